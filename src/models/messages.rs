use crate::models::Blockchain;
use serde::{Deserialize, Serialize};

pub const MESSAGE_VERSION: u32 = 1;

fn current_version() -> u32 {
    MESSAGE_VERSION
}

/// Common view over the per-chain confirmation request bodies.
pub trait ConfirmationRequest {
    const BLOCKCHAIN: Blockchain;

    fn version(&self) -> u32;
    fn user_name(&self) -> &str;
    fn payment_number(&self) -> i64;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthPaymentConfirmation {
    #[serde(default = "current_version")]
    pub version: u32,
    pub user_name: String,
    pub payment_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashPaymentConfirmation {
    #[serde(default = "current_version")]
    pub version: u32,
    pub user_name: String,
    pub payment_forward_id: String,
    pub payment_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BchPaymentConfirmation {
    #[serde(default = "current_version")]
    pub version: u32,
    pub user_name: String,
    pub sender_address: String,
    pub recipient_address: String,
    pub payment_number: i64,
}

macro_rules! impl_confirmation_request {
    ($ty:ty, $chain:expr) => {
        impl ConfirmationRequest for $ty {
            const BLOCKCHAIN: Blockchain = $chain;

            fn version(&self) -> u32 {
                self.version
            }

            fn user_name(&self) -> &str {
                &self.user_name
            }

            fn payment_number(&self) -> i64 {
                self.payment_number
            }
        }
    };
}

impl_confirmation_request!(EthPaymentConfirmation, Blockchain::Ethereum);
impl_confirmation_request!(DashPaymentConfirmation, Blockchain::Dash);
impl_confirmation_request!(BchPaymentConfirmation, Blockchain::BitcoinCash);

/// Email job consumed by the mail sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSend {
    pub subject: String,
    pub content: String,
    pub content_type: String,
    pub user_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_defaults_when_absent() {
        let msg: EthPaymentConfirmation =
            serde_json::from_str(r#"{"user_name":"alice","payment_number":7}"#).unwrap();
        assert_eq!(msg.version, MESSAGE_VERSION);
        assert_eq!(msg.payment_number(), 7);
        assert_eq!(EthPaymentConfirmation::BLOCKCHAIN, Blockchain::Ethereum);
    }

    #[test]
    fn dash_request_requires_forward_id() {
        let missing = serde_json::from_str::<DashPaymentConfirmation>(
            r#"{"user_name":"alice","payment_number":1}"#,
        );
        assert!(missing.is_err());
    }

    #[test]
    fn email_omits_empty_address_list() {
        let email = EmailSend {
            subject: "s".into(),
            content: "c".into(),
            content_type: "text/html".into(),
            user_names: vec!["alice".into()],
            emails: vec![],
        };
        let json = serde_json::to_value(&email).unwrap();
        assert!(json.get("emails").is_none());
    }
}
