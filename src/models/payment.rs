use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Blockchain {
    Ethereum,
    Dash,
    #[serde(rename = "bitcoincash")]
    BitcoinCash,
}

impl Blockchain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Blockchain::Ethereum => "ethereum",
            Blockchain::Dash => "dash",
            Blockchain::BitcoinCash => "bitcoincash",
        }
    }

    /// Human facing name used in notification subjects.
    pub fn display_name(&self) -> &'static str {
        match self {
            Blockchain::Ethereum => "Ethereum",
            Blockchain::Dash => "DASH",
            Blockchain::BitcoinCash => "Bitcoin Cash",
        }
    }
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Blockchain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ethereum" | "eth" => Ok(Blockchain::Ethereum),
            "dash" => Ok(Blockchain::Dash),
            "bitcoincash" | "bch" => Ok(Blockchain::BitcoinCash),
            other => Err(format!("unknown blockchain: {}", other)),
        }
    }
}

/// Native coin vs platform token. Only meaningful for Ethereum payments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Native = 0,
    Rtc = 1,
}

impl TryFrom<i16> for PaymentMethod {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PaymentMethod::Native),
            1 => Ok(PaymentMethod::Rtc),
            other => Err(format!("unknown payment method: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub number: i64,
    pub user_name: String,
    /// On-chain transaction hash, or the paid-for object for forward based chains.
    pub tx_hash: String,
    pub blockchain: Blockchain,
    pub payment_method: PaymentMethod,
    /// Expected amount. Satoshis for BCH, DASH for Dash.
    pub charge_amount: Decimal,
    /// Credits granted on confirmation.
    pub usd_value: Decimal,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_name: String,
    pub email_address: String,
    pub email_enabled: bool,
    pub credits: Decimal,
}
