//! Payment confirmation workflow shared by every chain.
//!
//! A request moves through `received -> looked up -> verifying` and ends as
//! [`Outcome::Confirmed`] or [`Outcome::Rejected`], both of which acknowledge
//! the message. [`Outcome::Abandoned`] leaves the message for redelivery. It
//! happens on shutdown, when the lock backend fails, and when another holder
//! still has the payment lock.

pub mod bch;
pub mod dash;
pub mod ethereum;

pub use bch::BchVerifier;
pub use dash::DashVerifier;
pub use ethereum::EthVerifier;

use crate::{
    error::ConfirmationError,
    models::{ConfirmationRequest, EmailSend, Payment, MESSAGE_VERSION},
    queue::{Delivery, Disposition, MessageHandler},
    services::{lock_key, Notifier, PaymentLocks, PaymentStore},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Extra lock lifetime on top of the verifier's own worst case.
const LOCK_SLACK: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub enum RejectReason {
    Malformed(String),
    UnsupportedVersion(u32),
    PaymentNotFound,
    BlockchainMismatch,
    UserMismatch,
    AlreadyConfirmed,
    /// The request contradicts what we know about the payment.
    Forged(String),
    InvalidPayment(String),
    Verification(ConfirmationError),
    Store(String),
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "MALFORMED",
            Self::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            Self::PaymentNotFound => "PAYMENT_NOT_FOUND",
            Self::BlockchainMismatch => "BLOCKCHAIN_MISMATCH",
            Self::UserMismatch => "USER_MISMATCH",
            Self::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Self::Forged(_) => "FORGED_REQUEST",
            Self::InvalidPayment(_) => "INVALID_PAYMENT",
            Self::Verification(e) => e.error_code(),
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed message: {}", e),
            Self::UnsupportedVersion(v) => write!(f, "unsupported message version {}", v),
            Self::PaymentNotFound => f.write_str("payment not found"),
            Self::BlockchainMismatch => f.write_str("payment belongs to another blockchain"),
            Self::UserMismatch => f.write_str("payment belongs to another user"),
            Self::AlreadyConfirmed => f.write_str("payment already confirmed"),
            Self::Forged(e) => write!(f, "forged request: {}", e),
            Self::InvalidPayment(e) => write!(f, "invalid payment record: {}", e),
            Self::Verification(e) => write!(f, "verification failed: {}", e),
            Self::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Confirmed { credits: Decimal },
    Rejected(RejectReason),
    Abandoned,
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Abandoned => Disposition::Abandon,
            _ => Disposition::Ack,
        }
    }
}

/// Chain specific half of the workflow.
#[async_trait]
pub trait Verifier: Send + Sync + 'static {
    type Request: ConfirmationRequest + DeserializeOwned + Send + Sync;

    /// Confirms the payment on chain. Only called for an unconfirmed payment
    /// that belongs to the requesting user.
    async fn verify(
        &self,
        request: &Self::Request,
        payment: &Payment,
        cancel: &CancellationToken,
    ) -> Result<(), RejectReason>;

    /// Longest a single `verify` call may run.
    fn max_duration(&self) -> Duration;
}

/// Collaborators every processor needs.
#[derive(Clone)]
pub struct PaymentServices {
    pub store: Arc<dyn PaymentStore>,
    pub locks: Arc<dyn PaymentLocks>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct PaymentProcessor<V: Verifier> {
    verifier: V,
    services: PaymentServices,
}

impl<V: Verifier> PaymentProcessor<V> {
    pub fn new(verifier: V, services: PaymentServices) -> Self {
        Self { verifier, services }
    }

    pub async fn process(&self, body: &[u8], cancel: CancellationToken) -> Outcome {
        let chain = V::Request::BLOCKCHAIN;
        let request: V::Request = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(%chain, error = %e, "Failed to unmarshal message");
                return Outcome::Rejected(RejectReason::Malformed(e.to_string()));
            }
        };
        if request.version() != MESSAGE_VERSION {
            tracing::error!(%chain, version = request.version(), "Unsupported message version");
            return Outcome::Rejected(RejectReason::UnsupportedVersion(request.version()));
        }

        let user = request.user_name();
        let number = request.payment_number();
        let key = lock_key(chain.as_str(), user, number);
        let ttl = self.verifier.max_duration() + LOCK_SLACK;

        let lease = match self.services.locks.try_acquire(&key, ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                // Holder may have crashed; keep the message until its lease ends
                tracing::warn!(
                    %chain,
                    user,
                    payment_number = number,
                    "Payment already being verified, leaving message for redelivery"
                );
                return Outcome::Abandoned;
            }
            Err(e) => {
                tracing::error!(%chain, error = %e, "Failed to acquire payment lock");
                return Outcome::Abandoned;
            }
        };

        let outcome = self.process_locked(&request, &cancel).await;

        if let Err(e) = self.services.locks.release(lease).await {
            tracing::warn!(%chain, error = %e, "Failed to release payment lock");
        }

        match &outcome {
            Outcome::Confirmed { credits } => {
                tracing::info!(%chain, user, payment_number = number, %credits, "Payment confirmed")
            }
            Outcome::Rejected(reason) => tracing::warn!(
                %chain,
                user,
                payment_number = number,
                code = reason.code(),
                "Payment confirmation rejected: {}",
                reason
            ),
            Outcome::Abandoned => {
                tracing::warn!(%chain, user, payment_number = number, "Payment confirmation abandoned")
            }
        }
        outcome
    }

    async fn process_locked(&self, request: &V::Request, cancel: &CancellationToken) -> Outcome {
        let payment = match self.lookup(request).await {
            Ok(payment) => payment,
            Err(reason) => return Outcome::Rejected(reason),
        };

        tracing::info!(
            chain = %payment.blockchain,
            user = %payment.user_name,
            payment_number = payment.number,
            tx_hash = %payment.tx_hash,
            "Verifying payment"
        );
        match self.verifier.verify(request, &payment, cancel).await {
            Ok(()) => {}
            Err(RejectReason::Verification(ConfirmationError::Cancelled)) => {
                return Outcome::Abandoned;
            }
            Err(RejectReason::Verification(e)) => {
                self.notify_failure(&payment, &e).await;
                return Outcome::Rejected(RejectReason::Verification(e));
            }
            Err(reason) => return Outcome::Rejected(reason),
        }

        match self.services.store.confirm_payment(&payment.tx_hash).await {
            Ok(true) => {}
            Ok(false) => return Outcome::Rejected(RejectReason::AlreadyConfirmed),
            Err(e) => return Outcome::Rejected(RejectReason::Store(e.to_string())),
        }

        match self
            .services
            .store
            .add_credits(&payment.user_name, payment.usd_value)
            .await
        {
            Ok(balance) => tracing::info!(
                user = %payment.user_name,
                granted = %payment.usd_value,
                %balance,
                "Granted credits"
            ),
            Err(e) => {
                tracing::error!(
                    user = %payment.user_name,
                    payment_number = payment.number,
                    error = %e,
                    "Payment confirmed but credits were not granted"
                );
                return Outcome::Rejected(RejectReason::Store(e.to_string()));
            }
        }

        self.notify_success(&payment).await;
        Outcome::Confirmed {
            credits: payment.usd_value,
        }
    }

    async fn lookup(&self, request: &V::Request) -> Result<Payment, RejectReason> {
        let payment = self
            .services
            .store
            .find_payment_by_number(request.user_name(), request.payment_number())
            .await
            .map_err(|e| RejectReason::Store(e.to_string()))?
            .ok_or(RejectReason::PaymentNotFound)?;

        if payment.blockchain != V::Request::BLOCKCHAIN {
            return Err(RejectReason::BlockchainMismatch);
        }
        if payment.user_name != request.user_name() {
            return Err(RejectReason::UserMismatch);
        }
        if payment.confirmed {
            return Err(RejectReason::AlreadyConfirmed);
        }
        Ok(payment)
    }

    async fn notify_success(&self, payment: &Payment) {
        let chain = payment.blockchain.display_name();
        self.notify(
            payment,
            format!("{} Payment Confirmed", chain),
            format!(
                "Your {} payment for {} credits has been confirmed",
                chain.to_lowercase(),
                payment.usd_value
            ),
        )
        .await;
    }

    async fn notify_failure(&self, payment: &Payment, error: &ConfirmationError) {
        let chain = payment.blockchain.display_name();
        let content = match error {
            ConfirmationError::Timeout(_) => format!(
                "Your {} payment #{} was not detected on chain in time (code {})",
                chain.to_lowercase(),
                payment.number,
                error.error_code()
            ),
            _ => format!(
                "Your {} payment #{} could not be confirmed (code {})",
                chain.to_lowercase(),
                payment.number,
                error.error_code()
            ),
        };
        self.notify(payment, format!("{} Payment Failed", chain), content)
            .await;
    }

    /// Failures here are logged only; the payment outcome stands.
    async fn notify(&self, payment: &Payment, subject: String, content: String) {
        let user = match self.services.store.find_user_by_name(&payment.user_name).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::error!(user = %payment.user_name, "Failed to find user for notification");
                return;
            }
            Err(e) => {
                tracing::error!(user = %payment.user_name, error = %e, "Failed to find email for user");
                return;
            }
        };
        if !user.email_enabled {
            tracing::warn!(
                user = %user.user_name,
                "User has not activated their email and won't receive notifications"
            );
            return;
        }

        let email = EmailSend {
            subject,
            content,
            content_type: "text/html".to_string(),
            user_names: vec![user.user_name],
            emails: vec![user.email_address],
        };
        if let Err(e) = self.services.notifier.send(email).await {
            tracing::error!(error = %e, "Failed to send payment email");
        }
    }
}

#[async_trait]
impl<V: Verifier> MessageHandler for PaymentProcessor<V> {
    async fn handle(&self, delivery: &Delivery, cancel: CancellationToken) -> Disposition {
        tracing::info!(
            queue = %delivery.queue,
            id = %delivery.id,
            redelivered = delivery.redelivered,
            "New payment message received"
        );
        self.process(&delivery.body, cancel).await.disposition()
    }
}
