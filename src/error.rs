use std::time::Duration;
use thiserror::Error;

/// Why a chain adapter could not confirm a payment transaction.
#[derive(Error, Debug)]
pub enum ConfirmationError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transaction not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?} waiting for confirmations")]
    Timeout(Duration),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Confirmation cancelled")]
    Cancelled,
}

impl ConfirmationError {
    /// Transient failures that another verification attempt may clear up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::NotFound(_))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Rpc(_) => "RPC_ERROR",
            Self::NotFound(_) => "TX_NOT_FOUND",
            Self::Timeout(_) => "CONFIRMATION_TIMEOUT",
            Self::Validation(v) => v.error_code(),
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl From<ethers::providers::ProviderError> for ConfirmationError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        Self::Rpc(err.to_string())
    }
}

impl From<reqwest::Error> for ConfirmationError {
    fn from(err: reqwest::Error) -> Self {
        Self::Rpc(err.to_string())
    }
}

/// A transaction was observed but is structurally not an acceptable payment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Transaction status is not success: {0}")]
    TxFailed(String),

    #[error("Destination {actual} is not the payment contract {expected}")]
    WrongDestination { expected: String, actual: String },

    #[error("Token transfer emitted by {actual}, expected {expected}")]
    UnexpectedToken { expected: String, actual: String },

    #[error("No token transfer found in transaction")]
    MissingTokenTransfer,

    #[error("No logs were emitted")]
    NoLogs,

    #[error("Sender {actual} does not match registered address {expected}")]
    WrongSender { expected: String, actual: String },

    #[error("Insufficient value: {actual} < {expected}")]
    InsufficientValue { expected: String, actual: String },

    #[error("Lock time {lock_time} not reached (current {current})")]
    LockTimeNotReached { lock_time: u64, current: u64 },

    #[error("Invalid sender address detected: {0}")]
    InvalidSender(String),

    #[error("Invalid recipient address detected: {0}")]
    InvalidRecipient(String),
}

impl ValidationError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TxFailed(_) => "TX_FAILED",
            Self::WrongDestination { .. } => "WRONG_DESTINATION",
            Self::UnexpectedToken { .. } => "UNEXPECTED_TOKEN",
            Self::MissingTokenTransfer => "MISSING_TOKEN_TRANSFER",
            Self::NoLogs => "NO_LOGS",
            Self::WrongSender { .. } => "WRONG_SENDER",
            Self::InsufficientValue { .. } => "INSUFFICIENT_VALUE",
            Self::LockTimeNotReached { .. } => "LOCK_TIME_NOT_REACHED",
            Self::InvalidSender(_) => "INVALID_SENDER",
            Self::InvalidRecipient(_) => "INVALID_RECIPIENT",
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The broker connection is gone; the consumer must be rebuilt from scratch.
    #[error("protocol connection error, reconnect")]
    Reconnect,

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            tracing::warn!(error = %err, "Broker connection lost");
            Self::Reconnect
        } else {
            Self::Broker(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Unknown user: {0}")]
    UnknownUser(String),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ConfirmationError::Rpc("502".into()).is_retryable());
        assert!(ConfirmationError::NotFound("0xabc".into()).is_retryable());
        assert!(!ConfirmationError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ConfirmationError::Cancelled.is_retryable());
        assert!(!ConfirmationError::from(ValidationError::NoLogs).is_retryable());
    }

    #[test]
    fn validation_codes_pass_through() {
        let err = ConfirmationError::from(ValidationError::LockTimeNotReached {
            lock_time: 10,
            current: 9,
        });
        assert_eq!(err.error_code(), "LOCK_TIME_NOT_REACHED");
        assert_eq!(
            ConfirmationError::Timeout(Duration::from_secs(5)).error_code(),
            "CONFIRMATION_TIMEOUT"
        );
    }
}
