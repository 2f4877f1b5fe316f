//! Timing primitives shared by the chain adapters.
//!
//! Every wait is a tokio timer raced against the caller's cancellation token, so
//! one sleeping confirmation never holds up the process or a shutdown.

use crate::error::{ConfirmationError, ValidationError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lock times at or above this value are unix timestamps, below it block heights.
pub const LOCK_TIME_THRESHOLD: u64 = 500_000_000;

/// Runs a single RPC call under a per-call timeout.
pub async fn rpc_call<T, E, F>(timeout: Duration, call: F) -> Result<T, ConfirmationError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ConfirmationError>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(ConfirmationError::Rpc(format!(
            "call timed out after {:?}",
            timeout
        ))),
    }
}

/// Bounds a whole confirmation workflow.
pub async fn with_deadline<T, F>(deadline: Duration, workflow: F) -> Result<T, ConfirmationError>
where
    F: Future<Output = Result<T, ConfirmationError>>,
{
    tokio::time::timeout(deadline, workflow)
        .await
        .unwrap_or(Err(ConfirmationError::Timeout(deadline)))
}

/// Sleeps the calling task, waking early with `Cancelled` on shutdown.
pub async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), ConfirmationError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ConfirmationError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// A transaction is final once its lock time is not ahead of the chain.
pub fn check_lock_time(lock_time: u64, best_height: u64) -> Result<(), ValidationError> {
    let current = if lock_time >= LOCK_TIME_THRESHOLD {
        chrono::Utc::now().timestamp().max(0) as u64
    } else {
        best_height
    };
    if lock_time > current {
        return Err(ValidationError::LockTimeNotReached { lock_time, current });
    }
    Ok(())
}
