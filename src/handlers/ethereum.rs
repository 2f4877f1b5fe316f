use crate::{
    handlers::{RejectReason, Verifier},
    models::{EthPaymentConfirmation, Payment},
    services::{
        ethereum::{EthPaymentExpectation, EthereumConfirmer},
        polling::pause,
        PaymentStore,
    },
};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Verifies Ethereum and RTC payments, retrying the whole check while the
/// node may simply not have seen the transaction yet.
pub struct EthVerifier {
    confirmer: EthereumConfirmer,
    store: Arc<dyn PaymentStore>,
    attempts: u32,
    retry_pause: Duration,
}

impl EthVerifier {
    pub fn new(
        confirmer: EthereumConfirmer,
        store: Arc<dyn PaymentStore>,
        attempts: u32,
        retry_pause: Duration,
    ) -> Self {
        Self {
            confirmer,
            store,
            attempts: attempts.max(1),
            retry_pause,
        }
    }

    async fn expectation(&self, payment: &Payment) -> Result<EthPaymentExpectation, RejectReason> {
        let registered = self
            .store
            .find_eth_address_by_user_name(&payment.user_name)
            .await
            .map_err(|e| RejectReason::Store(e.to_string()))?;

        let sender = registered
            .map(|addr| {
                Address::from_str(&addr).map_err(|e| {
                    RejectReason::InvalidPayment(format!("registered address {}: {}", addr, e))
                })
            })
            .transpose()?;

        Ok(EthPaymentExpectation {
            method: payment.payment_method,
            sender,
        })
    }
}

#[async_trait]
impl Verifier for EthVerifier {
    type Request = EthPaymentConfirmation;

    async fn verify(
        &self,
        _request: &EthPaymentConfirmation,
        payment: &Payment,
        cancel: &CancellationToken,
    ) -> Result<(), RejectReason> {
        let tx_hash = H256::from_str(payment.tx_hash.trim_start_matches("0x")).map_err(|e| {
            RejectReason::InvalidPayment(format!("tx hash {}: {}", payment.tx_hash, e))
        })?;
        let expectation = self.expectation(payment).await?;

        let mut attempt = 1;
        loop {
            match self
                .confirmer
                .process_payment_tx(tx_hash, &expectation, cancel)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    tracing::warn!(
                        tx_hash = %payment.tx_hash,
                        attempt,
                        error = %e,
                        "Ethereum verification failed, retrying"
                    );
                    pause(cancel, self.retry_pause)
                        .await
                        .map_err(RejectReason::Verification)?;
                    attempt += 1;
                }
                Err(e) => return Err(RejectReason::Verification(e)),
            }
        }
    }

    fn max_duration(&self) -> Duration {
        (self.confirmer.policy().deadline + self.retry_pause) * self.attempts
    }
}
