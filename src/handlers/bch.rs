use crate::{
    handlers::{RejectReason, Verifier},
    models::{BchPaymentConfirmation, Payment},
    services::bch::{same_address, BchConfirmer},
};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct BchVerifier {
    confirmer: BchConfirmer,
}

impl BchVerifier {
    pub fn new(confirmer: BchConfirmer) -> Self {
        Self { confirmer }
    }
}

#[async_trait]
impl Verifier for BchVerifier {
    type Request = BchPaymentConfirmation;

    async fn verify(
        &self,
        request: &BchPaymentConfirmation,
        payment: &Payment,
        cancel: &CancellationToken,
    ) -> Result<(), RejectReason> {
        let deposit = self.confirmer.deposit_address();
        if !same_address(&request.recipient_address, deposit) {
            return Err(RejectReason::Forged(format!(
                "recipient {} is not the deposit address",
                request.recipient_address
            )));
        }

        let paid = self
            .confirmer
            .process_payment_tx(
                &payment.tx_hash,
                payment.charge_amount,
                &request.sender_address,
                cancel,
            )
            .await
            .map_err(RejectReason::Verification)?;

        tracing::info!(tx_hash = %payment.tx_hash, %paid, "BCH payment settled");
        Ok(())
    }

    fn max_duration(&self) -> Duration {
        self.confirmer.policy().deadline
    }
}
