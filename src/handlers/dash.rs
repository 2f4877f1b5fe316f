use crate::{
    handlers::{RejectReason, Verifier},
    models::{DashPaymentConfirmation, Payment},
    services::dash::DashConfirmer,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct DashVerifier {
    confirmer: DashConfirmer,
}

impl DashVerifier {
    pub fn new(confirmer: DashConfirmer) -> Self {
        Self { confirmer }
    }
}

#[async_trait]
impl Verifier for DashVerifier {
    type Request = DashPaymentConfirmation;

    async fn verify(
        &self,
        request: &DashPaymentConfirmation,
        payment: &Payment,
        cancel: &CancellationToken,
    ) -> Result<(), RejectReason> {
        if request.payment_forward_id.is_empty() {
            return Err(RejectReason::Forged("empty payment forward id".to_string()));
        }
        let total = self
            .confirmer
            .process_payment(&request.payment_forward_id, payment.charge_amount, cancel)
            .await
            .map_err(RejectReason::Verification)?;

        tracing::info!(
            forward_id = %request.payment_forward_id,
            %total,
            charge = %payment.charge_amount,
            "Dash payment forward settled"
        );
        Ok(())
    }

    fn max_duration(&self) -> Duration {
        self.confirmer.policy().deadline
    }
}
