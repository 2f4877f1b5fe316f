use crate::{
    config::ConfirmationPolicy,
    error::{ConfirmationError, ValidationError},
    models::PaymentMethod,
    services::polling::{pause, rpc_call, with_deadline},
};
use anyhow::Result;
use async_trait::async_trait;
use ethers::{
    prelude::*,
    providers::{Http, Provider},
    types::{Address, Transaction, TransactionReceipt, H256},
    utils::keccak256,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The slice of Ethereum JSON-RPC the confirmation poller needs.
#[async_trait]
pub trait EthereumRpc: Send + Sync {
    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>, ConfirmationError>;
    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, ConfirmationError>;
    async fn block_number(&self) -> Result<u64, ConfirmationError>;
}

pub struct EthereumService {
    primary: Arc<Provider<Http>>,
    fallback: Option<Arc<Provider<Http>>>,
    call_timeout: Duration,
}

impl EthereumService {
    pub async fn new(
        rpc_url: &str,
        fallback_url: Option<&str>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let primary = Arc::new(Provider::<Http>::try_from(rpc_url)?);

        let fallback = if let Some(url) = fallback_url {
            Some(Arc::new(Provider::<Http>::try_from(url)?))
        } else {
            None
        };

        // Test connection
        let block_number = rpc_call(call_timeout, primary.get_block_number()).await?;
        tracing::info!("Ethereum RPC connected, current block: {}", block_number);

        Ok(Self {
            primary,
            fallback,
            call_timeout,
        })
    }
}

#[async_trait]
impl EthereumRpc for EthereumService {
    async fn transaction(&self, hash: H256) -> Result<Option<Transaction>, ConfirmationError> {
        match rpc_call(self.call_timeout, self.primary.get_transaction(hash)).await {
            Ok(tx) => Ok(tx),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(error = %e, "Primary RPC failed, trying fallback");
                    rpc_call(self.call_timeout, fallback.get_transaction(hash)).await
                }
                None => Err(e),
            },
        }
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, ConfirmationError> {
        match rpc_call(self.call_timeout, self.primary.get_transaction_receipt(hash)).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(error = %e, "Primary RPC failed, trying fallback");
                    rpc_call(self.call_timeout, fallback.get_transaction_receipt(hash)).await
                }
                None => Err(e),
            },
        }
    }

    async fn block_number(&self) -> Result<u64, ConfirmationError> {
        match rpc_call(self.call_timeout, self.primary.get_block_number()).await {
            Ok(num) => Ok(num.as_u64()),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    tracing::warn!(error = %e, "Primary RPC failed, trying fallback");
                    rpc_call(self.call_timeout, fallback.get_block_number())
                        .await
                        .map(|n| n.as_u64())
                }
                None => Err(e),
            },
        }
    }
}

/// What the payment row says the transaction must look like.
#[derive(Debug, Clone, Copy)]
pub struct EthPaymentExpectation {
    pub method: PaymentMethod,
    /// Registered address of the paying user, when one is on file.
    pub sender: Option<Address>,
}

/// Polls an Ethereum node until a payment transaction is buried deep enough,
/// then checks it actually paid the payment contract.
pub struct EthereumConfirmer {
    rpc: Arc<dyn EthereumRpc>,
    policy: ConfirmationPolicy,
    payment_contract: Address,
    rtc_token: Address,
}

impl EthereumConfirmer {
    pub fn new(
        rpc: Arc<dyn EthereumRpc>,
        policy: ConfirmationPolicy,
        payment_contract: Address,
        rtc_token: Address,
    ) -> Self {
        Self {
            rpc,
            policy,
            payment_contract,
            rtc_token,
        }
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    pub async fn process_payment_tx(
        &self,
        tx_hash: H256,
        expectation: &EthPaymentExpectation,
        cancel: &CancellationToken,
    ) -> Result<TransactionReceipt, ConfirmationError> {
        with_deadline(
            self.policy.deadline,
            self.confirm(tx_hash, expectation, cancel),
        )
        .await
    }

    async fn confirm(
        &self,
        tx_hash: H256,
        expectation: &EthPaymentExpectation,
        cancel: &CancellationToken,
    ) -> Result<TransactionReceipt, ConfirmationError> {
        self.wait_for_mining(tx_hash, cancel).await?;

        let receipt = self.fetch_receipt(tx_hash).await?;
        let confirmed_block = receipt
            .block_number
            .ok_or_else(|| ConfirmationError::Rpc("receipt has no block number".to_string()))?
            .as_u64();

        self.wait_for_confirmations(confirmed_block, cancel).await?;

        // Gas usage and logs are only reliable once the block is settled
        let receipt = self.fetch_receipt(tx_hash).await?;
        let tx = self
            .rpc
            .transaction(tx_hash)
            .await?
            .ok_or_else(|| ConfirmationError::NotFound(format!("{:?}", tx_hash)))?;

        self.validate(&tx, &receipt, expectation)?;

        tracing::info!(
            tx_hash = ?tx_hash,
            block = confirmed_block,
            "Ethereum payment transaction confirmed"
        );
        Ok(receipt)
    }

    async fn fetch_receipt(&self, tx_hash: H256) -> Result<TransactionReceipt, ConfirmationError> {
        self.rpc
            .receipt(tx_hash)
            .await?
            .ok_or_else(|| ConfirmationError::NotFound(format!("receipt for {:?}", tx_hash)))
    }

    async fn wait_for_mining(
        &self,
        tx_hash: H256,
        cancel: &CancellationToken,
    ) -> Result<Transaction, ConfirmationError> {
        loop {
            let tx = self
                .rpc
                .transaction(tx_hash)
                .await?
                .ok_or_else(|| ConfirmationError::NotFound(format!("{:?}", tx_hash)))?;
            if tx.block_number.is_some() {
                return Ok(tx);
            }
            tracing::debug!(tx_hash = ?tx_hash, "Transaction pending, waiting to be mined");
            pause(cancel, self.policy.poll_interval).await?;
        }
    }

    /// Returns the confirmation count that satisfied the policy.
    async fn wait_for_confirmations(
        &self,
        confirmed_block: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, ConfirmationError> {
        let needed = self.policy.required_confirmations;
        let mut last_checked: Option<u64> = None;

        loop {
            let current = self.rpc.block_number().await?;
            let confirmations = current.saturating_sub(confirmed_block);
            tracing::debug!(current, confirmations, needed, "Polled chain head");

            if confirmations >= needed {
                return Ok(confirmations);
            }
            if last_checked == Some(current) {
                pause(cancel, self.policy.poll_interval).await?;
            }
            last_checked = Some(current);
        }
    }

    fn validate(
        &self,
        tx: &Transaction,
        receipt: &TransactionReceipt,
        expectation: &EthPaymentExpectation,
    ) -> Result<(), ValidationError> {
        if receipt.status != Some(1.into()) {
            return Err(ValidationError::TxFailed(format!("{:?}", receipt.status)));
        }

        if tx.to != Some(self.payment_contract) {
            return Err(ValidationError::WrongDestination {
                expected: format!("{:?}", self.payment_contract),
                actual: tx
                    .to
                    .map(|to| format!("{:?}", to))
                    .unwrap_or_else(|| "contract creation".to_string()),
            });
        }

        if receipt.logs.is_empty() {
            return Err(ValidationError::NoLogs);
        }

        let transfer_topic = H256::from(keccak256("Transfer(address,address,uint256)"));
        let mut token_transfers = 0;
        for log in &receipt.logs {
            if log.topics.first() != Some(&transfer_topic) {
                continue;
            }
            if log.address != self.rtc_token {
                return Err(ValidationError::UnexpectedToken {
                    expected: format!("{:?}", self.rtc_token),
                    actual: format!("{:?}", log.address),
                });
            }
            token_transfers += 1;
        }
        if expectation.method == PaymentMethod::Rtc && token_transfers == 0 {
            return Err(ValidationError::MissingTokenTransfer);
        }

        if let Some(sender) = expectation.sender {
            if tx.from != sender {
                return Err(ValidationError::WrongSender {
                    expected: format!("{:?}", sender),
                    actual: format!("{:?}", tx.from),
                });
            }
        }

        Ok(())
    }
}
