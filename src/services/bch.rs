use crate::{
    config::ConfirmationPolicy,
    error::{ConfirmationError, ValidationError},
    services::polling::{check_lock_time, pause, rpc_call, with_deadline},
};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Node error code for an unknown transaction.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

const SATS_PER_BCH: i64 = 100_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct BchOutput {
    pub address: Option<String>,
    pub value_sats: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BchTransaction {
    pub hash: String,
    pub confirmations: u64,
    pub lock_time: u64,
    /// Addresses funding each input, when the node reports them.
    pub input_addresses: Vec<Option<String>>,
    pub outputs: Vec<BchOutput>,
}

impl BchTransaction {
    /// Total paid to `address`, ignoring change and any other outputs.
    pub fn value_to(&self, address: &str) -> Decimal {
        self.outputs
            .iter()
            .filter(|out| matches!(&out.address, Some(a) if same_address(a, address)))
            .map(|out| out.value_sats)
            .sum()
    }

    /// Every input must be funded by `sender`.
    pub fn validate_sender(&self, sender: &str) -> Result<(), ValidationError> {
        for input in &self.input_addresses {
            match input {
                Some(addr) if same_address(addr, sender) => {}
                other => {
                    return Err(ValidationError::InvalidSender(
                        other.clone().unwrap_or_else(|| "unknown".to_string()),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Every output must pay `recipient`.
    pub fn validate_recipient(&self, recipient: &str) -> Result<(), ValidationError> {
        for output in &self.outputs {
            match &output.address {
                Some(addr) if same_address(addr, recipient) => {}
                other => {
                    return Err(ValidationError::InvalidRecipient(
                        other.clone().unwrap_or_else(|| "unknown".to_string()),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Compares cash addresses with or without their network prefix.
pub fn same_address(a: &str, b: &str) -> bool {
    fn strip(addr: &str) -> &str {
        addr.rsplit_once(':').map(|(_, rest)| rest).unwrap_or(addr)
    }
    strip(a).eq_ignore_ascii_case(strip(b))
}

#[async_trait]
pub trait BchRpc: Send + Sync {
    async fn transaction(&self, hash: &str) -> Result<BchTransaction, ConfirmationError>;
    async fn best_height(&self) -> Result<u64, ConfirmationError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    txid: String,
    #[serde(default)]
    confirmations: u64,
    #[serde(default)]
    locktime: u64,
    #[serde(default)]
    vin: Vec<RawInput>,
    #[serde(default)]
    vout: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    #[serde(rename = "prevOut")]
    prev_out: Option<RawPrevOut>,
}

#[derive(Debug, Deserialize)]
struct RawPrevOut {
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    value: serde_json::Number,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptPubKey {
    #[serde(default)]
    addresses: Vec<String>,
}

impl ScriptPubKey {
    fn address(&self) -> Option<String> {
        match self.addresses.as_slice() {
            [single] => Some(single.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockchainInfo {
    blocks: u64,
}

fn bch_to_sats(value: &serde_json::Number) -> Result<Decimal, ConfirmationError> {
    let coins = Decimal::from_str(&value.to_string())
        .map_err(|e| ConfirmationError::Rpc(format!("bad output value {}: {}", value, e)))?;
    Ok((coins * Decimal::from(SATS_PER_BCH)).trunc())
}

impl TryFrom<RawTransaction> for BchTransaction {
    type Error = ConfirmationError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let outputs = raw
            .vout
            .iter()
            .map(|out| {
                Ok(BchOutput {
                    address: out.script_pub_key.address(),
                    value_sats: bch_to_sats(&out.value)?,
                })
            })
            .collect::<Result<Vec<_>, ConfirmationError>>()?;
        Ok(Self {
            hash: raw.txid,
            confirmations: raw.confirmations,
            lock_time: raw.locktime,
            input_addresses: raw
                .vin
                .iter()
                .map(|input| input.prev_out.as_ref().and_then(|p| p.script_pub_key.address()))
                .collect(),
            outputs,
        })
    }
}

/// JSON-RPC client for a Bitcoin Cash full node.
pub struct BchNodeClient {
    client: Client,
    url: String,
    auth: Option<(String, Option<String>)>,
    call_timeout: Duration,
}

impl BchNodeClient {
    pub fn new(
        url: &str,
        user: Option<String>,
        pass: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            url: url.to_string(),
            auth: user.map(|u| (u, pass)),
            call_timeout,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ConfirmationError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "pay-confirm",
            "method": method,
            "params": params,
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, pass.as_ref());
        }

        // Nodes report RPC failures with a 500 and a JSON error body
        let response = rpc_call(self.call_timeout, request.send()).await?;
        let status = response.status();
        let parsed: RpcResponse<T> = rpc_call(self.call_timeout, response.json())
            .await
            .map_err(|e| ConfirmationError::Rpc(format!("{} ({}): {}", method, status, e)))?;

        match (parsed.result, parsed.error) {
            (_, Some(err)) if err.code == RPC_INVALID_ADDRESS_OR_KEY => {
                Err(ConfirmationError::NotFound(err.message))
            }
            (_, Some(err)) => Err(ConfirmationError::Rpc(format!(
                "{} failed with {}: {}",
                method, err.code, err.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ConfirmationError::Rpc(format!("{} returned no result", method))),
        }
    }
}

#[async_trait]
impl BchRpc for BchNodeClient {
    async fn transaction(&self, hash: &str) -> Result<BchTransaction, ConfirmationError> {
        let raw: RawTransaction = self.call("getrawtransaction", json!([hash, 2])).await?;
        raw.try_into()
    }

    async fn best_height(&self) -> Result<u64, ConfirmationError> {
        let info: BlockchainInfo = self.call("getblockchaininfo", json!([])).await?;
        Ok(info.blocks)
    }
}

/// Confirms a single Bitcoin Cash payment into the deposit address.
pub struct BchConfirmer {
    rpc: Arc<dyn BchRpc>,
    policy: ConfirmationPolicy,
    deposit_address: String,
    strict: bool,
}

impl BchConfirmer {
    pub fn new(
        rpc: Arc<dyn BchRpc>,
        policy: ConfirmationPolicy,
        deposit_address: String,
        strict: bool,
    ) -> Self {
        Self {
            rpc,
            policy,
            deposit_address,
            strict,
        }
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    pub fn deposit_address(&self) -> &str {
        &self.deposit_address
    }

    /// Returns the satoshis paid into the deposit address.
    pub async fn process_payment_tx(
        &self,
        tx_hash: &str,
        expected_sats: Decimal,
        sender: &str,
        cancel: &CancellationToken,
    ) -> Result<Decimal, ConfirmationError> {
        with_deadline(
            self.policy.deadline,
            self.confirm(tx_hash, expected_sats, sender, cancel),
        )
        .await
    }

    async fn confirm(
        &self,
        tx_hash: &str,
        expected_sats: Decimal,
        sender: &str,
        cancel: &CancellationToken,
    ) -> Result<Decimal, ConfirmationError> {
        let mut tx = self.rpc.transaction(tx_hash).await?;

        let paid = tx.value_to(&self.deposit_address);
        if paid < expected_sats {
            return Err(ValidationError::InsufficientValue {
                expected: expected_sats.to_string(),
                actual: paid.to_string(),
            }
            .into());
        }
        if self.strict {
            tx.validate_sender(sender)?;
            tx.validate_recipient(&self.deposit_address)?;
        }

        let required = self.policy.required_confirmations;
        loop {
            if tx.confirmations >= required {
                let height = self.rpc.best_height().await?;
                check_lock_time(tx.lock_time, height)?;
                tracing::info!(
                    tx_hash,
                    confirmations = tx.confirmations,
                    paid = %paid,
                    "BCH payment transaction confirmed"
                );
                return Ok(paid);
            }

            tracing::debug!(
                tx_hash,
                confirmations = tx.confirmations,
                required,
                "BCH transaction not yet confirmed"
            );
            pause(cancel, self.policy.poll_interval).await?;
            tx = self.rpc.transaction(tx_hash).await?;
        }
    }
}
