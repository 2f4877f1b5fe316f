use crate::{
    config::ConfirmationPolicy,
    error::ConfirmationError,
    services::polling::{check_lock_time, pause, rpc_call, with_deadline},
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DUFFS_PER_DASH_SCALE: u32 = 8;

#[derive(Debug, Clone, Deserialize)]
pub struct DashTransaction {
    pub txid: String,
    #[serde(default)]
    pub locktime: u64,
    #[serde(default)]
    pub confirmations: u64,
}

/// One deposit relayed by a payment forward.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessedTx {
    pub input_transaction_hash: String,
    pub received_amount_duffs: u64,
    #[serde(default)]
    pub transaction_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentForward {
    #[serde(rename = "paymentforward_id", default)]
    pub id: String,
    #[serde(default)]
    pub payment_address: String,
    #[serde(default)]
    pub processed_txs: Vec<ProcessedTx>,
}

#[derive(Debug, Deserialize)]
struct LastBlockHash {
    #[serde(rename = "lastblockhash")]
    last_block_hash: String,
}

#[derive(Debug, Deserialize)]
struct Block {
    height: u64,
}

#[async_trait]
pub trait DashRpc: Send + Sync {
    async fn transaction(&self, hash: &str) -> Result<DashTransaction, ConfirmationError>;
    async fn payment_forward(&self, id: &str) -> Result<PaymentForward, ConfirmationError>;
    async fn best_height(&self) -> Result<u64, ConfirmationError>;
}

/// REST client for the ChainRider Dash API.
pub struct ChainRiderClient {
    client: Client,
    base_url: String,
    token: String,
    call_timeout: Duration,
}

impl ChainRiderClient {
    pub fn new(base_url: &str, token: &str, call_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            call_timeout,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, ConfirmationError> {
        let url = format!("{}{}", self.base_url, path);
        let request = self
            .client
            .get(&url)
            .query(&[("token", self.token.as_str())])
            .query(extra);

        let response = rpc_call(self.call_timeout, request.send()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ConfirmationError::NotFound(path.to_string()));
        }
        let response = response.error_for_status()?;
        rpc_call(self.call_timeout, response.json::<T>()).await
    }
}

#[async_trait]
impl DashRpc for ChainRiderClient {
    async fn transaction(&self, hash: &str) -> Result<DashTransaction, ConfirmationError> {
        self.get(&format!("/tx/{}", hash), &[]).await
    }

    async fn payment_forward(&self, id: &str) -> Result<PaymentForward, ConfirmationError> {
        self.get(&format!("/paymentforward/{}", id), &[]).await
    }

    async fn best_height(&self) -> Result<u64, ConfirmationError> {
        let last: LastBlockHash = self.get("/status", &[("q", "getLastBlockHash")]).await?;
        let block: Block = self
            .get(&format!("/block/{}", last.last_block_hash), &[])
            .await?;
        Ok(block.height)
    }
}

pub fn duffs_to_dash(duffs: u64) -> Decimal {
    Decimal::from_i128_with_scale(duffs as i128, DUFFS_PER_DASH_SCALE)
}

/// Watches a payment forward until the deposits relayed through it cover the
/// charge, counting each deposit once.
pub struct DashConfirmer {
    rpc: Arc<dyn DashRpc>,
    policy: ConfirmationPolicy,
    forward_poll_interval: Duration,
}

impl DashConfirmer {
    pub fn new(
        rpc: Arc<dyn DashRpc>,
        policy: ConfirmationPolicy,
        forward_poll_interval: Duration,
    ) -> Self {
        Self {
            rpc,
            policy,
            forward_poll_interval,
        }
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    /// Returns the confirmed total in DASH once it reaches `charge`.
    pub async fn process_payment(
        &self,
        forward_id: &str,
        charge: Decimal,
        cancel: &CancellationToken,
    ) -> Result<Decimal, ConfirmationError> {
        with_deadline(
            self.policy.deadline,
            self.accumulate(forward_id, charge, cancel),
        )
        .await
    }

    async fn accumulate(
        &self,
        forward_id: &str,
        charge: Decimal,
        cancel: &CancellationToken,
    ) -> Result<Decimal, ConfirmationError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut total = Decimal::ZERO;

        loop {
            let forward = self.rpc.payment_forward(forward_id).await?;
            let mut processed_any = false;

            for deposit in forward.processed_txs {
                if !seen.insert(deposit.input_transaction_hash.clone()) {
                    continue;
                }
                self.process_transaction(&deposit.input_transaction_hash, cancel)
                    .await?;
                let amount = duffs_to_dash(deposit.received_amount_duffs);
                total += amount;
                processed_any = true;
                tracing::info!(
                    forward_id,
                    tx_hash = %deposit.input_transaction_hash,
                    %amount,
                    %total,
                    %charge,
                    "Dash deposit confirmed"
                );
            }

            if !seen.is_empty() && total >= charge {
                return Ok(total);
            }

            if !processed_any {
                tracing::debug!(forward_id, "No new deposits on payment forward");
            }
            pause(cancel, self.forward_poll_interval).await?;
        }
    }

    /// Waits until `hash` has strictly more than the required confirmations,
    /// then rejects it if it is still time locked.
    pub async fn process_transaction(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<DashTransaction, ConfirmationError> {
        let required = self.policy.required_confirmations;
        loop {
            let tx = self.rpc.transaction(hash).await?;
            if tx.confirmations > required {
                let height = self.rpc.best_height().await?;
                check_lock_time(tx.locktime, height)?;
                return Ok(tx);
            }

            let remaining = (required + 1).saturating_sub(tx.confirmations).max(1);
            let wait = self
                .policy
                .poll_interval
                .saturating_mul(u32::try_from(remaining).unwrap_or(u32::MAX));
            tracing::debug!(
                tx_hash = hash,
                confirmations = tx.confirmations,
                required,
                wait_secs = wait.as_secs(),
                "Dash transaction not yet confirmed"
            );
            pause(cancel, wait).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use mockito::Matcher;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Forward contents change over (virtual) time; transactions are already
    /// deep enough unless listed in `pending`.
    struct ScriptedDash {
        forwards: Mutex<Vec<Vec<ProcessedTx>>>,
        locktimes: HashMap<String, u64>,
        confirmations: Mutex<HashMap<String, Vec<u64>>>,
        tx_calls: Mutex<Vec<String>>,
        height: u64,
    }

    impl ScriptedDash {
        fn new(forwards: Vec<Vec<ProcessedTx>>) -> Self {
            Self {
                forwards: Mutex::new(forwards),
                locktimes: HashMap::new(),
                confirmations: Mutex::new(HashMap::new()),
                tx_calls: Mutex::new(Vec::new()),
                height: 1_000,
            }
        }
    }

    #[async_trait]
    impl DashRpc for ScriptedDash {
        async fn transaction(&self, hash: &str) -> Result<DashTransaction, ConfirmationError> {
            self.tx_calls.lock().unwrap().push(hash.to_string());
            let mut confs = self.confirmations.lock().unwrap();
            let confirmations = match confs.get_mut(hash) {
                Some(script) if script.len() > 1 => script.remove(0),
                Some(script) => script[0],
                None => 100,
            };
            Ok(DashTransaction {
                txid: hash.to_string(),
                locktime: self.locktimes.get(hash).copied().unwrap_or(0),
                confirmations,
            })
        }

        async fn payment_forward(&self, id: &str) -> Result<PaymentForward, ConfirmationError> {
            let mut forwards = self.forwards.lock().unwrap();
            let processed_txs = if forwards.len() > 1 {
                forwards.remove(0)
            } else {
                forwards[0].clone()
            };
            Ok(PaymentForward {
                id: id.to_string(),
                payment_address: "XforwardAddr".to_string(),
                processed_txs,
            })
        }

        async fn best_height(&self) -> Result<u64, ConfirmationError> {
            Ok(self.height)
        }
    }

    fn deposit(hash: &str, duffs: u64) -> ProcessedTx {
        ProcessedTx {
            input_transaction_hash: hash.to_string(),
            received_amount_duffs: duffs,
            transaction_hash: format!("fwd-{}", hash),
        }
    }

    fn policy() -> ConfirmationPolicy {
        ConfirmationPolicy {
            required_confirmations: 6,
            poll_interval: Duration::from_secs(120),
            deadline: Duration::from_secs(90 * 60),
        }
    }

    fn confirmer(rpc: Arc<ScriptedDash>) -> DashConfirmer {
        DashConfirmer::new(rpc, policy(), Duration::from_secs(240))
    }

    #[test]
    fn duffs_convert_to_dash() {
        assert_eq!(duffs_to_dash(100_000_000), Decimal::ONE);
        assert_eq!(duffs_to_dash(50_000_000), Decimal::new(5, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_deposits_accumulate_across_polls() {
        let rpc = Arc::new(ScriptedDash::new(vec![
            vec![],
            vec![deposit("v1", 60_000_000)],
            vec![deposit("v1", 60_000_000), deposit("v2", 40_000_000)],
        ]));
        let total = assert_ok!(
            confirmer(rpc.clone())
                .process_payment("pf-1", Decimal::ONE, &CancellationToken::new())
                .await
        );
        assert_eq!(total, Decimal::ONE);
        // v1 is seen on two polls but confirmed only once
        assert_eq!(*rpc.tx_calls.lock().unwrap(), vec!["v1", "v2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_short_deposit_never_suffices() {
        let rpc = Arc::new(ScriptedDash::new(vec![vec![deposit("v1", 60_000_000)]]));
        let err = assert_err!(
            confirmer(rpc.clone())
                .process_payment("pf-1", Decimal::ONE, &CancellationToken::new())
                .await
        );
        assert!(matches!(err, ConfirmationError::Timeout(_)));
        assert_eq!(rpc.tx_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_charge_still_needs_a_deposit() {
        let rpc = Arc::new(ScriptedDash::new(vec![vec![]]));
        let err = confirmer(rpc)
            .process_payment("pf-1", Decimal::ZERO, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfirmationError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn time_locked_deposit_is_rejected() {
        let mut rpc = ScriptedDash::new(vec![vec![deposit("v1", 100_000_000)]]);
        rpc.locktimes.insert("v1".to_string(), 5_000);
        let err = confirmer(Arc::new(rpc))
            .process_payment("pf-1", Decimal::ONE, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConfirmationError::Validation(ValidationError::LockTimeNotReached {
                lock_time: 5_000,
                current: 1_000
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_scales_with_missing_confirmations() {
        let rpc = Arc::new(ScriptedDash::new(vec![vec![]]));
        rpc.confirmations
            .lock()
            .unwrap()
            .insert("v1".to_string(), vec![3, 7]);
        let start = tokio::time::Instant::now();
        let tx = confirmer(rpc.clone())
            .process_transaction("v1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tx.confirmations, 7);
        // 6 + 1 - 3 = 4 missing confirmations at two minutes each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4 * 120));
        assert!(elapsed < Duration::from_secs(5 * 120));
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_required_confirmations_is_not_enough() {
        let rpc = Arc::new(ScriptedDash::new(vec![vec![]]));
        rpc.confirmations
            .lock()
            .unwrap()
            .insert("v1".to_string(), vec![6, 7]);
        confirmer(rpc.clone())
            .process_transaction("v1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rpc.tx_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn chainrider_client_reads_transaction_and_height() {
        let mut server = mockito::Server::new_async().await;
        let tx_mock = server
            .mock("GET", "/tx/abc")
            .match_query(Matcher::UrlEncoded("token".into(), "secret".into()))
            .with_header("content-type", "application/json")
            .with_body(r#"{"txid":"abc","locktime":0,"confirmations":9,"valueOut":1.5}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/status")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("token".into(), "secret".into()),
                Matcher::UrlEncoded("q".into(), "getLastBlockHash".into()),
            ]))
            .with_body(r#"{"syncTipHash":"h1","lastblockhash":"h1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/block/h1")
            .match_query(Matcher::Any)
            .with_body(r#"{"hash":"h1","height":812345}"#)
            .create_async()
            .await;

        let client = ChainRiderClient::new(&server.url(), "secret", Duration::from_secs(5));
        let tx = client.transaction("abc").await.unwrap();
        assert_eq!(tx.confirmations, 9);
        assert_eq!(client.best_height().await.unwrap(), 812_345);
        tx_mock.assert_async().await;
    }

    #[tokio::test]
    async fn chainrider_client_parses_forward_and_maps_missing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/paymentforward/pf-1")
            .match_query(Matcher::Any)
            .with_body(
                r#"{"paymentforward_id":"pf-1","payment_address":"Xaddr","processed_txs":[
                    {"input_transaction_hash":"in1","received_amount_duffs":2500000,"transaction_hash":"out1"}
                ]}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/tx/missing")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/tx/broken")
            .match_query(Matcher::Any)
            .with_status(502)
            .create_async()
            .await;

        let client = ChainRiderClient::new(&server.url(), "secret", Duration::from_secs(5));
        let forward = client.payment_forward("pf-1").await.unwrap();
        assert_eq!(forward.id, "pf-1");
        assert_eq!(forward.processed_txs[0].received_amount_duffs, 2_500_000);

        let missing = client.transaction("missing").await.unwrap_err();
        assert!(matches!(missing, ConfirmationError::NotFound(_)));
        let broken = client.transaction("broken").await.unwrap_err();
        assert!(matches!(broken, ConfirmationError::Rpc(_)));
    }
}
