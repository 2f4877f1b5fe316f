use crate::error::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Proof of holding a payment lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLease {
    pub key: String,
    token: String,
}

impl PaymentLease {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

pub fn lock_key(chain: &str, user_name: &str, payment_number: i64) -> String {
    format!("payment-lock:{}:{}:{}", chain, user_name, payment_number)
}

/// Advisory mutual exclusion around verifying one payment.
#[async_trait]
pub trait PaymentLocks: Send + Sync {
    /// Returns `None` while another holder has the key.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<PaymentLease>, LockError>;

    async fn release(&self, lease: PaymentLease) -> Result<(), LockError>;
}

pub struct RedisPaymentLocks {
    redis: redis::aio::ConnectionManager,
}

impl RedisPaymentLocks {
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)?;
        let redis = client.get_connection_manager().await?;
        tracing::info!("Redis connected for payment locks");
        Ok(Self { redis })
    }
}

#[async_trait]
impl PaymentLocks for RedisPaymentLocks {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<PaymentLease>, LockError> {
        let lease = PaymentLease::new(key);
        let mut redis = self.redis.clone();
        let reply = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, Option<String>>(&mut redis)
            .await?;

        if reply.is_some() {
            tracing::debug!("Acquired lock {} for {}s", key, ttl.as_secs());
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, lease: PaymentLease) -> Result<(), LockError> {
        let mut redis = self.redis.clone();
        let removed: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut redis)
            .await?;
        if removed == 0 {
            tracing::warn!("Lock {} expired before release", lease.key);
        }
        Ok(())
    }
}

/// Process-local locks with the same expiry semantics as the Redis variant.
#[derive(Default)]
pub struct MemoryPaymentLocks {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryPaymentLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentLocks for MemoryPaymentLocks {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<PaymentLease>, LockError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some((_, expires)) = held.get(key) {
            if *expires > now {
                return Ok(None);
            }
        }
        let lease = PaymentLease::new(key);
        held.insert(key.to_string(), (lease.token.clone(), now + ttl));
        Ok(Some(lease))
    }

    async fn release(&self, lease: PaymentLease) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(held.get(&lease.key), Some((token, _)) if *token == lease.token) {
            held.remove(&lease.key);
        }
        Ok(())
    }
}

/// Redis locks when reachable, otherwise process-local ones.
pub async fn connect_locks(redis_url: &str) -> Arc<dyn PaymentLocks> {
    match RedisPaymentLocks::new(redis_url).await {
        Ok(locks) => Arc::new(locks),
        Err(e) => {
            tracing::warn!(
                "Redis lock backend unavailable: {}, using in-process locks only",
                e
            );
            Arc::new(MemoryPaymentLocks::new())
        }
    }
}
