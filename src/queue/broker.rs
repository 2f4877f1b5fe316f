use crate::error::QueueError;
use async_trait::async_trait;
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands, Value,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(600);

/// XAUTOCLAIM cursor that starts a sweep, and that the server returns once a
/// sweep has covered the whole pending list.
const SWEEP_START: &str = "0-0";

/// A message handed to a consumer. It stays pending until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub queue: String,
    pub body: Vec<u8>,
    /// True when the message was handed out before without an ack.
    pub redelivered: bool,
}

/// Durable queue transport with manual acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Creates the queue if needed. Safe to call repeatedly.
    async fn declare(&self, queue: &str) -> Result<(), QueueError>;

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError>;

    /// Returns up to `max` deliveries, waiting at most `block` for the first.
    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadStep {
    /// This consumer's own pending entries after the given id.
    Backlog(String),
    /// Idle pending entries of any consumer, continuing a sweep.
    Claim(String),
    New,
}

/// Per-queue read position. A fresh connection first replays its own
/// backlog, then sweeps for idle entries, then reads new messages. Sweeps
/// repeat once per idle period.
#[derive(Debug)]
struct ReadState {
    backlog: Option<String>,
    claim_from: String,
    next_sweep: Option<Instant>,
}

impl ReadState {
    fn new() -> Self {
        Self {
            backlog: Some("0".to_string()),
            claim_from: SWEEP_START.to_string(),
            next_sweep: None,
        }
    }

    fn next_step(&self, now: Instant) -> ReadStep {
        if let Some(after) = &self.backlog {
            return ReadStep::Backlog(after.clone());
        }
        match self.next_sweep {
            Some(at) if now < at => ReadStep::New,
            _ => ReadStep::Claim(self.claim_from.clone()),
        }
    }

    /// `last` is the highest id the backlog read returned; `None` ends the replay.
    fn backlog_read(&mut self, last: Option<&str>) {
        self.backlog = last.map(str::to_string);
    }

    fn claim_read(&mut self, next_start: &str, now: Instant, idle: Duration) {
        if next_start == SWEEP_START {
            self.next_sweep = Some(now + idle);
        }
        self.claim_from = next_start.to_string();
    }
}

/// Splits stream entries into deliveries and the ids of entries without a body.
fn into_deliveries(
    queue: &str,
    entries: Vec<StreamId>,
    redelivered: bool,
) -> (Vec<Delivery>, Vec<String>) {
    let mut deliveries = Vec::new();
    let mut unreadable = Vec::new();
    for entry in entries {
        match entry.get::<Vec<u8>>("body") {
            Some(body) => deliveries.push(Delivery {
                id: entry.id,
                queue: queue.to_string(),
                body,
                redelivered,
            }),
            None => unreadable.push(entry.id),
        }
    }
    (deliveries, unreadable)
}

/// Reads an XAUTOCLAIM reply: `[next-cursor, [[id, [field, value, ...]], ...], ...]`.
fn parse_autoclaim(reply: Value) -> Result<(String, Vec<StreamId>), QueueError> {
    let malformed = || QueueError::Broker("unexpected XAUTOCLAIM reply".to_string());

    let Value::Bulk(parts) = reply else {
        return Err(malformed());
    };
    let mut parts = parts.into_iter();
    let next: String = match parts.next() {
        Some(cursor) => redis::from_redis_value(&cursor)?,
        None => return Err(malformed()),
    };
    let Some(Value::Bulk(entries)) = parts.next() else {
        return Err(malformed());
    };

    let mut claimed = Vec::new();
    for entry in entries {
        // Older servers report entries deleted from the stream as nil
        let Value::Bulk(pair) = entry else {
            continue;
        };
        let mut pair = pair.into_iter();
        let Some(id) = pair.next() else {
            continue;
        };
        let id: String = redis::from_redis_value(&id)?;

        let mut map = HashMap::new();
        if let Some(Value::Bulk(fields)) = pair.next() {
            for field in fields.chunks(2) {
                if let [name, value] = field {
                    map.insert(redis::from_redis_value::<String>(name)?, value.clone());
                }
            }
        }
        claimed.push(StreamId { id, map });
    }
    Ok((next, claimed))
}

/// Queues as Redis streams, consumed through a consumer group.
pub struct RedisStreamBroker {
    /// Blocking XREADGROUP calls get their own connection.
    reader: MultiplexedConnection,
    writer: ConnectionManager,
    group: String,
    consumer: String,
    /// Pending entries idle this long are taken over by this consumer.
    claim_idle: Duration,
    reads: Mutex<HashMap<String, ReadState>>,
}

impl RedisStreamBroker {
    pub async fn connect(redis_url: &str, group: &str, consumer: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let reader = client.get_multiplexed_async_connection().await?;
        let writer = client.get_connection_manager().await?;
        tracing::info!(group, consumer, "Connected to Redis stream broker");
        Ok(Self {
            reader,
            writer,
            group: group.to_string(),
            consumer: consumer.to_string(),
            claim_idle: DEFAULT_CLAIM_IDLE,
            reads: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    fn with_state<T>(&self, queue: &str, f: impl FnOnce(&mut ReadState) -> T) -> T {
        let mut reads = self.reads.lock().unwrap_or_else(|e| e.into_inner());
        f(reads.entry(queue.to_string()).or_insert_with(ReadState::new))
    }

    /// Returns the deliveries plus the last raw entry id read.
    async fn read(
        &self,
        queue: &str,
        start: &str,
        max: usize,
        block: Option<Duration>,
    ) -> Result<(Vec<Delivery>, Option<String>), QueueError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        if let Some(block) = block {
            options = options.block(block.as_millis().max(1) as usize);
        }

        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[queue], &[start], &options)
            .await?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .collect();
        let last = entries.last().map(|entry| entry.id.clone());
        let deliveries = self.settle(queue, entries, start != ">").await?;
        Ok((deliveries, last))
    }

    /// Takes over entries idle longer than `claim_idle`, whoever held them.
    async fn claim(
        &self,
        queue: &str,
        start: &str,
        max: usize,
    ) -> Result<(String, Vec<Delivery>), QueueError> {
        let mut conn = self.writer.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg(start)
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        let (next, entries) = parse_autoclaim(reply)?;
        let claimed = self.settle(queue, entries, true).await?;
        Ok((next, claimed))
    }

    /// Entries without a body can never be handled; acknowledge them here.
    async fn settle(
        &self,
        queue: &str,
        entries: Vec<StreamId>,
        redelivered: bool,
    ) -> Result<Vec<Delivery>, QueueError> {
        let (deliveries, unreadable) = into_deliveries(queue, entries, redelivered);
        if !unreadable.is_empty() {
            tracing::warn!(queue, count = unreadable.len(), "Stream entries have no body, acknowledging");
            let mut writer = self.writer.clone();
            writer
                .xack::<_, _, _, i64>(queue, &self.group, unreadable.as_slice())
                .await?;
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.writer.clone();
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(queue, &self.group, "0")
            .await
        {
            Ok(()) => {
                tracing::info!(queue, group = %self.group, "Declared queue");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), QueueError> {
        let mut conn = self.writer.clone();
        let id: String = conn.xadd(queue, "*", &[("body", body)]).await?;
        tracing::debug!(queue, %id, "Published message");
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        loop {
            match self.with_state(queue, |state| state.next_step(Instant::now())) {
                ReadStep::Backlog(after) => {
                    let (pending, last) = self.read(queue, &after, max, None).await?;
                    self.with_state(queue, |state| state.backlog_read(last.as_deref()));
                    if !pending.is_empty() {
                        tracing::info!(queue, count = pending.len(), "Redelivering unacknowledged messages");
                        return Ok(pending);
                    }
                }
                ReadStep::Claim(start) => {
                    let (next, claimed) = self.claim(queue, &start, max).await?;
                    self.with_state(queue, |state| {
                        state.claim_read(&next, Instant::now(), self.claim_idle)
                    });
                    if !claimed.is_empty() {
                        tracing::info!(queue, count = claimed.len(), "Took over idle unacknowledged messages");
                        return Ok(claimed);
                    }
                    return Ok(self.read(queue, ">", max, Some(block)).await?.0);
                }
                ReadStep::New => return Ok(self.read(queue, ">", max, Some(block)).await?.0),
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.writer.clone();
        let _: i64 = conn
            .xack(&delivery.queue, &self.group, &[&delivery.id])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> Value {
        Value::Data(text.as_bytes().to_vec())
    }

    #[test]
    fn read_state_replays_backlog_then_sweeps_then_reads_new() {
        let idle = Duration::from_secs(600);
        let now = Instant::now();
        let mut state = ReadState::new();

        assert_eq!(state.next_step(now), ReadStep::Backlog("0".to_string()));
        state.backlog_read(Some("5-0"));
        assert_eq!(state.next_step(now), ReadStep::Backlog("5-0".to_string()));
        state.backlog_read(None);

        // First sweep runs straight away and continues until the cursor wraps
        assert_eq!(state.next_step(now), ReadStep::Claim(SWEEP_START.to_string()));
        state.claim_read("9-0", now, idle);
        assert_eq!(state.next_step(now), ReadStep::Claim("9-0".to_string()));
        state.claim_read(SWEEP_START, now, idle);

        assert_eq!(state.next_step(now), ReadStep::New);
        assert_eq!(state.next_step(now + idle / 2), ReadStep::New);
        assert_eq!(
            state.next_step(now + idle),
            ReadStep::Claim(SWEEP_START.to_string())
        );
    }

    #[test]
    fn autoclaim_reply_yields_redeliveries_and_bodyless_ids() {
        let reply = Value::Bulk(vec![
            bulk("0-0"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    bulk("1-0"),
                    Value::Bulk(vec![bulk("body"), bulk(r#"{"user_name":"alice"}"#)]),
                ]),
                Value::Nil,
                Value::Bulk(vec![bulk("2-0"), Value::Bulk(vec![bulk("other"), bulk("x")])]),
            ]),
            Value::Bulk(vec![]),
        ]);

        let (next, entries) = parse_autoclaim(reply).unwrap();
        assert_eq!(next, SWEEP_START);
        assert_eq!(entries.len(), 2);

        let (deliveries, unreadable) = into_deliveries("q", entries, true);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].id, "1-0");
        assert_eq!(deliveries[0].queue, "q");
        assert_eq!(deliveries[0].body, br#"{"user_name":"alice"}"#.to_vec());
        assert!(deliveries[0].redelivered);
        assert_eq!(unreadable, vec!["2-0".to_string()]);
    }

    #[test]
    fn malformed_autoclaim_reply_is_a_broker_error() {
        assert!(matches!(
            parse_autoclaim(Value::Okay),
            Err(QueueError::Broker(_))
        ));
        assert!(matches!(
            parse_autoclaim(Value::Bulk(vec![bulk("0-0")])),
            Err(QueueError::Broker(_))
        ));
    }

    /// Runs against a real server only when `REDIS_TEST_URL` is set.
    #[tokio::test]
    async fn stream_broker_redelivers_and_takes_over_idle_entries() {
        let Ok(url) = std::env::var("REDIS_TEST_URL") else {
            return;
        };
        let queue = format!("pay-confirm-test-{}", uuid::Uuid::new_v4());
        let block = Duration::from_millis(100);

        let crashed = RedisStreamBroker::connect(&url, "workers", "crashed")
            .await
            .unwrap();
        crashed.declare(&queue).await.unwrap();
        // Existing group is not an error
        crashed.declare(&queue).await.unwrap();
        crashed.publish(&queue, b"first").await.unwrap();

        let first = crashed.fetch(&queue, 10, block).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].redelivered);
        drop(crashed);

        let restarted = RedisStreamBroker::connect(&url, "workers", "crashed")
            .await
            .unwrap();
        let replay = restarted.fetch(&queue, 10, block).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].body, b"first".to_vec());
        assert!(replay[0].redelivered);

        let other = RedisStreamBroker::connect(&url, "workers", "other")
            .await
            .unwrap()
            .with_claim_idle(Duration::ZERO);
        let claimed = other.fetch(&queue, 10, block).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first[0].id);
        assert!(claimed[0].redelivered);
        other.ack(&claimed[0]).await.unwrap();

        let mut conn = redis::Client::open(url.as_str())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let _: String = redis::cmd("XADD")
            .arg(&queue)
            .arg("*")
            .arg("other")
            .arg("x")
            .query_async(&mut conn)
            .await
            .unwrap();
        other.publish(&queue, b"second").await.unwrap();

        let next = other.fetch(&queue, 10, block).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].body, b"second".to_vec());
        other.ack(&next[0]).await.unwrap();

        let pending: redis::streams::StreamPendingReply =
            conn.xpending(&queue, "workers").await.unwrap();
        assert_eq!(pending.count(), 0);

        let _: i64 = conn.del(&queue).await.unwrap();
    }
}
