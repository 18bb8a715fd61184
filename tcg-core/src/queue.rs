//! C8 — `ScanQueue` / `ImproveQueue`: durable, Redis-backed job queues with
//! idempotent enqueue, exponential-backoff retry, and bounded retention of
//! finished work. Per-queue concurrency (scan = 2, improve = 1) is enforced
//! by the worker process via semaphores, not by the queue client itself.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tcg_common::{CoreError, ImproveJobPayload, ScanJobPayload};

/// Retry/retention policy shared by both queues; the concrete values differ
/// only in `max_attempts` between scan and improve work.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub retain_last: usize,
}

impl QueuePolicy {
    pub const fn scan() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_secs(5),
            retain_last: 100,
        }
    }

    pub const fn improve() -> Self {
        Self {
            max_attempts: 2,
            base_backoff: Duration::from_secs(5),
            retain_last: 100,
        }
    }

    /// Backoff before the `attempt`-th retry (1-indexed): `base * 2^(attempt-1)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// One dequeued item, carrying enough state for the caller to report
/// success/failure back to the queue.
#[derive(Debug, Clone)]
pub struct QueuedItem<T> {
    pub key: String,
    pub payload: T,
    pub attempt: u32,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    key: String,
    attempt: u32,
    payload: T,
}

/// Outcome of reporting a failed dequeue back to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueued for another attempt after `delay`.
    Retry { delay: Duration },
    /// Attempts exhausted; the item is retired.
    Exhausted,
}

#[async_trait]
pub trait ScanQueue: Send + Sync {
    async fn enqueue(&self, payload: ScanJobPayload, dedupe_key: &str) -> Result<bool, CoreError>;
    async fn dequeue(&self, block_for: Duration) -> Result<Option<QueuedItem<ScanJobPayload>>, CoreError>;
    async fn complete(&self, item: &QueuedItem<ScanJobPayload>) -> Result<(), CoreError>;
    async fn fail(&self, item: QueuedItem<ScanJobPayload>) -> Result<RetryDecision, CoreError>;
}

#[async_trait]
pub trait ImproveQueue: Send + Sync {
    async fn enqueue(&self, payload: ImproveJobPayload, dedupe_key: &str) -> Result<bool, CoreError>;
    async fn dequeue(&self, block_for: Duration) -> Result<Option<QueuedItem<ImproveJobPayload>>, CoreError>;
    async fn complete(&self, item: &QueuedItem<ImproveJobPayload>) -> Result<(), CoreError>;
    async fn fail(&self, item: QueuedItem<ImproveJobPayload>) -> Result<RetryDecision, CoreError>;
}

/// Generic Redis-backed queue core shared by the scan and improve queues.
/// `name` namespaces every key so the two queues can share one Redis
/// instance without collision.
struct RedisQueueCore<T> {
    conn: ConnectionManager,
    name: &'static str,
    policy: QueuePolicy,
    _payload: PhantomData<T>,
}

impl<T> RedisQueueCore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(conn: ConnectionManager, name: &'static str, policy: QueuePolicy) -> Self {
        Self {
            conn,
            name,
            policy,
            _payload: PhantomData,
        }
    }

    fn list_key(&self) -> String {
        format!("tcg:{}:pending", self.name)
    }

    fn dedupe_key(&self) -> String {
        format!("tcg:{}:dedupe", self.name)
    }

    fn delayed_key(&self) -> String {
        format!("tcg:{}:delayed", self.name)
    }

    fn finished_key(&self) -> String {
        format!("tcg:{}:finished", self.name)
    }

    async fn enqueue(&self, payload: T, dedupe_key: &str) -> Result<bool, CoreError> {
        let mut conn = self.conn.clone();
        let added: bool = conn
            .sadd(self.dedupe_key(), dedupe_key)
            .await
            .map_err(|e| CoreError::Queue(format!("dedupe check failed: {e}")))?;
        if !added {
            return Ok(false);
        }

        let envelope = Envelope {
            key: dedupe_key.to_string(),
            attempt: 0,
            payload,
        };
        let serialized = serde_json::to_string(&envelope)
            .map_err(|e| CoreError::Queue(format!("payload serialize failed: {e}")))?;
        conn.lpush::<_, _, ()>(self.list_key(), serialized)
            .await
            .map_err(|e| CoreError::Queue(format!("enqueue push failed: {e}")))?;
        Ok(true)
    }

    /// Move due items from the delayed set into the pending list, then pop
    /// one from the pending list with a blocking timeout.
    async fn dequeue(&self, block_for: Duration) -> Result<Option<QueuedItem<T>>, CoreError> {
        self.promote_due().await?;

        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn
            .brpop(self.list_key(), block_for.as_secs_f64())
            .await
            .map_err(|e| CoreError::Queue(format!("dequeue failed: {e}")))?;

        let Some((_list, serialized)) = popped else {
            return Ok(None);
        };
        let envelope: Envelope<T> = serde_json::from_str(&serialized)
            .map_err(|e| CoreError::Queue(format!("payload deserialize failed: {e}")))?;
        Ok(Some(QueuedItem {
            key: envelope.key,
            payload: envelope.payload,
            attempt: envelope.attempt,
        }))
    }

    async fn promote_due(&self) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        let now_millis = current_epoch_millis();
        let due: Vec<String> = conn
            .zrangebyscore(self.delayed_key(), 0, now_millis)
            .await
            .map_err(|e| CoreError::Queue(format!("delayed scan failed: {e}")))?;
        for serialized in due {
            conn.zrem::<_, _, ()>(self.delayed_key(), &serialized)
                .await
                .map_err(|e| CoreError::Queue(format!("delayed removal failed: {e}")))?;
            conn.lpush::<_, _, ()>(self.list_key(), serialized)
                .await
                .map_err(|e| CoreError::Queue(format!("promote push failed: {e}")))?;
        }
        Ok(())
    }

    async fn complete(&self, item: &QueuedItem<T>) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(self.dedupe_key(), &item.key)
            .await
            .map_err(|e| CoreError::Queue(format!("dedupe release failed: {e}")))?;
        self.record_finished(&item.key).await
    }

    async fn fail(&self, item: QueuedItem<T>) -> Result<RetryDecision, CoreError> {
        let next_attempt = item.attempt + 1;
        if next_attempt >= self.policy.max_attempts {
            let mut conn = self.conn.clone();
            conn.srem::<_, _, ()>(self.dedupe_key(), &item.key)
                .await
                .map_err(|e| CoreError::Queue(format!("dedupe release failed: {e}")))?;
            self.record_finished(&item.key).await?;
            return Ok(RetryDecision::Exhausted);
        }

        let delay = self.policy.backoff_for_attempt(next_attempt);
        let envelope = Envelope {
            key: item.key,
            attempt: next_attempt,
            payload: item.payload,
        };
        let serialized = serde_json::to_string(&envelope)
            .map_err(|e| CoreError::Queue(format!("payload serialize failed: {e}")))?;

        let mut conn = self.conn.clone();
        let ready_at = current_epoch_millis() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(self.delayed_key(), serialized, ready_at)
            .await
            .map_err(|e| CoreError::Queue(format!("delayed insert failed: {e}")))?;
        Ok(RetryDecision::Retry { delay })
    }

    async fn record_finished(&self, key: &str) -> Result<(), CoreError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.finished_key(), key)
            .await
            .map_err(|e| CoreError::Queue(format!("finished record failed: {e}")))?;
        conn.ltrim::<_, ()>(self.finished_key(), 0, self.policy.retain_last as isize - 1)
            .await
            .map_err(|e| CoreError::Queue(format!("finished trim failed: {e}")))?;
        Ok(())
    }
}

fn current_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct RedisScanQueue {
    core: RedisQueueCore<ScanJobPayload>,
}

impl RedisScanQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            core: RedisQueueCore::new(conn, "scan", QueuePolicy::scan()),
        }
    }
}

#[async_trait]
impl ScanQueue for RedisScanQueue {
    async fn enqueue(&self, payload: ScanJobPayload, dedupe_key: &str) -> Result<bool, CoreError> {
        self.core.enqueue(payload, dedupe_key).await
    }

    async fn dequeue(&self, block_for: Duration) -> Result<Option<QueuedItem<ScanJobPayload>>, CoreError> {
        self.core.dequeue(block_for).await
    }

    async fn complete(&self, item: &QueuedItem<ScanJobPayload>) -> Result<(), CoreError> {
        self.core.complete(item).await
    }

    async fn fail(&self, item: QueuedItem<ScanJobPayload>) -> Result<RetryDecision, CoreError> {
        self.core.fail(item).await
    }
}

pub struct RedisImproveQueue {
    core: RedisQueueCore<ImproveJobPayload>,
}

impl RedisImproveQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            core: RedisQueueCore::new(conn, "improve", QueuePolicy::improve()),
        }
    }
}

#[async_trait]
impl ImproveQueue for RedisImproveQueue {
    async fn enqueue(&self, payload: ImproveJobPayload, dedupe_key: &str) -> Result<bool, CoreError> {
        self.core.enqueue(payload, dedupe_key).await
    }

    async fn dequeue(&self, block_for: Duration) -> Result<Option<QueuedItem<ImproveJobPayload>>, CoreError> {
        self.core.dequeue(block_for).await
    }

    async fn complete(&self, item: &QueuedItem<ImproveJobPayload>) -> Result<(), CoreError> {
        self.core.complete(item).await
    }

    async fn fail(&self, item: QueuedItem<ImproveJobPayload>) -> Result<RetryDecision, CoreError> {
        self.core.fail(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = QueuePolicy::scan();
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_secs(20));
    }

    #[test]
    fn scan_and_improve_policies_cap_at_two_attempts() {
        assert_eq!(QueuePolicy::scan().max_attempts, 2);
        assert_eq!(QueuePolicy::improve().max_attempts, 2);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope {
            key: "scan-1-2".to_string(),
            attempt: 1,
            payload: ScanJobPayload {
                repo_id: uuid::Uuid::new_v4(),
            },
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope<ScanJobPayload> = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded.key, envelope.key);
        assert_eq!(decoded.attempt, 1);
    }
}
