//! Queue adapter — named queues on the broker with at-least-once dispatch.
//!
//! A payload is claimed with `BLMOVE queue → queue:processing`, so a
//! worker that dies mid-job leaves its envelope on the processing list;
//! `recover` moves stale entries back at worker boot and the payload is
//! re-delivered. Acking removes the envelope from the processing list.
//!
//! Retry policy: up to `MAX_ATTEMPTS` deliveries with exponential
//! backoff on a 2s base. Completed handles are retained 24h (capped at
//! 1000); final failed envelopes are retained 7d.

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crucible_core::JobError;
use crucible_core::config::BrokerConfig;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
const COMPLETED_CAP: isize = 1000;
const COMPLETED_TTL_SECS: i64 = 24 * 60 * 60;
const FAILED_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Envelope carried on a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery<T> {
    /// Broker correlation handle, unique per logical job.
    pub handle: String,
    /// 1-based delivery attempt.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: T,
}

/// A claimed envelope plus the raw text needed to ack it off the
/// processing list.
#[derive(Debug)]
pub struct Claimed<T> {
    pub delivery: Delivery<T>,
    raw: String,
}

/// What happened to a payload that was handed back for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Re-enqueued (after backoff) for another attempt.
    Requeued { attempt: u32, delay: Duration },
    /// Attempts exhausted; parked on the failed list.
    Exhausted,
}

/// Delay before the next delivery of `attempt` (1-based): 2s, 4s, 8s…
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

fn queue_key(queue: &str) -> String {
    format!("queue:{queue}")
}

fn processing_key(queue: &str) -> String {
    format!("queue:{queue}:processing")
}

fn completed_key(queue: &str) -> String {
    format!("queue:{queue}:completed")
}

fn failed_key(queue: &str) -> String {
    format!("queue:{queue}:failed")
}

fn broker_err(e: redis::RedisError) -> JobError {
    JobError::Transient(format!("broker: {e}"))
}

#[derive(Clone)]
pub struct QueueAdapter {
    conn: MultiplexedConnection,
}

impl QueueAdapter {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, JobError> {
        let client = redis::Client::open(config.url()).map_err(broker_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(broker_err)?;
        Ok(Self { conn })
    }

    /// Enqueue a payload under `handle`. Returns the handle.
    pub async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        handle: &str,
        payload: &T,
    ) -> Result<String, JobError> {
        let envelope = Delivery {
            handle: handle.to_string(),
            attempt: 1,
            enqueued_at: Utc::now(),
            payload,
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|e| JobError::BadInput(format!("payload: {e}")))?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(queue_key(queue), text).await.map_err(broker_err)?;
        Ok(handle.to_string())
    }

    /// Claim the next payload, blocking up to `timeout`. None on timeout.
    pub async fn next<T: DeserializeOwned>(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Claimed<T>>, JobError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .blmove(
                queue_key(queue),
                processing_key(queue),
                redis::Direction::Right,
                redis::Direction::Left,
                timeout.as_secs_f64(),
            )
            .await
            .map_err(broker_err)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(delivery) => Ok(Some(Claimed { delivery, raw })),
            Err(e) => {
                // A malformed envelope would redeliver forever; drop it.
                tracing::warn!(queue, error = %e, "dropping malformed envelope");
                let _: () = conn
                    .lrem(processing_key(queue), 1, &raw)
                    .await
                    .map_err(broker_err)?;
                Ok(None)
            }
        }
    }

    /// Ack a claimed payload as done. Records the handle on the
    /// completed list with retention.
    pub async fn complete<T>(&self, queue: &str, claimed: &Claimed<T>) -> Result<(), JobError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lrem(processing_key(queue), 1, &claimed.raw)
            .await
            .map_err(broker_err)?;
        let key = completed_key(queue);
        let _: () = conn
            .lpush(&key, &claimed.delivery.handle)
            .await
            .map_err(broker_err)?;
        let _: () = conn
            .ltrim(&key, 0, COMPLETED_CAP - 1)
            .await
            .map_err(broker_err)?;
        let _: () = conn
            .expire(&key, COMPLETED_TTL_SECS)
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    /// Hand a claimed payload back after a transient failure. Re-enqueues
    /// with backoff while attempts remain, otherwise parks it on the
    /// failed list.
    pub async fn retry<T: Serialize>(
        &self,
        queue: &str,
        claimed: Claimed<T>,
    ) -> Result<RetryDisposition, JobError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lrem(processing_key(queue), 1, &claimed.raw)
            .await
            .map_err(broker_err)?;

        let mut delivery = claimed.delivery;
        if delivery.attempt >= MAX_ATTEMPTS {
            let key = failed_key(queue);
            let _: () = conn.lpush(&key, &claimed.raw).await.map_err(broker_err)?;
            let _: () = conn.expire(&key, FAILED_TTL_SECS).await.map_err(broker_err)?;
            return Ok(RetryDisposition::Exhausted);
        }

        delivery.attempt += 1;
        let delay = backoff_delay(delivery.attempt, BACKOFF_BASE);
        let text = serde_json::to_string(&delivery)
            .map_err(|e| JobError::BadInput(format!("payload: {e}")))?;
        let key = queue_key(queue);
        let attempt = delivery.attempt;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let push: Result<(), _> = conn.lpush(&key, text).await;
            if let Err(e) = push {
                tracing::warn!(queue = %key, error = %e, "delayed re-enqueue failed");
            }
        });
        Ok(RetryDisposition::Requeued { attempt, delay })
    }

    /// Move stale processing entries back onto the queue. Run at worker
    /// boot so payloads claimed by a dead instance are re-delivered.
    pub async fn recover(&self, queue: &str) -> Result<usize, JobError> {
        let mut conn = self.conn.clone();
        let mut moved = 0usize;
        loop {
            let raw: Option<String> = conn
                .lmove(
                    processing_key(queue),
                    queue_key(queue),
                    redis::Direction::Right,
                    redis::Direction::Left,
                )
                .await
                .map_err(broker_err)?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Pending depth of a queue.
    pub async fn depth(&self, queue: &str) -> Result<u64, JobError> {
        let mut conn = self.conn.clone();
        conn.llen(queue_key(queue)).await.map_err(broker_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        assert_eq!(backoff_delay(1, BACKOFF_BASE), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, BACKOFF_BASE), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, BACKOFF_BASE), Duration::from_secs(8));
    }

    #[test]
    fn key_naming() {
        assert_eq!(queue_key("compile"), "queue:compile");
        assert_eq!(processing_key("deploy"), "queue:deploy:processing");
        assert_eq!(completed_key("compile"), "queue:compile:completed");
        assert_eq!(failed_key("deploy"), "queue:deploy:failed");
    }

    #[test]
    fn delivery_round_trips() {
        let delivery = Delivery {
            handle: "compile-abc".into(),
            attempt: 2,
            enqueued_at: Utc::now(),
            payload: serde_json::json!({ "job_id": "abc" }),
        };
        let text = serde_json::to_string(&delivery).unwrap();
        let back: Delivery<serde_json::Value> = serde_json::from_str(&text).unwrap();
        assert_eq!(back.handle, "compile-abc");
        assert_eq!(back.attempt, 2);
        assert_eq!(back.payload["job_id"], "abc");
    }
}
