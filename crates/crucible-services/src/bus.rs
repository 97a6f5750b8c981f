//! PubSub bus — cross-process fan-out of per-job log and status events.
//!
//! Best-effort and fire-and-forget: publish failures are logged and
//! dropped, never surfaced to the job path. The bus is not durable;
//! late subscribers catch up from the job store snapshot instead.

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::broadcast;

use crucible_core::JobError;
use crucible_core::config::BrokerConfig;
use crucible_core::job::{LogEvent, StatusEvent, log_channel, status_channel};

use crate::hub::{ServerEvent, SocketHub};

#[derive(Clone)]
pub struct Bus {
    conn: Option<MultiplexedConnection>,
}

impl Bus {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, JobError> {
        let client =
            redis::Client::open(config.url()).map_err(|e| JobError::Transient(format!("bus: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| JobError::Transient(format!("bus: {e}")))?;
        Ok(Self { conn: Some(conn) })
    }

    /// A bus that drops every event. Jobs still finish and clients still
    /// see persisted state through snapshots.
    pub fn offline() -> Self {
        Self { conn: None }
    }

    /// Publish one log record on `job:log:{id}`. Errors are dropped.
    pub async fn publish_log(&self, event: &LogEvent) {
        let Some(conn) = &self.conn else {
            return;
        };
        let Ok(text) = serde_json::to_string(event) else {
            return;
        };
        let mut conn = conn.clone();
        let published: Result<(), _> = conn.publish(log_channel(&event.job_id), text).await;
        if let Err(e) = published {
            tracing::warn!(job_id = %event.job_id, error = %e, "log publish dropped");
        }
    }

    /// Publish a status transition on `job:status:{id}`. Errors are dropped.
    pub async fn publish_status(&self, event: &StatusEvent) {
        let Some(conn) = &self.conn else {
            return;
        };
        let Ok(text) = serde_json::to_string(event) else {
            return;
        };
        let mut conn = conn.clone();
        let published: Result<(), _> = conn.publish(status_channel(&event.job_id), text).await;
        if let Err(e) = published {
            tracing::warn!(job_id = %event.job_id, error = %e, "status publish dropped");
        }
    }
}

/// Subscribe to all job channels and forward decoded events into the
/// hub's rooms. Runs until shutdown; intended for API processes.
pub async fn subscribe_loop(
    config: &BrokerConfig,
    hub: SocketHub,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), JobError> {
    let client =
        redis::Client::open(config.url()).map_err(|e| JobError::Transient(format!("bus: {e}")))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| JobError::Transient(format!("bus: {e}")))?;
    pubsub
        .psubscribe("job:log:*")
        .await
        .map_err(|e| JobError::Transient(format!("bus: {e}")))?;
    pubsub
        .psubscribe("job:status:*")
        .await
        .map_err(|e| JobError::Transient(format!("bus: {e}")))?;

    tracing::info!("bus subscriber started");
    let mut stream = pubsub.on_message();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("bus subscriber stopping");
                return Ok(());
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Err(JobError::Transient("bus subscription closed".into()));
                };
                let channel = msg.get_channel_name().to_string();
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                forward(&hub, &channel, &payload);
            }
        }
    }
}

/// Decode a bus message and deliver it to the matching room.
fn forward(hub: &SocketHub, channel: &str, payload: &str) {
    if channel.strip_prefix("job:log:").is_some() {
        match serde_json::from_str::<LogEvent>(payload) {
            Ok(event) => {
                let room = event.job_id.clone();
                hub.deliver(
                    &room,
                    ServerEvent::Log {
                        job_id: event.job_id,
                        log: event.log,
                    },
                );
            }
            Err(e) => tracing::debug!(channel, error = %e, "unparseable log event"),
        }
    } else if channel.strip_prefix("job:status:").is_some() {
        match serde_json::from_str::<StatusEvent>(payload) {
            Ok(event) => {
                let room = event.job_id.clone();
                hub.deliver(
                    &room,
                    ServerEvent::Status {
                        job_id: event.job_id,
                        status: event.status,
                        result: event.result,
                    },
                );
            }
            Err(e) => tracing::debug!(channel, error = %e, "unparseable status event"),
        }
    } else {
        tracing::debug!(channel, "message on unexpected channel, ignoring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::job::{JobStatus, LogRecord};

    #[test]
    fn forward_routes_log_events_into_rooms() {
        let hub = SocketHub::new();
        let mut rx = hub.subscribe("j1");

        let event = LogEvent {
            job_id: "j1".into(),
            log: LogRecord::info("Compiling"),
        };
        forward(&hub, "job:log:j1", &serde_json::to_string(&event).unwrap());

        match rx.try_recv().unwrap() {
            ServerEvent::Log { job_id, log } => {
                assert_eq!(job_id, "j1");
                assert_eq!(log.message, "Compiling");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn forward_routes_status_events_into_rooms() {
        let hub = SocketHub::new();
        let mut rx = hub.subscribe("j2");

        let event = StatusEvent {
            job_id: "j2".into(),
            status: JobStatus::Completed,
            result: None,
        };
        forward(&hub, "job:status:j2", &serde_json::to_string(&event).unwrap());

        match rx.try_recv().unwrap() {
            ServerEvent::Status { status, .. } => assert_eq!(status, JobStatus::Completed),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn forward_ignores_garbage() {
        let hub = SocketHub::new();
        let mut rx = hub.subscribe("j3");
        forward(&hub, "job:log:j3", "not json");
        forward(&hub, "something:else", "{}");
        assert!(rx.try_recv().is_err());
    }
}
