//! Socket hub — per-job rooms fanning bus events out to subscribed
//! sockets.
//!
//! A room is a bounded broadcast channel keyed by job id. Slow receivers
//! lag and drop events; logs are not a durable protocol, the store
//! snapshot is the catch-up path. Rooms are cleaned up opportunistically
//! once their last receiver is gone.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crucible_core::job::{JobResult, JobStatus, LogEvent, LogRecord, StatusEvent};

use crate::bus::Bus;

/// Per-room buffer. A receiver further behind than this starts dropping.
const ROOM_BUFFER: usize = 256;

/// Events a client sends over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "subscribe:job")]
    Subscribe { job_id: String },
    #[serde(rename = "unsubscribe:job")]
    Unsubscribe { job_id: String },
}

/// Events the server sends to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// Emitted once on subscribe: the persisted log tail and current
    /// status. Live events follow; clients de-duplicate the overlap on
    /// `(timestamp, message, kind)`.
    #[serde(rename = "snapshot")]
    Snapshot {
        job_id: String,
        logs: Vec<LogRecord>,
        status: JobStatus,
    },
    #[serde(rename = "job:log")]
    Log { job_id: String, log: LogRecord },
    #[serde(rename = "job:status")]
    Status {
        job_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<JobResult>,
    },
}

#[derive(Clone, Default)]
pub struct SocketHub {
    rooms: Arc<DashMap<String, broadcast::Sender<ServerEvent>>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the room for a job, creating it on first subscriber.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ServerEvent> {
        self.rooms
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .subscribe()
    }

    /// Leave a room. Receivers unsubscribe by being dropped; this only
    /// reclaims the room entry once nobody is left. Idempotent.
    pub fn unsubscribe(&self, job_id: &str) {
        self.rooms
            .remove_if(job_id, |_, tx| tx.receiver_count() == 0);
    }

    /// Forward an event to the room, if anyone is listening. Returns the
    /// number of receivers it reached.
    pub fn deliver(&self, job_id: &str, event: ServerEvent) -> usize {
        match self.rooms.get(job_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// In-process emit: deliver to the local room and publish on the bus
    /// so workers and other API replicas see the same event.
    pub async fn emit_log(&self, bus: &Bus, job_id: &str, log: LogRecord) {
        self.deliver(
            job_id,
            ServerEvent::Log {
                job_id: job_id.to_string(),
                log: log.clone(),
            },
        );
        bus.publish_log(&LogEvent {
            job_id: job_id.to_string(),
            log,
        })
        .await;
    }

    /// In-process status emit, bridged to the bus like `emit_log`.
    pub async fn emit_status(
        &self,
        bus: &Bus,
        job_id: &str,
        status: JobStatus,
        result: Option<JobResult>,
    ) {
        self.deliver(
            job_id,
            ServerEvent::Status {
                job_id: job_id.to_string(),
                status,
                result: result.clone(),
            },
        );
        bus.publish_status(&StatusEvent {
            job_id: job_id.to_string(),
            status,
            result,
        })
        .await;
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Subscribers currently in a job's room.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.rooms
            .get(job_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(job_id: &str, message: &str) -> ServerEvent {
        ServerEvent::Log {
            job_id: job_id.to_string(),
            log: LogRecord::info(message),
        }
    }

    #[test]
    fn deliver_reaches_all_room_subscribers() {
        let hub = SocketHub::new();
        let mut a = hub.subscribe("j1");
        let mut b = hub.subscribe("j1");

        assert_eq!(hub.deliver("j1", log_event("j1", "hello")), 2);
        assert!(matches!(a.try_recv().unwrap(), ServerEvent::Log { .. }));
        assert!(matches!(b.try_recv().unwrap(), ServerEvent::Log { .. }));
    }

    #[test]
    fn deliver_without_room_is_dropped() {
        let hub = SocketHub::new();
        assert_eq!(hub.deliver("nobody", log_event("nobody", "x")), 0);
    }

    #[test]
    fn rooms_are_isolated() {
        let hub = SocketHub::new();
        let mut a = hub.subscribe("j1");
        let mut b = hub.subscribe("j2");

        hub.deliver("j1", log_event("j1", "for a"));
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_is_idempotent_and_reclaims_empty_rooms() {
        let hub = SocketHub::new();
        let rx = hub.subscribe("j1");
        assert_eq!(hub.room_count(), 1);

        // Room still has a receiver: entry stays.
        hub.unsubscribe("j1");
        assert_eq!(hub.room_count(), 1);

        drop(rx);
        hub.unsubscribe("j1");
        assert_eq!(hub.room_count(), 0);

        // Unknown room: no-op.
        hub.unsubscribe("j1");
        hub.unsubscribe("never-existed");
    }

    #[test]
    fn events_serialize_with_wire_names() {
        let event = log_event("j1", "Compiling");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "job:log");
        assert_eq!(json["log"]["kind"], "info");

        let snapshot = ServerEvent::Snapshot {
            job_id: "j1".into(),
            logs: vec![],
            status: JobStatus::Queued,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["event"], "snapshot");
        assert_eq!(json["status"], "queued");
    }

    #[test]
    fn client_events_parse_from_wire_names() {
        let parsed: ClientEvent =
            serde_json::from_str(r#"{"event":"subscribe:job","job_id":"j9"}"#).unwrap();
        assert!(matches!(parsed, ClientEvent::Subscribe { job_id } if job_id == "j9"));

        let parsed: ClientEvent =
            serde_json::from_str(r#"{"event":"unsubscribe:job","job_id":"j9"}"#).unwrap();
        assert!(matches!(parsed, ClientEvent::Unsubscribe { .. }));
    }

    #[tokio::test]
    async fn local_emits_reach_the_room_with_the_bus_down() {
        let hub = SocketHub::new();
        let bus = Bus::offline();
        let mut rx = hub.subscribe("j1");

        hub.emit_log(&bus, "j1", LogRecord::info("Compiling")).await;
        hub.emit_status(&bus, "j1", JobStatus::Queued, None).await;

        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Log { .. }));
        match rx.try_recv().unwrap() {
            ServerEvent::Status { status, result, .. } => {
                assert_eq!(status, JobStatus::Queued);
                assert!(result.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn slow_receiver_lags_instead_of_blocking() {
        let hub = SocketHub::new();
        let mut rx = hub.subscribe("j1");
        for i in 0..(ROOM_BUFFER + 50) {
            hub.deliver("j1", log_event("j1", &format!("line {i}")));
        }
        // The receiver lost the oldest events but the hub never blocked.
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
