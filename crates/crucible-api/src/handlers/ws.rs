//! WebSocket endpoint — per-job subscriptions.
//!
//! On `subscribe:job` the socket joins the room, gets a snapshot of the
//! persisted log tail and current status, then live events flow from
//! the bus. The snapshot+live overlap is deduplicable client-side on
//! `(timestamp, message, kind)`; a gap is not possible because the
//! room is joined before the snapshot is read.

use std::collections::HashMap;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use crucible_services::{ClientEvent, ServerEvent};

use super::ApiState;

pub async fn handle_ws(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_session(state, socket))
}

async fn client_session(state: ApiState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // Events from all of this client's rooms funnel through one channel
    // so the socket has a single writer.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(ClientEvent::Subscribe { job_id }) => {
                                subscribe(&state, &mut forwarders, &event_tx, job_id).await;
                            }
                            Ok(ClientEvent::Unsubscribe { job_id }) => {
                                if let Some(task) = forwarders.remove(&job_id) {
                                    task.abort();
                                }
                                state.hub.unsubscribe(&job_id);
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring malformed client event");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the transport
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    for (job_id, task) in forwarders {
        task.abort();
        state.hub.unsubscribe(&job_id);
    }
}

/// Join a room, emit the snapshot, and bridge room events into the
/// client channel. Double-subscribes are no-ops.
async fn subscribe(
    state: &ApiState,
    forwarders: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    event_tx: &mpsc::UnboundedSender<ServerEvent>,
    job_id: String,
) {
    if forwarders.contains_key(&job_id) {
        return;
    }

    // Join the room first: events arriving while the snapshot reads are
    // overlap, not a gap.
    let mut room_rx = state.hub.subscribe(&job_id);

    match state.store.get(&job_id).await {
        Ok(Some(job)) => {
            let _ = event_tx.send(ServerEvent::Snapshot {
                job_id: job.id,
                logs: job.logs,
                status: job.status,
            });
        }
        Ok(None) => {
            tracing::debug!(job_id = %job_id, "subscribe to unknown job, snapshot skipped");
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "snapshot read failed");
        }
    }

    let tx = event_tx.clone();
    let task = tokio::spawn(async move {
        loop {
            match room_rx.recv().await {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                // Slow client: skip what was lost and keep going.
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(lagged = n, "room receiver lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    forwarders.insert(job_id, task);
}
