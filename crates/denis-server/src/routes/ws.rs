use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use denis_hub::{Subscription, DEFAULT_MAX_BUFFERED};

use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug)]
enum ClientFrame {
    Subscribe {
        conversation_id: Option<String>,
        last_event_id: i64,
    },
    Pong,
    Other,
}

enum DrainOutcome {
    Resubscribe(ClientFrame),
    Closed,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.conversation_id))
}

/// One subscriber connection: hello, subscribe with replay, then live
/// delivery with a periodic heartbeat. Any socket error tears the
/// subscription down; the HTTP side is never affected.
async fn handle_socket(socket: WebSocket, state: AppState, conversation_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let hello = json!({
        "type": "hello",
        "server_time": denis_core::utc_now_iso(),
        "schema_version": denis_core::SCHEMA_VERSION,
    });
    if send_json(&mut sender, &hello).await.is_err() {
        return;
    }

    let mut conv_id = denis_core::event::normalize_conversation_id(conversation_id.as_deref());
    let mut pending: Option<ClientFrame> = None;

    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => match next_client_frame(&mut receiver).await {
                Some(frame) => frame,
                None => return,
            },
        };
        let ClientFrame::Subscribe {
            conversation_id,
            last_event_id,
        } = frame
        else {
            continue;
        };

        if let Some(requested) = conversation_id {
            conv_id = denis_core::event::normalize_conversation_id(Some(&requested));
        }
        let last_event_id = last_event_id.max(0);

        let mut subscription = state
            .frontdoor
            .hub()
            .register(&conv_id, DEFAULT_MAX_BUFFERED);
        debug!(
            event = "ws_subscribed",
            conversation_id = %conv_id,
            last_event_id,
            conn_id = subscription.conn_id
        );

        // Replay persisted events into the same queue live events use.
        match state.frontdoor.store().query_after(&conv_id, last_event_id) {
            Ok(events) => {
                for event in events {
                    if !subscription.try_enqueue(event) {
                        warn!(event = "ws_replay_overflow", conversation_id = %conv_id);
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(event = "ws_replay_failed", error = %err);
            }
        }

        let outcome = drain(&mut sender, &mut receiver, &mut subscription).await;
        state.frontdoor.hub().unregister(&subscription);
        match outcome {
            DrainOutcome::Resubscribe(frame) => pending = Some(frame),
            DrainOutcome::Closed => return,
        }
    }
}

async fn drain(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    subscription: &mut Subscription,
) -> DrainOutcome {
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            maybe_event = subscription.recv() => {
                let Some(event) = maybe_event else {
                    return DrainOutcome::Closed;
                };
                let Ok(value) = serde_json::to_value(&event) else {
                    continue;
                };
                if send_json(sender, &value).await.is_err() {
                    return DrainOutcome::Closed;
                }
                heartbeat.reset();
            }
            frame = next_client_frame(receiver) => {
                match frame {
                    None => return DrainOutcome::Closed,
                    Some(ClientFrame::Pong) => heartbeat.reset(),
                    Some(subscribe @ ClientFrame::Subscribe { .. }) => {
                        // Re-subscribe switches conversation or resets replay.
                        return DrainOutcome::Resubscribe(subscribe);
                    }
                    Some(ClientFrame::Other) => {}
                }
            }
            _ = heartbeat.tick() => {
                let ping = json!({"type": "ping", "ts": denis_core::utc_now_iso()});
                if send_json(sender, &ping).await.is_err() {
                    return DrainOutcome::Closed;
                }
            }
        }
    }
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, value: &Value) -> Result<(), ()> {
    let text = value.to_string();
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

async fn next_client_frame(receiver: &mut SplitStream<WebSocket>) -> Option<ClientFrame> {
    loop {
        let message = match receiver.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!(event = "ws_read_error", error = %err);
                return None;
            }
            None => return None,
        };
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let Ok(value) = serde_json::from_slice::<Value>(&data) else {
            continue;
        };
        return Some(parse_frame(&value));
    }
}

fn parse_frame(value: &Value) -> ClientFrame {
    match value.get("type").and_then(Value::as_str) {
        Some("subscribe") => ClientFrame::Subscribe {
            conversation_id: value
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            last_event_id: value
                .get("last_event_id")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        },
        Some("pong") => ClientFrame::Pong,
        _ => ClientFrame::Other,
    }
}
