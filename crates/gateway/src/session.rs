//! Attached-session I/O pair.
//!
//! Each session runs exactly two tasks: the reader (inline on the upgrade
//! task) and the writer (spawned). The writer is the only task touching the
//! socket's sink, which is what guarantees per-session frame ordering.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use metrics::counter;
use nats_client::NatsClient;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::connection::{ClientId, Connection};
use crate::consumer::EVENTS_SUBJECT;
use crate::error::{GatewayError, Result};
use crate::metrics::{ERRORS_TOTAL, MESSAGES_RECEIVED};
use crate::protocol::{self, ClientMessage, Envelope};
use crate::rooms::RoomManager;
use crate::ws_server::AppState;

/// Run an attached session to completion.
///
/// Spawns the writer, runs the reader inline, then detaches: the connection
/// is removed from the index exactly once, which closes its queue and lets
/// the writer drain and exit.
pub(crate) async fn run_session(
    state: Arc<AppState>,
    socket: WebSocket,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Utf8Bytes>,
) {
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        state.ws.ping_interval,
        state.ws.write_timeout,
        conn.id,
    ));

    let read = AssertUnwindSafe(read_loop(&state, &conn, stream)).catch_unwind();
    if read.await.is_err() {
        error!("Panic in read loop for conn {}", conn.id);
    }

    state.manager.remove(conn.id);
    let _ = writer.await;
}

/// Single-owner socket writer: outbound queue plus keep-alive pings, every
/// write under a deadline.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    ping_interval: Duration,
    write_timeout: Duration,
    conn_id: ClientId,
) {
    let mut ping = interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.reset(); // don't fire immediately

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                // `None` means the queue was closed by detach.
                let Some(frame) = frame else { break };
                match timeout(write_timeout, sink.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Write error on conn {}: {}", conn_id, e);
                        break;
                    }
                    Err(_) => {
                        debug!("Write deadline exceeded on conn {}", conn_id);
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                match timeout(write_timeout, sink.send(Message::Ping(vec![].into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Ping error on conn {}: {}", conn_id, e);
                        break;
                    }
                    Err(_) => {
                        debug!("Ping deadline exceeded on conn {}", conn_id);
                        break;
                    }
                }
            }
        }
    }

    // Half-close politely; the peer may already be gone.
    let _ = sink.send(Message::Close(None)).await;
}

async fn read_loop(state: &Arc<AppState>, conn: &Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                counter!(MESSAGES_RECEIVED).increment(1);
                conn.touch();
                dispatch_text(state, conn, text.as_str()).await;
            }
            Ok(Message::Binary(data)) => {
                counter!(MESSAGES_RECEIVED).increment(1);
                conn.touch();
                match std::str::from_utf8(&data) {
                    Ok(text) => dispatch_text(state, conn, text).await,
                    Err(_) => {
                        warn!("Discarding non-UTF-8 binary frame from conn {}", conn.id)
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => conn.touch(),
            Ok(Message::Close(_)) => {
                debug!("Conn {} closed by peer", conn.id);
                break;
            }
            Err(e) => {
                debug!("Read error on conn {}: {}", conn.id, e);
                break;
            }
        }
    }
}

/// Parse and dispatch one inbound text frame. Malformed JSON is logged and
/// skipped; it never ends the session.
async fn dispatch_text(state: &Arc<AppState>, conn: &Arc<Connection>, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Invalid message format from conn {}: {}", conn.id, e);
            counter!(ERRORS_TOTAL, "type" => "client_protocol").increment(1);
            return;
        }
    };

    if let Err(e) =
        handle_client_message(&state.manager, state.nats.as_deref(), conn, msg).await
    {
        warn!("Failed to handle message from conn {}: {}", conn.id, e);
    }
}

/// Control dispatch for client frames.
///
/// `ping`/`join`/`leave` are answered directly, `typing` fans out to the
/// room without touching the bus, and anything else is forwarded to
/// `CHAT.events` for backend consumers.
pub(crate) async fn handle_client_message(
    manager: &RoomManager,
    nats: Option<&NatsClient>,
    conn: &Arc<Connection>,
    msg: ClientMessage,
) -> Result<()> {
    match msg.kind.as_str() {
        "ping" => {
            conn.enqueue(protocol::pong_frame());
        }

        "join" => {
            if !msg.room.is_empty() {
                manager.join(conn.id, &msg.room);
                conn.enqueue(protocol::joined_frame(&msg.room));
            }
        }

        "leave" => {
            if !msg.room.is_empty() {
                manager.leave(conn.id, &msg.room);
                conn.enqueue(protocol::left_frame(&msg.room));
            }
        }

        "typing" => {
            if !msg.room.is_empty() {
                let frame = protocol::typing_frame(
                    &msg.room,
                    &conn.identity.user_id,
                    &conn.identity.user_type,
                );
                manager.broadcast_to_room(&msg.room, &frame, Some(conn.id));
            }
        }

        _ => forward_to_bus(nats, conn, msg).await?,
    }

    Ok(())
}

async fn forward_to_bus(
    nats: Option<&NatsClient>,
    conn: &Arc<Connection>,
    msg: ClientMessage,
) -> Result<()> {
    let kind = msg.kind.clone();
    let event = Envelope::from_client(conn, msg);
    let data = serde_json::to_vec(&event)?;

    let Some(nats) = nats else {
        warn!(
            "Bus publisher not configured, dropping {} from conn {}",
            kind, conn.id
        );
        return Ok(());
    };

    // Publish failures are logged by the caller; the client never sees them.
    if let Err(e) = nats.publish(EVENTS_SUBJECT, data.into()).await {
        counter!(ERRORS_TOTAL, "type" => "publish").increment(1);
        return Err(GatewayError::Bus(e));
    }

    debug!(
        "Forwarded {} from conn {} to {}",
        kind, conn.id, EVENTS_SUBJECT
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Identity;
    use serde_json::Value;

    fn client_msg(raw: &str) -> ClientMessage {
        serde_json::from_str(raw).unwrap()
    }

    fn attach(
        manager: &RoomManager,
        user_id: &str,
        user_type: &str,
        rooms: &[&str],
    ) -> (Arc<Connection>, mpsc::Receiver<Utf8Bytes>) {
        let identity = Identity {
            user_id: user_id.to_string(),
            user_type: user_type.to_string(),
            ..Default::default()
        };
        let claim_rooms: Vec<String> = rooms.iter().map(|r| r.to_string()).collect();
        let (conn, rx) = Connection::new(identity, &claim_rooms, 8);
        let conn = Arc::new(conn);
        manager.add(conn.clone());
        (conn, rx)
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let manager = RoomManager::new();
        let (conn, mut rx) = attach(&manager, "42", "cskh", &[]);

        handle_client_message(&manager, None, &conn, client_msg(r#"{"type":"ping"}"#))
            .await
            .unwrap();

        let frame: Value = serde_json::from_str(rx.try_recv().unwrap().as_str()).unwrap();
        assert_eq!(frame["type"], "pong");
        assert!(frame["timestamp"].is_string());
    }

    #[tokio::test]
    async fn join_registers_room_and_acks() {
        let manager = RoomManager::new();
        let (conn, mut rx) = attach(&manager, "42", "cskh", &[]);

        handle_client_message(
            &manager,
            None,
            &conn,
            client_msg(r#"{"type":"join","room":"chat:7"}"#),
        )
        .await
        .unwrap();

        assert!(conn.in_room("chat:7"));
        assert_eq!(manager.room_connections("chat:7").len(), 1);
        let frame: Value = serde_json::from_str(rx.try_recv().unwrap().as_str()).unwrap();
        assert_eq!(frame["type"], "joined");
        assert_eq!(frame["room"], "chat:7");
    }

    #[tokio::test]
    async fn join_without_room_is_ignored() {
        let manager = RoomManager::new();
        let (conn, mut rx) = attach(&manager, "42", "cskh", &[]);

        handle_client_message(&manager, None, &conn, client_msg(r#"{"type":"join"}"#))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_unregisters_room_and_acks() {
        let manager = RoomManager::new();
        let (conn, mut rx) = attach(&manager, "42", "cskh", &["chat:7"]);

        handle_client_message(
            &manager,
            None,
            &conn,
            client_msg(r#"{"type":"leave","room":"chat:7"}"#),
        )
        .await
        .unwrap();

        assert!(!conn.in_room("chat:7"));
        assert!(manager.room_connections("chat:7").is_empty());
        let frame: Value = serde_json::from_str(rx.try_recv().unwrap().as_str()).unwrap();
        assert_eq!(frame["type"], "left");
    }

    #[tokio::test]
    async fn typing_reaches_the_room_but_not_the_sender() {
        let manager = RoomManager::new();
        let (a, mut rx_a) = attach(&manager, "42", "cskh", &["chat:7"]);
        let (_b, mut rx_b) = attach(&manager, "7", "customer", &["chat:7"]);

        handle_client_message(
            &manager,
            None,
            &a,
            client_msg(r#"{"type":"typing","room":"chat:7"}"#),
        )
        .await
        .unwrap();

        assert!(rx_a.try_recv().is_err());
        let frame: Value = serde_json::from_str(rx_b.try_recv().unwrap().as_str()).unwrap();
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["room"], "chat:7");
        assert_eq!(frame["payload"]["user_id"], "42");
        assert_eq!(frame["payload"]["type"], "cskh");
    }

    #[tokio::test]
    async fn unknown_type_without_publisher_enqueues_nothing() {
        let manager = RoomManager::new();
        let (conn, mut rx) = attach(&manager, "42", "cskh", &[]);

        handle_client_message(
            &manager,
            None,
            &conn,
            client_msg(r#"{"type":"foo","payload":{"x":1}}"#),
        )
        .await
        .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn client_event_wraps_identity_and_excludes_sender() {
        let identity = Identity {
            user_id: "42".to_string(),
            brand_id: "b1".to_string(),
            user_type: "cskh".to_string(),
            ..Default::default()
        };
        let (conn, _rx) = Connection::new(identity, &[], 8);

        let event =
            Envelope::from_client(&conn, client_msg(r#"{"type":"foo","payload":{"x":1}}"#));
        let json = serde_json::to_string(&event).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "foo");
        assert_eq!(value["user_id"], "42");
        assert_eq!(value["brand_id"], "b1");
        assert_eq!(value["payload"]["x"], 1);
        assert_eq!(value["exclude_conn_id"], conn.id.to_string());
        assert!(value["timestamp"].is_string());
    }
}
