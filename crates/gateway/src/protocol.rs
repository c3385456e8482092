//! Wire contracts: client frames, server frames, and the bus envelope.
//!
//! Payloads stay as raw JSON end to end so a frame relayed from the bus
//! reaches the client with the producer's bytes intact.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::error;

use crate::connection::{Connection, Identity};

/// Message received from a client over the socket.
///
/// `type` is an open set: `ping`, `join`, `leave` and `typing` are handled
/// by the gateway, everything else is forwarded to the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
}

/// Message sent to a client.
#[derive(Debug, Serialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub room: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    fn new(kind: &str, room: &str, payload: Option<Box<RawValue>>) -> Self {
        Self {
            kind: kind.to_string(),
            room: room.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Serialize for the wire.
    pub fn frame(&self) -> Utf8Bytes {
        match serde_json::to_string(self) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!("Failed to serialize server frame: {}", e);
                Utf8Bytes::from_static("{}")
            }
        }
    }
}

/// Event carried on the bus between backend producers and the gateway.
///
/// Routed by `room` first, then `user_id`; `exclude_conn_id` suppresses echo
/// to the originating session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub brand_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chat_id: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exclude_conn_id: String,
}

impl Envelope {
    /// Wrap a client-originated message for publication on the bus.
    ///
    /// The sending connection is recorded as `exclude_conn_id` so the
    /// fan-out path does not echo the event back to it.
    pub fn from_client(conn: &Connection, msg: ClientMessage) -> Self {
        Self {
            kind: msg.kind,
            room: msg.room,
            user_id: conn.identity.user_id.clone(),
            brand_id: conn.identity.brand_id.clone(),
            chat_id: String::new(),
            payload: msg.payload,
            timestamp: Utc::now(),
            exclude_conn_id: conn.id.to_string(),
        }
    }
}

fn raw_payload(value: serde_json::Value) -> Option<Box<RawValue>> {
    serde_json::value::to_raw_value(&value).ok()
}

/// `{"type":"pong","timestamp":...}`
pub fn pong_frame() -> Utf8Bytes {
    ServerMessage::new("pong", "", None).frame()
}

/// Ack for a client `join`.
pub fn joined_frame(room: &str) -> Utf8Bytes {
    ServerMessage::new("joined", room, None).frame()
}

/// Ack for a client `leave`.
pub fn left_frame(room: &str) -> Utf8Bytes {
    ServerMessage::new("left", room, None).frame()
}

/// Typing indicator relayed to the rest of a room; never persisted.
pub fn typing_frame(room: &str, user_id: &str, user_type: &str) -> Utf8Bytes {
    let payload = raw_payload(serde_json::json!({
        "user_id": user_id,
        "type": user_type,
    }));
    ServerMessage::new("typing", room, payload).frame()
}

/// Terminal error frame, e.g. `AUTH_FAILED` before the socket is closed.
pub fn error_frame(code: &str, message: &str) -> Utf8Bytes {
    let payload = raw_payload(serde_json::json!({
        "code": code,
        "message": message,
    }));
    ServerMessage::new("error", "", payload).frame()
}

/// First frame after attach: echoes the resolved identity back to the client.
pub fn connected_frame(conn_id: &str, identity: &Identity) -> Utf8Bytes {
    let payload = raw_payload(serde_json::json!({
        "conn_id": conn_id,
        "user_id": identity.user_id,
        "brand_id": identity.brand_id,
        "role": identity.role,
        "user_type": identity.user_type,
        "device": identity.device,
        "tags": identity.tags,
        "tz": identity.tz,
        "channel": identity.channel,
        "room_id": identity.room_id,
    }));
    ServerMessage::new("connected", "", payload).frame()
}
