//! HTTP surface: health/stats endpoints and the WebSocket upgrade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics::counter;
use nats_client::NatsClient;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::warn;

use crate::auth::{Claims, TokenVerifier};
use crate::config::WsConfig;
use crate::connection::{Connection, Identity};
use crate::metrics::{AUTH_FAILURE, AUTH_SUCCESS};
use crate::protocol;
use crate::rooms::{RoomManager, Stats};
use crate::session;

/// Shared application state.
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub verifier: Arc<TokenVerifier>,
    pub nats: Option<Arc<NatsClient>>,
    pub ws: WsConfig,
    /// Set once the shutdown signal arrives; flips health to 503.
    pub draining: AtomicBool,
}

/// Upgrade-time parameters. These are defaults only: claims override any
/// field they carry a value for.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_type: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub tz: String,
    #[serde(default)]
    pub brand_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub channel: String,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let draining = state.draining.load(Ordering::Relaxed);
    let nats = state
        .nats
        .as_ref()
        .map(|nats| nats.connection_state().to_string())
        .unwrap_or_else(|| "disabled".to_string());
    let body = Json(json!({
        "status": if draining { "draining" } else { "healthy" },
        "message": "Fan-out gateway is running",
        "version": env!("CARGO_PKG_VERSION"),
        "nats": nats,
        "stats": state.manager.stats(),
    }));
    if draining {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    } else {
        body.into_response()
    }
}

async fn ready_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(state.manager.stats())
}

/// WebSocket upgrade: enforce upgrade headers, then hand the socket to the
/// session handler. The connection cap and authentication are checked on the
/// upgraded socket so the client gets a proper error frame.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Ok(ws) = ws else {
        return StatusCode::UPGRADE_REQUIRED.into_response();
    };

    let token = bearer_token(&query.token, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, query, token))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, query: WsQuery, token: String) {
    let max = state.ws.max_connections;
    if max > 0 && state.manager.stats().current_connections as usize >= max {
        warn!("Refusing connection: max connections ({}) reached", max);
        let frame = protocol::error_frame("MAX_CONNECTIONS", "Connection limit reached");
        let _ = socket.send(Message::Text(frame)).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let claims = match state.verifier.validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(
                "JWT validation failed: {} (token prefix {:?})",
                e,
                token_prefix(&token)
            );
            counter!(AUTH_FAILURE).increment(1);
            let frame = protocol::error_frame("AUTH_FAILED", "Invalid token");
            let _ = socket.send(Message::Text(frame)).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    counter!(AUTH_SUCCESS).increment(1);

    let identity = resolve_identity(&query, &claims);
    let (conn, outbound) = Connection::new(identity, &claims.rooms, state.ws.send_queue_size);
    let conn = Arc::new(conn);

    // Queued before the writer starts so it is the first frame on the wire,
    // even with bus fan-out racing the attach.
    conn.enqueue(protocol::connected_frame(
        &conn.id.to_string(),
        &conn.identity,
    ));
    state.manager.add(conn.clone());

    session::run_session(state, socket, conn, outbound).await;
}

/// Token from `?token=`, falling back to `Authorization: Bearer …`.
fn bearer_token(query_token: &str, headers: &HeaderMap) -> String {
    if !query_token.is_empty() {
        return query_token.to_string();
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).to_string())
        .unwrap_or_default()
}

fn token_prefix(token: &str) -> &str {
    token.get(..12).unwrap_or(token)
}

/// Merge query defaults with claims; claims win wherever they carry a value.
fn resolve_identity(query: &WsQuery, claims: &Claims) -> Identity {
    let mut identity = Identity {
        user_id: query.user_id.clone(),
        brand_id: query.brand_id.clone(),
        role: query.role.clone(),
        user_type: query.user_type.clone(),
        device: query.device.clone(),
        tags: query.tags.clone(),
        tz: query.tz.clone(),
        channel: query.channel.clone(),
        room_id: query.room_id.clone(),
    };

    if claims.user_id != 0 {
        identity.user_id = claims.user_id.to_string();
    }
    if !claims.brand_id.is_empty() {
        identity.brand_id = claims.brand_id.clone();
    }
    if !claims.role.is_empty() {
        identity.role = claims.role.clone();
    }
    if !claims.user_type.is_empty() {
        identity.user_type = claims.user_type.clone();
    }

    identity
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn claims(user_id: u64, brand_id: &str, role: &str, user_type: &str) -> Claims {
        Claims {
            iss: "attchat".to_string(),
            exp: None,
            user_id,
            username: String::new(),
            role_id: 0,
            token_version: 0,
            brand_id: brand_id.to_string(),
            role: role.to_string(),
            rooms: Vec::new(),
            user_type: user_type.to_string(),
        }
    }

    #[test]
    fn claims_override_query_defaults() {
        let query = WsQuery {
            user_id: "999".to_string(),
            brand_id: "query-brand".to_string(),
            role: "viewer".to_string(),
            user_type: "customer".to_string(),
            device: "ios".to_string(),
            ..Default::default()
        };
        let identity = resolve_identity(&query, &claims(42, "b1", "agent", "cskh"));

        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.brand_id, "b1");
        assert_eq!(identity.role, "agent");
        assert_eq!(identity.user_type, "cskh");
        // Query-only fields pass through untouched.
        assert_eq!(identity.device, "ios");
    }

    #[test]
    fn query_fills_fields_claims_leave_empty() {
        let query = WsQuery {
            brand_id: "query-brand".to_string(),
            role: "viewer".to_string(),
            room_id: "chat:7".to_string(),
            ..Default::default()
        };
        let identity = resolve_identity(&query, &claims(42, "", "", ""));

        assert_eq!(identity.user_id, "42");
        assert_eq!(identity.brand_id, "query-brand");
        assert_eq!(identity.role, "viewer");
        assert_eq!(identity.room_id, "chat:7");
    }

    #[test]
    fn query_token_wins_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(bearer_token("from-query", &headers), "from-query");
        assert_eq!(bearer_token("", &headers), "from-header");
    }

    #[test]
    fn missing_token_resolves_empty() {
        assert_eq!(bearer_token("", &HeaderMap::new()), "");
    }

    #[test]
    fn token_prefix_is_bounded() {
        assert_eq!(token_prefix("short"), "short");
        assert_eq!(token_prefix("0123456789abcdef"), "0123456789ab");
    }
}
