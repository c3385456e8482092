//! Environment-driven configuration.
//!
//! Every knob has a default suitable for local development; malformed values
//! are fatal at startup.

use std::env;
use std::time::Duration;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub nats: NatsConfig,
    pub metrics: MetricsConfig,
    pub ws: WsConfig,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bound on HTTP request handling; long-lived sockets are not affected.
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub public_key_pem: String,
    pub validate_exp: bool,
    pub allowed_issuers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Suffix for the durable consumer name and the connection name.
    pub client_id: String,
    /// Streams to attach a pull consumer to.
    pub streams: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub port: u16,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Refuse upgrades beyond this many concurrent connections (0 = unlimited).
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    /// Outbound queue capacity per connection.
    pub send_queue_size: usize,
    pub enable_compression: bool,
}

const DEFAULT_STREAMS: &str = "CHAT,NOTIFY,ONLINE,ANALYTICS,AUDIT,BILLING,FILE,EMAIL";

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, GatewayError> {
        let jwt = JwtConfig {
            public_key_pem: load_public_key()?,
            validate_exp: parse_bool("JWT_VALIDATE_EXP", true)?,
            allowed_issuers: parse_list(&env_or("JWT_ALLOWED_ISSUERS", "attchat")),
        };

        Ok(Self {
            server: ServerConfig {
                port: parse_u16("GATEWAY_PORT", 8086)?,
                read_timeout: parse_secs("SERVER_READ_TIMEOUT_SECS", 10)?,
            },
            jwt,
            nats: NatsConfig {
                url: env_or("NATS_URL", "nats://localhost:4222"),
                client_id: env_or("NATS_CLIENT_ID", "gateway"),
                streams: parse_list(&env_or("NATS_STREAMS", DEFAULT_STREAMS)),
            },
            metrics: MetricsConfig {
                port: parse_u16("METRICS_PORT", 9090)?,
                enabled: parse_bool("METRICS_ENABLED", true)?,
            },
            ws: WsConfig {
                max_connections: parse_usize("WS_MAX_CONNECTIONS", 10_000)?,
                ping_interval: parse_secs("WS_PING_INTERVAL_SECS", 30)?,
                write_timeout: parse_secs("WS_WRITE_TIMEOUT_SECS", 10)?,
                send_queue_size: parse_usize("WS_SEND_QUEUE_SIZE", 256)?,
                enable_compression: parse_bool("WS_ENABLE_COMPRESSION", false)?,
            },
            shutdown_timeout: parse_secs("SHUTDOWN_TIMEOUT_SECS", 30)?,
        })
    }
}

/// Inline PEM wins over a key file; one of the two is required.
fn load_public_key() -> Result<String, GatewayError> {
    let inline = env_or("JWT_PUBLIC_KEY", "");
    if !inline.trim().is_empty() {
        return Ok(inline);
    }
    let path = env_or("JWT_PUBLIC_KEY_FILE", "");
    if !path.trim().is_empty() {
        return std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Config(format!("failed to read JWT_PUBLIC_KEY_FILE {path}: {e}"))
        });
    }
    Err(GatewayError::Config(
        "JWT_PUBLIC_KEY or JWT_PUBLIC_KEY_FILE is required (RS256 only)".to_string(),
    ))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_u16(key: &str, default: u16) -> Result<u16, GatewayError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| GatewayError::Config(format!("{key} must be a port number, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn parse_usize(key: &str, default: usize) -> Result<usize, GatewayError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| GatewayError::Config(format!("{key} must be an integer, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn parse_secs(key: &str, default_secs: u64) -> Result<Duration, GatewayError> {
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| GatewayError::Config(format!("{key} must be seconds, got {v:?}"))),
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, GatewayError> {
    match env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(GatewayError::Config(format!(
                "{key} must be a boolean, got {v:?}"
            ))),
        },
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, trimming whitespace and dropping empties.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_trims_and_drops_empties() {
        assert_eq!(
            parse_list(" CHAT , NOTIFY ,, ONLINE ,"),
            vec!["CHAT", "NOTIFY", "ONLINE"]
        );
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ").is_empty());
    }

    #[test]
    fn default_streams_cover_all_buses() {
        let streams = parse_list(DEFAULT_STREAMS);
        assert_eq!(streams.len(), 8);
        assert!(streams.contains(&"CHAT".to_string()));
    }
}
