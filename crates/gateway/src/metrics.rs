//! Metric names and registration.
//!
//! All counters are registered up front so the Prometheus exposition carries
//! help text even before the first event.

use metrics::{describe_counter, describe_gauge, describe_histogram};

pub const CONNECTIONS_TOTAL: &str = "gateway_connections_total";
pub const CONNECTIONS_CURRENT: &str = "gateway_connections_current";
pub const ROOMS_TOTAL: &str = "gateway_rooms_total";
pub const MESSAGES_RECEIVED: &str = "gateway_messages_received_total";
pub const MESSAGES_SENT: &str = "gateway_messages_sent_total";
pub const MESSAGES_FROM_NATS: &str = "gateway_messages_from_nats_total";
pub const MESSAGE_LATENCY_SECONDS: &str = "gateway_message_latency_seconds";
pub const SLOW_CONSUMER_DROPPED: &str = "gateway_slow_consumer_dropped_total";
pub const AUTH_SUCCESS: &str = "gateway_auth_success_total";
pub const AUTH_FAILURE: &str = "gateway_auth_failure_total";
pub const ERRORS_TOTAL: &str = "gateway_errors_total";

/// Latency buckets for bus-to-enqueue processing, starting at 100µs.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Register help text for all gateway metrics.
pub fn describe() {
    describe_counter!(CONNECTIONS_TOTAL, "Total number of WebSocket connections");
    describe_gauge!(
        CONNECTIONS_CURRENT,
        "Current number of active WebSocket connections"
    );
    describe_gauge!(ROOMS_TOTAL, "Total number of active rooms");
    describe_counter!(
        MESSAGES_RECEIVED,
        "Total number of messages received from clients"
    );
    describe_counter!(MESSAGES_SENT, "Total number of messages sent to clients");
    describe_counter!(
        MESSAGES_FROM_NATS,
        "Total number of messages received from NATS"
    );
    describe_histogram!(
        MESSAGE_LATENCY_SECONDS,
        "Message processing latency in seconds"
    );
    describe_counter!(
        SLOW_CONSUMER_DROPPED,
        "Total number of frames dropped because a send queue was full"
    );
    describe_counter!(AUTH_SUCCESS, "Total number of successful authentications");
    describe_counter!(AUTH_FAILURE, "Total number of failed authentications");
    describe_counter!(ERRORS_TOTAL, "Total number of errors by type");
}
