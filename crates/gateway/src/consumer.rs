//! Bus subscriber: NATS JetStream → room fan-out.
//!
//! One task per configured stream, each owning a durable pull consumer. An
//! envelope is decoded only to pick its routing target; recipients get the
//! producer's bytes verbatim.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Utf8Bytes;
use futures::StreamExt;
use metrics::{counter, histogram};
use nats_client::NatsClient;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::{ERRORS_TOTAL, MESSAGES_FROM_NATS, MESSAGE_LATENCY_SECONDS};
use crate::protocol::Envelope;
use crate::rooms::RoomManager;

/// Subject client-originated events are published to.
pub const EVENTS_SUBJECT: &str = "CHAT.events";

/// Consumes events from the configured streams and fans them out.
pub struct BusConsumer {
    nats: Arc<NatsClient>,
    manager: Arc<RoomManager>,
    client_id: String,
}

impl BusConsumer {
    pub fn new(nats: Arc<NatsClient>, manager: Arc<RoomManager>, client_id: String) -> Self {
        Self {
            nats,
            manager,
            client_id,
        }
    }

    /// Spawn one consumer task per stream.
    ///
    /// Returns the per-task shutdown senders and join handles; a stream whose
    /// consumer cannot be created is logged and abandoned without affecting
    /// the others.
    pub fn start(
        self: &Arc<Self>,
        streams: &[String],
    ) -> (Vec<mpsc::Sender<()>>, Vec<JoinHandle<()>>) {
        let mut shutdown_txs = Vec::with_capacity(streams.len());
        let mut handles = Vec::with_capacity(streams.len());

        for stream in streams {
            let (tx, rx) = mpsc::channel(1);
            let this = self.clone();
            let stream = stream.clone();
            handles.push(tokio::spawn(async move {
                this.consume_stream(stream, rx).await;
            }));
            shutdown_txs.push(tx);
        }

        (shutdown_txs, handles)
    }

    async fn consume_stream(&self, stream: String, mut shutdown_rx: mpsc::Receiver<()>) {
        let consumer_name = format!("gateway-{}", self.client_id);
        let filter = format!("{stream}.>");

        let mut messages = match self
            .nats
            .pull_messages(&stream, &consumer_name, &filter)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!("Failed to create consumer for stream {}: {:?}", stream, e);
                counter!(ERRORS_TOTAL, "type" => "consumer_create").increment(1);
                return;
            }
        };

        info!(
            "Stream consumer running: stream={} consumer={}",
            stream, consumer_name
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Stream consumer for {} received shutdown signal", stream);
                    break;
                }

                msg = messages.next() => {
                    match msg {
                        Some(Ok(msg)) => self.handle_message(msg).await,
                        Some(Err(e)) => {
                            // Pull retries are handled by the client; just note it.
                            warn!("Error pulling from stream {}: {}", stream, e);
                        }
                        None => {
                            warn!("Stream {} consumer ended unexpectedly", stream);
                            break;
                        }
                    }
                }
            }
        }

        info!("Stream consumer for {} stopped", stream);
    }

    async fn handle_message(&self, msg: async_nats::jetstream::Message) {
        let start = Instant::now();

        match serde_json::from_slice::<Envelope>(&msg.payload) {
            Ok(envelope) => {
                counter!(MESSAGES_FROM_NATS).increment(1);
                route_envelope(&self.manager, &envelope, &msg.payload);
            }
            Err(e) => {
                // Poison message: ack it away rather than redeliver forever.
                warn!("Failed to decode envelope: {}", e);
                counter!(ERRORS_TOTAL, "type" => "decode").increment(1);
            }
        }

        if let Err(e) = msg.ack().await {
            warn!("Failed to ack message: {}", e);
        }

        histogram!(MESSAGE_LATENCY_SECONDS).record(start.elapsed().as_secs_f64());
    }
}

/// Deliver an already-serialized envelope to its room or user target.
pub(crate) fn route_envelope(manager: &RoomManager, envelope: &Envelope, raw: &[u8]) {
    let frame = match std::str::from_utf8(raw) {
        Ok(text) => Utf8Bytes::from(text.to_owned()),
        Err(e) => {
            warn!("Envelope is not valid UTF-8: {}", e);
            counter!(ERRORS_TOTAL, "type" => "decode").increment(1);
            return;
        }
    };
    let exclude = Uuid::parse_str(&envelope.exclude_conn_id).ok();

    if !envelope.room.is_empty() {
        let count = manager.broadcast_to_room(&envelope.room, &frame, exclude);
        debug!(
            "Broadcast to room {}: type={} recipients={}",
            envelope.room, envelope.kind, count
        );
    } else if !envelope.user_id.is_empty() {
        let count = manager.broadcast_to_user(&envelope.user_id, &frame, exclude);
        debug!(
            "Broadcast to user {}: type={} recipients={}",
            envelope.user_id, envelope.kind, count
        );
    } else {
        warn!("Envelope of type {} has no routing target", envelope.kind);
        counter!(ERRORS_TOTAL, "type" => "no_target").increment(1);
    }
}
