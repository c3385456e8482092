//! NATS client implementation with JetStream support.

use anyhow::Result;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::{jetstream, Event};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Wrapper around the NATS client with a JetStream context.
///
/// Reconnection is handled by the underlying client: the connection retries
/// indefinitely and durable consumers resume from their ack position.
#[derive(Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server and create a JetStream context.
    ///
    /// `client_name` is reported to the server and shows up in monitoring.
    pub async fn connect(url: &str, client_name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::ConnectOptions::new()
            .name(client_name)
            .retry_on_initial_connect()
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("NATS connected"),
                    Event::Disconnected => warn!("NATS disconnected"),
                    other => debug!("NATS event: {}", other),
                }
            })
            .connect(url)
            .await?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// Create or look up a durable pull consumer on `stream` and return its
    /// message stream.
    ///
    /// The consumer uses explicit acks and delivers only messages published
    /// after its creation; a consumer that already exists keeps its position.
    pub async fn pull_messages(
        &self,
        stream: &str,
        consumer_name: &str,
        filter_subject: &str,
    ) -> Result<pull::Stream> {
        let stream = self.jetstream.get_stream(stream).await?;

        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    name: Some(consumer_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::New,
                    filter_subject: filter_subject.to_string(),
                    ..Default::default()
                },
            )
            .await?;

        Ok(consumer.messages().await?)
    }

    /// Publish a message to JetStream and wait for the stream acknowledgment.
    pub async fn publish(&self, subject: impl Into<String>, payload: Bytes) -> Result<()> {
        self.jetstream
            .publish(subject.into(), payload)
            .await?
            .await?;
        Ok(())
    }

    /// Current state of the underlying connection.
    pub fn connection_state(&self) -> async_nats::connection::State {
        self.client.connection_state()
    }
}
