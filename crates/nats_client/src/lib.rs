//! NATS client wrapper with JetStream support.

pub mod client;

pub use client::NatsClient;
