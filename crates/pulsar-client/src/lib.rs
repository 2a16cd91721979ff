//! Async client for the Apache Pulsar binary protocol (v12).
//!
//! The layering mirrors the protocol itself:
//!
//! - [`Connection`] owns one TCP/TLS socket: serialized writes, a single
//!   reader task, keepalive, and a sticky close signal.
//! - [`Client`] multiplexes producers and consumers over one connection,
//!   correlating responses through a [`Dispatcher`] keyed by request id or
//!   (producer id, sequence id), and routing deliveries to consumers.
//! - [`Producer`] / [`Consumer`] implement the protocol state machines:
//!   create, send/receipt, subscribe, flow control, acknowledgement, batch
//!   de-aggregation, and close.
//! - [`ManagedProducer`] / [`ManagedConsumer`] keep a user-facing handle
//!   alive across connection churn, reconnecting through a [`ClientPool`]
//!   that resolves topic ownership (including lookup redirects).
//!
//! ```no_run
//! use pulsar_client::{ClientConfig, ClientPool, ConsumerConfig, ManagedConsumer};
//!
//! # async fn run() -> pulsar_client::Result<()> {
//! let pool = ClientPool::new();
//! let consumer = ManagedConsumer::new(
//!     pool,
//!     ConsumerConfig {
//!         client: ClientConfig::new("pulsar://localhost:6650"),
//!         topic: "persistent://public/default/events".to_string(),
//!         subscription: "worker".to_string(),
//!         ..ConsumerConfig::default()
//!     },
//! );
//! loop {
//!     let msg = consumer.receive().await?;
//!     consumer.ack(&msg).await?;
//! }
//! # }
//! ```

mod client;
mod compression;
mod config;
mod connection;
mod consumer;
mod counter;
mod dispatcher;
mod errors;
mod heartbeat;
mod managed;
mod pool;
mod producer;
mod signal;
#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::{
    AuthConfig, ClientConfig, ConsumerConfig, ProducerConfig, SubscriptionMode,
    DEFAULT_INITIAL_RECONNECT_DELAY, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_MAX_RECONNECT_DELAY,
    DEFAULT_NEW_ENTITY_TIMEOUT, DEFAULT_QUEUE_SIZE,
};
pub use connection::{CommandSender, Connection};
pub use consumer::{Consumer, Message, MessageId};
pub use counter::{MonotonicId, UNDEF_REQUEST_ID};
pub use dispatcher::{Dispatcher, Permit};
pub use errors::{AsyncErrors, ClientError, Result};
pub use managed::{ClientPool, ManagedConsumer, ManagedProducer};
pub use producer::{Producer, TraceHook};
pub use signal::CloseSignal;

pub use pulsar_wire as wire;
