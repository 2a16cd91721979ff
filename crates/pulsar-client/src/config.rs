// Client, producer and consumer configuration.
//
// Configs are plain structs with serde derives so applications can embed
// them in their own configuration files; this crate never reads files or
// the environment itself. `with_defaults` fills zero values in the way the
// defaults column of the protocol documentation describes.
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use pulsar_wire::proto::{InitialPosition, SubType};

use crate::errors::ClientError;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_NEW_ENTITY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_QUEUE_SIZE: usize = 128;
/// Upper bound on a lookup redirect chain before giving up.
pub const DEFAULT_MAX_LOOKUP_REDIRECTS: usize = 20;
/// Upper bound on message ids carried by one redeliver-overflow request,
/// keeping the frame comfortably under the frame size cap.
pub const DEFAULT_MAX_REDELIVER_IDS: usize = 1000;

/// Opaque credentials forwarded in CONNECT.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub method: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Pulsar's three subscription models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// Only one consumer may hold the subscription.
    #[default]
    Exclusive,
    /// One active consumer at a time; the broker promotes the next one on
    /// disconnect and reports the change via ACTIVE_CONSUMER_CHANGE.
    Failover,
    /// Messages are spread round-robin across all consumers on the
    /// subscription.
    Shared,
}

impl SubscriptionMode {
    pub(crate) fn sub_type(self) -> SubType {
        match self {
            SubscriptionMode::Exclusive => SubType::Exclusive,
            SubscriptionMode::Failover => SubType::Failover,
            SubscriptionMode::Shared => SubType::Shared,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Discovery address, `pulsar://host:port` or `pulsar+ssl://host:port`.
    pub addr: String,
    pub dial_timeout: Duration,
    pub keepalive_interval: Duration,
    pub auth: Option<AuthConfig>,
    /// When set, connections are dialed with TLS using this configuration.
    #[serde(skip)]
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Optional fan-in channel for errors observed by the managed layer.
    #[serde(skip)]
    pub errs: Option<tokio::sync::mpsc::UnboundedSender<ClientError>>,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn with_defaults(mut self) -> Self {
        if self.dial_timeout.is_zero() {
            self.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if self.keepalive_interval.is_zero() {
            self.keepalive_interval = DEFAULT_KEEPALIVE_INTERVAL;
        }
        self
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub client: ClientConfig,
    pub topic: String,
    /// Requested producer name; the broker assigns one when empty.
    pub name: Option<String>,
    /// Maximum time to create the producer, including topic lookup.
    pub new_producer_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ProducerConfig {
    pub fn with_defaults(mut self) -> Self {
        self.client = self.client.with_defaults();
        if self.new_producer_timeout.is_zero() {
            self.new_producer_timeout = DEFAULT_NEW_ENTITY_TIMEOUT;
        }
        if self.initial_reconnect_delay.is_zero() {
            self.initial_reconnect_delay = DEFAULT_INITIAL_RECONNECT_DELAY;
        }
        if self.max_reconnect_delay.is_zero() {
            self.max_reconnect_delay = DEFAULT_MAX_RECONNECT_DELAY;
        }
        self
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub client: ClientConfig,
    pub topic: String,
    /// Subscription name. Required by the broker; never defaulted here.
    pub subscription: String,
    pub mode: SubscriptionMode,
    /// Start from the earliest available message instead of the latest.
    pub earliest: bool,
    /// Delivery buffer capacity; messages beyond it are dropped into the
    /// overflow set.
    pub queue_size: usize,
    /// Maximum time to create the consumer, including topic lookup.
    pub new_consumer_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ConsumerConfig {
    pub fn with_defaults(mut self) -> Self {
        self.client = self.client.with_defaults();
        if self.new_consumer_timeout.is_zero() {
            self.new_consumer_timeout = DEFAULT_NEW_ENTITY_TIMEOUT;
        }
        if self.initial_reconnect_delay.is_zero() {
            self.initial_reconnect_delay = DEFAULT_INITIAL_RECONNECT_DELAY;
        }
        if self.max_reconnect_delay.is_zero() {
            self.max_reconnect_delay = DEFAULT_MAX_RECONNECT_DELAY;
        }
        // an unbuffered delivery queue is not allowed
        if self.queue_size == 0 {
            self.queue_size = DEFAULT_QUEUE_SIZE;
        }
        self
    }

    pub(crate) fn initial_position(&self) -> InitialPosition {
        if self.earliest {
            InitialPosition::Earliest
        } else {
            InitialPosition::Latest
        }
    }
}
