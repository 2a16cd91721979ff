// Per-connection client.
//
// Owns the connection, its dispatcher, the id counters, and the producer /
// consumer registries. A spawned reader task decodes frames and routes
// them: responses to the dispatcher slot that owns their key, deliveries
// and broker-initiated closes to the entity registries, PING straight back
// as PONG. The CONNECT handshake must complete before the client is handed
// out.
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pulsar_wire::Frame;
use pulsar_wire::proto::{
    BaseCommand, CommandConnect, CommandConnected, CommandLookupTopic, CommandLookupTopicResponse,
    CommandPartitionedTopicMetadata, CommandPartitionedTopicMetadataResponse, CommandPong,
    CommandProducer, CommandSubscribe, CommandType, LookupType, PROTOCOL_VERSION,
    PartitionedResponse,
};

use crate::config::{ClientConfig, SubscriptionMode};
use crate::connection::{CommandSender, Connection};
use crate::consumer::{Consumer, ConsumerOptions, Message, OverflowSet};
use crate::counter::{MonotonicId, UNDEF_REQUEST_ID};
use crate::dispatcher::Dispatcher;
use crate::errors::{ClientError, Result, server_error};
use crate::heartbeat;
use crate::producer::Producer;
use crate::signal::CloseSignal;

const CLIENT_VERSION: &str = concat!("pulsar-client-rust-", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct ClientInner {
    conn: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    request_id: Arc<MonotonicId>,
    producer_ids: MonotonicId,
    consumer_ids: MonotonicId,
    producers: StdMutex<HashMap<u64, Arc<Producer>>>,
    consumers: StdMutex<HashMap<u64, Arc<Consumer>>>,
}

impl Client {
    /// Dial the broker in `cfg.addr` and complete the CONNECT handshake.
    pub async fn connect(cfg: &ClientConfig) -> Result<Client> {
        Self::connect_inner(cfg, None).await
    }

    /// Like `connect`, but asks the dialed endpoint (a Pulsar proxy) to
    /// tunnel the session to `broker_url`.
    pub async fn connect_via_proxy(cfg: &ClientConfig, broker_url: &str) -> Result<Client> {
        Self::connect_inner(cfg, Some(broker_url)).await
    }

    async fn connect_inner(cfg: &ClientConfig, proxy_to_broker: Option<&str>) -> Result<Client> {
        let cfg = cfg.clone().with_defaults();
        let conn = match &cfg.tls {
            Some(tls) => Connection::dial_tls(&cfg.addr, Arc::clone(tls), cfg.dial_timeout).await?,
            None => Connection::dial_tcp(&cfg.addr, cfg.dial_timeout).await?,
        };
        let inner = Arc::new(ClientInner {
            conn: Arc::new(conn),
            dispatcher: Arc::new(Dispatcher::new()),
            request_id: Arc::new(MonotonicId::new(0)),
            producer_ids: MonotonicId::new(0),
            consumer_ids: MonotonicId::new(0),
            producers: StdMutex::new(HashMap::new()),
            consumers: StdMutex::new(HashMap::new()),
        });

        // single reader task; every registration drains to ConnectionClosed
        // when it exits
        {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let conn = Arc::clone(&inner.conn);
                let route_inner = Arc::clone(&inner);
                if let Err(err) = conn.run(async move |frame| route_inner.route(frame).await).await
                {
                    debug!(error = %err, "reader loop ended");
                }
                inner.dispatcher.drain();
            });
        }
        heartbeat::spawn(Arc::clone(&inner.conn), cfg.keepalive_interval);

        let client = Client { inner };
        let connected = tokio::time::timeout(
            cfg.dial_timeout,
            client.handshake(&cfg, proxy_to_broker),
        )
        .await
        .map_err(|_| ClientError::DeadlineExceeded)??;
        debug!(
            server = connected.server_version.as_deref().unwrap_or(""),
            protocol = connected.protocol_version.unwrap_or(0),
            "session established"
        );
        Ok(client)
    }

    async fn handshake(
        &self,
        cfg: &ClientConfig,
        proxy_to_broker: Option<&str>,
    ) -> Result<CommandConnected> {
        let (response, _permit) = self.inner.dispatcher.register_global()?;

        let mut connect = CommandConnect {
            client_version: Some(CLIENT_VERSION.to_string()),
            protocol_version: Some(PROTOCOL_VERSION),
            ..CommandConnect::default()
        };
        if let Some(auth) = &cfg.auth {
            connect.auth_method_name = Some(auth.method.clone());
            connect.auth_data = Some(auth.data.clone());
        }
        if let Some(proxy) = proxy_to_broker {
            connect.proxy_to_broker_url =
                Some(crate::connection::strip_scheme(proxy).to_string());
        }
        let mut cmd = BaseCommand::of(CommandType::Connect);
        cmd.connect = Some(connect);
        self.inner.conn.send_simple(cmd).await?;

        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::Connected) => {
                frame
                    .command
                    .connected
                    .ok_or(ClientError::UnexpectedResponse {
                        received: Some(CommandType::Connected),
                        context: "connecting",
                    })
            }
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::ConnectRejected {
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context: "connecting",
            }),
        }
    }

    /// Resolve which broker serves `topic`. Redirect responses are
    /// returned to the caller (the pool follows them); `Failed` surfaces
    /// as `LookupFailed`.
    pub async fn lookup_topic(
        &self,
        topic: &str,
        authoritative: bool,
    ) -> Result<CommandLookupTopicResponse> {
        let request_id = self.inner.request_id.next();
        let (response, _permit) = self.inner.dispatcher.register_request_id(request_id)?;
        let mut cmd = BaseCommand::of(CommandType::Lookup);
        cmd.lookup_topic = Some(CommandLookupTopic {
            topic: Some(topic.to_string()),
            request_id: Some(request_id),
            authoritative: Some(authoritative),
        });
        self.inner.conn.send_simple(cmd).await?;

        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::LookupResponse) => {
                let resp =
                    frame
                        .command
                        .lookup_topic_response
                        .ok_or(ClientError::UnexpectedResponse {
                            received: Some(CommandType::LookupResponse),
                            context: "looking up topic",
                        })?;
                if resp.response == Some(LookupType::Failed as i32) {
                    return Err(ClientError::LookupFailed {
                        kind: server_error(resp.error),
                        message: resp.message.clone().unwrap_or_default(),
                    });
                }
                Ok(resp)
            }
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::LookupFailed {
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context: "looking up topic",
            }),
        }
    }

    /// How many partitions `topic` has; zero means non-partitioned.
    pub async fn partitioned_metadata(&self, topic: &str) -> Result<u32> {
        let request_id = self.inner.request_id.next();
        let (response, _permit) = self.inner.dispatcher.register_request_id(request_id)?;
        let mut cmd = BaseCommand::of(CommandType::PartitionedMetadata);
        cmd.partition_metadata = Some(CommandPartitionedTopicMetadata {
            topic: Some(topic.to_string()),
            request_id: Some(request_id),
        });
        self.inner.conn.send_simple(cmd).await?;

        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::PartitionedMetadataResponse) => {
                let resp: CommandPartitionedTopicMetadataResponse = frame
                    .command
                    .partition_metadata_response
                    .ok_or(ClientError::UnexpectedResponse {
                        received: Some(CommandType::PartitionedMetadataResponse),
                        context: "querying partition metadata",
                    })?;
                if resp.response == Some(PartitionedResponse::Failed as i32) {
                    return Err(ClientError::Rejected {
                        context: "querying partition metadata",
                        kind: server_error(resp.error),
                        message: resp.message.unwrap_or_default(),
                    });
                }
                Ok(resp.partitions.unwrap_or(0))
            }
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::Rejected {
                    context: "querying partition metadata",
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context: "querying partition metadata",
            }),
        }
    }

    /// Create a producer on `topic`. The broker assigns the name when
    /// `name` is empty.
    pub async fn new_producer(&self, topic: &str, name: Option<String>) -> Result<Arc<Producer>> {
        let producer_id = self.inner.producer_ids.next();
        let request_id = self.inner.request_id.next();
        let (response, _permit) = self.inner.dispatcher.register_request_id(request_id)?;

        let mut cmd = BaseCommand::of(CommandType::Producer);
        cmd.producer = Some(CommandProducer {
            topic: Some(topic.to_string()),
            producer_id: Some(producer_id),
            request_id: Some(request_id),
            producer_name: name,
        });
        self.inner.conn.send_simple(cmd).await?;

        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::ProducerSuccess) => {
                let success =
                    frame
                        .command
                        .producer_success
                        .ok_or(ClientError::UnexpectedResponse {
                            received: Some(CommandType::ProducerSuccess),
                            context: "creating producer",
                        })?;
                let producer = Arc::new(Producer::new(
                    Arc::clone(&self.inner.conn) as Arc<dyn CommandSender>,
                    Arc::clone(&self.inner.dispatcher),
                    Arc::clone(&self.inner.request_id),
                    producer_id,
                    success.producer_name.unwrap_or_default(),
                ));
                self.inner
                    .producers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(producer_id, Arc::clone(&producer));
                Ok(producer)
            }
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::Rejected {
                    context: "creating producer",
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context: "creating producer",
            }),
        }
    }

    /// Subscribe with exclusive semantics. Messages are pushed into
    /// `queue`; nothing arrives until the consumer grants flow permits.
    pub async fn new_exclusive_consumer(
        &self,
        topic: &str,
        subscription: &str,
        earliest: bool,
        queue: mpsc::Sender<Message>,
    ) -> Result<Arc<Consumer>> {
        let (overflow, _overflow_rx) = OverflowSet::channel();
        self.subscribe(
            topic,
            subscription,
            SubscriptionMode::Exclusive,
            earliest,
            queue,
            overflow,
        )
        .await
    }

    /// Subscribe with failover semantics.
    pub async fn new_failover_consumer(
        &self,
        topic: &str,
        subscription: &str,
        earliest: bool,
        queue: mpsc::Sender<Message>,
    ) -> Result<Arc<Consumer>> {
        let (overflow, _overflow_rx) = OverflowSet::channel();
        self.subscribe(
            topic,
            subscription,
            SubscriptionMode::Failover,
            earliest,
            queue,
            overflow,
        )
        .await
    }

    /// Subscribe with shared semantics.
    pub async fn new_shared_consumer(
        &self,
        topic: &str,
        subscription: &str,
        earliest: bool,
        queue: mpsc::Sender<Message>,
    ) -> Result<Arc<Consumer>> {
        let (overflow, _overflow_rx) = OverflowSet::channel();
        self.subscribe(
            topic,
            subscription,
            SubscriptionMode::Shared,
            earliest,
            queue,
            overflow,
        )
        .await
    }

    pub(crate) async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        earliest: bool,
        queue: mpsc::Sender<Message>,
        overflow: Arc<OverflowSet>,
    ) -> Result<Arc<Consumer>> {
        let consumer_id = self.inner.consumer_ids.next();
        let request_id = self.inner.request_id.next();

        // register the consumer before SUBSCRIBE so frames racing the
        // SUCCESS response still find it
        let consumer = Arc::new(Consumer::new(
            Arc::clone(&self.inner.conn) as Arc<dyn CommandSender>,
            Arc::clone(&self.inner.dispatcher),
            Arc::clone(&self.inner.request_id),
            ConsumerOptions {
                consumer_id,
                topic: topic.to_string(),
                subscription: subscription.to_string(),
                mode,
                queue,
                overflow,
            },
        ));
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer_id, Arc::clone(&consumer));

        let result = self
            .subscribe_exchange(&consumer, topic, subscription, mode, earliest, request_id)
            .await;
        if result.is_err() {
            // release the consumer id
            self.inner
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&consumer_id);
        }
        result.map(|()| consumer)
    }

    async fn subscribe_exchange(
        &self,
        consumer: &Arc<Consumer>,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        earliest: bool,
        request_id: u64,
    ) -> Result<()> {
        let (response, _permit) = self.inner.dispatcher.register_request_id(request_id)?;
        let initial_position = if earliest {
            pulsar_wire::proto::InitialPosition::Earliest
        } else {
            pulsar_wire::proto::InitialPosition::Latest
        };
        let mut cmd = BaseCommand::of(CommandType::Subscribe);
        cmd.subscribe = Some(CommandSubscribe {
            topic: Some(topic.to_string()),
            subscription: Some(subscription.to_string()),
            sub_type: Some(mode.sub_type() as i32),
            consumer_id: Some(consumer.consumer_id()),
            request_id: Some(request_id),
            consumer_name: None,
            initial_position: Some(initial_position as i32),
        });
        self.inner.conn.send_simple(cmd).await?;

        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::Success) => Ok(()),
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::SubscribeRejected {
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context: "subscribing",
            }),
        }
    }

    /// Fires when this client's connection dies.
    pub fn closed_signal(&self) -> CloseSignal {
        self.inner.conn.closed_signal()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Close the connection. Every outstanding call drains with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        self.inner.conn.close().await;
    }
}

impl ClientInner {
    async fn route(&self, frame: Frame) {
        let Some(kind) = frame.command.command_type() else {
            warn!(raw = ?frame.command.r#type, "unknown command type, dropping frame");
            return;
        };
        let result = match kind {
            CommandType::Connected => self.dispatcher.notify_global(frame),
            CommandType::Error => {
                // an ERROR without a usable request id answers CONNECT
                let request_id = frame.command.error.as_ref().and_then(|e| e.request_id);
                match request_id {
                    Some(id) if id != UNDEF_REQUEST_ID => {
                        self.dispatcher.notify_request_id(id, frame)
                    }
                    _ => self.dispatcher.notify_global(frame),
                }
            }
            CommandType::ProducerSuccess => {
                let id = frame
                    .command
                    .producer_success
                    .as_ref()
                    .and_then(|c| c.request_id);
                self.notify_by_request_id(id, frame)
            }
            CommandType::Success => {
                let id = frame.command.success.as_ref().and_then(|c| c.request_id);
                self.notify_by_request_id(id, frame)
            }
            CommandType::LookupResponse => {
                let id = frame
                    .command
                    .lookup_topic_response
                    .as_ref()
                    .and_then(|c| c.request_id);
                self.notify_by_request_id(id, frame)
            }
            CommandType::PartitionedMetadataResponse => {
                let id = frame
                    .command
                    .partition_metadata_response
                    .as_ref()
                    .and_then(|c| c.request_id);
                self.notify_by_request_id(id, frame)
            }
            CommandType::SendReceipt => {
                let key = frame
                    .command
                    .send_receipt
                    .as_ref()
                    .map(|r| (r.producer_id.unwrap_or(0), r.sequence_id.unwrap_or(0)));
                match key {
                    Some((producer_id, sequence_id)) => {
                        self.dispatcher.notify_prod_seq(producer_id, sequence_id, frame)
                    }
                    None => Err(ClientError::NoHandler),
                }
            }
            CommandType::SendError => {
                let key = frame
                    .command
                    .send_error
                    .as_ref()
                    .map(|r| (r.producer_id.unwrap_or(0), r.sequence_id.unwrap_or(0)));
                match key {
                    Some((producer_id, sequence_id)) => {
                        self.dispatcher.notify_prod_seq(producer_id, sequence_id, frame)
                    }
                    None => Err(ClientError::NoHandler),
                }
            }
            CommandType::Message => self.route_message(frame),
            CommandType::ActiveConsumerChange => {
                let change = frame.command.active_consumer_change.as_ref();
                let consumer_id = change.and_then(|c| c.consumer_id);
                let is_active = change.and_then(|c| c.is_active).unwrap_or(false);
                match self.consumer(consumer_id) {
                    Some(consumer) => {
                        consumer.set_inactive(!is_active);
                        Ok(())
                    }
                    None => Err(ClientError::NoHandler),
                }
            }
            CommandType::ReachedEndOfTopic => {
                let consumer_id = frame
                    .command
                    .reached_end_of_topic
                    .as_ref()
                    .and_then(|c| c.consumer_id);
                match self.consumer(consumer_id) {
                    Some(consumer) => {
                        consumer.handle_reached_end_of_topic();
                        Ok(())
                    }
                    None => Err(ClientError::NoHandler),
                }
            }
            CommandType::CloseProducer => {
                let producer_id = frame
                    .command
                    .close_producer
                    .as_ref()
                    .and_then(|c| c.producer_id);
                let producer = producer_id.and_then(|id| {
                    self.producers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(&id)
                        .cloned()
                });
                match producer {
                    Some(producer) => {
                        producer.handle_close_producer();
                        Ok(())
                    }
                    None => Err(ClientError::NoHandler),
                }
            }
            CommandType::CloseConsumer => {
                let consumer_id = frame
                    .command
                    .close_consumer
                    .as_ref()
                    .and_then(|c| c.consumer_id);
                match self.consumer(consumer_id) {
                    Some(consumer) => {
                        consumer.handle_close_consumer();
                        Ok(())
                    }
                    None => Err(ClientError::NoHandler),
                }
            }
            CommandType::Ping => {
                let mut pong = BaseCommand::of(CommandType::Pong);
                pong.pong = Some(CommandPong {});
                self.conn.send_simple(pong).await
            }
            // inbound-frame accounting already happened in the read loop
            CommandType::Pong => Ok(()),
            other => {
                warn!(kind = ?other, "unhandled command, dropping frame");
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!(kind = ?kind, error = %err, "dropping frame");
        }
    }

    fn route_message(&self, frame: Frame) -> Result<()> {
        let msg = frame.command.message.ok_or(ClientError::NoHandler)?;
        let payload = frame.payload.ok_or(ClientError::UnexpectedResponse {
            received: Some(CommandType::Message),
            context: "message without payload",
        })?;
        match self.consumer(msg.consumer_id) {
            Some(consumer) => consumer.handle_message(&msg, payload),
            None => Err(ClientError::NoHandler),
        }
    }

    fn consumer(&self, consumer_id: Option<u64>) -> Option<Arc<Consumer>> {
        consumer_id.and_then(|id| {
            self.consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&id)
                .cloned()
        })
    }

    fn notify_by_request_id(&self, request_id: Option<u64>, frame: Frame) -> Result<()> {
        match request_id {
            Some(id) => self.dispatcher.notify_request_id(id, frame),
            None => Err(ClientError::NoHandler),
        }
    }
}
