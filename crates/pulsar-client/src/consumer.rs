// Consumer state machine.
//
// Created by the client's subscribe call once SUCCESS arrives. The reader
// task pushes inbound MESSAGE frames through `handle_message`, which
// decompresses, splits batches, and enqueues logical messages on the
// bounded delivery queue without ever blocking the reader: when the queue
// is full the message id goes to the overflow set and the payload is
// dropped, to be redelivered later via `redeliver_overflow`.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use pulsar_wire::proto::{
    AckType, BaseCommand, CommandAck, CommandCloseConsumer, CommandMessage,
    CommandRedeliverUnacknowledgedMessages, CommandSeek, CommandType, CommandUnsubscribe,
    CompressionType, KeyValue, MessageIdData,
};
use pulsar_wire::{Payload, batch};

use crate::compression::decompress;
use crate::config::{DEFAULT_MAX_REDELIVER_IDS, SubscriptionMode};
use crate::connection::CommandSender;
use crate::counter::MonotonicId;
use crate::dispatcher::Dispatcher;
use crate::errors::{ClientError, Result, server_error};
use crate::signal::{CloseBroadcast, CloseSignal};

/// Durable address of a message. Equality and hashing are component-wise;
/// cumulative acknowledgement compares (ledger, entry) lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub batch_index: i32,
}

impl MessageId {
    pub(crate) fn from_proto(data: &MessageIdData) -> Self {
        Self {
            ledger_id: data.ledger_id.unwrap_or(0),
            entry_id: data.entry_id.unwrap_or(0),
            partition: data.partition.unwrap_or(-1),
            batch_index: data.batch_index.unwrap_or(-1),
        }
    }

    pub(crate) fn to_proto(self) -> MessageIdData {
        MessageIdData {
            ledger_id: Some(self.ledger_id),
            entry_id: Some(self.entry_id),
            partition: Some(self.partition),
            batch_index: Some(self.batch_index),
        }
    }

    /// Whether this id is covered by a cumulative ack up to `other`.
    fn covered_by(self, other: MessageId) -> bool {
        (self.ledger_id, self.entry_id) <= (other.ledger_id, other.entry_id)
    }
}

/// One logical message as delivered to the application.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub message_id: MessageId,
    pub payload: Bytes,
    pub publish_time: Option<u64>,
    pub partition_key: Option<String>,
    pub properties: Vec<KeyValue>,
    pub redelivery_count: u32,
}

/// Message ids dropped because the delivery queue was full. Shared across
/// consumer incarnations so a reconnect cannot lose redelivery debt.
pub(crate) struct OverflowSet {
    ids: StdMutex<Vec<MessageId>>,
    signal: mpsc::UnboundedSender<()>,
}

impl OverflowSet {
    /// New set plus the signal receiver that fires once per dropped
    /// message.
    pub(crate) fn channel() -> (Arc<OverflowSet>, mpsc::UnboundedReceiver<()>) {
        let (signal, rx) = mpsc::unbounded_channel();
        (
            Arc::new(OverflowSet {
                ids: StdMutex::new(Vec::new()),
                signal,
            }),
            rx,
        )
    }

    fn push(&self, id: MessageId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        let _ = self.signal.send(());
        metrics::counter!("pulsar_client_consumer_overflow_total").increment(1);
    }

    fn drain(&self, max: usize) -> Vec<MessageId> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        let take = ids.len().min(max);
        ids.drain(..take).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub(crate) struct ConsumerOptions {
    pub consumer_id: u64,
    pub topic: String,
    pub subscription: String,
    pub mode: SubscriptionMode,
    pub queue: mpsc::Sender<Message>,
    pub overflow: Arc<OverflowSet>,
}

pub struct Consumer {
    sender: Arc<dyn CommandSender>,
    dispatcher: Arc<Dispatcher>,
    request_id: Arc<MonotonicId>,
    consumer_id: u64,
    topic: String,
    subscription: String,
    mode: SubscriptionMode,
    queue: mpsc::Sender<Message>,
    /// Delivered but not yet acknowledged, with delivery time for
    /// redelivery decisions.
    pending_acks: StdMutex<HashMap<MessageId, Instant>>,
    overflow: Arc<OverflowSet>,
    /// Failover subscriptions only: set while another consumer holds the
    /// subscription.
    inactive: AtomicBool,
    end_of_topic: CloseBroadcast,
    closed: CloseBroadcast,
    close_lock: Mutex<()>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("consumer_id", &self.consumer_id)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub(crate) fn new(
        sender: Arc<dyn CommandSender>,
        dispatcher: Arc<Dispatcher>,
        request_id: Arc<MonotonicId>,
        options: ConsumerOptions,
    ) -> Consumer {
        Consumer {
            sender,
            dispatcher,
            request_id,
            consumer_id: options.consumer_id,
            topic: options.topic,
            subscription: options.subscription,
            mode: options.mode,
            queue: options.queue,
            pending_acks: StdMutex::new(HashMap::new()),
            overflow: options.overflow,
            inactive: AtomicBool::new(false),
            end_of_topic: CloseBroadcast::new(),
            closed: CloseBroadcast::new(),
            close_lock: Mutex::new(()),
        }
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Failover mode: true while the broker considers this consumer a
    /// standby. Messages still flow once the consumer is promoted.
    pub fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::Relaxed)
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.len()
    }

    /// Grant the broker `permits` more message deliveries. Nothing arrives
    /// until the first flow call.
    pub async fn flow(&self, permits: u32) -> Result<()> {
        if self.closed.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let mut cmd = BaseCommand::of(CommandType::Flow);
        cmd.flow = Some(pulsar_wire::proto::CommandFlow {
            consumer_id: Some(self.consumer_id),
            message_permits: Some(permits),
        });
        self.sender.send_simple(cmd).await
    }

    /// Acknowledge one message.
    pub async fn ack(&self, message_id: MessageId) -> Result<()> {
        self.ack_with(AckType::Individual, message_id).await
    }

    /// Acknowledge every message up to and including `message_id`
    /// (lexicographically by ledger and entry).
    pub async fn ack_cumulative(&self, message_id: MessageId) -> Result<()> {
        self.ack_with(AckType::Cumulative, message_id).await
    }

    async fn ack_with(&self, ack_type: AckType, message_id: MessageId) -> Result<()> {
        if self.closed.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let mut cmd = BaseCommand::of(CommandType::Ack);
        cmd.ack = Some(CommandAck {
            consumer_id: Some(self.consumer_id),
            ack_type: Some(ack_type as i32),
            message_id: vec![message_id.to_proto()],
        });
        self.sender.send_simple(cmd).await?;

        let mut pending = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match ack_type {
            AckType::Individual => {
                pending.remove(&message_id);
            }
            AckType::Cumulative => {
                pending.retain(|id, _| !id.covered_by(message_id));
            }
        }
        Ok(())
    }

    /// Ask the broker to resend everything delivered but not yet acked.
    /// The pending set is only cleared as redeliveries arrive.
    pub async fn redeliver_unacknowledged(&self) -> Result<()> {
        if self.closed.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let ids: Vec<MessageIdData> = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|id| id.to_proto())
            .collect();
        let mut cmd = BaseCommand::of(CommandType::RedeliverUnacknowledgedMessages);
        cmd.redeliver_unacknowledged_messages = Some(CommandRedeliverUnacknowledgedMessages {
            consumer_id: Some(self.consumer_id),
            message_ids: ids,
        });
        self.sender.send_simple(cmd).await
    }

    /// Ask the broker to resend messages that were dropped because the
    /// delivery queue was full. At most `DEFAULT_MAX_REDELIVER_IDS` ids go
    /// into one request; returns how many were sent. Note that for
    /// non-Shared subscriptions the broker redelivers all unacked
    /// messages, not just the requested ones.
    pub async fn redeliver_overflow(&self) -> Result<usize> {
        if self.closed.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let ids = self.overflow.drain(DEFAULT_MAX_REDELIVER_IDS);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        let mut cmd = BaseCommand::of(CommandType::RedeliverUnacknowledgedMessages);
        cmd.redeliver_unacknowledged_messages = Some(CommandRedeliverUnacknowledgedMessages {
            consumer_id: Some(self.consumer_id),
            message_ids: ids.into_iter().map(|id| id.to_proto()).collect(),
        });
        self.sender.send_simple(cmd).await?;
        metrics::counter!("pulsar_client_consumer_redelivered_total").increment(count as u64);
        Ok(count)
    }

    /// Reset the subscription cursor to the given message id.
    pub async fn seek(&self, message_id: MessageId) -> Result<()> {
        if self.closed.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let request_id = self.request_id.next();
        let (response, _permit) = self.dispatcher.register_request_id(request_id)?;
        let mut cmd = BaseCommand::of(CommandType::Seek);
        cmd.seek = Some(CommandSeek {
            consumer_id: Some(self.consumer_id),
            request_id: Some(request_id),
            message_id: Some(message_id.to_proto()),
        });
        self.sender.send_simple(cmd).await?;
        self.await_success(response, "seeking").await
    }

    /// Remove the subscription from the topic. The consumer is closed on
    /// success.
    pub async fn unsubscribe(&self) -> Result<()> {
        if self.closed.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let request_id = self.request_id.next();
        let (response, _permit) = self.dispatcher.register_request_id(request_id)?;
        let mut cmd = BaseCommand::of(CommandType::Unsubscribe);
        cmd.unsubscribe = Some(CommandUnsubscribe {
            consumer_id: Some(self.consumer_id),
            request_id: Some(request_id),
        });
        self.sender.send_simple(cmd).await?;
        self.await_success(response, "unsubscribing").await?;
        self.closed.fire();
        Ok(())
    }

    /// Close the consumer, waiting for the broker's SUCCESS. A second
    /// close returns without any I/O.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.close_lock.lock().await;
        if self.closed.is_fired() {
            return Ok(());
        }
        let request_id = self.request_id.next();
        let (response, _permit) = self.dispatcher.register_request_id(request_id)?;
        let mut cmd = BaseCommand::of(CommandType::CloseConsumer);
        cmd.close_consumer = Some(CommandCloseConsumer {
            consumer_id: Some(self.consumer_id),
            request_id: Some(request_id),
        });
        self.sender.send_simple(cmd).await?;
        self.await_success(response, "closing consumer").await?;
        self.closed.fire();
        Ok(())
    }

    async fn await_success(
        &self,
        response: tokio::sync::oneshot::Receiver<pulsar_wire::Frame>,
        context: &'static str,
    ) -> Result<()> {
        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::Success) => Ok(()),
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::Rejected {
                    context,
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context,
            }),
        }
    }

    pub fn closed_signal(&self) -> CloseSignal {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    pub fn conn_closed_signal(&self) -> CloseSignal {
        self.sender.closed_signal()
    }

    /// Fires when the broker reports the topic has been terminated and
    /// fully consumed.
    pub fn end_of_topic_signal(&self) -> CloseSignal {
        self.end_of_topic.subscribe()
    }

    /// Inbound MESSAGE frame: decompress, de-batch, enqueue. Runs on the
    /// reader task and never blocks; queue overflow drops the payload and
    /// records the id for later redelivery.
    pub(crate) fn handle_message(&self, msg: &CommandMessage, payload: Payload) -> Result<()> {
        let base_id = MessageId::from_proto(msg.message_id.as_ref().ok_or(
            ClientError::UnexpectedResponse {
                received: Some(CommandType::Message),
                context: "message without id",
            },
        )?);
        let redelivery_count = msg.redelivery_count.unwrap_or(0);
        let metadata = payload.metadata;

        let codec = metadata
            .compression
            .map(|raw| {
                CompressionType::try_from(raw)
                    .map_err(|_| ClientError::Decompress(format!("unknown codec {raw}")))
            })
            .transpose()?
            .unwrap_or(CompressionType::None);
        let data = if codec == CompressionType::None {
            payload.data
        } else {
            decompress(
                codec,
                &payload.data,
                metadata.uncompressed_size.unwrap_or(0) as usize,
            )?
        };

        match metadata.num_messages_in_batch {
            Some(count) => {
                // batch container: one logical message per entry, with
                // batch indexes assigned in wire order
                for (index, entry) in batch::entries(data, count.max(0) as u32).enumerate() {
                    let entry = entry?;
                    self.deliver(Message {
                        topic: self.topic.clone(),
                        message_id: MessageId {
                            batch_index: index as i32,
                            ..base_id
                        },
                        payload: entry.data,
                        publish_time: metadata.publish_time,
                        partition_key: entry
                            .metadata
                            .partition_key
                            .clone()
                            .or_else(|| metadata.partition_key.clone()),
                        properties: entry.metadata.properties,
                        redelivery_count,
                    });
                }
            }
            None => self.deliver(Message {
                topic: self.topic.clone(),
                message_id: base_id,
                payload: data,
                publish_time: metadata.publish_time,
                partition_key: metadata.partition_key,
                properties: metadata.properties,
                redelivery_count,
            }),
        }
        Ok(())
    }

    fn deliver(&self, message: Message) {
        let id = message.message_id;
        match self.queue.try_send(message) {
            Ok(()) => {
                self.pending_acks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, Instant::now());
            }
            Err(mpsc::error::TrySendError::Full(_)) => self.overflow.push(id),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(consumer_id = self.consumer_id, "delivery queue receiver gone");
            }
        }
    }

    pub(crate) fn set_inactive(&self, inactive: bool) {
        self.inactive.store(inactive, Ordering::Relaxed);
    }

    pub(crate) fn handle_reached_end_of_topic(&self) {
        self.end_of_topic.fire();
    }

    /// Broker-initiated CLOSE_CONSUMER: mark closed and wake waiters. The
    /// managed layer resubscribes.
    pub(crate) fn handle_close_consumer(&self) {
        self.closed.fire();
    }
}
