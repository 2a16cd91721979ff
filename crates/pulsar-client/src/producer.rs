// Producer state machine.
//
// Created by `Client::new_producer` once the broker has answered
// PRODUCER_SUCCESS with the assigned producer name. Each `send` claims the
// next sequence id, registers the (producer-id, sequence-id) response slot
// before writing, and resolves on SEND_RECEIPT, SEND_ERROR, producer close
// or connection close — whichever comes first.
use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use pulsar_wire::proto::{
    BaseCommand, CommandCloseProducer, CommandSend, CommandSendReceipt, CommandType,
    CompressionType, MessageMetadata,
};

use crate::connection::CommandSender;
use crate::counter::MonotonicId;
use crate::dispatcher::Dispatcher;
use crate::errors::{ClientError, Result, server_error};
use crate::signal::{CloseBroadcast, CloseSignal};

/// Observes every outgoing message right before it is written to the
/// wire. Runs on the sending task; it must not block.
pub trait TraceHook: Send + Sync {
    fn on_send(&self, metadata: &MessageMetadata, payload: &[u8]);
}

pub struct Producer {
    sender: Arc<dyn CommandSender>,
    dispatcher: Arc<Dispatcher>,
    request_id: Arc<MonotonicId>,
    producer_id: u64,
    /// Broker-assigned name, installed by PRODUCER_SUCCESS.
    producer_name: String,
    sequence_id: MonotonicId,
    closed: CloseBroadcast,
    close_lock: Mutex<()>,
    trace_hook: StdMutex<Option<Arc<dyn TraceHook>>>,
}

impl Producer {
    pub(crate) fn new(
        sender: Arc<dyn CommandSender>,
        dispatcher: Arc<Dispatcher>,
        request_id: Arc<MonotonicId>,
        producer_id: u64,
        producer_name: String,
    ) -> Producer {
        Producer {
            sender,
            dispatcher,
            request_id,
            producer_id,
            producer_name,
            sequence_id: MonotonicId::new(0),
            closed: CloseBroadcast::new(),
            close_lock: Mutex::new(()),
            trace_hook: StdMutex::new(None),
        }
    }

    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    pub fn producer_name(&self) -> &str {
        &self.producer_name
    }

    /// Install a hook observing outgoing messages. Install once, before
    /// sending.
    pub fn set_trace_hook(&self, hook: Arc<dyn TraceHook>) {
        *self
            .trace_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Publish one message and wait for the broker's receipt.
    pub async fn send(&self, payload: Bytes) -> Result<CommandSendReceipt> {
        if self.closed.is_fired() {
            return Err(ClientError::ClosedProducer);
        }
        let sequence_id = self.sequence_id.next();
        let (response, _permit) = self
            .dispatcher
            .register_prod_seq(self.producer_id, sequence_id)?;

        let mut cmd = BaseCommand::of(CommandType::Send);
        cmd.send = Some(CommandSend {
            producer_id: Some(self.producer_id),
            sequence_id: Some(sequence_id),
            num_messages: Some(1),
        });
        let metadata = MessageMetadata {
            producer_name: Some(self.producer_name.clone()),
            sequence_id: Some(sequence_id),
            publish_time: Some(now_millis()),
            compression: Some(CompressionType::None as i32),
            ..MessageMetadata::default()
        };

        let hook = self
            .trace_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook.on_send(&metadata, &payload);
        }

        self.sender.send_payload(cmd, metadata, payload).await?;

        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = closed.wait() => Err(ClientError::ClosedProducer),
            frame = response => {
                let frame = frame.map_err(|_| ClientError::ConnectionClosed)?;
                match frame.command.command_type() {
                    Some(CommandType::SendReceipt) => {
                        frame.command.send_receipt.ok_or(ClientError::UnexpectedResponse {
                            received: Some(CommandType::SendReceipt),
                            context: "awaiting send receipt",
                        })
                    }
                    Some(CommandType::SendError) => {
                        let err = frame.command.send_error.unwrap_or_default();
                        Err(ClientError::SendRejected {
                            kind: server_error(err.error),
                            message: err.message.unwrap_or_default(),
                        })
                    }
                    other => Err(ClientError::UnexpectedResponse {
                        received: other,
                        context: "awaiting send receipt",
                    }),
                }
            }
        }
    }

    /// Fires once the producer is closed, whether by `close` or by the
    /// broker.
    pub fn closed_signal(&self) -> CloseSignal {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Fires when the underlying connection dies; the producer must then
    /// be recreated on a fresh client.
    pub fn conn_closed_signal(&self) -> CloseSignal {
        self.sender.closed_signal()
    }

    /// Ask the broker to close the producer, waiting for its SUCCESS. A
    /// second close returns without any I/O.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.close_lock.lock().await;
        if self.closed.is_fired() {
            return Ok(());
        }

        let request_id = self.request_id.next();
        let (response, _permit) = self.dispatcher.register_request_id(request_id)?;

        let mut cmd = BaseCommand::of(CommandType::CloseProducer);
        cmd.close_producer = Some(CommandCloseProducer {
            producer_id: Some(self.producer_id),
            request_id: Some(request_id),
        });
        self.sender.send_simple(cmd).await?;

        let frame = response.await.map_err(|_| ClientError::ConnectionClosed)?;
        match frame.command.command_type() {
            Some(CommandType::Success) => {
                self.closed.fire();
                Ok(())
            }
            Some(CommandType::Error) => {
                let err = frame.command.error.unwrap_or_default();
                Err(ClientError::Rejected {
                    context: "closing producer",
                    kind: server_error(err.error),
                    message: err.message.unwrap_or_default(),
                })
            }
            other => Err(ClientError::UnexpectedResponse {
                received: other,
                context: "closing producer",
            }),
        }
    }

    /// Broker-initiated CLOSE_PRODUCER: mark closed and wake everyone
    /// waiting. The managed layer recreates the producer.
    pub(crate) fn handle_close_producer(&self) {
        self.closed.fire();
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
