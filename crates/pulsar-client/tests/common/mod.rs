// In-process mock broker for end-to-end tests.
//
// Listens on loopback, accepts connections one at a time, and decodes real
// protocol frames. Every inbound frame is offered to the test's responder
// (which returns reply frames) and recorded on the `inbound` channel;
// frames can also be injected at any time through `outbound`, and the
// current connection can be severed with `drop_conn` to exercise
// reconnect paths.
#![allow(dead_code)]
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use pulsar_wire::Frame;
use pulsar_wire::proto::*;

/// Returns reply frames for an inbound frame; `None` means no reply.
pub type Responder = Box<dyn FnMut(&Frame) -> Option<Vec<Frame>> + Send>;

pub struct MockBroker {
    pub addr: String,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub drop_conn: mpsc::UnboundedSender<()>,
    pub connections: Arc<AtomicUsize>,
}

impl MockBroker {
    /// Next recorded inbound frame of the given type, skipping others.
    pub async fn expect(&mut self, kind: CommandType) -> Frame {
        loop {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(5), self.inbound.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("broker task gone");
            if frame.command.command_type() == Some(kind) {
                return frame;
            }
        }
    }
}

pub async fn spawn(mut responder: Responder) -> Result<MockBroker> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind mock broker")?;
    let addr = format!("pulsar://{}", listener.local_addr().context("local addr")?);
    let (in_tx, inbound) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (drop_tx, mut drop_rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));

    let conn_count = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            conn_count.fetch_add(1, Ordering::SeqCst);
            serve(stream, &mut responder, &in_tx, &mut out_rx, &mut drop_rx).await;
        }
    });

    Ok(MockBroker {
        addr,
        inbound,
        outbound: out_tx,
        drop_conn: drop_tx,
        connections,
    })
}

async fn serve(
    mut stream: TcpStream,
    responder: &mut Responder,
    in_tx: &mpsc::UnboundedSender<Frame>,
    out_rx: &mut mpsc::UnboundedReceiver<Frame>,
    drop_rx: &mut mpsc::UnboundedReceiver<()>,
) {
    let mut buf = BytesMut::new();
    loop {
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    let replies = responder(&frame);
                    let _ = in_tx.send(frame);
                    if let Some(replies) = replies {
                        for reply in replies {
                            let bytes = reply.encode().expect("encode reply");
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
        tokio::select! {
            _ = drop_rx.recv() => return,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { return };
                let bytes = frame.encode().expect("encode outbound");
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}

/// Session-level behaviour shared by most tests: answer CONNECT with
/// CONNECTED and PING with PONG.
pub fn session_basics(frame: &Frame) -> Option<Vec<Frame>> {
    match frame.command.command_type() {
        Some(CommandType::Connect) => Some(vec![connected()]),
        Some(CommandType::Ping) => Some(vec![pong()]),
        _ => None,
    }
}

pub fn connected() -> Frame {
    let mut cmd = BaseCommand::of(CommandType::Connected);
    cmd.connected = Some(CommandConnected {
        server_version: Some("mock-broker".to_string()),
        protocol_version: Some(PROTOCOL_VERSION),
    });
    Frame::simple(cmd)
}

pub fn pong() -> Frame {
    let mut cmd = BaseCommand::of(CommandType::Pong);
    cmd.pong = Some(CommandPong {});
    Frame::simple(cmd)
}

pub fn ping() -> Frame {
    let mut cmd = BaseCommand::of(CommandType::Ping);
    cmd.ping = Some(CommandPing {});
    Frame::simple(cmd)
}

pub fn success(request_id: u64) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::Success);
    cmd.success = Some(CommandSuccess {
        request_id: Some(request_id),
    });
    Frame::simple(cmd)
}

pub fn error_reply(request_id: Option<u64>, error: ServerError, message: &str) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::Error);
    cmd.error = Some(CommandError {
        request_id,
        error: Some(error as i32),
        message: Some(message.to_string()),
    });
    Frame::simple(cmd)
}

pub fn producer_success(request_id: u64, name: &str) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::ProducerSuccess);
    cmd.producer_success = Some(CommandProducerSuccess {
        request_id: Some(request_id),
        producer_name: Some(name.to_string()),
        last_sequence_id: Some(-1),
    });
    Frame::simple(cmd)
}

pub fn send_receipt(producer_id: u64, sequence_id: u64) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::SendReceipt);
    cmd.send_receipt = Some(CommandSendReceipt {
        producer_id: Some(producer_id),
        sequence_id: Some(sequence_id),
        message_id: Some(MessageIdData {
            ledger_id: Some(1),
            entry_id: Some(sequence_id),
            partition: Some(-1),
            batch_index: Some(-1),
        }),
    });
    Frame::simple(cmd)
}

pub fn send_error(producer_id: u64, sequence_id: u64, error: ServerError, message: &str) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::SendError);
    cmd.send_error = Some(CommandSendError {
        producer_id: Some(producer_id),
        sequence_id: Some(sequence_id),
        error: Some(error as i32),
        message: Some(message.to_string()),
    });
    Frame::simple(cmd)
}

pub fn close_producer(producer_id: u64) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::CloseProducer);
    cmd.close_producer = Some(CommandCloseProducer {
        producer_id: Some(producer_id),
        request_id: Some(0),
    });
    Frame::simple(cmd)
}

pub fn close_consumer(consumer_id: u64) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::CloseConsumer);
    cmd.close_consumer = Some(CommandCloseConsumer {
        consumer_id: Some(consumer_id),
        request_id: Some(0),
    });
    Frame::simple(cmd)
}

pub fn lookup_connect(request_id: u64, broker_url: &str) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::LookupResponse);
    cmd.lookup_topic_response = Some(CommandLookupTopicResponse {
        broker_service_url: Some(broker_url.to_string()),
        broker_service_url_tls: None,
        response: Some(LookupType::Connect as i32),
        request_id: Some(request_id),
        authoritative: Some(true),
        error: None,
        message: None,
        proxy_through_service_url: None,
    });
    Frame::simple(cmd)
}

pub fn lookup_redirect(request_id: u64, broker_url: &str, authoritative: bool) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::LookupResponse);
    cmd.lookup_topic_response = Some(CommandLookupTopicResponse {
        broker_service_url: Some(broker_url.to_string()),
        broker_service_url_tls: None,
        response: Some(LookupType::Redirect as i32),
        request_id: Some(request_id),
        authoritative: Some(authoritative),
        error: None,
        message: None,
        proxy_through_service_url: None,
    });
    Frame::simple(cmd)
}

pub fn reached_end_of_topic(consumer_id: u64) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::ReachedEndOfTopic);
    cmd.reached_end_of_topic = Some(CommandReachedEndOfTopic {
        consumer_id: Some(consumer_id),
    });
    Frame::simple(cmd)
}

pub fn active_consumer_change(consumer_id: u64, is_active: bool) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::ActiveConsumerChange);
    cmd.active_consumer_change = Some(CommandActiveConsumerChange {
        consumer_id: Some(consumer_id),
        is_active: Some(is_active),
    });
    Frame::simple(cmd)
}

/// MESSAGE frame with a single uncompressed payload.
pub fn message(consumer_id: u64, ledger: u64, entry: u64, payload: &[u8]) -> Frame {
    let mut cmd = BaseCommand::of(CommandType::Message);
    cmd.message = Some(CommandMessage {
        consumer_id: Some(consumer_id),
        message_id: Some(MessageIdData {
            ledger_id: Some(ledger),
            entry_id: Some(entry),
            partition: Some(-1),
            batch_index: Some(-1),
        }),
        redelivery_count: None,
    });
    let metadata = MessageMetadata {
        producer_name: Some("mock".to_string()),
        sequence_id: Some(entry),
        publish_time: Some(1),
        ..MessageMetadata::default()
    };
    Frame::with_payload(cmd, metadata, bytes::Bytes::copy_from_slice(payload))
}

/// MESSAGE frame carrying a batch container with the given payloads.
pub fn batch_message(consumer_id: u64, ledger: u64, entry: u64, payloads: &[&[u8]]) -> Frame {
    use bytes::BufMut;
    use prost::Message as _;

    let mut cmd = BaseCommand::of(CommandType::Message);
    cmd.message = Some(CommandMessage {
        consumer_id: Some(consumer_id),
        message_id: Some(MessageIdData {
            ledger_id: Some(ledger),
            entry_id: Some(entry),
            partition: Some(-1),
            batch_index: Some(-1),
        }),
        redelivery_count: None,
    });
    let metadata = MessageMetadata {
        producer_name: Some("mock".to_string()),
        sequence_id: Some(entry),
        publish_time: Some(1),
        num_messages_in_batch: Some(payloads.len() as i32),
        ..MessageMetadata::default()
    };
    let mut container = BytesMut::new();
    for payload in payloads {
        let single = SingleMessageMetadata {
            payload_size: Some(payload.len() as i32),
            ..SingleMessageMetadata::default()
        };
        let encoded = single.encode_to_vec();
        container.put_u32(encoded.len() as u32);
        container.extend_from_slice(&encoded);
        container.extend_from_slice(payload);
    }
    Frame::with_payload(cmd, metadata, container.freeze())
}

/// Extract the request id a control command carries, for echo replies.
pub fn request_id_of(frame: &Frame) -> Option<u64> {
    let cmd = &frame.command;
    cmd.producer
        .as_ref()
        .and_then(|c| c.request_id)
        .or_else(|| cmd.subscribe.as_ref().and_then(|c| c.request_id))
        .or_else(|| cmd.lookup_topic.as_ref().and_then(|c| c.request_id))
        .or_else(|| cmd.partition_metadata.as_ref().and_then(|c| c.request_id))
        .or_else(|| cmd.close_producer.as_ref().and_then(|c| c.request_id))
        .or_else(|| cmd.close_consumer.as_ref().and_then(|c| c.request_id))
        .or_else(|| cmd.unsubscribe.as_ref().and_then(|c| c.request_id))
        .or_else(|| cmd.seek.as_ref().and_then(|c| c.request_id))
}
