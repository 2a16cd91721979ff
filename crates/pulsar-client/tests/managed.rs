// Managed supervisor and client pool against the mock broker.
mod common;

use anyhow::Result;
use bytes::Bytes;
use common::*;
use pulsar_client::{
    ClientConfig, ClientError, ClientPool, ConsumerConfig, ManagedConsumer, ManagedProducer,
    ProducerConfig,
};
use pulsar_wire::Frame;
use pulsar_wire::proto::CommandType;
use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::time::Duration;

const TOPIC: &str = "persistent://p/n/t/a";

/// Full broker behaviour: lookups resolve to the answering broker itself,
/// producers and subscriptions succeed, sends are receipted, and every
/// FLOW is answered with one fresh message.
fn full_responder() -> Responder {
    let entry = Cell::new(0u64);
    Box::new(move |frame: &Frame| {
        if let Some(replies) = session_basics(frame) {
            return Some(replies);
        }
        match frame.command.command_type() {
            Some(CommandType::Lookup) => {
                // empty broker URL: this broker owns the topic
                Some(vec![lookup_connect(
                    request_id_of(frame).expect("request id"),
                    "",
                )])
            }
            Some(CommandType::Producer) => Some(vec![producer_success(
                request_id_of(frame).expect("request id"),
                "managed-producer",
            )]),
            Some(CommandType::Send) => {
                let send = frame.command.send.as_ref().expect("send");
                Some(vec![send_receipt(
                    send.producer_id.expect("producer id"),
                    send.sequence_id.expect("sequence id"),
                )])
            }
            Some(
                CommandType::Subscribe | CommandType::Unsubscribe | CommandType::CloseConsumer,
            ) => Some(vec![success(request_id_of(frame).expect("request id"))]),
            Some(CommandType::CloseProducer) => {
                Some(vec![success(request_id_of(frame).expect("request id"))])
            }
            Some(CommandType::Flow) => {
                let consumer_id = frame
                    .command
                    .flow
                    .as_ref()
                    .and_then(|f| f.consumer_id)
                    .expect("consumer id");
                let n = entry.get();
                entry.set(n + 1);
                Some(vec![message(
                    consumer_id,
                    1,
                    n,
                    format!("m{n}").as_bytes(),
                )])
            }
            _ => None,
        }
    })
}

fn producer_cfg(addr: &str) -> ProducerConfig {
    ProducerConfig {
        client: ClientConfig::new(addr),
        topic: TOPIC.to_string(),
        name: None,
        new_producer_timeout: Duration::from_secs(2),
        initial_reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(200),
    }
}

fn consumer_cfg(addr: &str) -> ConsumerConfig {
    ConsumerConfig {
        client: ClientConfig::new(addr),
        topic: TOPIC.to_string(),
        subscription: "managed-sub".to_string(),
        new_consumer_timeout: Duration::from_secs(2),
        initial_reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(200),
        ..ConsumerConfig::default()
    }
}

/// Retry an operation that may race a reconnect; the handle must
/// eventually succeed again.
async fn send_until_ok(producer: &ManagedProducer, payload: &'static [u8]) -> Result<u64> {
    for _ in 0..100 {
        match producer.send(Bytes::from_static(payload)).await {
            Ok(receipt) => return Ok(receipt.sequence_id.unwrap_or(0)),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    anyhow::bail!("send did not recover");
}

#[tokio::test]
async fn managed_producer_sends_through_lookup() -> Result<()> {
    let broker = spawn(full_responder()).await?;
    let pool = ClientPool::new();
    let producer = ManagedProducer::new(pool, producer_cfg(&broker.addr));

    let seq = send_until_ok(&producer, b"hola mundo").await?;
    assert_eq!(seq, 0);
    assert_eq!(broker.connections.load(Ordering::SeqCst), 1);
    producer.close().await?;
    Ok(())
}

#[tokio::test]
async fn managed_producer_survives_connection_loss() -> Result<()> {
    let broker = spawn(full_responder()).await?;
    let pool = ClientPool::new();
    let producer = ManagedProducer::new(pool, producer_cfg(&broker.addr));

    send_until_ok(&producer, b"before").await?;
    broker.drop_conn.send(())?;

    // the same handle recovers on a fresh connection
    send_until_ok(&producer, b"after").await?;
    assert!(broker.connections.load(Ordering::SeqCst) >= 2);
    Ok(())
}

#[tokio::test]
async fn managed_producer_replaced_after_broker_close() -> Result<()> {
    let broker = spawn(full_responder()).await?;
    let pool = ClientPool::new();
    let producer = ManagedProducer::new(pool, producer_cfg(&broker.addr));

    send_until_ok(&producer, b"before").await?;
    let first = producer.producer().expect("producer present");

    // broker hands the topic off: CLOSE_PRODUCER without closing the
    // connection
    broker.outbound.send(close_producer(first.producer_id()))?;
    let mut closed = first.closed_signal();
    tokio::time::timeout(Duration::from_secs(5), closed.wait())
        .await
        .expect("producer closed by broker");

    send_until_ok(&producer, b"after").await?;
    let second = producer.producer().expect("replacement present");
    assert_ne!(first.producer_id(), second.producer_id());
    // the handoff reused the existing connection
    assert_eq!(broker.connections.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn managed_consumer_receives_and_acks() -> Result<()> {
    let mut broker = spawn(full_responder()).await?;
    let pool = ClientPool::new();
    let consumer = ManagedConsumer::new(pool, consumer_cfg(&broker.addr));

    let msg = tokio::time::timeout(Duration::from_secs(5), consumer.receive())
        .await
        .expect("receive")?;
    assert_eq!(msg.payload.as_ref(), b"m0");
    consumer.ack(&msg).await?;
    broker.expect(CommandType::Ack).await;
    consumer.close().await?;
    Ok(())
}

#[tokio::test]
async fn managed_consumer_survives_connection_loss() -> Result<()> {
    let broker = spawn(full_responder()).await?;
    let pool = ClientPool::new();
    let consumer = ManagedConsumer::new(pool, consumer_cfg(&broker.addr));

    let first = tokio::time::timeout(Duration::from_secs(5), consumer.receive())
        .await
        .expect("first receive")?;
    assert_eq!(first.payload.as_ref(), b"m0");

    broker.drop_conn.send(())?;

    // keep calling the same handle until the replacement consumer delivers
    let recovered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match consumer.receive().await {
                Ok(msg) => return msg,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("receive after reconnect");
    assert!(!recovered.payload.is_empty());
    assert!(broker.connections.load(Ordering::SeqCst) >= 2);
    Ok(())
}

#[tokio::test]
async fn pool_follows_lookup_redirects_with_authoritative_bit() -> Result<()> {
    // owner broker answers lookups with itself
    let mut owner = spawn(full_responder()).await?;
    let owner_addr = owner.addr.clone();

    // frontline broker redirects every lookup to the owner
    let frontline = spawn(Box::new(move |frame: &Frame| {
        if let Some(replies) = session_basics(frame) {
            return Some(replies);
        }
        match frame.command.command_type() {
            Some(CommandType::Lookup) => Some(vec![lookup_redirect(
                request_id_of(frame).expect("request id"),
                &owner_addr,
                true,
            )]),
            _ => None,
        }
    }))
    .await?;

    let pool = ClientPool::new();
    let cfg = ClientConfig::new(&frontline.addr);
    let client = pool.for_topic(&cfg, TOPIC).await?;
    assert!(!client.is_closed());
    assert_eq!(frontline.connections.load(Ordering::SeqCst), 1);
    assert_eq!(owner.connections.load(Ordering::SeqCst), 1);

    // the redirected lookup carried the authoritative bit forward
    let lookup = owner.expect(CommandType::Lookup).await;
    assert_eq!(
        lookup
            .command
            .lookup_topic
            .as_ref()
            .and_then(|l| l.authoritative),
        Some(true)
    );
    Ok(())
}

#[tokio::test]
async fn redirect_cycles_are_bounded() -> Result<()> {
    // two brokers redirecting lookups at each other forever
    let second_addr = std::sync::Arc::new(std::sync::OnceLock::new());
    let first = spawn(Box::new({
        let second_addr = std::sync::Arc::clone(&second_addr);
        move |frame: &Frame| {
            if let Some(replies) = session_basics(frame) {
                return Some(replies);
            }
            match frame.command.command_type() {
                Some(CommandType::Lookup) => Some(vec![lookup_redirect(
                    request_id_of(frame).expect("request id"),
                    second_addr.get().map(String::as_str).unwrap_or_default(),
                    false,
                )]),
                _ => None,
            }
        }
    }))
    .await?;
    let first_addr = first.addr.clone();
    let second = spawn(Box::new(move |frame: &Frame| {
        if let Some(replies) = session_basics(frame) {
            return Some(replies);
        }
        match frame.command.command_type() {
            Some(CommandType::Lookup) => Some(vec![lookup_redirect(
                request_id_of(frame).expect("request id"),
                &first_addr,
                false,
            )]),
            _ => None,
        }
    }))
    .await?;
    second_addr
        .set(second.addr.clone())
        .expect("set second addr");

    let pool = ClientPool::new();
    let cfg = ClientConfig::new(&first.addr);
    let err = pool.for_topic(&cfg, TOPIC).await.expect_err("must not loop");
    assert!(matches!(err, ClientError::LookupRedirectLoop(_)));
    // the pool kept one client per broker while chasing the cycle
    assert_eq!(first.connections.load(Ordering::SeqCst), 1);
    assert_eq!(second.connections.load(Ordering::SeqCst), 1);
    Ok(())
}
