// Consumer with transparent reconnection.
//
// The delivery queue and the overflow set are created once, here, and
// handed to every consumer incarnation; a reconnect therefore cannot lose
// buffered messages or redelivery debt.
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::config::ConsumerConfig;
use crate::consumer::{Consumer, Message, MessageId, OverflowSet};
use crate::errors::{AsyncErrors, ClientError, Result};
use crate::managed::pool::ClientPool;
use crate::managed::{EntityCell, reconnect_with_backoff};
use crate::signal::CloseBroadcast;

/// Stable consumer handle. A background task resubscribes whenever the
/// underlying consumer or its connection closes, or the broker reports the
/// end of the topic.
pub struct ManagedConsumer {
    inner: Arc<Inner>,
    queue: Mutex<mpsc::Receiver<Message>>,
    overflow_signal: Mutex<mpsc::UnboundedReceiver<()>>,
}

struct Inner {
    pool: Arc<ClientPool>,
    cfg: ConsumerConfig,
    cell: EntityCell<Consumer>,
    errs: AsyncErrors,
    stop: CloseBroadcast,
    queue_tx: mpsc::Sender<Message>,
    overflow: Arc<OverflowSet>,
}

impl ManagedConsumer {
    pub fn new(pool: Arc<ClientPool>, cfg: ConsumerConfig) -> ManagedConsumer {
        let cfg = cfg.with_defaults();
        let errs = AsyncErrors::new(cfg.client.errs.clone());
        let (queue_tx, queue_rx) = mpsc::channel(cfg.queue_size);
        let (overflow, overflow_rx) = OverflowSet::channel();
        let inner = Arc::new(Inner {
            pool,
            cfg,
            cell: EntityCell::new(),
            errs,
            stop: CloseBroadcast::new(),
            queue_tx,
            overflow,
        });
        tokio::spawn(manage(Arc::clone(&inner)));
        ManagedConsumer {
            inner,
            queue: Mutex::new(queue_rx),
            overflow_signal: Mutex::new(overflow_rx),
        }
    }

    /// Receive one message. Grants a single flow permit up front, so the
    /// broker keeps exactly pace with consumption.
    pub async fn receive(&self) -> Result<Message> {
        let consumer = self.acquire().await?;
        consumer.flow(1).await?;

        let mut queue = self.queue.lock().await;
        let mut overflow = self.overflow_signal.lock().await;
        let mut closed = consumer.closed_signal();
        let mut conn_closed = consumer.conn_closed_signal();
        tokio::select! {
            msg = queue.recv() => msg.ok_or(ClientError::ConsumerClosed),
            Some(()) = overflow.recv() => Err(ClientError::ConsumerOverflow),
            _ = closed.wait() => Err(ClientError::ConsumerClosed),
            _ = conn_closed.wait() => Err(ClientError::ConnectionClosed),
        }
    }

    /// Pump messages into `out` until closed, managing flow control with a
    /// half-queue high watermark: request `queue_size / 2` permits, then
    /// top up whenever that many have been consumed. Reconnect-level
    /// failures go to the async error channel and pumping resumes with the
    /// replacement consumer.
    pub async fn receive_async(&self, out: mpsc::Sender<Message>) -> Result<()> {
        let highwater = (self.inner.cfg.queue_size as u32 / 2).max(1);
        'consumer: loop {
            // flush whatever the previous incarnation left behind
            {
                let mut queue = self.queue.lock().await;
                while let Ok(msg) = queue.try_recv() {
                    if out.send(msg).await.is_err() {
                        return Err(ClientError::Cancelled);
                    }
                }
            }

            let consumer = self.acquire().await?;
            if let Err(err) = consumer.flow(highwater).await {
                self.inner.errs.send(err);
                continue 'consumer;
            }
            let mut received_since_flow = 0u32;

            let mut queue = self.queue.lock().await;
            let mut overflow = self.overflow_signal.lock().await;
            let mut closed = consumer.closed_signal();
            let mut conn_closed = consumer.conn_closed_signal();
            let mut stop = self.inner.stop.subscribe();
            loop {
                tokio::select! {
                    _ = stop.wait() => return Ok(()),
                    msg = queue.recv() => {
                        let Some(msg) = msg else {
                            return Err(ClientError::ConsumerClosed);
                        };
                        if out.send(msg).await.is_err() {
                            return Err(ClientError::Cancelled);
                        }
                        received_since_flow += 1;
                        if received_since_flow >= highwater {
                            if let Err(err) = consumer.flow(received_since_flow).await {
                                self.inner.errs.send(err);
                                continue 'consumer;
                            }
                            received_since_flow = 0;
                        }
                    }
                    Some(()) = overflow.recv() => {
                        // a dropped message consumed a permit too
                        received_since_flow += 1;
                    }
                    _ = closed.wait() => {
                        self.inner.errs.send(ClientError::ConsumerClosed);
                        continue 'consumer;
                    }
                    _ = conn_closed.wait() => {
                        self.inner.errs.send(ClientError::ConnectionClosed);
                        continue 'consumer;
                    }
                }
            }
        }
    }

    /// Acknowledge one message.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.acquire().await?.ack(message.message_id).await
    }

    /// Acknowledge everything up to and including `message_id`.
    pub async fn ack_cumulative(&self, message_id: MessageId) -> Result<()> {
        self.acquire().await?.ack_cumulative(message_id).await
    }

    /// Ask the broker to resend all unacknowledged messages.
    pub async fn redeliver_unacknowledged(&self) -> Result<()> {
        self.acquire().await?.redeliver_unacknowledged().await
    }

    /// Ask the broker to resend messages dropped on queue overflow.
    /// Returns the number of ids requested.
    pub async fn redeliver_overflow(&self) -> Result<usize> {
        self.acquire().await?.redeliver_overflow().await
    }

    /// True while a failover subscription holds this consumer in standby,
    /// or while no consumer is connected at all.
    pub fn is_inactive(&self) -> bool {
        match self.inner.cell.get() {
            Some(consumer) => consumer.is_inactive(),
            None => true,
        }
    }

    /// The current underlying consumer, if one is connected right now.
    pub fn consumer(&self) -> Option<Arc<Consumer>> {
        self.inner.cell.get()
    }

    /// Remove the subscription from the topic and stop the reconnect
    /// loop (a reconnect would silently recreate the subscription).
    pub async fn unsubscribe(&self) -> Result<()> {
        let consumer = self.acquire().await?;
        self.inner.stop.fire();
        consumer.unsubscribe().await
    }

    /// Stop the reconnect loop and close the current consumer.
    pub async fn close(&self) -> Result<()> {
        self.inner.stop.fire();
        match self.inner.cell.get() {
            Some(consumer) => consumer.close().await,
            None => Ok(()),
        }
    }

    async fn acquire(&self) -> Result<Arc<Consumer>> {
        if self.inner.stop.is_fired() {
            return Err(ClientError::ConsumerClosed);
        }
        let mut stop = self.inner.stop.subscribe();
        tokio::select! {
            _ = stop.wait() => Err(ClientError::ConsumerClosed),
            entity = self.inner.cell.wait() => entity.ok_or(ClientError::ConsumerClosed),
        }
    }
}

async fn manage(inner: Arc<Inner>) {
    let mut stop = inner.stop.subscribe();
    let mut reconnecting = false;
    loop {
        if reconnecting {
            debug!(topic = %inner.cfg.topic, "reconnecting consumer");
            metrics::counter!("pulsar_client_consumer_reconnects_total").increment(1);
        }
        let created = reconnect_with_backoff(
            inner.cfg.initial_reconnect_delay,
            inner.cfg.max_reconnect_delay,
            inner.cfg.new_consumer_timeout,
            &inner.errs,
            &mut stop,
            || create_consumer(&inner),
        )
        .await;
        let Some(consumer) = created else {
            return;
        };
        inner.cell.set(Arc::clone(&consumer));
        reconnecting = true;

        let mut closed = consumer.closed_signal();
        let mut conn_closed = consumer.conn_closed_signal();
        let mut end_of_topic = consumer.end_of_topic_signal();
        tokio::select! {
            _ = stop.wait() => return,
            _ = closed.wait() => {}
            _ = conn_closed.wait() => {}
            // the broker will keep reporting it; reconnect like the other
            // terminal signals
            _ = end_of_topic.wait() => {}
        }
        inner.cell.unset();
    }
}

async fn create_consumer(inner: &Arc<Inner>) -> Result<Arc<Consumer>> {
    let client = inner
        .pool
        .for_topic(&inner.cfg.client, &inner.cfg.topic)
        .await?;
    client
        .subscribe(
            &inner.cfg.topic,
            &inner.cfg.subscription,
            inner.cfg.mode,
            inner.cfg.earliest,
            inner.queue_tx.clone(),
            Arc::clone(&inner.overflow),
        )
        .await
}
