// Producer with transparent reconnection.
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use pulsar_wire::proto::CommandSendReceipt;

use crate::config::ProducerConfig;
use crate::errors::{AsyncErrors, ClientError, Result};
use crate::managed::pool::ClientPool;
use crate::managed::{EntityCell, reconnect_with_backoff};
use crate::producer::Producer;
use crate::signal::CloseBroadcast;

/// Stable producer handle. A background task recreates the underlying
/// producer whenever it or its connection closes; callers keep using the
/// same handle throughout.
pub struct ManagedProducer {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Arc<ClientPool>,
    cfg: ProducerConfig,
    cell: EntityCell<Producer>,
    errs: AsyncErrors,
    stop: CloseBroadcast,
}

impl ManagedProducer {
    pub fn new(pool: Arc<ClientPool>, cfg: ProducerConfig) -> ManagedProducer {
        let cfg = cfg.with_defaults();
        let errs = AsyncErrors::new(cfg.client.errs.clone());
        let inner = Arc::new(Inner {
            pool,
            cfg,
            cell: EntityCell::new(),
            errs,
            stop: CloseBroadcast::new(),
        });
        tokio::spawn(manage(Arc::clone(&inner)));
        ManagedProducer { inner }
    }

    /// Publish one message through the current producer. Waits for a
    /// producer to exist first; if the send races a close, the error is
    /// surfaced and a retry on this same handle will use the replacement.
    pub async fn send(&self, payload: Bytes) -> Result<CommandSendReceipt> {
        let producer = self.acquire().await?;
        producer.send(payload).await
    }

    /// The current underlying producer, if one is connected right now.
    pub fn producer(&self) -> Option<Arc<Producer>> {
        self.inner.cell.get()
    }

    /// Stop the reconnect loop and close the current producer.
    pub async fn close(&self) -> Result<()> {
        self.inner.stop.fire();
        match self.inner.cell.get() {
            Some(producer) => producer.close().await,
            None => Ok(()),
        }
    }

    async fn acquire(&self) -> Result<Arc<Producer>> {
        if self.inner.stop.is_fired() {
            return Err(ClientError::ClosedProducer);
        }
        let mut stop = self.inner.stop.subscribe();
        tokio::select! {
            _ = stop.wait() => Err(ClientError::ClosedProducer),
            entity = self.inner.cell.wait() => entity.ok_or(ClientError::ClosedProducer),
        }
    }
}

async fn manage(inner: Arc<Inner>) {
    let mut stop = inner.stop.subscribe();
    let mut reconnecting = false;
    loop {
        if reconnecting {
            debug!(topic = %inner.cfg.topic, "reconnecting producer");
            metrics::counter!("pulsar_client_producer_reconnects_total").increment(1);
        }
        let created = reconnect_with_backoff(
            inner.cfg.initial_reconnect_delay,
            inner.cfg.max_reconnect_delay,
            inner.cfg.new_producer_timeout,
            &inner.errs,
            &mut stop,
            || create_producer(&inner),
        )
        .await;
        let Some(producer) = created else {
            return;
        };
        inner.cell.set(Arc::clone(&producer));
        reconnecting = true;

        let mut closed = producer.closed_signal();
        let mut conn_closed = producer.conn_closed_signal();
        tokio::select! {
            _ = stop.wait() => return,
            _ = closed.wait() => {}
            _ = conn_closed.wait() => {}
        }
        inner.cell.unset();
    }
}

async fn create_producer(inner: &Arc<Inner>) -> Result<Arc<Producer>> {
    let client = inner
        .pool
        .for_topic(&inner.cfg.client, &inner.cfg.topic)
        .await?;
    client
        .new_producer(&inner.cfg.topic, inner.cfg.name.clone())
        .await
}
