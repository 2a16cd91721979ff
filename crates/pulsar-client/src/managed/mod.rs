// Managed entity supervision.
//
// A managed producer or consumer is a stable user-facing handle over an
// entity that gets torn down and recreated as connections churn. The
// entity lives in a single-slot cell: operations take the current value or
// wait for the next one; the manage task unsets the slot when a close
// signal fires and refills it after reconnecting with exponential backoff.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::errors::{AsyncErrors, ClientError, Result};
use crate::signal::CloseSignal;

mod consumer;
mod pool;
mod producer;

pub use consumer::ManagedConsumer;
pub use pool::ClientPool;
pub use producer::ManagedProducer;

/// Single-slot cell holding the currently usable entity, if any. Waiters
/// park on the watch channel until the manage task fills the slot.
pub(crate) struct EntityCell<T> {
    tx: watch::Sender<Option<Arc<T>>>,
}

impl<T> EntityCell<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn set(&self, value: Arc<T>) {
        self.tx.send_replace(Some(value));
    }

    pub(crate) fn unset(&self) {
        self.tx.send_replace(None);
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.tx.borrow().clone()
    }

    /// Current entity, waiting for the slot to be filled if empty.
    pub(crate) async fn wait(&self) -> Option<Arc<T>> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }
}

/// Doubling delay, capped.
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Run `create` until it yields an entity, sleeping with exponential
/// backoff between attempts and bounding each attempt by `attempt_timeout`.
/// The first attempt runs immediately. Failures go to the async error
/// channel. Returns `None` if `stop` fires first.
pub(crate) async fn reconnect_with_backoff<T, F, Fut>(
    initial: Duration,
    max: Duration,
    attempt_timeout: Duration,
    errs: &AsyncErrors,
    stop: &mut CloseSignal,
    mut create: F,
) -> Option<Arc<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Arc<T>>>,
{
    let mut backoff = Backoff::new(initial, max);
    let mut first = true;
    loop {
        if !first {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = stop.wait() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        first = false;
        tokio::select! {
            _ = stop.wait() => return None,
            attempt = tokio::time::timeout(attempt_timeout, create()) => match attempt {
                Ok(Ok(entity)) => return Some(entity),
                Ok(Err(err)) => errs.send(err),
                Err(_) => errs.send(ClientError::DeadlineExceeded),
            },
        }
    }
}
