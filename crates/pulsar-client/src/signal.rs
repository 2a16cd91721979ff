// Sticky one-shot close signals.
//
// A `CloseBroadcast` flips from open to closed exactly once; every
// `CloseSignal` observer unblocks, including ones subscribed after the
// fact. Backed by a watch channel so late subscribers see the final state.
use tokio::sync::watch;

pub(crate) struct CloseBroadcast {
    tx: watch::Sender<bool>,
}

impl Default for CloseBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseBroadcast {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Flip to closed. Returns true the first time, false after.
    pub(crate) fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> CloseSignal {
        CloseSignal(self.tx.subscribe())
    }
}

/// Awaitable view of a `CloseBroadcast`.
#[derive(Clone)]
pub struct CloseSignal(watch::Receiver<bool>);

impl CloseSignal {
    /// Resolves once the signal has fired. Returns immediately if it
    /// already has.
    pub async fn wait(&mut self) {
        // A dropped sender means the owner is gone, which counts as closed.
        let _ = self.0.wait_for(|fired| *fired).await;
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }
}
