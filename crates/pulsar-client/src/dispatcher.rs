// Response dispatcher.
//
// Correlates inbound frames with the caller awaiting them across three
// disjoint key spaces: the single CONNECT handshake slot, request-id
// correlated control commands, and (producer-id, sequence-id) correlated
// sends. A key is held by exactly one registration at a time; the
// registration is released either by delivery or by dropping its permit,
// so a caller that gives up (timeout, cancelled future) frees the slot on
// the way out.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

use pulsar_wire::Frame;

use crate::errors::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    /// CONNECT → CONNECTED/ERROR. Only one may be outstanding.
    Global,
    RequestId(u64),
    ProdSeq { producer_id: u64, sequence_id: u64 },
}

struct Slot {
    tx: oneshot::Sender<Frame>,
    /// Distinguishes this registration from a later one under the same key,
    /// so a stale permit cannot cancel its successor.
    token: u64,
}

type SlotMap = Arc<Mutex<HashMap<Key, Slot>>>;

#[derive(Default)]
pub struct Dispatcher {
    slots: SlotMap,
    tokens: AtomicU64,
}

/// Releases the registration on drop unless the frame was delivered first.
pub struct Permit {
    slots: SlotMap,
    key: Key,
    token: u64,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&self.key).is_some_and(|s| s.token == self.token) {
            slots.remove(&self.key);
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global(&self) -> Result<(oneshot::Receiver<Frame>, Permit)> {
        self.register(Key::Global)
    }

    pub fn register_request_id(&self, request_id: u64) -> Result<(oneshot::Receiver<Frame>, Permit)> {
        self.register(Key::RequestId(request_id))
    }

    pub fn register_prod_seq(
        &self,
        producer_id: u64,
        sequence_id: u64,
    ) -> Result<(oneshot::Receiver<Frame>, Permit)> {
        self.register(Key::ProdSeq {
            producer_id,
            sequence_id,
        })
    }

    pub fn notify_global(&self, frame: Frame) -> Result<()> {
        self.notify(Key::Global, frame)
    }

    pub fn notify_request_id(&self, request_id: u64, frame: Frame) -> Result<()> {
        self.notify(Key::RequestId(request_id), frame)
    }

    pub fn notify_prod_seq(&self, producer_id: u64, sequence_id: u64, frame: Frame) -> Result<()> {
        self.notify(
            Key::ProdSeq {
                producer_id,
                sequence_id,
            },
            frame,
        )
    }

    /// Drop every outstanding registration. Receivers observe a closed
    /// channel, which callers surface as `ConnectionClosed`.
    pub fn drain(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn register(&self, key: Key) -> Result<(oneshot::Receiver<Frame>, Permit)> {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(&key) {
            return Err(ClientError::AlreadyRegistered);
        }
        slots.insert(key, Slot { tx, token });
        drop(slots);
        Ok((
            rx,
            Permit {
                slots: Arc::clone(&self.slots),
                key,
                token,
            },
        ))
    }

    fn notify(&self, key: Key, frame: Frame) -> Result<()> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        match slot {
            // A send error means the caller already gave up; the frame is
            // dropped, which is the documented late-response behaviour.
            Some(slot) => {
                let _ = slot.tx.send(frame);
                Ok(())
            }
            None => Err(ClientError::NoHandler),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsar_wire::proto::{BaseCommand, CommandPing, CommandType};

    fn ping_frame() -> Frame {
        let mut cmd = BaseCommand::of(CommandType::Ping);
        cmd.ping = Some(CommandPing {});
        Frame::simple(cmd)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dispatcher = Dispatcher::new();
        let (_rx, _permit) = dispatcher.register_request_id(7).expect("register");
        assert!(matches!(
            dispatcher.register_request_id(7),
            Err(ClientError::AlreadyRegistered)
        ));
        // other key spaces are unaffected
        let (_g, _gp) = dispatcher.register_global().expect("global");
        let (_p, _pp) = dispatcher.register_prod_seq(7, 7).expect("prod-seq");
    }

    #[test]
    fn cancel_frees_the_key() {
        let dispatcher = Dispatcher::new();
        let (_rx, permit) = dispatcher.register_request_id(7).expect("register");
        drop(permit);
        let (_rx, _permit) = dispatcher.register_request_id(7).expect("re-register");
    }

    #[tokio::test]
    async fn notify_delivers_exactly_the_registered_frame() {
        let dispatcher = Dispatcher::new();
        let (rx, _permit) = dispatcher.register_prod_seq(123, 0).expect("register");
        dispatcher
            .notify_prod_seq(123, 0, ping_frame())
            .expect("notify");
        let frame = rx.await.expect("deliver");
        assert_eq!(frame.command.command_type(), Some(CommandType::Ping));
        // the slot is consumed
        assert!(matches!(
            dispatcher.notify_prod_seq(123, 0, ping_frame()),
            Err(ClientError::NoHandler)
        ));
    }

    #[test]
    fn notify_without_registration_is_no_handler() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.notify_request_id(99, ping_frame()),
            Err(ClientError::NoHandler)
        ));
        assert!(matches!(
            dispatcher.notify_global(ping_frame()),
            Err(ClientError::NoHandler)
        ));
    }

    #[test]
    fn stale_permit_does_not_cancel_a_successor() {
        let dispatcher = Dispatcher::new();
        let (_rx1, permit1) = dispatcher.register_request_id(7).expect("register");
        dispatcher
            .notify_request_id(7, ping_frame())
            .expect("notify");
        let (_rx2, _permit2) = dispatcher.register_request_id(7).expect("re-register");
        drop(permit1);
        // the second registration must still be live
        dispatcher
            .notify_request_id(7, ping_frame())
            .expect("second notify");
    }

    #[tokio::test]
    async fn drain_closes_outstanding_receivers() {
        let dispatcher = Dispatcher::new();
        let (rx, _permit) = dispatcher.register_request_id(1).expect("register");
        dispatcher.drain();
        assert!(rx.await.is_err());
    }
}
