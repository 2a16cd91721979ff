// In-memory sender for unit tests: records frames instead of writing them.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

use pulsar_wire::proto::BaseCommand;
use pulsar_wire::{Frame, MessageMetadata};

use crate::connection::CommandSender;
use crate::errors::Result;
use crate::signal::{CloseBroadcast, CloseSignal};

#[derive(Default)]
pub(crate) struct MockSender {
    frames: Mutex<Vec<Frame>>,
    closed: CloseBroadcast,
    notify: Notify,
}

impl MockSender {
    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `n` frames have been submitted. Lets tests
    /// synchronise on "the command is on the wire" without sleeping.
    pub(crate) async fn wait_for_frames(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if self.frames().len() >= n {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed.fire();
    }

    fn push(&self, frame: Frame) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl CommandSender for MockSender {
    async fn send_simple(&self, cmd: BaseCommand) -> Result<()> {
        self.push(Frame::simple(cmd));
        Ok(())
    }

    async fn send_payload(
        &self,
        cmd: BaseCommand,
        metadata: MessageMetadata,
        payload: Bytes,
    ) -> Result<()> {
        self.push(Frame::with_payload(cmd, metadata, payload));
        Ok(())
    }

    fn closed_signal(&self) -> CloseSignal {
        self.closed.subscribe()
    }
}
