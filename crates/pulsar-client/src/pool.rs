// Process-wide encode buffer pools.
//
// Frames are encoded into pooled buffers before the socket write so that a
// burst of senders cannot allocate without bound: the pool hands out at
// most `limit` buffers and additional senders wait FIFO on the semaphore.
// Two classes exist — a small one for latency-sensitive control frames and
// a large growable one for everything else.
use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::sync::{Semaphore, SemaphorePermit};

use pulsar_wire::CommandType;

pub(crate) const SMALL_BUF_SIZE: usize = 500;
pub(crate) const SMALL_BUF_LIMIT: usize = 1000;
pub(crate) const LARGE_BUF_SIZE: usize = 5 * 1024;
pub(crate) const LARGE_BUF_LIMIT: usize = 50;

pub(crate) struct BufferPool {
    permits: Semaphore,
    free: Mutex<Vec<BytesMut>>,
    buf_size: usize,
}

impl BufferPool {
    pub(crate) fn new(limit: usize, buf_size: usize) -> Self {
        Self {
            permits: Semaphore::new(limit),
            free: Mutex::new(Vec::with_capacity(limit)),
            buf_size,
        }
    }

    /// Take a cleared buffer, waiting while the pool is saturated.
    pub(crate) async fn acquire(&self) -> PooledBuf<'_> {
        let permit = self
            .permits
            .acquire()
            .await
            .expect("buffer pool semaphore closed");
        let buf = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_size));
        PooledBuf {
            pool: self,
            buf: Some(buf),
            _permit: permit,
        }
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }
}

/// Buffer checked out of a pool; returns itself (and its permit) on drop.
pub(crate) struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<BytesMut>,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledBuf<'_> {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Control frames that stay tiny and latency-sensitive; they draw from the
/// small pool so a burst of large sends cannot starve them.
fn is_small_command(kind: Option<CommandType>) -> bool {
    matches!(
        kind,
        Some(
            CommandType::Ping
                | CommandType::Pong
                | CommandType::Ack
                | CommandType::Connect
                | CommandType::Flow
                | CommandType::Subscribe
                | CommandType::Lookup
        )
    )
}

/// Pool serving the command type: small for control frames, large for the
/// rest. Pools are process-wide.
pub(crate) fn pool_for(kind: Option<CommandType>) -> &'static BufferPool {
    static SMALL: OnceLock<BufferPool> = OnceLock::new();
    static LARGE: OnceLock<BufferPool> = OnceLock::new();
    if is_small_command(kind) {
        SMALL.get_or_init(|| BufferPool::new(SMALL_BUF_LIMIT, SMALL_BUF_SIZE))
    } else {
        LARGE.get_or_init(|| BufferPool::new(LARGE_BUF_LIMIT, LARGE_BUF_SIZE))
    }
}
