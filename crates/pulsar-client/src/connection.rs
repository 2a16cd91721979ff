// One duplex broker connection.
//
// The connection owns the socket. Writes come from any task and are
// serialised by a mutex; each frame is encoded into a pooled buffer and
// written with a single write_all, so concurrent senders can never
// interleave frame bytes. Reads happen in exactly one task via `run`,
// which decodes frames off the socket and hands them to the router
// sequentially. Close is sticky and observable through `closed_signal`.
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use pulsar_wire::proto::BaseCommand;
use pulsar_wire::{Frame, MessageMetadata, WireError};

use crate::errors::{ClientError, Result};
use crate::pool::pool_for;
use crate::signal::{CloseBroadcast, CloseSignal};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Capability to submit frames on a connection. Producers and consumers
/// depend on this rather than on the concrete connection, which keeps
/// them testable against an in-memory sender.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_simple(&self, cmd: BaseCommand) -> Result<()>;
    async fn send_payload(
        &self,
        cmd: BaseCommand,
        metadata: MessageMetadata,
        payload: Bytes,
    ) -> Result<()>;
    /// Fires when the underlying connection is no longer usable.
    fn closed_signal(&self) -> CloseSignal;
}

pub struct Connection {
    writer: Mutex<BoxedWriter>,
    /// Taken exactly once by `run`.
    reader: StdMutex<Option<BoxedReader>>,
    closed: CloseBroadcast,
    epoch: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
}

/// Strip the `pulsar://` / `pulsar+ssl://` scheme prefix from a broker
/// address, leaving `host:port`.
pub(crate) fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("pulsar+ssl://")
        .or_else(|| addr.strip_prefix("pulsar://"))
        .unwrap_or(addr)
}

impl Connection {
    /// Dial a broker over plain TCP.
    pub async fn dial_tcp(addr: &str, timeout: Duration) -> Result<Connection> {
        let target = strip_scheme(addr);
        let stream = dial_stream(target, timeout).await?;
        let (reader, writer) = stream.into_split();
        debug!(addr = target, "connection established");
        Ok(Self::from_parts(Box::new(reader), Box::new(writer)))
    }

    /// Dial a broker over TCP + TLS. The server name for certificate
    /// verification is the host portion of the address.
    pub async fn dial_tls(
        addr: &str,
        tls_config: Arc<rustls::ClientConfig>,
        timeout: Duration,
    ) -> Result<Connection> {
        let target = strip_scheme(addr);
        let host = target.split(':').next().unwrap_or(target);
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| ClientError::ConnectFailed(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let stream = dial_stream(target, timeout).await?;
        let tls = TlsConnector::from(tls_config)
            .connect(server_name, stream)
            .await
            .map_err(ClientError::ConnectFailed)?;
        let (reader, writer) = tokio::io::split(tls);
        debug!(addr = target, "tls connection established");
        Ok(Self::from_parts(Box::new(reader), Box::new(writer)))
    }

    pub(crate) fn from_parts(reader: BoxedReader, writer: BoxedWriter) -> Connection {
        Connection {
            writer: Mutex::new(writer),
            reader: StdMutex::new(Some(reader)),
            closed: CloseBroadcast::new(),
            epoch: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
        }
    }

    /// Read frames until the connection fails or is closed, handing each
    /// one to `handler` from this task. The error describes why the
    /// connection died; afterwards the connection is terminal.
    pub async fn run(&self, mut handler: impl AsyncFnMut(Frame)) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        let mut close = self.closed.subscribe();
        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            loop {
                match Frame::decode(&mut buf) {
                    Ok(Some(frame)) => {
                        self.mark_received();
                        trace!(kind = ?frame.command.command_type(), "frame received");
                        handler(frame).await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        self.close().await;
                        return Err(ClientError::Wire(err));
                    }
                }
            }
            tokio::select! {
                _ = close.wait() => return Err(ClientError::ConnectionClosed),
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        self.close().await;
                        return Err(if buf.is_empty() {
                            ClientError::ConnectionClosed
                        } else {
                            // the peer hung up inside a frame
                            ClientError::Wire(WireError::Truncated)
                        });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "connection read failed");
                        self.close().await;
                        return Err(ClientError::ConnectionClosed);
                    }
                },
            }
        }
    }

    /// Idempotent. Fires the close signal and shuts the socket down,
    /// which also unblocks the reader task.
    pub async fn close(&self) {
        if !self.closed.fire() {
            return;
        }
        debug!("connection closed");
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    pub(crate) fn since_last_sent(&self) -> Duration {
        self.since(&self.last_sent_ms)
    }

    pub(crate) fn since_last_received(&self) -> Duration {
        self.since(&self.last_received_ms)
    }

    fn since(&self, mark: &AtomicU64) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(mark.load(Ordering::Relaxed)))
    }

    fn mark_sent(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_sent_ms.store(now, Ordering::Relaxed);
    }

    fn mark_received(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_received_ms.store(now, Ordering::Relaxed);
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        if self.closed.is_fired() {
            return Err(ClientError::ConnectionClosed);
        }
        let pool = pool_for(frame.command.command_type());
        let mut buf = pool.acquire().await;
        frame.encode_into(&mut buf)?;
        trace!(kind = ?frame.command.command_type(), "frame sent");

        let mut writer = self.writer.lock().await;
        if self.closed.is_fired() {
            return Err(ClientError::ConnectionClosed);
        }
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        drop(writer);
        match result {
            Ok(()) => {
                self.mark_sent();
                Ok(())
            }
            Err(err) => {
                // write failures are fatal for the connection
                self.close().await;
                Err(ClientError::WriteFailed(err))
            }
        }
    }
}

#[async_trait]
impl CommandSender for Connection {
    async fn send_simple(&self, cmd: BaseCommand) -> Result<()> {
        self.write_frame(Frame::simple(cmd)).await
    }

    async fn send_payload(
        &self,
        cmd: BaseCommand,
        metadata: MessageMetadata,
        payload: Bytes,
    ) -> Result<()> {
        self.write_frame(Frame::with_payload(cmd, metadata, payload))
            .await
    }

    fn closed_signal(&self) -> CloseSignal {
        self.closed.subscribe()
    }
}

async fn dial_stream(target: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| {
            ClientError::ConnectFailed(io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))
        })?
        .map_err(ClientError::ConnectFailed)?;
    stream.set_nodelay(true).map_err(ClientError::ConnectFailed)?;
    Ok(stream)
}
