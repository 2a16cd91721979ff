// Client-facing error taxonomy.
use pulsar_wire::WireError;
use pulsar_wire::proto::{CommandType, ServerError};
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    // Transport
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    // Protocol. Carries FrameTooLarge, ChecksumMismatch and Truncated.
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("unexpected {received:?} response while {context}")]
    UnexpectedResponse {
        received: Option<CommandType>,
        context: &'static str,
    },

    // Handshake and lookup
    #[error("connect rejected: {kind:?}: {message}")]
    ConnectRejected { kind: ServerError, message: String },
    #[error("lookup failed: {kind:?}: {message}")]
    LookupFailed { kind: ServerError, message: String },
    #[error("lookup redirect chain exceeded {0} hops")]
    LookupRedirectLoop(usize),

    // Producer
    #[error("producer is closed")]
    ClosedProducer,
    #[error("send rejected: {kind:?}: {message}")]
    SendRejected { kind: ServerError, message: String },

    // Consumer
    #[error("subscribe rejected: {kind:?}: {message}")]
    SubscribeRejected { kind: ServerError, message: String },
    #[error("consumer overflow: delivery queue was full")]
    ConsumerOverflow,
    #[error("consumer is closed")]
    ConsumerClosed,
    #[error("invalid subscription mode")]
    InvalidSubscriptionMode,
    #[error("payload decompression failed: {0}")]
    Decompress(String),

    // Broker ERROR replies to control commands other than the dedicated
    // connect/send/subscribe cycles (close, unsubscribe, seek, metadata).
    #[error("{context} rejected: {kind:?}: {message}")]
    Rejected {
        context: &'static str,
        kind: ServerError,
        message: String,
    },

    // Dispatcher
    #[error("response key already registered")]
    AlreadyRegistered,
    #[error("no handler registered for frame")]
    NoHandler,

    // Cancellation
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Decode a broker error code, defaulting to `UnknownError` for values
/// outside the known vocabulary.
pub(crate) fn server_error(raw: Option<i32>) -> ServerError {
    raw.and_then(|value| ServerError::try_from(value).ok())
        .unwrap_or(ServerError::UnknownError)
}

/// Fan-in handle for errors the managed layer observes while reconnecting.
/// When no channel is configured, errors are logged and dropped.
#[derive(Clone, Default)]
pub struct AsyncErrors(Option<mpsc::UnboundedSender<ClientError>>);

impl AsyncErrors {
    pub fn new(tx: Option<mpsc::UnboundedSender<ClientError>>) -> Self {
        Self(tx)
    }

    pub fn send(&self, err: ClientError) {
        match &self.0 {
            Some(tx) => {
                if tx.send(err).is_err() {
                    tracing::warn!("async error receiver dropped");
                }
            }
            None => tracing::warn!(error = %err, "async error (no channel configured)"),
        }
    }
}
