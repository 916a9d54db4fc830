use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;

use crate::errors::TransportError;

/// Why a connection's read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    ClientClosed(Option<String>),
    Transport(String),
    Superseded,
    IdleTimeout,
    Shutdown,
}

impl CloseCause {
    pub fn reason(&self) -> &str {
        match self {
            CloseCause::ClientClosed(_) => "client closed",
            CloseCause::Transport(_) => "transport error",
            CloseCause::Superseded => "superseded",
            CloseCause::IdleTimeout => "idle timeout",
            CloseCause::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::ClientClosed(Some(detail)) | CloseCause::Transport(detail) => {
                write!(f, "{}: {}", self.reason(), detail)
            }
            _ => f.write_str(self.reason()),
        }
    }
}

/// Upper bound on how long a connection teardown waits for the sink to close.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outbound half of a tenant connection.
///
/// `send_text` resolves only once the frame was handed to the transport, so a
/// failed write is observable by the caller that issued it. `post_text` is for
/// housekeeping frames: it queues without waiting and fails with
/// `Backpressure` when the peer is not draining.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    fn post_text(&self, text: String) -> Result<(), TransportError>;
    async fn send_ping(&self) -> Result<(), TransportError>;
    async fn close(&self, cause: &CloseCause);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close(String),
}

/// In-process sink, used for embedding the bridge without sockets and in tests.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    reject_sends: AtomicBool,
}

impl MemorySink {
    pub fn pair() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded();
        (
            std::sync::Arc::new(Self {
                tx,
                reject_sends: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Makes every subsequent text send fail as if the socket write errored.
    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    fn push(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.tx
            .unbounded_send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.post_text(text)
    }

    fn post_text(&self, text: String) -> Result<(), TransportError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Write("memory sink rejecting sends".into()));
        }
        self.push(OutboundFrame::Text(text))
    }

    async fn send_ping(&self) -> Result<(), TransportError> {
        self.push(OutboundFrame::Ping)
    }

    async fn close(&self, cause: &CloseCause) {
        let _ = self.push(OutboundFrame::Close(cause.reason().to_string()));
        self.tx.close_channel();
    }
}
