//! # Message Transport Abstraction
//!
//! A minimal, async interface for handing Service Messages to whoever is on
//! the other side of a conversation.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: A sink moves whole `ServiceMessage` values. Wire
//!   encoding, if any, lives behind the trait.
//! - **Fire-and-Forget**: A successful `send` only means the message was
//!   handed over. Ordering and duplicate suppression are the receiver's job,
//!   driven by message indices.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::RetryConfig;
use crate::message::ConversationId;
use crate::message::ServiceMessage;

/// Errors that occur while handing a message to a sink.
#[derive(Debug, Clone)]
pub enum Error {
    /// The receiving side is gone (channel dropped, peer disconnected).
    ConnectionLost(String),
    /// The sink did not accept the message in time.
    Timeout,
    /// The message addressed a conversation the receiver does not know.
    UnknownConversation(ConversationId),
    /// The receiver refused the message for another reason.
    Rejected(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Send timed out"),
            Self::UnknownConversation(id) => write!(f, "Unknown conversation: {}", id),
            Self::Rejected(msg) => write!(f, "Message rejected: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A destination for Service Messages.
///
/// Used both as the outbound target of a conversation (service -> client) and
/// as the entry point into a collection (client -> service).
/// This trait is designed to be object-safe (`Arc<dyn MessageSink>`).
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Hands `message` to the receiving side.
    ///
    /// # invariants
    /// - Must not reorder or rewrite the message.
    /// - May deliver the same message more than once; receivers deduplicate
    ///   by index.
    async fn send(&self, message: ServiceMessage) -> Result<()>;
}

/// Sink that pushes messages into an unbounded tokio channel.
///
/// This is the outbound target of a local-loopback conversation: the client
/// messenger owns the receiving half.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ServiceMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ServiceMessage>) -> Self {
        Self { tx }
    }

    /// Creates a sink together with the receiver that observes its messages.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServiceMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl MessageSink for ChannelSink {
    async fn send(&self, message: ServiceMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::ConnectionLost("Channel closed".into()))
    }
}

/// Sink that retries a failing inner sink according to a `RetryConfig`.
///
/// Each attempt is bounded by `RetryConfig::timeout`; between attempts the
/// sink sleeps for `RetryConfig::retry_delay`.
pub struct RetryingSink {
    inner: Arc<dyn MessageSink>,
    config: RetryConfig,
}

impl RetryingSink {
    pub fn new(inner: Arc<dyn MessageSink>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait::async_trait]
impl MessageSink for RetryingSink {
    async fn send(&self, message: ServiceMessage) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.config.timeout(), self.inner.send(message.clone())).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_retries() => {
                    attempt += 1;
                    debug!(
                        conversation = %message.conversation_id(),
                        index = message.index(),
                        attempt,
                        error = %e,
                        "retrying message delivery"
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
