//! # Messengers
//!
//! The two faces of a conversation:
//!
//! - `ClientMessenger` is held by the calling side. It sends values to the
//!   service and receives replies, failures and end-of-conversation.
//! - `ServiceMessenger` is handed to the running service body. It receives
//!   the client's values and pushes replies.
//!
//! Both `receive` calls wait until something arrives. Typed receives fail
//! with `UnexpectedPayload` when the payload has another type.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::RouteGuard;
use crate::config::DEFAULT_REORDER_WINDOW;
use crate::conversation::Conversation;
use crate::conversation::Inbound;
use crate::message::ConversationId;
use crate::message::MessageKind;
use crate::message::Payload;
use crate::message::ServiceMessage;
use crate::sequence::Sequencer;
use crate::transport;
use crate::transport::MessageSink;

#[derive(Debug, Clone)]
pub enum Error {
    /// The service failed or timed out. Only its description crossed over.
    ExecutionFailure { conversation_id: ConversationId, description: String },
    /// The service side ended the conversation.
    EndOfConversation(ConversationId),
    /// No message arrived within the client's receive timeout.
    ReceiveTimeout(ConversationId),
    /// Seen by a service: the conversation was terminated.
    Terminated(ConversationId),
    /// Seen by a service: the conversation exceeded its idle timeout.
    TimedOut(ConversationId),
    /// Seen by a service: the client reported a failure.
    ClientFailure { conversation_id: ConversationId, description: String },
    /// The received payload is not of the requested type.
    UnexpectedPayload { expected: &'static str },
    /// The message could not be handed to the other side.
    Transport(transport::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExecutionFailure { conversation_id, description } => {
                write!(f, "Service execution failed in conversation {}: {}", conversation_id, description)
            }
            Self::EndOfConversation(id) => write!(f, "Conversation {} has ended", id),
            Self::ReceiveTimeout(id) => write!(f, "Timed out waiting for a message in conversation {}", id),
            Self::Terminated(id) => write!(f, "Conversation {} was terminated", id),
            Self::TimedOut(id) => write!(f, "Conversation {} timed out", id),
            Self::ClientFailure { conversation_id, description } => {
                write!(f, "Client of conversation {} failed: {}", conversation_id, description)
            }
            Self::UnexpectedPayload { expected } => write!(f, "Unexpected payload, expected {}", expected),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn unwrap_payload<T: Any + Send + Sync + Clone>(payload: Payload) -> Result<T> {
    payload.downcast::<T>().map_err(|_| Error::UnexpectedPayload {
        expected: std::any::type_name::<T>(),
    })
}

struct Incoming {
    rx: mpsc::UnboundedReceiver<ServiceMessage>,
    sequencer: Sequencer,
    ready: VecDeque<ServiceMessage>,
    /// The exception or terminate message that ended the conversation.
    finished: Option<ServiceMessage>,
}

impl Incoming {
    fn absorb(&mut self, message: ServiceMessage) {
        let ready = self.sequencer.accept(message);
        self.ready.extend(ready);
    }

    /// Moves everything that already arrived into `ready`, without waiting.
    fn drain(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.absorb(message);
        }
    }

    /// Drops data queued ahead of an exception: a failure overtakes replies
    /// that were not received yet.
    fn skip_to_exception(&mut self) {
        if let Some(position) = self.ready.iter().position(|m| m.is_exception()) {
            if position > 0 {
                debug!(skipped = position, "dropping replies queued behind a failure");
                self.ready.drain(..position);
            }
        }
    }

    fn pending_exception(&self) -> Option<&ServiceMessage> {
        self.ready
            .iter()
            .chain(self.finished.iter())
            .find(|m| m.is_exception())
    }
}

/// The calling side of one conversation.
pub struct ClientMessenger {
    conversation_id: ConversationId,
    outgoing: Arc<dyn MessageSink>,
    next_index: AtomicU64,
    incoming: Mutex<Incoming>,
    receive_timeout: Option<Duration>,
    _route: Option<RouteGuard>,
}

impl ClientMessenger {
    pub(crate) fn new(
        conversation_id: ConversationId,
        outgoing: Arc<dyn MessageSink>,
        rx: mpsc::UnboundedReceiver<ServiceMessage>,
        receive_timeout: Option<Duration>,
        route: Option<RouteGuard>,
    ) -> Self {
        Self {
            conversation_id,
            outgoing,
            next_index: AtomicU64::new(0),
            incoming: Mutex::new(Incoming {
                rx,
                sequencer: Sequencer::new(DEFAULT_REORDER_WINDOW),
                ready: VecDeque::new(),
                finished: None,
            }),
            receive_timeout,
            _route: route,
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.conversation_id
    }

    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Surfaces a failure the service already reported.
    ///
    /// Skipped when another task is currently receiving; that task will see
    /// the failure itself.
    fn check_failure(&self) -> Result<()> {
        let Ok(mut incoming) = self.incoming.try_lock() else {
            return Ok(());
        };
        incoming.drain();
        match incoming.pending_exception() {
            Some(message) => Err(self.execution_failure(message)),
            None => Ok(()),
        }
    }

    fn execution_failure(&self, message: &ServiceMessage) -> Error {
        Error::ExecutionFailure {
            conversation_id: self.conversation_id.clone(),
            description: message.description().unwrap_or_default().to_string(),
        }
    }

    /// Sends `value` to the service.
    ///
    /// Fails with `ExecutionFailure` if the service already failed or timed
    /// out, even when that failure has not been received yet.
    pub async fn send<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.check_failure()?;
        let message = ServiceMessage::data(self.conversation_id.clone(), self.next_index(), Payload::new(value));
        self.outgoing.send(message).await.map_err(Error::from)
    }

    /// Asks the service side to end the conversation.
    pub async fn terminate(&self) -> Result<()> {
        let message = ServiceMessage::terminate(self.conversation_id.clone(), self.next_index());
        self.outgoing.send(message).await.map_err(Error::from)
    }

    /// Reports a client-side failure to the service, which ends the
    /// conversation.
    pub async fn send_exception(&self, description: impl Into<String>) -> Result<()> {
        let message = ServiceMessage::exception(self.conversation_id.clone(), self.next_index(), description);
        self.outgoing.send(message).await.map_err(Error::from)
    }

    /// Waits for the next message from the service.
    ///
    /// A failure reported by the service is returned ahead of any replies
    /// still queued before it. Bounded by the receive timeout this messenger was created with.
    pub async fn receive<T: Any + Send + Sync + Clone>(&self) -> Result<T> {
        match self.receive_timeout {
            Some(timeout) => self
                .try_receive(timeout)
                .await?
                .ok_or_else(|| Error::ReceiveTimeout(self.conversation_id.clone())),
            None => {
                let message = self.next_message().await?;
                self.unwrap_message(message)
            }
        }
    }

    /// Waits at most `timeout` for the next message from the service.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. A zero timeout only
    /// looks at what already arrived.
    pub async fn try_receive<T: Any + Send + Sync + Clone>(&self, timeout: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.next_message()).await {
            Ok(message) => self.unwrap_message(message?).map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn next_message(&self) -> Result<ServiceMessage> {
        let mut incoming = self.incoming.lock().await;
        incoming.drain();
        loop {
            incoming.skip_to_exception();
            if let Some(message) = incoming.ready.pop_front() {
                if !message.is_data() {
                    incoming.finished = Some(message.clone());
                }
                return Ok(message);
            }
            if let Some(finished) = &incoming.finished {
                return Ok(finished.clone());
            }
            match incoming.rx.recv().await {
                Some(message) => incoming.absorb(message),
                None => return Err(Error::EndOfConversation(self.conversation_id.clone())),
            }
        }
    }

    fn unwrap_message<T: Any + Send + Sync + Clone>(&self, message: ServiceMessage) -> Result<T> {
        match message.kind() {
            MessageKind::Data => match message.into_payload() {
                Some(payload) => unwrap_payload(payload),
                None => Err(Error::UnexpectedPayload { expected: std::any::type_name::<T>() }),
            },
            MessageKind::Exception => Err(self.execution_failure(&message)),
            MessageKind::Terminate => Err(Error::EndOfConversation(self.conversation_id.clone())),
        }
    }
}

/// The service side of one conversation, handed to `Service::run`.
pub struct ServiceMessenger {
    conversation: Arc<Conversation>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl ServiceMessenger {
    pub(crate) fn new(conversation: Arc<Conversation>, inbound: mpsc::UnboundedReceiver<Inbound>) -> Self {
        Self { conversation, inbound }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.conversation.id()
    }

    pub fn service_type(&self) -> &str {
        self.conversation.service_type()
    }

    /// Waits for the next value the client sent.
    pub async fn receive<T: Any + Send + Sync + Clone>(&mut self) -> Result<T> {
        let inbound = self.inbound.recv().await;
        self.unwrap_inbound(inbound)
    }

    /// Waits at most `timeout` for the next value the client sent.
    pub async fn try_receive<T: Any + Send + Sync + Clone>(&mut self, timeout: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(inbound) => self.unwrap_inbound(inbound).map(Some),
            Err(_) => Ok(None),
        }
    }

    fn unwrap_inbound<T: Any + Send + Sync + Clone>(&self, inbound: Option<Inbound>) -> Result<T> {
        match inbound {
            Some(Inbound::Data(payload)) => unwrap_payload(payload),
            Some(Inbound::Exception(description)) => Err(Error::ClientFailure {
                conversation_id: self.conversation.id().clone(),
                description,
            }),
            None => Err(self.conversation.closed_error()),
        }
    }

    /// Pushes `value` to the client.
    pub async fn send<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.conversation.send_data(Payload::new(value)).await
    }
}
