//! # Conversation Collection
//!
//! Central registry for conversation lifecycles. Creates conversations from
//! registered service types, routes inbound messages to them by id, and
//! reaps the ones that stay idle for too long.
//!
//! Uses DashMap for the live-conversation map so that starts, routing, the
//! timeout sweep and conversation teardown proceed without a global lock.
//!
//! ## Invariants
//!
//! - A conversation is fully built before it is inserted, and inserted before
//!   its service task is spawned. Lookups never see a half-built entry, and
//!   teardown never runs before insertion.
//! - Removal from the map happens only after the service task has stopped.
//! - An id is never reused within one collection.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CollectionConfig;
use crate::conversation::Cause;
use crate::conversation::Conversation;
use crate::conversation::Delivery;
use crate::conversation::State;
use crate::message::ConversationId;
use crate::message::ServiceMessage;
use crate::messenger::ClientMessenger;
use crate::registry;
use crate::registry::ServiceFactory;
use crate::registry::ServiceRegistry;
use crate::transport;
use crate::transport::MessageSink;

#[derive(Debug, Clone)]
pub enum Error {
    /// No factory is registered for the requested service type.
    UnknownServiceType(String),
    /// No live conversation has this id.
    UnknownConversation(ConversationId),
    /// The collection was created outside of a tokio runtime.
    NoRuntime,
    /// The message's index is too far ahead of what the conversation
    /// expects next.
    BeyondWindow { conversation_id: ConversationId, index: u64 },
    /// The collection this handle pointed to is gone.
    Closed,
    Transport(transport::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownServiceType(name) => write!(f, "Unknown service type: {}", name),
            Self::UnknownConversation(id) => write!(f, "Unknown conversation: {}", id),
            Self::BeyondWindow { conversation_id, index } => {
                write!(f, "Message {} is beyond the reorder window of conversation {}", index, conversation_id)
            }
            Self::NoRuntime => write!(f, "No tokio runtime available"),
            Self::Closed => write!(f, "Conversation collection is closed"),
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

impl From<registry::Error> for Error {
    fn from(e: registry::Error) -> Self {
        match e {
            registry::Error::UnknownServiceType(name) => Self::UnknownServiceType(name),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a client learns when a conversation starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationInfo {
    id: ConversationId,
    client_timeout: Option<Duration>,
}

impl ConversationInfo {
    pub fn new(id: ConversationId, client_timeout: Option<Duration>) -> Self {
        Self { id, client_timeout }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    /// Per-type bound for the client's `receive`, if the service type has one.
    pub fn client_timeout(&self) -> Option<Duration> {
        self.client_timeout
    }

    pub fn into_id(self) -> ConversationId {
        self.id
    }
}

pub(crate) struct Inner {
    config: CollectionConfig,
    runtime: Handle,
    registry: ServiceRegistry,
    conversations: DashMap<ConversationId, Arc<Conversation>>,
    id_prefix: u32,
    next_id: AtomicU64,
    sweeper: Mutex<Option<AbortHandle>>,
}

impl Inner {
    fn next_conversation_id(&self) -> ConversationId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        ConversationId::new(format!("{:08x}-{}", self.id_prefix, n))
    }

    fn live(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.get(id).map(|entry| entry.value().clone())
    }

    fn route(&self, message: ServiceMessage) -> Result<()> {
        let id = message.conversation_id().clone();
        let index = message.index();
        let delivery = match self.live(&id) {
            Some(conversation) => conversation.deliver_inbound(message),
            None => Delivery::Closed,
        };
        match delivery {
            Delivery::Accepted | Delivery::Duplicate => Ok(()),
            Delivery::BeyondWindow => Err(Error::BeyondWindow { conversation_id: id, index }),
            Delivery::Closed => {
                debug!(conversation = %id, "message for unknown conversation");
                Err(Error::UnknownConversation(id))
            }
        }
    }

    fn stop_sweeper(&self) {
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }
    }

    /// Times out every expired conversation, each on its own task so that a
    /// stalled sink delays only its own conversation.
    fn reap_idle(&self) {
        let now = Instant::now();
        let expired: Vec<(Arc<Conversation>, Duration)> = self
            .conversations
            .iter()
            .filter_map(|entry| {
                let idle = entry.idle_for(now);
                (idle > entry.idle_timeout()).then(|| (entry.value().clone(), idle))
            })
            .collect();

        for (conversation, idle) in expired {
            self.runtime.spawn(async move { conversation.time_out(idle).await });
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_sweeper();
        for entry in self.conversations.iter() {
            entry.cancel();
        }
    }
}

async fn sweep(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        inner.reap_idle();
    }
}

/// The registry of live conversations.
///
/// Cheap to clone; clones share the same conversations. The background
/// sweep and all service tasks stop once the last handle is dropped.
#[derive(Clone)]
pub struct ConversationCollection {
    inner: Arc<Inner>,
}

impl ConversationCollection {
    /// Creates a collection and starts its timeout sweep.
    ///
    /// Must be called from within a tokio runtime; later calls may come from
    /// any thread.
    pub fn new(config: CollectionConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let period = config.sweep_interval();
        let inner = Arc::new(Inner {
            config,
            runtime,
            registry: ServiceRegistry::new(),
            conversations: DashMap::new(),
            id_prefix: rand::random(),
            next_id: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        });

        let sweeper = inner.runtime.spawn(sweep(Arc::downgrade(&inner), period));
        *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper.abort_handle());

        info!(
            idle_timeout_ms = inner.config.idle_timeout().as_millis() as u64,
            sweep_interval_ms = period.as_millis() as u64,
            "conversation collection started"
        );
        Ok(Self { inner })
    }

    /// Creates a collection whose idle timeout is `millis` milliseconds.
    pub fn with_idle_timeout_millis(millis: u64) -> Result<Self> {
        Self::new(CollectionConfig::from_idle_timeout_millis(millis))
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    /// Registers a service type. A later registration replaces an earlier one.
    pub fn add_service_type(&self, name: impl Into<String>, factory: impl ServiceFactory) {
        self.inner.registry.add_service_type(name, factory);
    }

    /// Starts a local-loopback conversation and returns the client side of it.
    pub fn start_conversation(&self, service_type: &str) -> Result<ClientMessenger> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(transport::ChannelSink::new(tx));
        let info = self.start_remote_conversation(service_type, sink)?;
        let receive_timeout = info
            .client_timeout()
            .or(self.inner.config.client_receive_timeout());
        Ok(ClientMessenger::new(
            info.into_id(),
            Arc::new(self.incoming_transport()),
            rx,
            receive_timeout,
            None,
        ))
    }

    /// Starts a conversation whose replies are pushed into `sink`.
    ///
    /// Used when the client is remote: it addresses the conversation by the
    /// returned id through `send` or `incoming_transport`.
    pub fn start_conversation_with_sink(
        &self,
        service_type: &str,
        sink: Arc<dyn MessageSink>,
    ) -> Result<ConversationId> {
        Ok(self.start_remote_conversation(service_type, sink)?.into_id())
    }

    /// Like `start_conversation_with_sink`, also returning the settings the
    /// client should apply.
    pub fn start_remote_conversation(
        &self,
        service_type: &str,
        sink: Arc<dyn MessageSink>,
    ) -> Result<ConversationInfo> {
        let factory = self.inner.registry.factory(service_type)?;
        let id = self.inner.next_conversation_id();
        let idle_timeout = factory
            .idle_timeout()
            .unwrap_or_else(|| self.inner.config.idle_timeout());

        let (conversation, messenger) = Conversation::new(
            id.clone(),
            service_type,
            idle_timeout,
            self.inner.config.max_reorder_window(),
            sink,
        );
        let mut service = factory.create();
        self.inner.conversations.insert(id.clone(), conversation.clone());

        let task = self
            .inner
            .runtime
            .spawn(async move { service.run(messenger).await });
        conversation.attach(task.abort_handle());

        let collection = Arc::downgrade(&self.inner);
        let supervised = conversation.clone();
        self.inner.runtime.spawn(async move {
            supervised.supervise(task).await;
            if let Some(inner) = collection.upgrade() {
                inner.conversations.remove(supervised.id());
            }
        });

        info!(conversation = %id, service_type, "conversation started");
        Ok(ConversationInfo::new(id, factory.client_timeout()))
    }

    /// Routes an inbound message to its conversation.
    ///
    /// Duplicates addressed to a live conversation are absorbed and return
    /// `Ok`. Messages for ids without a live conversation, including ones
    /// that already terminated, fail with `UnknownConversation`. An index
    /// too far ahead of the expected one fails with `BeyondWindow` and does
    /// not count as activity.
    pub fn send(&self, message: ServiceMessage) -> Result<()> {
        self.inner.route(message)
    }

    /// True iff a live, not yet terminated conversation has this id.
    pub fn has_conversation(&self, id: &ConversationId) -> bool {
        self.inner
            .live(id)
            .is_some_and(|conversation| conversation.state() != State::Terminated)
    }

    /// State of the conversation with this id, if it is still registered.
    pub fn conversation_state(&self, id: &ConversationId) -> Option<State> {
        self.inner.live(id).map(|conversation| conversation.state())
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.conversations.len()
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.inner
            .conversations
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// The endpoint remote clients send their messages to.
    pub fn incoming_transport(&self) -> IncomingTransport {
        IncomingTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stops the timeout sweep and terminates every live conversation. Their
    /// clients receive a terminate message. Conversations are terminated
    /// concurrently, each on its own task.
    pub async fn shutdown(&self) {
        self.inner.stop_sweeper();
        let live: Vec<Arc<Conversation>> = self
            .inner
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(conversations = live.len(), "shutting down conversation collection");
        let pending: Vec<_> = live
            .into_iter()
            .map(|conversation| {
                self.inner
                    .runtime
                    .spawn(async move { conversation.terminate(Cause::Shutdown).await })
            })
            .collect();
        for termination in pending {
            if let Err(e) = termination.await {
                warn!(error = %e, "conversation shutdown task failed");
            }
        }
    }
}

/// Routes messages into a collection.
///
/// Holds only a weak reference: once the collection is gone every send
/// fails with `ConnectionLost`. A message for an unknown conversation fails
/// with `transport::Error::UnknownConversation`.
#[derive(Clone)]
pub struct IncomingTransport {
    inner: Weak<Inner>,
}

#[async_trait::async_trait]
impl MessageSink for IncomingTransport {
    async fn send(&self, message: ServiceMessage) -> transport::Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| transport::Error::ConnectionLost(Error::Closed.to_string()))?;
        inner.route(message).map_err(|e| match e {
            Error::UnknownConversation(id) => transport::Error::UnknownConversation(id),
            other => transport::Error::Rejected(other.to_string()),
        })
    }
}
