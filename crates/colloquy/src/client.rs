//! # Remote Conversation Client
//!
//! Talks to a conversation collection that lives behind a transport. The
//! client starts conversations through a `RemoteServer`, sends its messages
//! through an outgoing sink, and receives replies through a
//! `ResponseTransport` that demultiplexes them by conversation id.
//!
//! ## Invariants
//!
//! - Replies may reach the `ResponseTransport` before the start call
//!   returns. While a start is outstanding, a reply for an unknown id opens
//!   a route that the start picks up later.
//! - A route lives as long as its `ClientMessenger`. Replies for ids with no
//!   route and no outstanding start are refused.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::collection;
use crate::collection::ConversationCollection;
use crate::collection::ConversationInfo;
use crate::message::ConversationId;
use crate::message::ServiceMessage;
use crate::messenger::ClientMessenger;
use crate::transport;
use crate::transport::MessageSink;

/// The server side as seen by a remote client.
#[async_trait::async_trait]
pub trait RemoteServer: Send + Sync + 'static {
    /// Starts a conversation of `service_type` and returns its id, with the
    /// service type's client timeout if it has one.
    async fn start_conversation(&self, service_type: &str) -> collection::Result<ConversationInfo>;
}

/// Replies for one conversation, waiting to be picked up.
struct Route {
    tx: mpsc::UnboundedSender<ServiceMessage>,
    rx: Option<mpsc::UnboundedReceiver<ServiceMessage>>,
}

impl Route {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
pub(crate) struct Routes {
    map: DashMap<ConversationId, Route>,
    starting: AtomicUsize,
}

impl Routes {
    fn take_receiver(&self, id: &ConversationId) -> Option<mpsc::UnboundedReceiver<ServiceMessage>> {
        self.map.entry(id.clone()).or_insert_with(Route::new).rx.take()
    }
}

/// Counts an outstanding start for as long as it lives.
struct Starting<'a>(&'a Routes);

impl<'a> Starting<'a> {
    fn new(routes: &'a Routes) -> Self {
        routes.starting.fetch_add(1, Ordering::SeqCst);
        Self(routes)
    }
}

impl Drop for Starting<'_> {
    fn drop(&mut self) {
        self.0.starting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes a conversation's route once its messenger is dropped.
pub(crate) struct RouteGuard {
    routes: Arc<Routes>,
    conversation_id: ConversationId,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes.map.remove(&self.conversation_id);
    }
}

/// Demultiplexes replies from the server into per-conversation queues.
#[derive(Clone, Default)]
pub struct ResponseTransport {
    routes: Arc<Routes>,
}

impl ResponseTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations with an open route.
    pub fn route_count(&self) -> usize {
        self.routes.map.len()
    }
}

#[async_trait::async_trait]
impl MessageSink for ResponseTransport {
    async fn send(&self, message: ServiceMessage) -> transport::Result<()> {
        let id = message.conversation_id().clone();
        let existing = self.routes.map.get(&id).map(|route| route.tx.clone());
        let route = match existing {
            Some(tx) => tx,
            None if self.routes.starting.load(Ordering::SeqCst) > 0 => {
                self.routes.map.entry(id.clone()).or_insert_with(Route::new).tx.clone()
            }
            None => {
                debug!(conversation = %id, "reply for unknown conversation");
                return Err(transport::Error::UnknownConversation(id));
            }
        };
        route
            .send(message)
            .map_err(|_| transport::Error::UnknownConversation(id))
    }
}

/// Starts and drives conversations on a remote collection.
pub struct ConversationClient {
    server: Arc<dyn RemoteServer>,
    outgoing: Arc<dyn MessageSink>,
    responses: ResponseTransport,
    receive_timeout: Option<Duration>,
}

impl ConversationClient {
    /// `outgoing` carries the client's messages to the server. The server
    /// must push its replies into `responses`.
    pub fn new(server: Arc<dyn RemoteServer>, outgoing: Arc<dyn MessageSink>, responses: ResponseTransport) -> Self {
        Self {
            server,
            outgoing,
            responses,
            receive_timeout: None,
        }
    }

    /// Bounds every `receive` on messengers started by this client, unless
    /// the service type sets its own client timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// The endpoint the server pushes replies into.
    pub fn incoming_response_transport(&self) -> ResponseTransport {
        self.responses.clone()
    }

    pub async fn start_conversation(&self, service_type: &str) -> collection::Result<ClientMessenger> {
        let routes = &self.responses.routes;
        let (id, receive_timeout, rx) = {
            let _starting = Starting::new(routes);
            let info = self.server.start_conversation(service_type).await?;
            let receive_timeout = info.client_timeout().or(self.receive_timeout);
            let id = info.into_id();
            let rx = routes.take_receiver(&id).ok_or_else(|| {
                collection::Error::Transport(transport::Error::Rejected(format!(
                    "conversation {} was already started",
                    id
                )))
            })?;
            (id, receive_timeout, rx)
        };

        debug!(conversation = %id, service_type, "remote conversation started");
        let guard = RouteGuard {
            routes: routes.clone(),
            conversation_id: id.clone(),
        };
        Ok(ClientMessenger::new(id, self.outgoing.clone(), rx, receive_timeout, Some(guard)))
    }
}

/// Serves a collection in-process, with replies pushed into a fixed sink.
///
/// Stands in for a network hop: wrap `response` in a lossy sink to exercise
/// the client under duplication or failures.
pub struct LocalServer {
    collection: ConversationCollection,
    response: Arc<dyn MessageSink>,
}

impl LocalServer {
    pub fn new(collection: ConversationCollection, response: Arc<dyn MessageSink>) -> Self {
        Self { collection, response }
    }
}

#[async_trait::async_trait]
impl RemoteServer for LocalServer {
    async fn start_conversation(&self, service_type: &str) -> collection::Result<ConversationInfo> {
        self.collection
            .start_remote_conversation(service_type, self.response.clone())
    }
}
