//! # Service Registry
//!
//! Maps a service-type name to the factory that builds fresh service bodies.
//! Filled at setup time and read on every conversation start.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::failure::ServiceError;
use crate::messenger::ServiceMessenger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnknownServiceType(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownServiceType(name) => write!(f, "Unknown service type: {}", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A service body running inside one conversation.
///
/// `run` is called once, on the conversation's own task. It may loop and call
/// `receive`/`send` any number of times. An error from the messenger means the
/// conversation is over; propagating it with `?` is the expected reaction.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    async fn run(&mut self, messenger: ServiceMessenger) -> std::result::Result<(), ServiceError>;
}

/// Builds service bodies for one service type.
pub trait ServiceFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn Service>;

    /// Idle timeout for conversations of this type. `None` uses the
    /// collection's default.
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    /// Upper bound for a client's blocking `receive` in conversations of
    /// this type, handed to the client when the conversation starts. `None`
    /// leaves the client's own setting in place.
    fn client_timeout(&self) -> Option<Duration> {
        None
    }
}

impl<F, S> ServiceFactory for F
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Service,
{
    fn create(&self) -> Box<dyn Service> {
        Box::new(self())
    }
}

/// Concurrent map from service-type name to factory.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: DashMap<String, Arc<dyn ServiceFactory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`. A later registration replaces an
    /// earlier one.
    pub fn add_service_type(&self, name: impl Into<String>, factory: impl ServiceFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            debug!(service_type = %name, "replaced service factory");
        } else {
            debug!(service_type = %name, "registered service factory");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Retrieves the factory for `name`.
    pub fn factory(&self, name: &str) -> Result<Arc<dyn ServiceFactory>> {
        self.factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownServiceType(name.to_string()))
    }

    /// Builds a fresh service body of type `name`.
    pub fn create_service(&self, name: &str) -> Result<Box<dyn Service>> {
        Ok(self.factory(name)?.create())
    }
}
