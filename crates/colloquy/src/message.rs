//! # Service Messages
//!
//! The atomic unit of conversation traffic. A message is addressed to a
//! conversation, carries a conversation-scoped index, and is one of three
//! kinds: a data step, a captured failure, or a terminate request.
//!
//! ## Invariants
//!
//! - A message never changes after construction; all fields are private.
//! - Identity is `(conversation_id, index)`. Two messages with the same pair
//!   are the same message, whatever their payload.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

/// Opaque routing key of a conversation.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    Exception,
    Terminate,
}

/// A type-erased, cheaply clonable message payload.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Extracts the value as `T`, handing the payload back on a type mismatch.
    ///
    /// Clones the value only if other handles to the same payload are alive.
    pub fn downcast<T: Any + Send + Sync + Clone>(self) -> Result<T, Payload> {
        match self.0.downcast::<T>() {
            Ok(value) => Ok(Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone())),
            Err(erased) => Err(Self(erased)),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            return write!(f, "Payload({:?})", s);
        }
        if let Some(s) = self.downcast_ref::<&'static str>() {
            return write!(f, "Payload({:?})", s);
        }
        f.write_str("Payload(..)")
    }
}

/// One step of a conversation.
#[derive(Clone, Debug)]
pub struct ServiceMessage {
    conversation_id: ConversationId,
    index: u64,
    kind: MessageKind,
    payload: Option<Payload>,
}

impl ServiceMessage {
    /// A data step carrying `payload`.
    pub fn data(conversation_id: ConversationId, index: u64, payload: Payload) -> Self {
        Self {
            conversation_id,
            index,
            kind: MessageKind::Data,
            payload: Some(payload),
        }
    }

    /// A request to end the conversation. Carries no payload.
    pub fn terminate(conversation_id: ConversationId, index: u64) -> Self {
        Self {
            conversation_id,
            index,
            kind: MessageKind::Terminate,
            payload: None,
        }
    }

    /// A captured failure. The payload is the failure description string.
    pub fn exception(conversation_id: ConversationId, index: u64, description: impl Into<String>) -> Self {
        Self {
            conversation_id,
            index,
            kind: MessageKind::Exception,
            payload: Some(Payload::new(description.into())),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<Payload> {
        self.payload
    }

    /// The failure description of an exception message.
    pub fn description(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Exception => self
                .payload
                .as_ref()
                .and_then(|p| p.downcast_ref::<String>())
                .map(String::as_str),
            _ => None,
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind == MessageKind::Data
    }

    pub fn is_exception(&self) -> bool {
        self.kind == MessageKind::Exception
    }

    pub fn is_terminate(&self) -> bool {
        self.kind == MessageKind::Terminate
    }
}

impl PartialEq for ServiceMessage {
    fn eq(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id && self.index == other.index
    }
}

impl Eq for ServiceMessage {}

impl Hash for ServiceMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.conversation_id.hash(state);
        self.index.hash(state);
    }
}

impl PartialOrd for ServiceMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.conversation_id
            .cmp(&other.conversation_id)
            .then(self.index.cmp(&other.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConversationId {
        ConversationId::from(s)
    }

    #[test]
    fn test_identity_ignores_payload() {
        let a = ServiceMessage::data(id("c-1"), 3, Payload::new("One".to_string()));
        let b = ServiceMessage::data(id("c-1"), 3, Payload::new(42u32));
        let c = ServiceMessage::terminate(id("c-1"), 3);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, ServiceMessage::data(id("c-2"), 3, Payload::new(0u8)));
    }

    #[test]
    fn test_ordering_by_conversation_then_index() {
        let mut messages = vec![
            ServiceMessage::terminate(id("b"), 0),
            ServiceMessage::terminate(id("a"), 2),
            ServiceMessage::terminate(id("a"), 1),
        ];
        messages.sort();
        let keys: Vec<_> = messages
            .iter()
            .map(|m| (m.conversation_id().as_str().to_string(), m.index()))
            .collect();
        assert_eq!(keys, vec![("a".into(), 1), ("a".into(), 2), ("b".into(), 0)]);
    }

    #[test]
    fn test_exception_carries_description() {
        let m = ServiceMessage::exception(id("c"), 0, "kind: message");
        assert!(m.is_exception());
        assert_eq!(m.description(), Some("kind: message"));

        let data = ServiceMessage::data(id("c"), 1, Payload::new("kind: message".to_string()));
        assert_eq!(data.description(), None);
    }

    #[test]
    fn test_terminate_has_no_payload() {
        let m = ServiceMessage::terminate(id("c"), 7);
        assert!(m.is_terminate());
        assert!(m.payload().is_none());
        assert_eq!(m.index(), 7);
    }

    #[test]
    fn test_payload_downcast() {
        let payload = Payload::new("Hallo".to_string());
        assert!(payload.is::<String>());
        let shared = payload.clone();
        assert_eq!(shared.downcast::<String>().unwrap(), "Hallo");

        let wrong = payload.downcast::<u64>().unwrap_err();
        assert_eq!(wrong.downcast_ref::<String>().map(String::as_str), Some("Hallo"));
    }
}
