//! # Failure Descriptions
//!
//! Failures never cross a conversation boundary as objects. What crosses is a
//! description of the form `"<kind>: <message>"`, built here from a service
//! error, a panic payload, or the idle-timeout sweep.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use crate::message::ConversationId;

/// Kind reported for conversations reaped by the idle-timeout sweep.
pub const TIMEOUT_KIND: &str = "colloquy::timeout";

/// Kind reported for service bodies that panicked.
pub const PANIC_KIND: &str = "panic";

/// The error a service body returns.
///
/// Any `std::error::Error` converts into it through `?`; the conversion
/// records the fully-qualified type name of the source error as the kind.
/// Does not implement `std::error::Error`: the blanket conversion would
/// overlap with `From<T> for T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    kind: String,
    message: String,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E> From<E> for ServiceError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(e: E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: e.to_string(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A captured failure, reduced to what may cross the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: String,
    message: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The failure delivered when a conversation exceeds its idle timeout.
    pub fn timeout(id: &ConversationId, idle: Duration) -> Self {
        Self::new(
            TIMEOUT_KIND,
            format!("conversation {} idle for {} ms", id, idle.as_millis()),
        )
    }

    /// Builds a failure from the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(s) => *s,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(s) => (*s).to_string(),
                Err(_) => "non-string panic payload".to_string(),
            },
        };
        Self::new(PANIC_KIND, message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn description(&self) -> String {
        format!("{}: {}", self.kind, self.message)
    }
}

impl From<ServiceError> for Failure {
    fn from(e: ServiceError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Returns true if `description` was produced by the idle-timeout sweep.
pub fn is_timeout_description(description: &str) -> bool {
    description
        .strip_prefix(TIMEOUT_KIND)
        .is_some_and(|rest| rest.starts_with(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dislike;

    impl fmt::Display for Dislike {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Don't like you!")
        }
    }

    impl std::error::Error for Dislike {}

    fn refuse() -> Result<(), ServiceError> {
        Err(Dislike.into())
    }

    #[test]
    fn test_conversion_records_type_name() {
        let error = refuse().unwrap_err();
        assert!(error.kind().ends_with("Dislike"), "kind was {}", error.kind());
        assert_eq!(error.message(), "Don't like you!");

        let description = Failure::from(error).description();
        assert!(description.contains("Dislike"));
        assert!(description.ends_with(": Don't like you!"));
    }

    #[test]
    fn test_timeout_description() {
        let failure = Failure::timeout(&ConversationId::from("c-9"), Duration::from_millis(150));
        let description = failure.description();
        assert!(is_timeout_description(&description));
        assert!(description.contains("c-9"));
        assert!(description.contains("150 ms"));
        assert!(!is_timeout_description("colloquy::timeoutish: no"));
    }

    #[test]
    fn test_panic_payloads() {
        assert_eq!(Failure::from_panic(Box::new("boom")).description(), "panic: boom");
        assert_eq!(Failure::from_panic(Box::new(String::from("bang"))).message(), "bang");
        assert_eq!(Failure::from_panic(Box::new(7u8)).message(), "non-string panic payload");
    }
}
