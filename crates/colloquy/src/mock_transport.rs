//! Mock sinks for testing.
//!
//! Each misbehaves in one specific way, standing in for an unreliable
//! network between client and collection.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::message::ServiceMessage;
use crate::transport;
use crate::transport::MessageSink;

/// Delivers every message twice.
///
/// Fails only if the first delivery fails; the copy is best effort.
pub struct DuplicatingSink {
    inner: Arc<dyn MessageSink>,
}

impl DuplicatingSink {
    pub fn new(inner: impl MessageSink) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

#[async_trait::async_trait]
impl MessageSink for DuplicatingSink {
    async fn send(&self, message: ServiceMessage) -> transport::Result<()> {
        self.inner.send(message.clone()).await?;
        let _ = self.inner.send(message).await;
        Ok(())
    }
}

/// Refuses the first `failures` messages with `ConnectionLost`, then passes
/// everything through.
pub struct FlakySink {
    inner: Arc<dyn MessageSink>,
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakySink {
    pub fn new(inner: impl MessageSink, failures: usize) -> Self {
        Self {
            inner: Arc::new(inner),
            remaining_failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of `send` calls so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MessageSink for FlakySink {
    async fn send(&self, message: ServiceMessage) -> transport::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(transport::Error::ConnectionLost("Injected failure".into()));
        }
        self.inner.send(message).await
    }
}

/// Accepts and drops every message.
#[derive(Clone, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl MessageSink for NullSink {
    async fn send(&self, _message: ServiceMessage) -> transport::Result<()> {
        Ok(())
    }
}

/// Never completes a send. Counts the sends that started.
#[derive(Default)]
pub struct HangingSink {
    sends: AtomicUsize,
}

impl HangingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MessageSink for HangingSink {
    async fn send(&self, _message: ServiceMessage) -> transport::Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}
