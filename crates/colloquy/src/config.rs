//! Configuration values consumed by the collection and the retrying sink.

use std::time::Duration;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// How far past the next expected index a message may arrive and still be
/// held for reordering.
pub const DEFAULT_REORDER_WINDOW: u64 = 1024;

/// Settings for a `ConversationCollection`.
#[derive(Clone, Debug)]
pub struct CollectionConfig {
    idle_timeout: Duration,
    sweep_interval: Option<Duration>,
    client_receive_timeout: Option<Duration>,
    max_reorder_window: u64,
}

impl CollectionConfig {
    pub fn new() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: None,
            client_receive_timeout: None,
            max_reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }

    /// Creates a configuration whose idle timeout is `millis` milliseconds.
    pub fn from_idle_timeout_millis(millis: u64) -> Self {
        Self::new().with_idle_timeout(Duration::from_millis(millis))
    }

    /// Maximum gap between two messages before a conversation is reaped.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Cadence of the background timeout sweep.
    ///
    /// Defaults to a quarter of the idle timeout. Set it explicitly when
    /// service factories override the idle timeout with shorter values.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Upper bound for a loopback client's blocking `receive`.
    pub fn with_client_receive_timeout(mut self, timeout: Duration) -> Self {
        self.client_receive_timeout = Some(timeout);
        self
    }

    /// Inbound messages at or beyond `next expected + window` are refused
    /// instead of buffered. Clamped to at least 1.
    pub fn with_max_reorder_window(mut self, window: u64) -> Self {
        self.max_reorder_window = window.max(1);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
            .unwrap_or(self.idle_timeout / 4)
            .max(MIN_SWEEP_INTERVAL)
    }

    pub fn client_receive_timeout(&self) -> Option<Duration> {
        self.client_receive_timeout
    }

    pub fn max_reorder_window(&self) -> u64 {
        self.max_reorder_window
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout and retry policy for delivering a message over an unreliable sink.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 10,
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Bound for a single delivery attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of attempts after the first one.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
