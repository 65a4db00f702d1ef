//! # Conversation
//!
//! One client paired with one running service body. The conversation owns
//! both directions of traffic: an inbound channel feeding the service and an
//! outbound sink reaching the client, each with its own index counter.
//!
//! ## State machine
//!
//! ```text
//! Active ──terminate / failure / timeout / shutdown──▶ Terminating ──task exited──▶ Terminated
//! ```
//!
//! There is no way back to `Active`. Once `Terminating`, inbound deliveries
//! are refused and the service observes the end at its next `receive` or
//! `send`. The entry leaves the collection only after the service task has
//! stopped.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::failure::Failure;
use crate::failure::ServiceError;
use crate::message::ConversationId;
use crate::message::Payload;
use crate::message::ServiceMessage;
use crate::messenger;
use crate::messenger::ServiceMessenger;
use crate::sequence::Admission;
use crate::sequence::Sequencer;
use crate::transport::MessageSink;

/// Lifecycle state of a conversation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Active,
    Terminating,
    Terminated,
}

/// Why a conversation left the `Active` state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cause {
    /// The client sent a terminate message.
    ClientTerminated,
    /// The client reported a failure of its own.
    ClientFailure,
    /// The service body returned normally.
    ServiceFinished,
    /// The service body returned an error or panicked.
    ServiceFailure,
    /// The idle-timeout sweep reaped the conversation.
    TimedOut,
    /// The owning collection shut down.
    Shutdown,
}

/// Outcome of routing one client message into a conversation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Released to the service or held for reordering.
    Accepted,
    /// Already seen; dropped.
    Duplicate,
    /// Too far ahead of the expected index; refused.
    BeyondWindow,
    /// The conversation no longer takes inbound messages.
    Closed,
}

/// What the service body sees on its inbound channel.
pub(crate) enum Inbound {
    Data(Payload),
    Exception(String),
}

struct Status {
    state: State,
    cause: Option<Cause>,
    sequencer: Sequencer,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    task: Option<AbortHandle>,
}

pub(crate) struct Conversation {
    id: ConversationId,
    service_type: String,
    idle_timeout: Duration,
    status: Mutex<Status>,
    last_activity: Mutex<Instant>,
    /// Next outbound index. Held across the sink call so that index order
    /// and hand-over order agree.
    outbound: tokio::sync::Mutex<u64>,
    sink: Arc<dyn MessageSink>,
}

impl Conversation {
    /// Creates a conversation in the `Active` state together with the
    /// messenger its service body will use.
    pub(crate) fn new(
        id: ConversationId,
        service_type: impl Into<String>,
        idle_timeout: Duration,
        reorder_window: u64,
        sink: Arc<dyn MessageSink>,
    ) -> (Arc<Self>, ServiceMessenger) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conversation = Arc::new(Self {
            id,
            service_type: service_type.into(),
            idle_timeout,
            status: Mutex::new(Status {
                state: State::Active,
                cause: None,
                sequencer: Sequencer::new(reorder_window),
                inbound: Some(tx),
                task: None,
            }),
            last_activity: Mutex::new(Instant::now()),
            outbound: tokio::sync::Mutex::new(0),
            sink,
        });
        let messenger = ServiceMessenger::new(conversation.clone(), rx);
        (conversation, messenger)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &ConversationId {
        &self.id
    }

    pub(crate) fn service_type(&self) -> &str {
        &self.service_type
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn state(&self) -> State {
        self.status().state
    }

    pub(crate) fn cause(&self) -> Option<Cause> {
        self.status().cause
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last inbound or outbound message.
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    /// Attaches the task running the service body, so that termination can
    /// cancel it. A conversation that already stopped cancels it right away.
    pub(crate) fn attach(&self, task: AbortHandle) {
        let mut status = self.status();
        if status.state == State::Active {
            status.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// The error a service observes once its inbound channel is closed.
    pub(crate) fn closed_error(&self) -> messenger::Error {
        match self.cause() {
            Some(Cause::TimedOut) => messenger::Error::TimedOut(self.id.clone()),
            _ => messenger::Error::Terminated(self.id.clone()),
        }
    }

    /// Leaves the `Active` state. Closes the inbound channel; already queued
    /// items stay readable. With `cancel`, the service task is aborted too,
    /// which takes effect at its next await point.
    fn begin_termination(&self, status: &mut Status, cause: Cause, cancel: bool) {
        status.state = State::Terminating;
        status.cause = Some(cause);
        status.inbound = None;
        if cancel {
            if let Some(task) = &status.task {
                task.abort();
            }
        }
        debug!(conversation = %self.id, ?cause, "conversation terminating");
    }

    /// Routes a client message to the service.
    ///
    /// Messages ahead of the expected index wait in the sequencer until the
    /// gap fills, unless they fall beyond the reorder window. Only accepted
    /// messages count as activity. A terminate message is honored whatever
    /// its index and never enters the sequencer.
    pub(crate) fn deliver_inbound(&self, message: ServiceMessage) -> Delivery {
        let mut status = self.status();
        if status.state != State::Active {
            return Delivery::Closed;
        }

        if message.is_terminate() {
            self.touch();
            self.begin_termination(&mut status, Cause::ClientTerminated, true);
            return Delivery::Accepted;
        }

        let index = message.index();
        match status.sequencer.admit(index) {
            Admission::Fresh => {}
            Admission::Duplicate => {
                debug!(conversation = %self.id, index, "dropped duplicate inbound message");
                return Delivery::Duplicate;
            }
            Admission::BeyondWindow => {
                warn!(
                    conversation = %self.id,
                    index,
                    expected = status.sequencer.next_expected(),
                    "refused inbound message beyond the reorder window"
                );
                return Delivery::BeyondWindow;
            }
        }
        self.touch();

        let released = status.sequencer.accept(message);
        if released.is_empty() {
            debug!(
                conversation = %self.id,
                index,
                expected = status.sequencer.next_expected(),
                buffered = status.sequencer.buffered(),
                "holding out-of-order inbound message"
            );
        }

        for ready in released {
            let Some(inbound) = status.inbound.clone() else { break };
            if ready.is_exception() {
                let description = ready.description().unwrap_or_default().to_string();
                warn!(conversation = %self.id, %description, "client reported a failure");
                let _ = inbound.send(Inbound::Exception(description));
                self.begin_termination(&mut status, Cause::ClientFailure, false);
            } else if let Some(payload) = ready.into_payload() {
                let _ = inbound.send(Inbound::Data(payload));
            }
        }
        Delivery::Accepted
    }

    /// Sends a data message from the service to the client.
    pub(crate) async fn send_data(&self, payload: Payload) -> messenger::Result<()> {
        let mut next = self.outbound.lock().await;
        if self.state() != State::Active {
            return Err(self.closed_error());
        }
        let message = ServiceMessage::data(self.id.clone(), *next, payload);
        *next += 1;
        self.touch();
        self.sink.send(message).await.map_err(messenger::Error::from)
    }

    /// Sends a control message. Sink failures are logged, never returned.
    async fn send_control(&self, build: impl FnOnce(ConversationId, u64) -> ServiceMessage) {
        let mut next = self.outbound.lock().await;
        let message = build(self.id.clone(), *next);
        *next += 1;
        self.touch();
        if let Err(e) = self.sink.send(message).await {
            warn!(conversation = %self.id, error = %e, "failed to deliver control message");
        }
    }

    /// Fails an active conversation: the failure goes out as an exception
    /// message and the service task is cancelled. A conversation that is
    /// already terminating keeps its first cause and sends nothing.
    pub(crate) async fn fail(&self, cause: Cause, failure: &Failure) {
        {
            let mut status = self.status();
            if status.state != State::Active {
                debug!(conversation = %self.id, %failure, "ignored failure of a stopping conversation");
                return;
            }
            self.begin_termination(&mut status, cause, true);
        }
        let description = failure.description();
        self.send_control(|id, index| ServiceMessage::exception(id, index, description))
            .await;
    }

    /// Ends an active conversation in an orderly way: the client receives a
    /// terminate message.
    pub(crate) async fn terminate(&self, cause: Cause) {
        {
            let mut status = self.status();
            if status.state != State::Active {
                return;
            }
            self.begin_termination(&mut status, cause, true);
        }
        self.send_control(ServiceMessage::terminate).await;
    }

    /// Reaps an idle conversation. An active one fails with a timeout; one
    /// that is already terminating just has its task cancelled.
    pub(crate) async fn time_out(&self, idle: Duration) {
        if self.state() == State::Active {
            warn!(conversation = %self.id, idle_ms = idle.as_millis() as u64, "conversation timed out");
            self.fail(Cause::TimedOut, &Failure::timeout(&self.id, idle)).await;
        } else {
            self.cancel();
        }
    }

    /// Aborts the service task without notifying the client.
    pub(crate) fn cancel(&self) {
        if let Some(task) = &self.status().task {
            task.abort();
        }
    }

    /// Waits for the service task and converts its outcome into the
    /// matching outbound message, then marks the conversation terminated.
    pub(crate) async fn supervise(&self, task: JoinHandle<Result<(), ServiceError>>) {
        match task.await {
            Ok(Ok(())) => self.terminate(Cause::ServiceFinished).await,
            Ok(Err(error)) => {
                if self.state() == State::Active {
                    warn!(conversation = %self.id, %error, "service failed");
                }
                self.fail(Cause::ServiceFailure, &Failure::from(error)).await;
            }
            Err(join) if join.is_panic() => {
                let failure = Failure::from_panic(join.into_panic());
                warn!(conversation = %self.id, %failure, "service panicked");
                self.fail(Cause::ServiceFailure, &failure).await;
            }
            Err(_) => debug!(conversation = %self.id, "service task cancelled"),
        }

        let cause = {
            let mut status = self.status();
            status.state = State::Terminated;
            status.inbound = None;
            status.task = None;
            status.cause
        };
        info!(
            conversation = %self.id,
            service_type = %self.service_type,
            ?cause,
            "conversation terminated"
        );
    }
}
