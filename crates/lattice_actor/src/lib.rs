//! # Lattice Actor - Per-Entity Sequential Processing
//!
//! A single-mailbox actor primitive: many producers, one consumer, strict
//! FIFO processing. Each actor owns its state outright — the processing
//! loop is the only code that ever touches it, so entity logic (a room, a
//! match, a player session) mutates freely without locks.
//!
//! Two ways to send:
//!
//! * [`Actor::tell`] — fire-and-forget, never blocks; a full mailbox is an
//!   immediate error, not a silent drop and not an unbounded queue
//! * [`Actor::ask`] — request/response; the caller awaits exactly one of a
//!   reply, a processing error, its own timeout, or an actor-stopped error
//!
//! Stopping is one-way: [`Actor::stop`] preempts whatever is still queued,
//! answers every pending ask with a stopped error, and joins the loop so no
//! state mutation can happen after it returns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Mailbox capacity used when the caller passes zero.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 128;

/// Identifier of one actor instance. Uniqueness is the caller's concern;
/// services hand out IDs from an injected generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActorId(pub i64);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced to senders.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    /// The mailbox is at capacity; the message was not enqueued.
    #[error("actor mailbox is full")]
    MailboxFull,

    /// The actor has stopped; no further messages are accepted.
    #[error("actor stopped, cannot deliver message")]
    Stopped,

    /// The actor stopped while this message was still queued.
    #[error("actor stopped before processing message")]
    StoppedBeforeProcessing,

    /// The caller's own wait bound fired. The actor still processes the
    /// message; only the waiting side gave up.
    #[error("ask timed out after {0:?}")]
    AskTimedOut(Duration),

    /// The processor returned an error for an ask message.
    #[error("message processing failed: {0}")]
    Processing(String),
}

/// Errors a processor may return; the display text is what ask callers see
/// inside [`ActorError::Processing`].
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Ambient information handed to the processor with every message.
#[derive(Debug, Clone)]
pub struct ActorContext {
    id: ActorId,
    name: String,
}

impl ActorContext {
    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The behavior of one actor: invoked for each message, strictly one at a
/// time, with exclusive `&mut` access to the processor's state.
#[async_trait]
pub trait ActorProcessor: Send + 'static {
    type Message: Send + 'static;
    type Response: Send + 'static;

    async fn process(
        &mut self,
        ctx: &ActorContext,
        message: Self::Message,
    ) -> Result<Self::Response, ProcessError>;
}

enum Envelope<P: ActorProcessor> {
    Tell(P::Message),
    Ask(
        P::Message,
        oneshot::Sender<Result<P::Response, ActorError>>,
    ),
}

struct Shared {
    id: ActorId,
    name: String,
    stopped: AtomicBool,
    stop_notify: Notify,
}

/// Handle to a running actor. Clones share the same mailbox and loop.
pub struct Actor<P: ActorProcessor> {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Envelope<P>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<P: ActorProcessor> Clone for Actor<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            sender: self.sender.clone(),
            join: self.join.clone(),
        }
    }
}

impl<P: ActorProcessor> Actor<P> {
    /// Starts an actor: allocates its mailbox and spawns the processing
    /// loop. A `mailbox_capacity` of zero selects the default.
    pub fn spawn(
        id: ActorId,
        name: impl Into<String>,
        processor: P,
        mailbox_capacity: usize,
    ) -> Self {
        let capacity = if mailbox_capacity == 0 {
            DEFAULT_MAILBOX_CAPACITY
        } else {
            mailbox_capacity
        };
        let (sender, receiver) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            id,
            name: name.into(),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        });
        let handle = tokio::spawn(run_loop(shared.clone(), receiver, processor));
        Self {
            shared,
            sender,
            join: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn id(&self) -> ActorId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueues a fire-and-forget message. Never blocks: a full mailbox is
    /// [`ActorError::MailboxFull`], a stopped actor [`ActorError::Stopped`].
    pub fn tell(&self, message: P::Message) -> Result<(), ActorError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ActorError::Stopped);
        }
        match self.sender.try_send(Envelope::Tell(message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "actor {} ({}) mailbox full, message rejected",
                    self.shared.name, self.shared.id
                );
                Err(ActorError::MailboxFull)
            }
            Err(TrySendError::Closed(_)) => Err(ActorError::Stopped),
        }
    }

    /// Enqueues a message and awaits its result.
    ///
    /// Exactly one outcome is observed: the processor's reply, the
    /// processor's error, a stopped error, or — when the caller wraps this
    /// future in its own timeout or drops it — nothing at all on this side
    /// while the actor still finishes the message.
    pub async fn ask(&self, message: P::Message) -> Result<P::Response, ActorError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ActorError::Stopped);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Envelope::Ask(message, reply_tx))
            .await
            .map_err(|_| ActorError::Stopped)?;
        match reply_rx.await {
            Ok(result) => result,
            // The loop dropped the reply slot without answering, which only
            // happens when the actor went away mid-flight.
            Err(_) => Err(ActorError::Stopped),
        }
    }

    /// [`ask`](Self::ask) bounded by `timeout`. On expiry the message is
    /// not retracted; the actor processes it without anyone waiting.
    pub async fn ask_timeout(
        &self,
        message: P::Message,
        timeout: Duration,
    ) -> Result<P::Response, ActorError> {
        match tokio::time::timeout(timeout, self.ask(message)).await {
            Ok(result) => result,
            Err(_) => Err(ActorError::AskTimedOut(timeout)),
        }
    }

    /// Stops the actor: the loop finishes the message it is processing (if
    /// any), skips everything still queued — answering pending asks with
    /// [`ActorError::StoppedBeforeProcessing`] — and exits. Returns once
    /// the loop has fully terminated, so no state mutation happens after.
    ///
    /// Safe to call more than once; when stops race, the first caller
    /// performs the join.
    pub async fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            self.shared.stop_notify.notify_one();
        }
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("actor {} ({}) loop task failed: {e}", self.shared.name, self.shared.id);
            }
        }
    }

    /// True once `stop` has been requested.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

async fn run_loop<P: ActorProcessor>(
    shared: Arc<Shared>,
    mut receiver: mpsc::Receiver<Envelope<P>>,
    mut processor: P,
) {
    debug!("actor {} ({}) loop started", shared.name, shared.id);
    let ctx = ActorContext {
        id: shared.id,
        name: shared.name.clone(),
    };

    loop {
        tokio::select! {
            // Stop preempts queued messages, never an in-flight one.
            biased;
            _ = shared.stop_notify.notified() => break,
            envelope = receiver.recv() => {
                let Some(envelope) = envelope else {
                    // Every handle dropped without stop(); nothing more can
                    // arrive, so wind down.
                    break;
                };
                match envelope {
                    Envelope::Tell(message) => {
                        if let Err(e) = processor.process(&ctx, message).await {
                            error!(
                                "actor {} ({}) error processing tell message: {e}",
                                shared.name, shared.id
                            );
                        }
                    }
                    Envelope::Ask(message, reply) => {
                        let result = processor
                            .process(&ctx, message)
                            .await
                            .map_err(|e| ActorError::Processing(e.to_string()));
                        // The caller may have timed out and dropped its end.
                        let _ = reply.send(result);
                    }
                }
            }
        }
    }

    // Drain: reject everything still queued so no ask waiter hangs.
    receiver.close();
    while let Ok(envelope) = receiver.try_recv() {
        if let Envelope::Ask(_, reply) = envelope {
            let _ = reply.send(Err(ActorError::StoppedBeforeProcessing));
        }
    }
    debug!("actor {} ({}) loop stopped", shared.name, shared.id);
}
