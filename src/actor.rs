//! Actor loop that owns an aggregate handler and processes its commands one at
//! a time.
//!
//! The actor runs on a dedicated thread and sequentially processes messages
//! from an `mpsc` channel, so commands sent through one handle (or any of its
//! clones) never race each other between load and append.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle) and
//! [`spawn_actor`] (starts the actor thread).

use std::fmt;
use std::io;

use tokio::sync::{mpsc, oneshot};

use crate::aggregate::{Aggregate, AggregateHandler, Command, Loaded};
use crate::error::ExecuteError;
use crate::event::RecordedEvent;
use crate::storage::Backend;

/// Bounded mailbox size; senders wait once it is full.
const MAILBOX_CAPACITY: usize = 64;

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> = Result<
    Vec<RecordedEvent<<A as Aggregate>::Event>>,
    ExecuteError<<A as Aggregate>::Error>,
>;

/// Result type sent back through the `Load` reply channel.
type LoadResult<A> = Result<Loaded<A>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from `AggregateHandle` to the actor loop.
///
/// Each variant carries a `oneshot::Sender` for the actor to reply on
/// once the operation completes.
enum ActorMessage<A: Aggregate> {
    /// Execute a command against its aggregate.
    Execute {
        cmd: A::Command,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Fold an aggregate's stream and return it.
    Load {
        aggregate_id: String,
        reply: oneshot::Sender<LoadResult<A>>,
    },

    /// Gracefully shut down the actor loop.
    Shutdown,
}

/// Runs the actor loop until the channel closes or `Shutdown` arrives.
fn run_actor<A, S>(handler: AggregateHandler<A, S>, mut rx: mpsc::Receiver<ActorMessage<A>>)
where
    A: Aggregate,
    S: Backend<A::Event>,
{
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            ActorMessage::Execute { cmd, reply } => {
                let _span = tracing::info_span!(
                    "execute",
                    aggregate_type = A::AGGREGATE_TYPE,
                    aggregate_id = cmd.aggregate_id(),
                )
                .entered();
                let result = handler.handle(cmd);
                // If the receiver was dropped, the caller no longer cares
                // about the result. Silently discard it.
                let _ = reply.send(result);
            }

            ActorMessage::Load {
                aggregate_id,
                reply,
            } => {
                let _ = reply.send(handler.load(&aggregate_id));
            }

            ActorMessage::Shutdown => break,
        }
    }
    tracing::debug!(aggregate_type = A::AGGREGATE_TYPE, "actor stopped");
}

/// Async handle to a running aggregate actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the
/// actor thread over a bounded channel.
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<ActorMessage<A>>,
}

impl<A: Aggregate> fmt::Debug for AggregateHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandle")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// Manual `Clone` because `A` itself need not be `Clone` for the handle.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the actor and wait for the result.
    ///
    /// # Returns
    ///
    /// The recorded events (empty for a no-op command).
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Apply`] -- the stream could not be folded.
    /// * [`ExecuteError::Store`] -- loading or appending failed.
    /// * [`ExecuteError::ActorGone`] -- the actor thread has exited.
    pub async fn execute(&self, cmd: A::Command) -> ExecuteResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute { cmd, reply: tx })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Fold and return the current state of `aggregate_id`.
    ///
    /// Runs on the actor, so it observes every command sent before it.
    pub async fn state(&self, aggregate_id: impl Into<String>) -> LoadResult<A> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Load {
                aggregate_id: aggregate_id.into(),
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Ask the actor to stop after the messages already queued.
    ///
    /// Returns immediately; a no-op if the actor has already exited.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }

    /// Check whether the actor backing this handle is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Start an actor thread that owns `handler`.
///
/// The thread exits once every handle is dropped or
/// [`shutdown`](AggregateHandle::shutdown) is processed.
///
/// # Errors
///
/// Returns [`std::io::Error`] if the thread cannot be spawned.
pub fn spawn_actor<A, S>(handler: AggregateHandler<A, S>) -> io::Result<AggregateHandle<A>>
where
    A: Aggregate,
    S: Backend<A::Event> + 'static,
{
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(MAILBOX_CAPACITY);
    std::thread::Builder::new()
        .name(format!("evoke-actor-{}", A::AGGREGATE_TYPE))
        .spawn(move || run_actor(handler, rx))?;
    Ok(AggregateHandle { sender: tx })
}
