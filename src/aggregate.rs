//! Aggregate and command traits, and the handler that rehydrates an aggregate
//! from its stream before every command.

use std::fmt;
use std::sync::Arc;

use crate::error::ExecuteError;
use crate::event::{Event, RecordedEvent};
use crate::storage::Backend;
use crate::store::EventStore;

/// A command addressed to one aggregate.
pub trait Command: Send + 'static {
    /// Id of the aggregate the command targets.
    fn aggregate_id(&self) -> &str;
}

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. It is never
/// persisted: every command rebuilds it from scratch by folding its stream
/// through [`apply`](Aggregate::apply).
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `Event`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection and fold error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
/// - [`apply`](Aggregate::apply) must be a pure, order-sensitive fold with no
///   hidden external state. It takes ownership of the current state and
///   returns the next one, or an error if the event cannot follow the
///   current state.
pub trait Aggregate: Send + Sized + 'static {
    /// Identifies this aggregate type (e.g. "order"). Used in log fields.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Command;

    /// The set of events this aggregate can produce and apply.
    type Event: Event;

    /// Command rejection / fold error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Result<Self, Self::Error>;
}

/// An aggregate folded from its stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<A> {
    /// The current state.
    pub state: A,
    /// Number of events folded.
    pub version: u64,
    /// Sequence of the last folded event, `0` for an empty stream.
    pub last_sequence: i64,
}

type Factory<A> = Arc<dyn Fn(&str) -> A + Send + Sync>;

/// Runs commands against aggregates of type `A`: load, fold, decide, append.
///
/// Cheap to clone; clones share the store and the factory.
pub struct AggregateHandler<A: Aggregate, S> {
    store: EventStore<A::Event, S>,
    factory: Factory<A>,
}

impl<A: Aggregate, S> Clone for AggregateHandler<A, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<A: Aggregate, S> fmt::Debug for AggregateHandler<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandler")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate + Default, S: Backend<A::Event>> AggregateHandler<A, S> {
    /// A handler that starts every aggregate from `A::default()`.
    pub fn with_default(store: EventStore<A::Event, S>) -> Self {
        Self::new(store, |_| A::default())
    }
}

impl<A: Aggregate, S: Backend<A::Event>> AggregateHandler<A, S> {
    /// A handler that builds the empty aggregate for an id with `factory`.
    pub fn new<F>(store: EventStore<A::Event, S>, factory: F) -> Self
    where
        F: Fn(&str) -> A + Send + Sync + 'static,
    {
        Self {
            store,
            factory: Arc::new(factory),
        }
    }

    /// The store commands are appended to.
    pub fn store(&self) -> &EventStore<A::Event, S> {
        &self.store
    }

    /// Rebuild the aggregate for `aggregate_id` from its full stream.
    ///
    /// An id with no events yields the factory's empty aggregate at
    /// version 0.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Store`] if the stream cannot be read or decoded.
    /// - [`ExecuteError::Apply`] if an event cannot be folded; no partial
    ///   state is returned.
    pub fn load(&self, aggregate_id: &str) -> Result<Loaded<A>, ExecuteError<A::Error>> {
        let stream = self.store.load_stream(aggregate_id)?;
        fold((self.factory)(aggregate_id), &stream)
    }

    /// Handle one command.
    ///
    /// Returns the recorded events, or an empty vector when the aggregate
    /// decided the command was a no-op (nothing is appended then).
    ///
    /// Commands for the same aggregate from different callers are not
    /// serialized against each other; use an
    /// [`AggregateHandle`](crate::AggregateHandle) for that.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Domain`] if the aggregate rejects the command.
    /// - [`ExecuteError::Apply`] if the stream cannot be folded.
    /// - [`ExecuteError::Store`] if loading or appending fails.
    pub fn handle(
        &self,
        cmd: A::Command,
    ) -> Result<Vec<RecordedEvent<A::Event>>, ExecuteError<A::Error>> {
        let aggregate_id = cmd.aggregate_id().to_string();
        let _span = tracing::debug_span!(
            "handle",
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %aggregate_id,
        )
        .entered();

        let loaded = self.load(&aggregate_id)?;
        let events = loaded.state.handle(cmd).map_err(ExecuteError::Domain)?;
        if events.is_empty() {
            tracing::debug!(version = loaded.version, "command produced no events");
            return Ok(Vec::new());
        }
        Ok(self.store.append(&aggregate_id, &events)?)
    }
}

fn fold<A: Aggregate>(
    mut state: A,
    stream: &[RecordedEvent<A::Event>],
) -> Result<Loaded<A>, ExecuteError<A::Error>> {
    let mut last_sequence = 0;
    for event in stream {
        state = state
            .apply(&event.payload)
            .map_err(|source| ExecuteError::Apply {
                sequence: event.sequence,
                source,
            })?;
        last_sequence = event.sequence;
    }
    Ok(Loaded {
        state,
        version: stream.len() as u64,
        last_sequence,
    })
}
