//! Storage traits shared by the in-memory and SQLite backends.
//!
//! A backend owns two tables: the append-only event log and the saga instance
//! table. The event log is written under a single writer; every row of one
//! `append` call commits together or not at all.

use std::sync::Arc;

use crate::error::StoreError;
use crate::event::{Event, LoadOrder, RecordedEvent};
use crate::registry::TypeRegistry;
use crate::saga::{SagaInstance, SagaStatus};

/// Transaction-scoped context handed to synchronous projection handlers.
///
/// On the SQLite backend `connection()` exposes the live write transaction,
/// so a read model stored in the same database commits or rolls back together
/// with the events that produced it.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionContext<'a> {
    replay: bool,
    conn: Option<&'a rusqlite::Connection>,
}

impl<'a> ProjectionContext<'a> {
    pub(crate) fn new(replay: bool, conn: Option<&'a rusqlite::Connection>) -> Self {
        Self { replay, conn }
    }

    /// `true` when the event is being re-driven by a replay rather than
    /// freshly appended.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// The open write transaction, when the backend has one.
    ///
    /// Always `None` on [`MemoryStorage`](crate::MemoryStorage), whose
    /// handlers' own side effects are not rolled back with a failed batch.
    pub fn connection(&self) -> Option<&'a rusqlite::Connection> {
        self.conn
    }
}

/// Callback run for each freshly written row while the append transaction is
/// still open. Returning an error rolls back the whole batch.
pub type RowCallback<'c, E> =
    dyn FnMut(&RecordedEvent<E>, &ProjectionContext<'_>) -> Result<(), StoreError> + 'c;

/// The append-only event log.
///
/// Implementations must serialize writers so that concurrent `append` calls
/// never interleave their sequence assignment, and readers must only observe
/// committed rows.
pub trait EventStorage<E: Event>: Send + Sync {
    /// The registry used to encode and decode payloads.
    fn registry(&self) -> &TypeRegistry<E>;

    /// Append a batch of events to one aggregate's stream.
    ///
    /// Each event is encoded, written, read back and decoded, then passed to
    /// `on_row` before the next one is written. The batch commits only if
    /// every step succeeds for every event.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NoEvents`] if `events` is empty.
    /// - [`StoreError::UnregisteredType`] / [`StoreError::MalformedPayload`]
    ///   if an event cannot be encoded or decoded.
    /// - Whatever `on_row` returns.
    fn append(
        &self,
        aggregate_id: &str,
        events: &[E],
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError>;

    /// Every committed event for `aggregate_id`, sequence ascending.
    ///
    /// An unknown id yields an empty vector.
    fn load_stream(&self, aggregate_id: &str) -> Result<Vec<RecordedEvent<E>>, StoreError>;

    /// The entire log in the given order.
    fn load_all(&self, order: LoadOrder) -> Result<Vec<RecordedEvent<E>>, StoreError>;

    /// Every committed event with `sequence >= from`, ascending.
    fn load_from(&self, from: i64) -> Result<Vec<RecordedEvent<E>>, StoreError>;

    /// Distinct aggregate ids starting with `prefix` (ASCII case-insensitive),
    /// sorted.
    fn aggregate_ids(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Highest committed sequence, or `0` for an empty log.
    fn last_sequence(&self) -> Result<i64, StoreError>;

    /// Re-drive every event with `sequence >= from` through `on_row` with a
    /// replay-flagged context, and return those events.
    ///
    /// The events are read after the write lock is taken, so no append can
    /// commit between the read and the callbacks. Whatever `on_row` wrote
    /// through the context commits only if every call succeeds.
    fn replay_scope(
        &self,
        from: i64,
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError>;
}

/// Persistence of [`SagaInstance`] rows.
///
/// Instances are never deleted. A row leaves `running` exactly once.
pub trait SagaInstanceStorage: Send + Sync {
    /// Insert a new `running` instance for `(event_id, saga_name)`.
    fn start_saga(&self, event_id: i64, saga_name: &str) -> Result<SagaInstance, StoreError>;

    /// Move a `running` instance to `completed`.
    ///
    /// # Errors
    ///
    /// [`StoreError::SagaNotRunning`] if the row is missing or already
    /// terminal.
    fn complete_saga(&self, id: i64) -> Result<SagaInstance, StoreError>;

    /// Move a `running` instance to `error`, recording `message`.
    ///
    /// # Errors
    ///
    /// [`StoreError::SagaNotRunning`] if the row is missing or already
    /// terminal.
    fn fail_saga(&self, id: i64, message: &str) -> Result<SagaInstance, StoreError>;

    /// Look up one instance.
    fn saga_instance(&self, id: i64) -> Result<Option<SagaInstance>, StoreError>;

    /// Every instance created for `event_id`, oldest first.
    fn saga_instances_for(&self, event_id: i64) -> Result<Vec<SagaInstance>, StoreError>;

    /// Every instance currently in `status`, oldest first.
    fn saga_instances_with_status(
        &self,
        status: SagaStatus,
    ) -> Result<Vec<SagaInstance>, StoreError>;
}

/// A complete backend: event log plus saga instance table.
pub trait Backend<E: Event>: EventStorage<E> + SagaInstanceStorage {}

impl<E: Event, T: EventStorage<E> + SagaInstanceStorage> Backend<E> for T {}

impl<E: Event, T: EventStorage<E> + ?Sized> EventStorage<E> for Arc<T> {
    fn registry(&self) -> &TypeRegistry<E> {
        (**self).registry()
    }

    fn append(
        &self,
        aggregate_id: &str,
        events: &[E],
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        (**self).append(aggregate_id, events, on_row)
    }

    fn load_stream(&self, aggregate_id: &str) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn load_all(&self, order: LoadOrder) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        (**self).load_all(order)
    }

    fn load_from(&self, from: i64) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        (**self).load_from(from)
    }

    fn aggregate_ids(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).aggregate_ids(prefix)
    }

    fn last_sequence(&self) -> Result<i64, StoreError> {
        (**self).last_sequence()
    }

    fn replay_scope(
        &self,
        from: i64,
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        (**self).replay_scope(from, on_row)
    }
}

impl<T: SagaInstanceStorage + ?Sized> SagaInstanceStorage for Arc<T> {
    fn start_saga(&self, event_id: i64, saga_name: &str) -> Result<SagaInstance, StoreError> {
        (**self).start_saga(event_id, saga_name)
    }

    fn complete_saga(&self, id: i64) -> Result<SagaInstance, StoreError> {
        (**self).complete_saga(id)
    }

    fn fail_saga(&self, id: i64, message: &str) -> Result<SagaInstance, StoreError> {
        (**self).fail_saga(id, message)
    }

    fn saga_instance(&self, id: i64) -> Result<Option<SagaInstance>, StoreError> {
        (**self).saga_instance(id)
    }

    fn saga_instances_for(&self, event_id: i64) -> Result<Vec<SagaInstance>, StoreError> {
        (**self).saga_instances_for(event_id)
    }

    fn saga_instances_with_status(
        &self,
        status: SagaStatus,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        (**self).saga_instances_with_status(status)
    }
}

/// ASCII case-insensitive prefix test used by `aggregate_ids`.
pub(crate) fn has_prefix_ignore_case(id: &str, prefix: &str) -> bool {
    id.len() >= prefix.len()
        && id.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
