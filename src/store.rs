//! The event store: a backend plus its projections, sagas and publishers.

use std::fmt;
use std::sync::Arc;

use crate::bus::Publisher;
use crate::error::{HandlerError, StoreError};
use crate::event::{Event, LoadOrder, RecordedEvent};
use crate::projection::ProjectionDispatcher;
use crate::registry::TypeRegistry;
use crate::replay::ReplayEngine;
use crate::saga::{SagaInstance, SagaOrchestrator, SagaReport, SagaStatus};
use crate::storage::{Backend, ProjectionContext};

pub(crate) struct Inner<E, S> {
    pub(crate) storage: S,
    pub(crate) projections: ProjectionDispatcher<E>,
    pub(crate) sagas: SagaOrchestrator<E>,
    pub(crate) publishers: Vec<Box<dyn Publisher<E>>>,
}

/// Append-only event log with synchronous projections and post-commit sagas.
///
/// `EventStore` is cheap to clone (it wraps an `Arc`) and safe to share across
/// threads. Handlers are fixed at [`build`](EventStoreBuilder::build) time.
///
/// An [`append`](EventStore::append) runs in three phases:
///
/// 1. Under the backend's write lock, each event is encoded, written, decoded
///    back and passed to the projection handlers registered for its type. Any
///    failure rolls back the whole batch.
/// 2. After commit, each saga registered for the event's type runs with its
///    own tracked [`SagaInstance`]. Saga failures are recorded, not returned.
/// 3. Publishers receive the event. Their errors are logged and dropped.
///
/// # Examples
///
/// ```
/// use evoke::{EventStore, MemoryStorage, TypeRegistry};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum OrderEvent {
///     OrderCreated { id: String },
///     OrderShipped { id: String },
/// }
///
/// let mut registry = TypeRegistry::new();
/// registry.register_all(["OrderCreated", "OrderShipped"]);
/// let store = EventStore::builder(MemoryStorage::new(registry)).build();
///
/// store.append("A", &[OrderEvent::OrderCreated { id: "A".into() }]).unwrap();
/// store.append("A", &[OrderEvent::OrderShipped { id: "A".into() }]).unwrap();
///
/// let stream = store.load_stream("A").unwrap();
/// assert_eq!(stream[0].sequence, 1);
/// assert_eq!(stream[1].event_type, "OrderShipped");
/// ```
pub struct EventStore<E, S> {
    pub(crate) inner: Arc<Inner<E, S>>,
}

impl<E, S> Clone for EventStore<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, S: fmt::Debug> fmt::Debug for EventStore<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("storage", &self.inner.storage)
            .field("projections", &self.inner.projections)
            .field("sagas", &self.inner.sagas)
            .field("publishers", &self.inner.publishers.len())
            .finish()
    }
}

impl<E: Event, S: Backend<E>> EventStore<E, S> {
    /// Start configuring a store over `storage`.
    pub fn builder(storage: S) -> EventStoreBuilder<E, S> {
        EventStoreBuilder {
            storage,
            projections: ProjectionDispatcher::new(),
            sagas: SagaOrchestrator::new(),
            publishers: Vec::new(),
        }
    }

    /// A store with no handlers.
    pub fn new(storage: S) -> Self {
        Self::builder(storage).build()
    }

    /// Append events to one aggregate's stream.
    ///
    /// Returns the recorded events as a later load would produce them. Once
    /// this returns `Ok`, the events are committed and every matching saga
    /// has run.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NoEvents`] for an empty batch.
    /// - [`StoreError::UnregisteredType`] / [`StoreError::MalformedPayload`]
    ///   if an event cannot be encoded; nothing is written.
    /// - [`StoreError::HandlerFailed`] if a projection rejects an event;
    ///   nothing is written.
    /// - [`StoreError::Storage`] if the backend fails.
    pub fn append(
        &self,
        aggregate_id: &str,
        events: &[E],
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let _span = tracing::debug_span!("append", aggregate_id, count = events.len()).entered();

        let inner = &*self.inner;
        let recorded = inner
            .storage
            .append(aggregate_id, events, &mut |event, ctx| {
                inner.projections.dispatch(event, ctx)
            })?;

        if let (Some(first), Some(last)) = (recorded.first(), recorded.last()) {
            tracing::info!(
                aggregate_id,
                first = first.sequence,
                last = last.sequence,
                "events committed"
            );
        }

        for event in &recorded {
            self.publish(event, false)?;
        }
        Ok(recorded)
    }

    /// Run the sagas and publishers for an already committed event.
    ///
    /// `append` calls this for every event it records. Calling it directly
    /// re-dispatches an event and creates new saga instances; existing
    /// instances are never touched.
    ///
    /// # Errors
    ///
    /// Only storage failures while writing saga instances. Saga and publisher
    /// failures are recorded or logged instead.
    pub fn publish(
        &self,
        event: &RecordedEvent<E>,
        replay: bool,
    ) -> Result<SagaReport, StoreError> {
        let inner = &*self.inner;
        let report = inner.sagas.dispatch(&inner.storage, event, replay)?;
        self.notify(event, replay);
        Ok(report)
    }

    fn notify(&self, event: &RecordedEvent<E>, replay: bool) {
        for publisher in &self.inner.publishers {
            if let Err(error) = publisher.publish(event, replay) {
                tracing::warn!(
                    sequence = event.sequence,
                    event_type = %event.event_type,
                    error = %error,
                    "publisher failed"
                );
            }
        }
    }

    /// Every committed event for `aggregate_id`, oldest first.
    pub fn load_stream(&self, aggregate_id: &str) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        self.inner.storage.load_stream(aggregate_id)
    }

    /// The whole log in the given order.
    pub fn load_all(&self, order: LoadOrder) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        self.inner.storage.load_all(order)
    }

    /// Every committed event with `sequence >= from`, ascending.
    pub fn load_from(&self, from: i64) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        self.inner.storage.load_from(from)
    }

    /// Highest committed sequence, `0` when the log is empty.
    pub fn last_sequence(&self) -> Result<i64, StoreError> {
        self.inner.storage.last_sequence()
    }

    /// Distinct aggregate ids starting with `prefix`, case-insensitively.
    pub fn aggregate_ids(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.storage.aggregate_ids(prefix)
    }

    /// Expand an abbreviated aggregate id to the single id it names.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AggregateNotFound`] if nothing starts with `prefix`.
    /// - [`StoreError::AmbiguousAggregateId`] if more than one id does.
    pub fn resolve_aggregate_id(&self, prefix: &str) -> Result<String, StoreError> {
        let mut matches = self.aggregate_ids(prefix)?;
        match matches.len() {
            0 => Err(StoreError::AggregateNotFound {
                prefix: prefix.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(StoreError::AmbiguousAggregateId {
                prefix: prefix.to_string(),
                matches,
            }),
        }
    }

    /// Look up one saga instance.
    pub fn saga_instance(&self, id: i64) -> Result<Option<SagaInstance>, StoreError> {
        self.inner.storage.saga_instance(id)
    }

    /// Every saga instance created for the event at `sequence`.
    pub fn saga_instances_for(&self, sequence: i64) -> Result<Vec<SagaInstance>, StoreError> {
        self.inner.storage.saga_instances_for(sequence)
    }

    /// Every saga instance in `status`, e.g. to sweep `Error` rows.
    pub fn saga_instances_with_status(
        &self,
        status: SagaStatus,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        self.inner.storage.saga_instances_with_status(status)
    }

    /// Replay historical events through the registered handlers.
    pub fn replay(&self) -> ReplayEngine<'_, E, S> {
        ReplayEngine::new(self)
    }

    /// The type registry shared with the backend.
    pub fn registry(&self) -> &TypeRegistry<E> {
        self.inner.storage.registry()
    }

    /// The backend.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }
}

/// Builder for [`EventStore`].
///
/// Handlers registered here are the only ones the store will ever run.
pub struct EventStoreBuilder<E, S> {
    storage: S,
    projections: ProjectionDispatcher<E>,
    sagas: SagaOrchestrator<E>,
    publishers: Vec<Box<dyn Publisher<E>>>,
}

impl<E: Event, S: Backend<E>> EventStoreBuilder<E, S> {
    /// Register a synchronous projection handler for `event_type`.
    ///
    /// See [`ProjectionDispatcher::register_sync`].
    pub fn register_sync<F>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RecordedEvent<E>, &ProjectionContext<'_>) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.projections.register_sync(event_type, handler);
        self
    }

    /// Register a named saga for `event_type`.
    ///
    /// See [`SagaOrchestrator::register_async`].
    pub fn register_async<F>(
        mut self,
        name: impl Into<String>,
        event_type: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.sagas.register_async(name, event_type, handler);
        self
    }

    /// Add a publisher that receives every committed event after its sagas.
    pub fn publisher(mut self, publisher: impl Publisher<E> + 'static) -> Self {
        self.publishers.push(Box::new(publisher));
        self
    }

    /// Freeze the configuration.
    pub fn build(self) -> EventStore<E, S> {
        EventStore {
            inner: Arc::new(Inner {
                storage: self.storage,
                projections: self.projections,
                sagas: self.sagas,
                publishers: self.publishers,
            }),
        }
    }
}
