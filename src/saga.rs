//! Sagas: post-commit side effects with persisted, failure-tracked instances.
//!
//! A saga reacts to one event type after the append that recorded it has
//! committed. Every invocation is tracked by a [`SagaInstance`] row that is
//! created as `running` before the handler runs and moved to `completed` or
//! `error` once it returns. A failing saga never undoes the event and never
//! prevents the next saga from running.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{HandlerError, StoreError};
use crate::event::{Event, RecordedEvent};
use crate::storage::SagaInstanceStorage;

/// Lifecycle status of a [`SagaInstance`].
///
/// Transitions are `Running -> Completed` or `Running -> Error`; a terminal
/// status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    /// The handler has been dispatched and has not returned yet.
    Running,
    /// The handler returned `Ok`.
    Completed,
    /// The handler returned an error or panicked.
    Error,
}

impl SagaStatus {
    /// The stored text form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parse the stored text form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// `true` for `Completed` and `Error`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SagaStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SagaStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown saga status {s:?}").into()))
    }
}

/// One tracked invocation of a saga handler for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Auto-incremented instance id.
    pub id: i64,
    /// Sequence of the event that triggered the saga.
    pub event_id: i64,
    /// Name the saga was registered under.
    pub saga_name: String,
    /// Current lifecycle status.
    pub status: SagaStatus,
    /// Error message captured when the handler failed.
    pub last_error: Option<String>,
    /// When the instance was started.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of dispatching one event (or a batch) to the registered sagas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SagaReport {
    /// Number of instances created.
    pub started: usize,
    /// Number of instances that reached `completed`.
    pub completed: usize,
    /// Number of instances that reached `error`.
    pub failed: usize,
    /// The instances in their final state, in dispatch order.
    pub instances: Vec<SagaInstance>,
}

impl SagaReport {
    /// Fold another report into this one.
    pub fn merge(&mut self, other: SagaReport) {
        self.started += other.started;
        self.completed += other.completed;
        self.failed += other.failed;
        self.instances.extend(other.instances);
    }

    fn record(&mut self, instance: SagaInstance) {
        self.started += 1;
        match instance.status {
            SagaStatus::Completed => self.completed += 1,
            SagaStatus::Error => self.failed += 1,
            SagaStatus::Running => {}
        }
        self.instances.push(instance);
    }
}

/// A saga handler. Receives the committed event and the replay flag.
pub type SagaHandler<E> =
    Arc<dyn Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError> + Send + Sync>;

struct SagaEntry<E> {
    name: String,
    event_type: String,
    handler: SagaHandler<E>,
}

/// Ordered table of named saga handlers.
///
/// Handlers for an event type run in registration order. Populated before
/// traffic and read-only afterwards.
pub struct SagaOrchestrator<E> {
    entries: Vec<SagaEntry<E>>,
}

impl<E> fmt::Debug for SagaOrchestrator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| (e.name.as_str(), e.event_type.as_str())),
            )
            .finish()
    }
}

impl<E: Event> Default for SagaOrchestrator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> SagaOrchestrator<E> {
    /// Create an empty orchestrator.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Bind a named handler to an event type.
    ///
    /// The same name may be registered for several event types.
    pub fn register_async<F>(
        &mut self,
        name: impl Into<String>,
        event_type: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&RecordedEvent<E>, bool) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.entries.push(SagaEntry {
            name: name.into(),
            event_type: event_type.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Returns `true` if no saga is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every saga registered for `event.event_type`.
    ///
    /// Each handler gets its own instance row. Handler errors and panics are
    /// recorded on that row and dispatch moves on to the next handler.
    ///
    /// # Errors
    ///
    /// Only storage failures while writing instance rows are returned.
    pub fn dispatch<S>(
        &self,
        storage: &S,
        event: &RecordedEvent<E>,
        replay: bool,
    ) -> Result<SagaReport, StoreError>
    where
        S: SagaInstanceStorage + ?Sized,
    {
        let mut report = SagaReport::default();
        for entry in self.entries.iter().filter(|e| e.event_type == event.event_type) {
            let instance = storage.start_saga(event.sequence, &entry.name)?;
            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.handler)(event, replay)));
            let finished = match outcome {
                Ok(Ok(())) => storage.complete_saga(instance.id)?,
                Ok(Err(e)) => {
                    let message = e.to_string();
                    tracing::error!(
                        saga = %entry.name,
                        sequence = event.sequence,
                        instance = instance.id,
                        error = %message,
                        "saga handler failed"
                    );
                    storage.fail_saga(instance.id, &message)?
                }
                Err(panic) => {
                    let message = format!("saga handler panicked: {}", panic_message(&*panic));
                    tracing::error!(
                        saga = %entry.name,
                        sequence = event.sequence,
                        instance = instance.id,
                        error = %message,
                        "saga handler panicked"
                    );
                    storage.fail_saga(instance.id, &message)?
                }
            };
            report.record(finished);
        }
        Ok(report)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::aggregate::test_fixtures::{OrderEvent, order_registry};
    use crate::memory::MemoryStorage;
    use crate::storage::EventStorage;

    fn committed(storage: &MemoryStorage<OrderEvent>) -> RecordedEvent<OrderEvent> {
        storage
            .append(
                "A",
                &[OrderEvent::OrderCreated { id: "A".into() }],
                &mut |_, _| Ok(()),
            )
            .expect("append should succeed")
            .remove(0)
    }

    #[test]
    fn status_text_roundtrip() {
        for status in [SagaStatus::Running, SagaStatus::Completed, SagaStatus::Error] {
            assert_eq!(SagaStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SagaStatus::parse("paused"), None);
        assert!(!SagaStatus::Running.is_terminal());
        assert!(SagaStatus::Error.is_terminal());
    }

    #[test]
    fn failing_saga_does_not_block_the_next() {
        let storage = MemoryStorage::new(order_registry());
        let event = committed(&storage);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_b = Arc::clone(&ran);
        let mut sagas = SagaOrchestrator::new();
        sagas
            .register_async("notify", "OrderCreated", |_, _| Err("smtp down".into()))
            .register_async("reserve", "OrderCreated", move |_, _| {
                ran_b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register_async("ignored", "OrderShipped", |_, _| Ok(()));

        let report = sagas.dispatch(&storage, &event, false).unwrap();
        assert_eq!(report.started, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let notify = &report.instances[0];
        assert_eq!(notify.saga_name, "notify");
        assert_eq!(notify.status, SagaStatus::Error);
        assert_eq!(notify.last_error.as_deref(), Some("smtp down"));
        assert_eq!(report.instances[1].status, SagaStatus::Completed);
        assert!(report.instances[1].last_error.is_none());
    }

    #[test]
    fn panicking_saga_is_recorded_as_error() {
        let storage = MemoryStorage::new(order_registry());
        let event = committed(&storage);

        let mut sagas = SagaOrchestrator::new();
        sagas.register_async("boom", "OrderCreated", |_, _| panic!("exploded"));

        let report = sagas.dispatch(&storage, &event, false).unwrap();
        assert_eq!(report.failed, 1);
        let message = report.instances[0].last_error.clone().unwrap_or_default();
        assert!(message.contains("exploded"), "got {message}");
    }

    #[test]
    fn handlers_see_replay_flag() {
        let storage = MemoryStorage::new(order_registry());
        let event = committed(&storage);

        let mut sagas = SagaOrchestrator::new();
        sagas.register_async("check", "OrderCreated", |_, replay| {
            if replay { Ok(()) } else { Err("expected replay".into()) }
        });

        let report = sagas.dispatch(&storage, &event, true).unwrap();
        assert_eq!(report.completed, 1);
    }

    #[test]
    fn report_merge_adds_counts() {
        let mut a = SagaReport {
            started: 1,
            completed: 1,
            ..Default::default()
        };
        a.merge(SagaReport {
            started: 2,
            failed: 2,
            ..Default::default()
        });
        assert_eq!((a.started, a.completed, a.failed), (3, 1, 2));
    }

    #[test]
    fn handler_count_by_type() {
        let mut sagas = SagaOrchestrator::<OrderEvent>::new();
        assert!(sagas.is_empty());
        sagas
            .register_async("a", "OrderCreated", |_, _| Ok(()))
            .register_async("b", "OrderCreated", |_, _| Ok(()));
        assert_eq!(sagas.handler_count("OrderCreated"), 2);
        assert_eq!(sagas.handler_count("OrderShipped"), 0);
    }
}
