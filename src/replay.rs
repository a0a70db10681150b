//! Re-driving historical events through projections, sagas and publishers.

use crate::bus::Publisher;
use crate::error::StoreError;
use crate::event::{Event, RecordedEvent};
use crate::saga::SagaReport;
use crate::storage::Backend;
use crate::store::EventStore;

/// Whether sagas run again during a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SagaPolicy {
    /// Rebuild projections only.
    #[default]
    Skip,
    /// Also re-run matching sagas (with `replay = true`), each creating a new
    /// instance. Historical instances are left untouched.
    Rerun,
}

/// Summary of a replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Number of events re-driven.
    pub events: usize,
    /// Sequence of the last event re-driven, `0` if none.
    pub last_sequence: i64,
    /// Saga outcomes when replaying with [`SagaPolicy::Rerun`].
    pub sagas: SagaReport,
}

/// Replays the log of an [`EventStore`]. Obtained from
/// [`EventStore::replay`].
#[derive(Debug)]
pub struct ReplayEngine<'a, E, S> {
    store: &'a EventStore<E, S>,
}

impl<'a, E: Event, S: Backend<E>> ReplayEngine<'a, E, S> {
    pub(crate) fn new(store: &'a EventStore<E, S>) -> Self {
        Self { store }
    }

    /// Re-run the projection handlers for every event with
    /// `sequence >= from`, in sequence order.
    ///
    /// The events are read and re-projected in one replay-flagged transaction
    /// under the write lock, so a concurrent append lands either wholly before
    /// the replay (and is replayed) or wholly after it. On the first handler
    /// error none of the writes made through the context are kept.
    /// With [`SagaPolicy::Rerun`], sagas run after that transaction commits.
    ///
    /// # Errors
    ///
    /// [`StoreError::HandlerFailed`] if a projection rejects an event, plus
    /// any decode or storage failure.
    pub fn replay_from(&self, from: i64, policy: SagaPolicy) -> Result<ReplayReport, StoreError> {
        let _span = tracing::debug_span!("replay", from, ?policy).entered();
        let inner = &*self.store.inner;
        let events = inner
            .storage
            .replay_scope(from, &mut |event, ctx| inner.projections.dispatch(event, ctx))?;

        let mut report = ReplayReport {
            events: events.len(),
            last_sequence: events.last().map_or(0, |e| e.sequence),
            sagas: SagaReport::default(),
        };
        if policy == SagaPolicy::Rerun {
            for event in &events {
                report.sagas.merge(inner.sagas.dispatch(&inner.storage, event, true)?);
            }
        }
        tracing::debug!(
            events = report.events,
            last_sequence = report.last_sequence,
            sagas = report.sagas.started,
            "replay finished"
        );
        Ok(report)
    }

    /// Replay the entire log.
    pub fn replay_all(&self, policy: SagaPolicy) -> Result<ReplayReport, StoreError> {
        self.replay_from(1, policy)
    }

    /// Stream every event with `sequence >= from` to `publisher` with
    /// `replay = true`, stopping at the first publisher error.
    ///
    /// Projections and sagas are not involved.
    pub fn replay_into<P>(&self, from: i64, publisher: &P) -> Result<usize, StoreError>
    where
        P: Publisher<E> + ?Sized,
    {
        let events = self.store.load_from(from)?;
        for event in &events {
            publish_replayed(publisher, event)?;
        }
        Ok(events.len())
    }
}

fn publish_replayed<E, P: Publisher<E> + ?Sized>(
    publisher: &P,
    event: &RecordedEvent<E>,
) -> Result<(), StoreError> {
    publisher
        .publish(event, true)
        .map_err(|source| StoreError::HandlerFailed {
            handler: "publisher".to_string(),
            event_type: event.event_type.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::aggregate::test_fixtures::{OrderEvent, order_registry};
    use crate::bus::EventBus;
    use crate::event::LoadOrder;
    use crate::memory::MemoryStorage;
    use crate::saga::SagaStatus;

    fn created(id: &str) -> OrderEvent {
        OrderEvent::OrderCreated { id: id.into() }
    }

    #[test]
    fn replay_rebuilds_projection_identically() {
        let counts: Arc<Mutex<BTreeMap<String, usize>>> = Arc::default();
        let sink = Arc::clone(&counts);
        let store = EventStore::builder(MemoryStorage::new(order_registry()))
            .register_sync("OrderCreated", move |event, _| {
                *sink.lock().entry(event.aggregate_id.clone()).or_default() += 1;
                Ok(())
            })
            .build();
        store.append("A", &[created("A")]).unwrap();
        store.append("B", &[created("B")]).unwrap();
        let live = counts.lock().clone();

        counts.lock().clear();
        let first = store.replay().replay_all(SagaPolicy::Skip).unwrap();
        let once = counts.lock().clone();

        counts.lock().clear();
        store.replay().replay_all(SagaPolicy::Skip).unwrap();
        let twice = counts.lock().clone();

        assert_eq!(once, live);
        assert_eq!(twice, once);
        assert_eq!(first.events, 2);
        assert_eq!(first.last_sequence, 2);
        assert_eq!(first.sagas, SagaReport::default());
    }

    #[test]
    fn projections_see_replay_flag() {
        let flags = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flags);
        let store = EventStore::builder(MemoryStorage::new(order_registry()))
            .register_sync("OrderCreated", move |_, ctx| {
                sink.lock().push(ctx.is_replay());
                Ok(())
            })
            .build();
        store.append("A", &[created("A")]).unwrap();
        store.replay().replay_from(1, SagaPolicy::Skip).unwrap();
        assert_eq!(*flags.lock(), vec![false, true]);
    }

    #[test]
    fn replay_from_skips_earlier_events() {
        let store = EventStore::new(MemoryStorage::new(order_registry()));
        store.append("A", &[created("A"), OrderEvent::OrderCancelled]).unwrap();
        store.append("B", &[created("B")]).unwrap();
        let report = store.replay().replay_from(2, SagaPolicy::Skip).unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(report.last_sequence, 3);

        let empty = store.replay().replay_from(10, SagaPolicy::Skip).unwrap();
        assert_eq!(empty.events, 0);
        assert_eq!(empty.last_sequence, 0);
    }

    #[test]
    fn rerun_policy_creates_new_saga_instances() {
        let store = EventStore::builder(MemoryStorage::new(order_registry()))
            .register_async("notify", "OrderCreated", |_, replay| {
                if replay { Err("suppressed on replay".into()) } else { Ok(()) }
            })
            .build();
        store.append("A", &[created("A")]).unwrap();

        let skipped = store.replay().replay_all(SagaPolicy::Skip).unwrap();
        assert_eq!(skipped.sagas.started, 0);
        assert_eq!(store.saga_instances_for(1).unwrap().len(), 1);

        let rerun = store.replay().replay_all(SagaPolicy::Rerun).unwrap();
        assert_eq!(rerun.sagas.started, 1);
        assert_eq!(rerun.sagas.failed, 1);

        let instances = store.saga_instances_for(1).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].status, SagaStatus::Completed);
        assert_eq!(instances[1].status, SagaStatus::Error);
    }

    #[test]
    fn failing_projection_aborts_replay() {
        let store = EventStore::builder(MemoryStorage::new(order_registry()))
            .register_sync("OrderCancelled", |_, ctx| {
                if ctx.is_replay() { Err("cannot rebuild".into()) } else { Ok(()) }
            })
            .build();
        store.append("A", &[created("A"), OrderEvent::OrderCancelled]).unwrap();
        let err = store.replay().replay_all(SagaPolicy::Skip).unwrap_err();
        assert!(matches!(err, StoreError::HandlerFailed { .. }));
        assert_eq!(store.load_all(LoadOrder::Ascending).unwrap().len(), 2);
    }

    #[test]
    fn replay_into_publishes_with_replay_flag() {
        let store = EventStore::new(MemoryStorage::new(order_registry()));
        store.append("A", &[created("A")]).unwrap();
        store.append("B", &[created("B")]).unwrap();

        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("OrderCreated", move |e: &RecordedEvent<OrderEvent>, replay| {
            sink.lock().push((e.aggregate_id.clone(), replay));
            Ok(())
        });

        let count = store.replay().replay_into(1, &bus).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            *seen.lock(),
            vec![("A".to_string(), true), ("B".to_string(), true)]
        );
    }
}
