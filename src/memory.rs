//! Non-durable backend used for tests and ephemeral pipelines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::error::StoreError;
use crate::event::{Event, LoadOrder, RecordedEvent};
use crate::registry::TypeRegistry;
use crate::saga::{SagaInstance, SagaStatus};
use crate::storage::{
    EventStorage, ProjectionContext, RowCallback, SagaInstanceStorage,
    has_prefix_ignore_case,
};

/// One committed event, kept in its encoded form.
#[derive(Debug, Clone)]
struct StoredRow {
    sequence: i64,
    aggregate_id: String,
    event_type: String,
    payload: String,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MemoryState {
    rows: Vec<StoredRow>,
    /// Row indices per aggregate id, in sequence order.
    streams: HashMap<String, Vec<usize>>,
    next_sequence: i64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            streams: HashMap::new(),
            next_sequence: 1,
        }
    }
}

#[derive(Debug)]
struct SagaTable {
    rows: Vec<SagaInstance>,
    next_id: i64,
}

/// In-memory event log and saga table.
///
/// A writer mutex is held for the whole of an `append`, including its
/// projection callbacks, so sequence assignment never interleaves. Rows are
/// staged while the batch runs and published to readers in one step at commit;
/// readers take a shared lock and never see a half-written batch.
///
/// Payloads are stored encoded and decoded on every read, so what `append`
/// returns is exactly what a later load produces.
///
/// There is no transaction for projections to write through:
/// [`ProjectionContext::connection`] is always `None`. When event *k* of a
/// batch fails, the batch is discarded, but anything a projection handler did
/// for events *1..k-1* stays done. Handlers that need all-or-nothing read
/// models must either stage their own writes or use
/// [`SqliteStorage`](crate::SqliteStorage).
pub struct MemoryStorage<E> {
    registry: Arc<TypeRegistry<E>>,
    writer: Mutex<()>,
    state: RwLock<MemoryState>,
    sagas: Mutex<SagaTable>,
}

impl<E> fmt::Debug for MemoryStorage<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryStorage")
            .field("events", &state.rows.len())
            .field("next_sequence", &state.next_sequence)
            .finish_non_exhaustive()
    }
}

impl<E: Event> MemoryStorage<E> {
    /// Create an empty in-memory backend.
    pub fn new(registry: impl Into<Arc<TypeRegistry<E>>>) -> Self {
        Self {
            registry: registry.into(),
            writer: Mutex::new(()),
            state: RwLock::new(MemoryState::default()),
            sagas: Mutex::new(SagaTable {
                rows: Vec::new(),
                next_id: 1,
            }),
        }
    }

    fn decode(&self, row: &StoredRow) -> Result<RecordedEvent<E>, StoreError> {
        let payload = self.registry.decode(&row.event_type, &row.payload)?;
        Ok(RecordedEvent {
            sequence: row.sequence,
            aggregate_id: row.aggregate_id.clone(),
            event_type: row.event_type.clone(),
            payload,
            recorded_at: row.recorded_at,
        })
    }

    fn decode_all<'a>(
        &self,
        rows: impl Iterator<Item = &'a StoredRow>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        rows.map(|row| self.decode(row)).collect()
    }
}

impl<E: Event> EventStorage<E> for MemoryStorage<E> {
    fn registry(&self) -> &TypeRegistry<E> {
        &self.registry
    }

    fn append(
        &self,
        aggregate_id: &str,
        events: &[E],
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        if events.is_empty() {
            return Err(StoreError::NoEvents);
        }
        let _writer = self.writer.lock();
        let first = self.state.read().next_sequence;

        let ctx = ProjectionContext::new(false, None);
        let mut staged = Vec::with_capacity(events.len());
        let mut recorded = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let encoded = self.registry.encode(event)?;
            let row = StoredRow {
                sequence: first + offset as i64,
                aggregate_id: aggregate_id.to_string(),
                event_type: encoded.event_type,
                payload: encoded.payload,
                recorded_at: Utc::now(),
            };
            let record = self.decode(&row)?;
            on_row(&record, &ctx)?;
            staged.push(row);
            recorded.push(record);
        }

        // Commit: publish the whole batch at once.
        let mut state = self.state.write();
        for row in staged {
            let index = state.rows.len();
            state
                .streams
                .entry(row.aggregate_id.clone())
                .or_default()
                .push(index);
            state.rows.push(row);
        }
        state.next_sequence = first + recorded.len() as i64;
        Ok(recorded)
    }

    fn load_stream(&self, aggregate_id: &str) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let state = self.state.read();
        let rows = &state.rows;
        match state.streams.get(aggregate_id) {
            Some(indices) => self.decode_all(indices.iter().map(|&i| &rows[i])),
            None => Ok(Vec::new()),
        }
    }

    fn load_all(&self, order: LoadOrder) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let state = self.state.read();
        match order {
            LoadOrder::Ascending => self.decode_all(state.rows.iter()),
            LoadOrder::Descending => self.decode_all(state.rows.iter().rev()),
        }
    }

    fn load_from(&self, from: i64) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let state = self.state.read();
        // Sequences are dense from 1, so the row index is `sequence - 1`.
        let start = usize::try_from(from.saturating_sub(1)).unwrap_or(0);
        match state.rows.get(start..) {
            Some(rows) => self.decode_all(rows.iter()),
            None => Ok(Vec::new()),
        }
    }

    fn aggregate_ids(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let mut ids: Vec<String> = state
            .streams
            .keys()
            .filter(|id| has_prefix_ignore_case(id, prefix))
            .cloned()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn last_sequence(&self) -> Result<i64, StoreError> {
        Ok(self.state.read().next_sequence - 1)
    }

    fn replay_scope(
        &self,
        from: i64,
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let _writer = self.writer.lock();
        // Only `append` mutates the rows, and it needs the writer lock.
        let events = self.load_from(from)?;
        let ctx = ProjectionContext::new(true, None);
        for event in &events {
            on_row(event, &ctx)?;
        }
        Ok(events)
    }
}

impl<E: Event> SagaInstanceStorage for MemoryStorage<E> {
    fn start_saga(&self, event_id: i64, saga_name: &str) -> Result<SagaInstance, StoreError> {
        let mut table = self.sagas.lock();
        let now = Utc::now();
        let instance = SagaInstance {
            id: table.next_id,
            event_id,
            saga_name: saga_name.to_string(),
            status: SagaStatus::Running,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        table.next_id += 1;
        table.rows.push(instance.clone());
        Ok(instance)
    }

    fn complete_saga(&self, id: i64) -> Result<SagaInstance, StoreError> {
        finish(&mut self.sagas.lock(), id, SagaStatus::Completed, None)
    }

    fn fail_saga(&self, id: i64, message: &str) -> Result<SagaInstance, StoreError> {
        finish(&mut self.sagas.lock(), id, SagaStatus::Error, Some(message))
    }

    fn saga_instance(&self, id: i64) -> Result<Option<SagaInstance>, StoreError> {
        Ok(self.sagas.lock().rows.iter().find(|s| s.id == id).cloned())
    }

    fn saga_instances_for(&self, event_id: i64) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self
            .sagas
            .lock()
            .rows
            .iter()
            .filter(|s| s.event_id == event_id)
            .cloned()
            .collect())
    }

    fn saga_instances_with_status(
        &self,
        status: SagaStatus,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self
            .sagas
            .lock()
            .rows
            .iter()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }
}

fn finish(
    table: &mut SagaTable,
    id: i64,
    status: SagaStatus,
    message: Option<&str>,
) -> Result<SagaInstance, StoreError> {
    let row = table
        .rows
        .iter_mut()
        .find(|s| s.id == id && s.status == SagaStatus::Running)
        .ok_or(StoreError::SagaNotRunning { id })?;
    row.status = status;
    row.last_error = message.map(str::to_string);
    row.updated_at = Utc::now();
    Ok(row.clone())
}
