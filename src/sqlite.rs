//! Durable SQLite backend.
//!
//! One writer connection behind a mutex serializes appends and saga updates.
//! File databases also get a read-only connection so loads run against the
//! last committed WAL snapshot without waiting for the writer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params};

use crate::config::SqliteConfig;
use crate::error::StoreError;
use crate::event::{Event, LoadOrder, RecordedEvent};
use crate::registry::TypeRegistry;
use crate::saga::{SagaInstance, SagaStatus};
use crate::storage::{
    EventStorage, ProjectionContext, RowCallback, SagaInstanceStorage,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    sequence     INTEGER PRIMARY KEY AUTOINCREMENT,
    aggregate_id TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload      TEXT NOT NULL,
    recorded_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_aggregate_id ON events (aggregate_id, sequence);

CREATE TABLE IF NOT EXISTS saga_instances (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    INTEGER NOT NULL,
    saga_name   TEXT NOT NULL,
    status      TEXT NOT NULL,
    last_error  TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_saga_instances_event_id ON saga_instances (event_id);
CREATE INDEX IF NOT EXISTS idx_saga_instances_status ON saga_instances (status);
";

const EVENT_COLUMNS: &str = "sequence, aggregate_id, event_type, payload, recorded_at";

const SAGA_COLUMNS: &str = "id, event_id, saga_name, status, last_error, created_at, updated_at";

/// An `events` row before its payload is decoded.
struct RawEvent {
    sequence: i64,
    aggregate_id: String,
    event_type: String,
    payload: String,
    recorded_at: DateTime<Utc>,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            aggregate_id: row.get(1)?,
            event_type: row.get(2)?,
            payload: row.get(3)?,
            recorded_at: row.get(4)?,
        })
    }
}

fn select_events(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<RawEvent>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, RawEvent::from_row)?;
    rows.collect()
}

fn saga_from_row(row: &Row<'_>) -> rusqlite::Result<SagaInstance> {
    Ok(SagaInstance {
        id: row.get(0)?,
        event_id: row.get(1)?,
        saga_name: row.get(2)?,
        status: row.get(3)?,
        last_error: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// SQLite-backed event log and saga table.
pub struct SqliteStorage<E> {
    registry: Arc<TypeRegistry<E>>,
    writer: Mutex<Connection>,
    /// Read-only connection; `None` for in-memory databases, which cannot be
    /// shared between connections.
    reader: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl<E> fmt::Debug for SqliteStorage<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .field("reader", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: Event> SqliteStorage<E> {
    /// Open (or create) a database file.
    ///
    /// Creates parent directories, applies the configured pragmas and the
    /// schema, then opens the read-only connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the parent directory cannot be created
    /// and [`StoreError::Storage`] for any SQLite failure.
    pub fn open(
        config: SqliteConfig,
        registry: impl Into<Arc<TypeRegistry<E>>>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        configure_writer(&writer, &config)?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(config.busy_timeout())?;

        tracing::debug!(path = %config.path.display(), wal = config.wal_mode, "opened event log");

        Ok(Self {
            registry: registry.into(),
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            path: Some(config.path),
        })
    }

    /// Open a private in-memory database. Nothing survives the value.
    pub fn open_in_memory(registry: impl Into<Arc<TypeRegistry<E>>>) -> Result<Self, StoreError> {
        let writer = Connection::open_in_memory()?;
        writer.pragma_update(None, "foreign_keys", "ON")?;
        writer.execute_batch(SCHEMA)?;
        Ok(Self {
            registry: registry.into(),
            writer: Mutex::new(writer),
            reader: None,
            path: None,
        })
    }

    /// The database file, or `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        match &self.reader {
            Some(reader) => f(&reader.lock()),
            None => f(&self.writer.lock()),
        }
    }

    fn decode(&self, raw: RawEvent) -> Result<RecordedEvent<E>, StoreError> {
        let payload = self.registry.decode(&raw.event_type, &raw.payload)?;
        Ok(RecordedEvent {
            sequence: raw.sequence,
            aggregate_id: raw.aggregate_id,
            event_type: raw.event_type,
            payload,
            recorded_at: raw.recorded_at,
        })
    }

    fn query_events(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let raws = self.with_reader(|conn| Ok(select_events(conn, sql, params)?))?;
        raws.into_iter().map(|raw| self.decode(raw)).collect()
    }

    fn query_sagas(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params, saga_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    fn finish_saga(
        &self,
        id: i64,
        status: SagaStatus,
        message: Option<&str>,
    ) -> Result<SagaInstance, StoreError> {
        let conn = self.writer.lock();
        let sql = format!(
            "UPDATE saga_instances SET status = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'running'
             RETURNING {SAGA_COLUMNS}"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.query_row(params![id, status, message, Utc::now()], saga_from_row)
            .optional()?
            .ok_or(StoreError::SagaNotRunning { id })
    }
}

fn configure_writer(conn: &Connection, config: &SqliteConfig) -> Result<(), StoreError> {
    if config.wal_mode {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
    }
    conn.pragma_update(None, "synchronous", config.synchronous.pragma_value())?;
    conn.pragma_update(
        None,
        "foreign_keys",
        if config.foreign_keys { "ON" } else { "OFF" },
    )?;
    conn.pragma_update(None, "cache_size", config.cache_size)?;
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}

/// Escape `%`, `_` and `\` so a prefix matches literally under `LIKE ... ESCAPE '\'`.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl<E: Event> EventStorage<E> for SqliteStorage<E> {
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
        let encoded = events
            .iter()
            .map(|event| self.registry.encode(event))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.writer.lock();
        // Dropped without commit on any early return, which rolls back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut recorded = Vec::with_capacity(encoded.len());
        {
            let live: &Connection = &tx;
            let ctx = ProjectionContext::new(false, Some(live));
            let sql = format!(
                "INSERT INTO events (aggregate_id, event_type, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING {EVENT_COLUMNS}"
            );
            let mut insert = live.prepare_cached(&sql)?;
            for event in &encoded {
                let raw = insert.query_row(
                    params![aggregate_id, event.event_type, event.payload, Utc::now()],
                    RawEvent::from_row,
                )?;
                let record = self.decode(raw)?;
                on_row(&record, &ctx)?;
                recorded.push(record);
            }
        }
        tx.commit()?;
        Ok(recorded)
    }

    fn load_stream(&self, aggregate_id: &str) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let sql =
            format!("SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = ?1 ORDER BY sequence");
        self.query_events(&sql, [aggregate_id])
    }

    fn load_all(&self, order: LoadOrder) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let direction = match order {
            LoadOrder::Ascending => "ASC",
            LoadOrder::Descending => "DESC",
        };
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY sequence {direction}");
        self.query_events(&sql, [])
    }

    fn load_from(&self, from: i64) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let sql =
            format!("SELECT {EVENT_COLUMNS} FROM events WHERE sequence >= ?1 ORDER BY sequence");
        self.query_events(&sql, [from])
    }

    fn aggregate_ids(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = like_prefix(prefix);
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT aggregate_id FROM events
                 WHERE aggregate_id LIKE ?1 ESCAPE '\\'
                 ORDER BY aggregate_id",
            )?;
            let ids = stmt
                .query_map([pattern], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    fn last_sequence(&self) -> Result<i64, StoreError> {
        self.with_reader(|conn| {
            let last = conn.query_row("SELECT COALESCE(MAX(sequence), 0) FROM events", [], |row| {
                row.get(0)
            })?;
            Ok(last)
        })
    }

    fn replay_scope(
        &self,
        from: i64,
        on_row: &mut RowCallback<'_, E>,
    ) -> Result<Vec<RecordedEvent<E>>, StoreError> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let live: &Connection = &tx;

        // Read through the transaction; the reader may be the writer itself.
        let sql =
            format!("SELECT {EVENT_COLUMNS} FROM events WHERE sequence >= ?1 ORDER BY sequence");
        let events = select_events(live, &sql, [from])?
            .into_iter()
            .map(|raw| self.decode(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let ctx = ProjectionContext::new(true, Some(live));
        for event in &events {
            on_row(event, &ctx)?;
        }
        tx.commit()?;
        Ok(events)
    }
}

impl<E: Event> SagaInstanceStorage for SqliteStorage<E> {
    fn start_saga(&self, event_id: i64, saga_name: &str) -> Result<SagaInstance, StoreError> {
        let conn = self.writer.lock();
        let sql = format!(
            "INSERT INTO saga_instances (event_id, saga_name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             RETURNING {SAGA_COLUMNS}"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let instance = stmt.query_row(
            params![event_id, saga_name, SagaStatus::Running, Utc::now()],
            saga_from_row,
        )?;
        Ok(instance)
    }

    fn complete_saga(&self, id: i64) -> Result<SagaInstance, StoreError> {
        self.finish_saga(id, SagaStatus::Completed, None)
    }

    fn fail_saga(&self, id: i64, message: &str) -> Result<SagaInstance, StoreError> {
        self.finish_saga(id, SagaStatus::Error, Some(message))
    }

    fn saga_instance(&self, id: i64) -> Result<Option<SagaInstance>, StoreError> {
        let sql = format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE id = ?1");
        Ok(self.query_sagas(&sql, [id])?.into_iter().next())
    }

    fn saga_instances_for(&self, event_id: i64) -> Result<Vec<SagaInstance>, StoreError> {
        let sql =
            format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE event_id = ?1 ORDER BY id");
        self.query_sagas(&sql, [event_id])
    }

    fn saga_instances_with_status(
        &self,
        status: SagaStatus,
    ) -> Result<Vec<SagaInstance>, StoreError> {
        let sql = format!("SELECT {SAGA_COLUMNS} FROM saga_instances WHERE status = ?1 ORDER BY id");
        self.query_sagas(&sql, [status])
    }
}
