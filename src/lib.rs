//! Embeddable event sourcing: an append-only log of typed events, projection
//! handlers that run inside the append transaction, and post-commit sagas
//! whose every run is tracked as a durable instance.
//!
//! Two backends ship with the crate: [`MemoryStorage`] for tests and
//! ephemeral use, and [`SqliteStorage`] for a durable single-file log.
//! Projection handlers that keep read models in the same SQLite database
//! write through [`ProjectionContext::connection`], so their rows commit or
//! roll back together with the events.

mod actor;
pub use actor::{AggregateHandle, spawn_actor};
mod aggregate;
pub use aggregate::{Aggregate, AggregateHandler, Command, Loaded};
mod bus;
pub use bus::{EventBus, Publisher};
mod command;
pub use command::CommandBus;
mod config;
pub use config::{SqliteConfig, SynchronousMode};
mod error;
pub use error::{DispatchError, ExecuteError, HandlerError, StoreError};
mod event;
pub use event::{EncodedEvent, Event, LoadOrder, RecordedEvent, derive_id, new_id};
mod memory;
pub use memory::MemoryStorage;
mod projection;
pub use projection::{ProjectionDispatcher, ProjectionHandler};
mod registry;
pub use registry::TypeRegistry;
mod replay;
pub use replay::{ReplayEngine, ReplayReport, SagaPolicy};
mod saga;
pub use saga::{SagaHandler, SagaInstance, SagaOrchestrator, SagaReport, SagaStatus};
mod sqlite;
pub use sqlite::SqliteStorage;
mod storage;
pub use storage::{Backend, EventStorage, ProjectionContext, RowCallback, SagaInstanceStorage};
mod store;
pub use store::{EventStore, EventStoreBuilder};

/// Re-exported so projection handlers can name the connection type they
/// receive without depending on a matching `rusqlite` version.
pub use rusqlite;
