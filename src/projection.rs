//! Synchronous projections: read-side handlers bound to the append
//! transaction.
//!
//! A projection handler runs after its event's row is written and before the
//! transaction commits. If any handler fails, the whole append is rolled back,
//! so derived state can never be observed out of step with the log.

use std::collections::HashMap;
use std::fmt;

use crate::error::{HandlerError, StoreError};
use crate::event::{Event, RecordedEvent};
use crate::storage::ProjectionContext;

/// A synchronous projection handler.
pub type ProjectionHandler<E> = Box<
    dyn Fn(&RecordedEvent<E>, &ProjectionContext<'_>) -> Result<(), HandlerError> + Send + Sync,
>;

/// Handlers keyed by event type, each list in registration order.
pub struct ProjectionDispatcher<E> {
    handlers: HashMap<String, Vec<ProjectionHandler<E>>>,
}

impl<E> fmt::Debug for ProjectionDispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.handlers.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

impl<E: Event> Default for ProjectionDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> ProjectionDispatcher<E> {
    /// Create a dispatcher with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Bind `handler` to `event_type`.
    ///
    /// The handler receives a [`ProjectionContext`]. Use
    /// [`is_replay`](ProjectionContext::is_replay) to suppress work that must
    /// not repeat, and [`connection`](ProjectionContext::connection) to write
    /// read models inside the append transaction.
    pub fn register_sync<F>(&mut self, event_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&RecordedEvent<E>, &ProjectionContext<'_>) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Number of handlers bound to `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Run every handler for `event.event_type`, stopping at the first error.
    ///
    /// # Errors
    ///
    /// [`StoreError::HandlerFailed`] naming the handler as
    /// `"<event_type>[<index>]"`.
    pub fn dispatch(
        &self,
        event: &RecordedEvent<E>,
        ctx: &ProjectionContext<'_>,
    ) -> Result<(), StoreError> {
        let Some(handlers) = self.handlers.get(&event.event_type) else {
            return Ok(());
        };
        for (index, handler) in handlers.iter().enumerate() {
            handler(event, ctx).map_err(|source| StoreError::HandlerFailed {
                handler: format!("{}[{index}]", event.event_type),
                event_type: event.event_type.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
