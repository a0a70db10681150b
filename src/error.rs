//! Crate-level error types for the event log, command handling and dispatch.

/// Boxed error returned by user-supplied handlers (projections, sagas,
/// publishers and command-bus closures).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by event log, registry, projection, saga and replay
/// operations.
///
/// Input and decode errors are raised before anything is written. Storage
/// errors are fatal and surface the backend's own error unchanged.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `append` was called with an empty batch.
    #[error("no events to append")]
    NoEvents,

    /// The event type name has no entry in the type registry.
    ///
    /// Raised when encoding an event whose variant was never registered and
    /// when decoding a stored row written under an unknown name.
    #[error("event type {event_type:?} is not registered")]
    UnregisteredType {
        /// The unknown type name.
        event_type: String,
    },

    /// The payload could not be serialized or deserialized for its type.
    #[error("malformed payload for event type {event_type:?}: {source}")]
    MalformedPayload {
        /// Type name the payload was stored (or produced) under.
        event_type: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// A synchronous projection handler rejected an event.
    ///
    /// The append that triggered it has been rolled back.
    #[error("handler {handler} failed for {event_type}: {source}")]
    HandlerFailed {
        /// Label of the failing handler.
        handler: String,
        /// Event type that was being dispatched.
        event_type: String,
        /// Error returned by the handler.
        #[source]
        source: HandlerError,
    },

    /// No aggregate id starts with the given prefix.
    #[error("no aggregate id matches prefix {prefix:?}")]
    AggregateNotFound {
        /// The prefix that was looked up.
        prefix: String,
    },

    /// More than one aggregate id starts with the given prefix.
    #[error("aggregate id prefix {prefix:?} is ambiguous: {matches:?}")]
    AmbiguousAggregateId {
        /// The prefix that was looked up.
        prefix: String,
        /// Every id that matched.
        matches: Vec<String>,
    },

    /// A saga instance was asked to leave a state other than `running`.
    #[error("saga instance {id} is not running")]
    SagaNotRunning {
        /// The saga instance id.
        id: i64,
    },

    /// The durable backend failed.
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    /// Filesystem failure while opening the durable backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Build a [`StoreError::MalformedPayload`] from a plain message.
    pub(crate) fn malformed(event_type: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            event_type: event_type.into(),
            source: <serde_json::Error as serde::ser::Error>::custom(msg),
        }
    }
}

/// Error returned when handling a command against an aggregate fails.
///
/// Generic over `E`, the aggregate's own error type.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    #[error(transparent)]
    Domain(E),

    /// A stored event could not be folded into the aggregate.
    ///
    /// The command was not evaluated and nothing was appended.
    #[error("failed to apply stored event at sequence {sequence}: {source}")]
    Apply {
        /// Sequence of the event that failed to apply.
        sequence: i64,
        /// Error returned by the aggregate's `apply`.
        #[source]
        source: E,
    },

    /// Loading or appending events failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker thread behind an [`AggregateHandle`](crate::AggregateHandle)
    /// has exited.
    #[error("aggregate actor is no longer running")]
    ActorGone,
}

/// Error returned by the [`CommandBus`](crate::CommandBus).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler is registered for the command type.
    #[error("no handler registered for command {command}")]
    NoHandler {
        /// Rust type name of the command.
        command: &'static str,
    },

    /// A handler for the command type is already registered.
    #[error("a handler for command {command} is already registered")]
    AlreadyRegistered {
        /// Rust type name of the command.
        command: &'static str,
    },

    /// The handler ran and failed.
    #[error("command execution failed: {0}")]
    Execution(HandlerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn no_events_display() {
        assert_eq!(StoreError::NoEvents.to_string(), "no events to append");
    }

    #[test]
    fn unregistered_type_names_the_type() {
        let err = StoreError::UnregisteredType {
            event_type: "OrderShipped".into(),
        };
        assert!(err.to_string().contains("\"OrderShipped\""));
    }

    #[test]
    fn malformed_helper_keeps_message() {
        let err = StoreError::malformed("OrderCreated", "expected an object");
        let StoreError::MalformedPayload { event_type, source } = &err else {
            panic!("expected MalformedPayload, got {err:?}");
        };
        assert_eq!(event_type, "OrderCreated");
        assert!(source.to_string().contains("expected an object"));
    }

    #[test]
    fn handler_failed_exposes_source() {
        use std::error::Error as _;
        let err = StoreError::HandlerFailed {
            handler: "OrderCreated[0]".into(),
            event_type: "OrderCreated".into(),
            source: "read model offline".into(),
        };
        assert_eq!(
            err.source().map(|s| s.to_string()).as_deref(),
            Some("read model offline")
        );
    }

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_from_store_error() {
        let err: ExecuteError<TestDomainError> = StoreError::NoEvents.into();
        assert!(matches!(err, ExecuteError::Store(StoreError::NoEvents)));
    }

    #[test]
    fn execute_error_actor_gone_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::ActorGone;
        assert_eq!(err.to_string(), "aggregate actor is no longer running");
    }

    #[test]
    fn dispatch_error_no_handler_display() {
        let err = DispatchError::NoHandler { command: "Ship" };
        assert_eq!(err.to_string(), "no handler registered for command Ship");
    }

    // Errors cross thread boundaries (actor replies, saga logs).
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<DispatchError>();
        }
    };
}
