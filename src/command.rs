//! Command bus: one handler per command type.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregate::{Aggregate, AggregateHandler};
use crate::error::{DispatchError, HandlerError};
use crate::storage::Backend;

type ErasedHandler = Arc<dyn Fn(Box<dyn Any + Send>) -> Result<(), DispatchError> + Send + Sync>;

/// Routes commands to the single handler registered for their type.
///
/// Registration is expected to happen during bootstrap; it takes a write lock
/// so late registration is safe but races with in-flight sends for the same
/// type.
///
/// # Examples
///
/// ```
/// use evoke::{CommandBus, DispatchError};
///
/// struct Ping;
///
/// let bus = CommandBus::new();
/// bus.register(|_: Ping| Ok(())).unwrap();
/// assert!(matches!(
///     bus.register(|_: Ping| Ok(())),
///     Err(DispatchError::AlreadyRegistered { .. })
/// ));
/// bus.send(Ping).unwrap();
/// ```
#[derive(Default)]
pub struct CommandBus {
    handlers: RwLock<HashMap<TypeId, (&'static str, ErasedHandler)>>,
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let mut names: Vec<&str> = handlers.values().map(|(name, _)| *name).collect();
        names.sort_unstable();
        f.debug_struct("CommandBus").field("commands", &names).finish()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for commands of type `C`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyRegistered`] if `C` already has a handler; the
    /// existing handler is kept.
    pub fn register<C, F>(&self, handler: F) -> Result<(), DispatchError>
    where
        C: Send + 'static,
        F: Fn(C) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let command = type_name::<C>();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&TypeId::of::<C>()) {
            return Err(DispatchError::AlreadyRegistered { command });
        }
        let erased: ErasedHandler = Arc::new(move |boxed: Box<dyn Any + Send>| {
            let cmd = boxed
                .downcast::<C>()
                .map_err(|_| DispatchError::NoHandler { command })?;
            handler(*cmd).map_err(DispatchError::Execution)
        });
        handlers.insert(TypeId::of::<C>(), (command, erased));
        Ok(())
    }

    /// Register an [`AggregateHandler`] for its aggregate's command type.
    pub fn register_aggregate<A, S>(
        &self,
        handler: AggregateHandler<A, S>,
    ) -> Result<(), DispatchError>
    where
        A: Aggregate,
        S: Backend<A::Event> + 'static,
    {
        self.register(move |cmd: A::Command| {
            handler
                .handle(cmd)
                .map(drop)
                .map_err(|e| Box::new(e) as HandlerError)
        })
    }

    /// Returns `true` if `C` has a handler.
    pub fn is_registered<C: 'static>(&self) -> bool {
        self.handlers.read().contains_key(&TypeId::of::<C>())
    }

    /// Dispatch `cmd` to its handler.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoHandler`] if nothing is registered for `C`.
    /// - [`DispatchError::Execution`] with the handler's error.
    pub fn send<C: Send + 'static>(&self, cmd: C) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .read()
            .get(&TypeId::of::<C>())
            .map(|(_, handler)| Arc::clone(handler));
        let Some(handler) = handler else {
            return Err(DispatchError::NoHandler {
                command: type_name::<C>(),
            });
        };
        handler(Box::new(cmd))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::aggregate::test_fixtures::{
        Order, OrderCommand, OrderError, OrderEvent, order_registry,
    };
    use crate::error::ExecuteError;
    use crate::memory::MemoryStorage;
    use crate::store::EventStore;

    struct Ping(u32);

    #[test]
    fn send_reaches_registered_handler() {
        let bus = CommandBus::new();
        let total = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&total);
        bus.register(move |Ping(n): Ping| {
            sink.fetch_add(n, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        bus.send(Ping(2)).unwrap();
        bus.send(Ping(3)).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert!(bus.is_registered::<Ping>());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let bus = CommandBus::new();
        bus.register(|_: Ping| Ok(())).unwrap();
        let err = bus.register(|_: Ping| Err("second".into())).unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyRegistered { .. }));
        // The first handler stays in place.
        bus.send(Ping(1)).unwrap();
    }

    #[test]
    fn unknown_command_has_no_handler() {
        let bus = CommandBus::new();
        let err = bus.send(Ping(1)).unwrap_err();
        match err {
            DispatchError::NoHandler { command } => assert!(command.ends_with("Ping")),
            other => panic!("expected NoHandler, got {other:?}"),
        }
    }

    #[test]
    fn handler_error_is_wrapped() {
        let bus = CommandBus::new();
        bus.register(|_: Ping| Err("rejected".into())).unwrap();
        let err = bus.send(Ping(1)).unwrap_err();
        assert!(matches!(&err, DispatchError::Execution(e) if e.to_string() == "rejected"));
    }

    #[test]
    fn aggregate_handler_behind_the_bus() {
        let store = EventStore::new(MemoryStorage::<OrderEvent>::new(order_registry()));
        let bus = CommandBus::new();
        bus.register_aggregate(AggregateHandler::<Order, _>::with_default(store.clone()))
            .unwrap();

        bus.send(OrderCommand::Create { id: "A".into() }).unwrap();
        assert_eq!(store.load_stream("A").unwrap().len(), 1);

        let err = bus.send(OrderCommand::Create { id: "A".into() }).unwrap_err();
        let DispatchError::Execution(source) = err else {
            panic!("expected Execution");
        };
        let execute = source
            .downcast_ref::<ExecuteError<OrderError>>()
            .expect("source should be an ExecuteError");
        assert!(matches!(execute, ExecuteError::Domain(_)));
    }
}
