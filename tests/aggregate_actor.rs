//! Command handling through `AggregateHandler`, the actor and the command bus.

mod common;

use common::{Account, AccountCommand, AccountError, AccountEvent, account_registry, withdrawn};
use evoke::{
    AggregateHandler, CommandBus, DispatchError, EventStore, ExecuteError, MemoryStorage,
    SqliteConfig, SqliteStorage, spawn_actor,
};

fn open(id: &str) -> AccountCommand {
    AccountCommand::Open {
        id: id.to_string(),
        owner: "ann".to_string(),
    }
}

fn deposit(id: &str, amount: u64) -> AccountCommand {
    AccountCommand::Deposit {
        id: id.to_string(),
        amount,
    }
}

fn withdraw(id: &str, amount: u64) -> AccountCommand {
    AccountCommand::Withdraw {
        id: id.to_string(),
        amount,
    }
}

#[test]
fn handler_folds_stream_before_deciding() {
    let store = EventStore::new(MemoryStorage::new(account_registry()));
    let handler = AggregateHandler::<Account, _>::with_default(store.clone());

    handler.handle(open("A")).unwrap();
    handler.handle(deposit("A", 40)).unwrap();
    let err = handler.handle(withdraw("A", 50)).unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::Domain(AccountError::InsufficientFunds {
            balance: 40,
            requested: 50
        })
    ));

    let recorded = handler.handle(withdraw("A", 15)).unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].sequence, 3);

    let loaded = handler.load("A").unwrap();
    assert_eq!(loaded.state.balance, 25);
    assert_eq!(loaded.version, 3);
    assert_eq!(loaded.last_sequence, 3);
}

#[test]
fn unfoldable_stream_reports_sequence() {
    let store = EventStore::new(MemoryStorage::new(account_registry()));
    store
        .append("A", &[AccountEvent::Opened { owner: "ann".into() }, withdrawn(5)])
        .unwrap();
    let handler = AggregateHandler::<Account, _>::with_default(store);

    let err = handler.handle(deposit("A", 1)).unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::Apply {
            sequence: 2,
            source: AccountError::Overdrawn
        }
    ));
}

#[test]
fn command_bus_routes_to_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let storage =
        SqliteStorage::open(SqliteConfig::new(dir.path().join("bank.db")), account_registry())
            .unwrap();
    let store = EventStore::new(storage);

    let bus = CommandBus::new();
    bus.register_aggregate(AggregateHandler::<Account, _>::with_default(store.clone()))
        .unwrap();
    assert!(matches!(
        bus.register_aggregate(AggregateHandler::<Account, _>::with_default(store.clone())),
        Err(DispatchError::AlreadyRegistered { .. })
    ));

    bus.send(open("A")).unwrap();
    bus.send(deposit("A", 10)).unwrap();
    let err = bus.send(open("A")).unwrap_err();
    assert!(matches!(err, DispatchError::Execution(_)));
    assert_eq!(store.load_stream("A").unwrap().len(), 2);
}

#[tokio::test]
async fn actor_serializes_commands_from_many_tasks() {
    let store = EventStore::new(MemoryStorage::new(account_registry()));
    let handle = spawn_actor(AggregateHandler::<Account, _>::with_default(store.clone())).unwrap();

    handle.execute(open("A")).await.unwrap();
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.execute(deposit("A", 1)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let loaded = handle.state("A").await.unwrap();
    assert_eq!(loaded.state.balance, 10);
    assert_eq!(loaded.version, 11);

    // A no-op deposit appends nothing.
    assert!(handle.execute(deposit("A", 0)).await.unwrap().is_empty());
    assert_eq!(store.last_sequence().unwrap(), 11);
}
