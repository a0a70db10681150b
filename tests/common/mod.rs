//! Shared fixtures for the integration tests: a small bank-account domain.

#![allow(dead_code)]

use evoke::{Aggregate, Command, TypeRegistry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: u64 },
    Withdrawn { amount: u64 },
    Closed,
}

pub fn opened(owner: &str) -> AccountEvent {
    AccountEvent::Opened {
        owner: owner.to_string(),
    }
}

pub fn deposited(amount: u64) -> AccountEvent {
    AccountEvent::Deposited { amount }
}

pub fn withdrawn(amount: u64) -> AccountEvent {
    AccountEvent::Withdrawn { amount }
}

pub fn account_registry() -> TypeRegistry<AccountEvent> {
    let mut registry = TypeRegistry::new();
    registry.register_all(["Opened", "Deposited", "Withdrawn", "Closed"]);
    registry
}

#[derive(Debug, Clone)]
pub enum AccountCommand {
    Open { id: String, owner: String },
    Deposit { id: String, amount: u64 },
    Withdraw { id: String, amount: u64 },
}

impl Command for AccountCommand {
    fn aggregate_id(&self) -> &str {
        match self {
            Self::Open { id, .. } | Self::Deposit { id, .. } | Self::Withdraw { id, .. } => id,
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum AccountError {
    #[error("account already open")]
    AlreadyOpen,
    #[error("account not open")]
    NotOpen,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
    #[error("balance would go negative")]
    Overdrawn,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Account {
    pub owner: Option<String>,
    pub balance: u64,
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";

    type Command = AccountCommand;
    type Event = AccountEvent;
    type Error = AccountError;

    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match cmd {
            AccountCommand::Open { owner, .. } => {
                if self.owner.is_some() {
                    return Err(AccountError::AlreadyOpen);
                }
                Ok(vec![AccountEvent::Opened { owner }])
            }
            AccountCommand::Deposit { amount, .. } => {
                self.require_open()?;
                if amount == 0 {
                    return Ok(vec![]);
                }
                Ok(vec![AccountEvent::Deposited { amount }])
            }
            AccountCommand::Withdraw { amount, .. } => {
                self.require_open()?;
                if amount > self.balance {
                    return Err(AccountError::InsufficientFunds {
                        balance: self.balance,
                        requested: amount,
                    });
                }
                Ok(vec![AccountEvent::Withdrawn { amount }])
            }
        }
    }

    fn apply(mut self, event: &Self::Event) -> Result<Self, Self::Error> {
        match event {
            AccountEvent::Opened { owner } => self.owner = Some(owner.clone()),
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => {
                self.balance = self
                    .balance
                    .checked_sub(*amount)
                    .ok_or(AccountError::Overdrawn)?;
            }
            AccountEvent::Closed => self.owner = None,
        }
        Ok(self)
    }
}

impl Account {
    fn require_open(&self) -> Result<(), AccountError> {
        match self.owner {
            Some(_) => Ok(()),
            None => Err(AccountError::NotOpen),
        }
    }
}
