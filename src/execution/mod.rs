// Ledger, decision loop and order execution
pub mod decision_loop;
pub mod executor;
pub mod fill_flags;
pub mod fill_listener;
pub mod ledger;
pub mod limit_orders;
pub mod runner;

pub use decision_loop::{sleep_interval, Decision, DecisionLoop};
pub use executor::ActionExecutor;
pub use fill_flags::{FillSnapshot, SharedFillFlags};
pub use fill_listener::FillListener;
pub use ledger::{AveragingEntry, LedgerError, PositionLedger};
pub use limit_orders::{ArmedLink, LimitOrderManager};
pub use runner::StrategyRunner;

use std::sync::Arc;

use crate::api::{ExchangeDriver, Notifier};
use crate::persistence::StateStore;

/// Shared collaborators handed to every component of one bot instance
#[derive(Clone)]
pub struct BotContext {
    pub driver: Arc<dyn ExchangeDriver>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn StateStore>,
    pub flags: SharedFillFlags,
}

impl BotContext {
    pub fn new(
        driver: Arc<dyn ExchangeDriver>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn StateStore>,
        flags: SharedFillFlags,
    ) -> Self {
        Self {
            driver,
            notifier,
            store,
            flags,
        }
    }
}
