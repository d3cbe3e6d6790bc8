// Durable strategy state and status snapshots
pub mod file;
pub mod redis_store;
pub mod status;

pub use file::FileStateStore;
pub use redis_store::RedisStateStore;
pub use status::StatusSnapshot;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::ledger::PositionLedger;
use crate::models::FilledOrderInfo;
use crate::strategy::stages::StageMap;
use crate::Result;

/// Everything needed to resume a bot after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub ledger: PositionLedger,
    /// Stage map as last rewritten by reset directives
    pub stages: StageMap,
    #[serde(default)]
    pub limit_order_filled: bool,
    #[serde(default)]
    pub last_filled_order: Option<FilledOrderInfo>,
    /// Set once the trailing stop has run its course
    #[serde(default)]
    pub trailing_stop_finished: bool,
    pub updated_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(ledger: PositionLedger, stages: StageMap) -> Self {
        Self {
            ledger,
            stages,
            limit_order_filled: false,
            last_filled_order: None,
            trailing_stop_finished: false,
            updated_at: Utc::now(),
        }
    }
}

/// Storage backend for one bot instance
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<PersistedState>>;

    async fn save(&self, state: &PersistedState) -> Result<()>;

    async fn save_status(&self, status: &StatusSnapshot) -> Result<()>;

    async fn load_status(&self) -> Result<Option<StatusSnapshot>>;
}
