use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::decision_loop::{Decision, DecisionLoop};
use super::executor::ActionExecutor;
use super::ledger::PositionLedger;
use super::limit_orders::LimitOrderManager;
use super::BotContext;
use crate::api::notify_best_effort;
use crate::config::StrategyParameters;
use crate::persistence::PersistedState;
use crate::risk::TrailingStopHandle;
use crate::strategy::stages::StageMap;
use crate::Result;

/// Bounded wait for the trailing-stop worker on shutdown
pub const TSL_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Why the runner stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    PositionClosed,
}

/// Main decision context: owns the ledger and runs cycles back to back
pub struct StrategyRunner {
    ctx: BotContext,
    params: StrategyParameters,
    decision_loop: DecisionLoop,
    executor: ActionExecutor,
    limit_orders: LimitOrderManager,
    ledger: PositionLedger,
    stages: StageMap,
    shutdown: CancellationToken,
    tsl: Option<TrailingStopHandle>,
}

impl StrategyRunner {
    /// Build a runner, resuming from `restored` when present
    pub fn new(
        ctx: BotContext,
        params: StrategyParameters,
        restored: Option<PersistedState>,
        shutdown: CancellationToken,
    ) -> Self {
        let (ledger, stages) = match restored {
            Some(state) => {
                tracing::info!(
                    "♻️  Restored stack {} (saved {})",
                    state.ledger,
                    state.updated_at
                );
                (state.ledger, state.stages)
            }
            None => (PositionLedger::new(), params.stages.clone()),
        };

        let limit_orders = LimitOrderManager::new(
            ctx.driver.clone(),
            params.symbol.clone(),
            params.side,
            params.min_profit_offset(),
        );

        Self {
            decision_loop: DecisionLoop::new(ctx.clone(), params.clone()),
            executor: ActionExecutor::new(ctx.clone(), params.clone()),
            ctx,
            params,
            limit_orders,
            ledger,
            stages,
            shutdown,
            tsl: None,
        }
    }

    /// Swap in a prepared decision loop
    pub fn with_decision_loop(mut self, decision_loop: DecisionLoop) -> Self {
        self.decision_loop = decision_loop;
        self
    }

    pub fn attach_trailing_stop(&mut self, handle: TrailingStopHandle) {
        self.tsl = Some(handle);
    }

    pub fn limit_orders(&self) -> &LimitOrderManager {
        &self.limit_orders
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn stages(&self) -> &StageMap {
        &self.stages
    }

    /// Run cycles until shutdown, a closed position, or an action failure
    ///
    /// The profit-take limit order is cancelled after every cycle, whatever
    /// its outcome.
    pub async fn run(&mut self) -> Result<StopReason> {
        tracing::info!(
            "🚀 Strategy started: {} {} (stack {})",
            self.params.side,
            self.params.symbol,
            self.ledger
        );

        loop {
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                result = self.decision_loop.run(&self.ledger, &self.stages, &self.limit_orders) => Some(result),
            };

            if let Err(e) = self.limit_orders.cancel().await {
                tracing::error!("Failed to cancel profit-take limit: {}", e);
            }

            let decision = match outcome {
                None => {
                    tracing::info!("Shutdown requested, leaving decision loop");
                    return Ok(StopReason::Shutdown);
                }
                Some(Ok(decision)) => decision,
                Some(Err(e)) => return Err(self.fail(e).await),
            };

            if decision == Decision::PositionClosed {
                notify_best_effort(
                    self.ctx.notifier.as_ref(),
                    &format!(
                        "Position on {} fully closed by TP/SL, stopping",
                        self.params.symbol
                    ),
                )
                .await;
                return Ok(StopReason::PositionClosed);
            }

            if let Err(e) = self
                .executor
                .handle(&decision, &mut self.ledger, &mut self.stages)
                .await
            {
                return Err(self.fail(e).await);
            }
        }
    }

    async fn fail(&self, e: anyhow::Error) -> anyhow::Error {
        tracing::error!("❌ Strategy failed: {:#}", e);
        notify_best_effort(
            self.ctx.notifier.as_ref(),
            &format!("Strategy on {} stopped: {:#}", self.params.symbol, e),
        )
        .await;
        e
    }

    /// Stop the trailing stop and save state
    pub async fn stop(&mut self) {
        self.shutdown.cancel();

        if let Some(tsl) = self.tsl.take() {
            tsl.stop(TSL_JOIN_TIMEOUT).await;
        }

        self.executor.persist(&self.ledger, &self.stages).await;
        tracing::info!("👋 Strategy stopped with stack {}", self.ledger);
    }
}
