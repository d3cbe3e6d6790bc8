use anyhow::{bail, Context};
use chrono::Utc;

use super::decision_loop::Decision;
use super::ledger::PositionLedger;
use super::BotContext;
use crate::config::StrategyParameters;
use crate::models::Side;
use crate::persistence::PersistedState;
use crate::strategy::stages::StageMap;
use crate::Result;

/// Profit of `entry_price` at `current_price` for a position on `side`, as a fraction
pub fn entry_profit(side: Side, entry_price: f64, current_price: f64) -> f64 {
    if current_price == 0.0 {
        return 0.0;
    }
    let offset = (current_price - entry_price) / current_price;
    match side {
        Side::Buy => offset,
        Side::Sell => -offset,
    }
}

/// Turns decisions into orders, ledger mutations and state saves
pub struct ActionExecutor {
    ctx: BotContext,
    params: StrategyParameters,
}

impl ActionExecutor {
    pub fn new(ctx: BotContext, params: StrategyParameters) -> Self {
        Self { ctx, params }
    }

    pub async fn handle(
        &self,
        decision: &Decision,
        ledger: &mut PositionLedger,
        stages: &mut StageMap,
    ) -> Result<()> {
        match decision {
            Decision::AverageDown { .. } => self.on_average_down(ledger, stages).await,
            Decision::ProfitTakeMarket => {
                let current = self
                    .ctx
                    .driver
                    .get_last_price(&self.params.symbol)
                    .await
                    .context("Failed to read last price")?;
                self.on_profit_take_market(current, ledger, stages).await?;
                Ok(())
            }
            Decision::ProfitTakeLimit => {
                self.on_profit_take_limit(ledger, stages).await;
                Ok(())
            }
            Decision::PositionClosed => Ok(()),
        }
    }

    /// Add one averaging entry sized by the current stage
    pub async fn on_average_down(
        &self,
        ledger: &mut PositionLedger,
        stages: &mut StageMap,
    ) -> Result<()> {
        let symbol = &self.params.symbol;
        let side = self.params.side;
        let stage = stages.stage_for(ledger.size());

        let qty = self
            .ctx
            .driver
            .get_valid_order_qty(symbol, stage.qty_fraction())
            .await
            .context("Failed to size averaging order")?;
        if qty <= 0.0 {
            bail!("Averaging order size for {} is zero", symbol);
        }

        tracing::info!("🛒 Chase {} {} {}", side, qty, symbol);
        let ack = self
            .ctx
            .driver
            .place_chase_order(
                symbol,
                side,
                qty,
                side.position_idx(),
                self.params.pool_dist_threshold_pct,
            )
            .await
            .context("Chase order failed")?;

        let price = self
            .ctx
            .driver
            .get_filled_order_price(symbol, &ack.order_id)
            .await
            .with_context(|| format!("No fill price for order {}", ack.order_id))?;

        ledger.push(price, qty);
        tracing::info!(
            "✅ Averaged down: {} @ {} (stack size {})",
            qty,
            price,
            ledger.size()
        );
        self.persist(ledger, stages).await;

        let next = stages.stage_for_mut(ledger.size());
        if let Some(tf) = next.reset_timeframe() {
            next.at_ha = tf;
            next.at_rsi = tf;
            tracing::info!("🔧 Stage {} averaging timeframes reset to {}m", ledger.size(), tf);
            self.persist(ledger, stages).await;
        }

        Ok(())
    }

    /// Close entries from the top while each one clears the minimum profit
    ///
    /// Returns the number of entries closed.
    pub async fn on_profit_take_market(
        &self,
        current_price: f64,
        ledger: &mut PositionLedger,
        stages: &StageMap,
    ) -> Result<usize> {
        let symbol = &self.params.symbol;
        let side = self.params.side;
        let min_offset = self.params.min_profit_offset();
        let mut closed = 0;

        while let Ok(entry) = ledger.peek() {
            let profit = entry_profit(side, entry.price, current_price);
            if profit <= min_offset {
                tracing::debug!(
                    "Entry {} @ {} below minimum profit ({:.4} <= {:.4})",
                    entry.quantity,
                    entry.price,
                    profit,
                    min_offset
                );
                break;
            }

            self.ctx
                .driver
                .place_market_close(symbol, side.inverse(), entry.quantity, side.position_idx())
                .await
                .with_context(|| format!("Market close of {} @ {} failed", entry.quantity, entry.price))?;

            ledger.pop()?;
            closed += 1;
            tracing::info!(
                "💰 Closed {} @ {} at {} ({:.2}%)",
                entry.quantity,
                entry.price,
                current_price,
                profit * 100.0
            );
            self.persist(ledger, stages).await;
        }

        Ok(closed)
    }

    /// Drop the entry the profit-take limit order closed
    pub async fn on_profit_take_limit(&self, ledger: &mut PositionLedger, stages: &StageMap) -> bool {
        if !self.ctx.flags.limit_order_filled() {
            return false;
        }

        match ledger.pop() {
            Ok(entry) => tracing::info!(
                "💰 Limit profit-take closed {} @ {}",
                entry.quantity,
                entry.price
            ),
            Err(e) => tracing::warn!("Limit fill with {}", e),
        }
        self.ctx.flags.clear_limit_filled();
        self.persist(ledger, stages).await;
        true
    }

    /// Save state; failures are logged and the cycle continues
    pub async fn persist(&self, ledger: &PositionLedger, stages: &StageMap) {
        let flags = self.ctx.flags.snapshot();
        let state = PersistedState {
            ledger: ledger.clone(),
            stages: stages.clone(),
            limit_order_filled: flags.limit_order_filled,
            last_filled_order: flags.last_filled_order,
            trailing_stop_finished: flags.trailing_stop_finished,
            updated_at: Utc::now(),
        };

        if let Err(e) = self.ctx.store.save(&state).await {
            tracing::error!("❌ Failed to save state: {:#}", e);
        }
    }
}
