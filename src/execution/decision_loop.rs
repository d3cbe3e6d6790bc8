use anyhow::Context;
use chrono::Utc;
use tokio::time::Duration;

use super::fill_flags::FillSnapshot;
use super::ledger::PositionLedger;
use super::limit_orders::LimitOrderManager;
use super::BotContext;
use crate::config::StrategyParameters;
use crate::models::Side;
use crate::persistence::StatusSnapshot;
use crate::risk::drawdown::{loss_pct, DrawdownGate, GATE_INACTIVE_SLEEP};
use crate::strategy::signals::{SignalEvaluator, Slot, SlotReset};
use crate::strategy::stages::{StageConfig, StageMap};
use crate::Result;

/// Outcome of one ledger-depth cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AverageDown { reason: String },
    ProfitTakeMarket,
    ProfitTakeLimit,
    /// The exchange reported the whole position closed by TP/SL
    PositionClosed,
}

/// Poll interval for the shortest active timeframe (minutes)
pub fn sleep_interval(min_timeframe: u32) -> Duration {
    let secs = match min_timeframe {
        1 => 20,
        3 | 5 => 30,
        10 | 15 | 30 => 60,
        _ => 120,
    };
    Duration::from_secs(secs)
}

/// Result of the averaging test, labelled for the status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AverageDownCheck {
    Ready(&'static str),
    Blocked(&'static str),
}

fn stage_sleep(stage: &StageConfig) -> Duration {
    let min_tf = stage.timeframes().into_iter().min().unwrap_or(0);
    sleep_interval(min_tf)
}

/// Watches signals for the current ledger depth until one action is due
///
/// Each call to [`DecisionLoop::run`] is one cycle: signals are reset once for
/// the stage in force, then the loop polls until it can return a [`Decision`].
pub struct DecisionLoop {
    ctx: BotContext,
    params: StrategyParameters,
    evaluator: SignalEvaluator,
    gate: DrawdownGate,
    avdo_status: String,
}

impl DecisionLoop {
    pub fn new(ctx: BotContext, params: StrategyParameters) -> Self {
        let evaluator = SignalEvaluator::new(
            params.symbol.clone(),
            params.side,
            params.avdo_offset(),
            params.min_profit_offset(),
        );
        Self::with_evaluator(ctx, params, evaluator)
    }

    pub fn with_evaluator(
        ctx: BotContext,
        params: StrategyParameters,
        evaluator: SignalEvaluator,
    ) -> Self {
        let gate = DrawdownGate::new(params.is_loss_check, params.loss_limit_pct);
        Self {
            ctx,
            params,
            evaluator,
            gate,
            avdo_status: "starting".to_string(),
        }
    }

    /// Averaging status shown in status snapshots
    pub fn avdo_status(&self) -> &str {
        &self.avdo_status
    }

    fn reset_signals(&mut self, stage: &StageConfig) {
        let side = self.params.side;
        self.evaluator.reset(
            Slot::Averaging,
            SlotReset {
                trend_timeframe: stage.at_ha,
                momentum_timeframe: stage.at_rsi,
                set_threshold: self.params.avdo_rsi_threshold,
                reset_threshold: self.params.prta_rsi_threshold,
                side,
            },
        );
        self.evaluator.reset(
            Slot::ProfitTake,
            SlotReset {
                trend_timeframe: stage.pt_ha,
                momentum_timeframe: stage.pt_rsi,
                set_threshold: self.params.prta_rsi_threshold,
                reset_threshold: self.params.avdo_rsi_threshold,
                side: side.inverse(),
            },
        );
    }

    /// BS stages and the first entry skip the price test above the top entry
    fn check_average_down_bs(&self, ledger: &PositionLedger, reference: f64) -> AverageDownCheck {
        if !self.evaluator.trend_reversed(Slot::Averaging) {
            return AverageDownCheck::Blocked("BS mode: HA not reversed");
        }
        if !self.evaluator.momentum_snapped(Slot::Averaging) {
            return AverageDownCheck::Blocked("BS mode: HA reversed, but RSI not snapped");
        }
        if ledger.is_empty() {
            return AverageDownCheck::Ready("BS mode: HA and RSI ok, empty stack");
        }

        let Some(current) = self.evaluator.last_price() else {
            return AverageDownCheck::Blocked("BS mode: no price yet");
        };
        let beyond_top = match self.params.side {
            Side::Buy => current < reference,
            Side::Sell => current > reference,
        };
        if !beyond_top {
            return AverageDownCheck::Ready("BS mode: HA and RSI ok, price not beyond the top entry");
        }
        if !self.evaluator.price_offset_ok(Slot::Averaging, reference) {
            return AverageDownCheck::Blocked("HA and RSI ok, but Price not ok");
        }
        AverageDownCheck::Ready("BS mode: HA, RSI and price ok")
    }

    fn check_average_down(
        &self,
        ledger: &PositionLedger,
        stage: &StageConfig,
        reference: f64,
    ) -> AverageDownCheck {
        if stage.is_buy_signals() || ledger.is_empty() {
            return self.check_average_down_bs(ledger, reference);
        }

        if !self.evaluator.trend_reversed(Slot::Averaging) {
            return AverageDownCheck::Blocked("HA not reversed");
        }
        if !self.evaluator.momentum_snapped(Slot::Averaging) {
            return AverageDownCheck::Blocked("HA ok, but RSI not snapped");
        }
        if !self.evaluator.price_offset_ok(Slot::Averaging, reference) {
            return AverageDownCheck::Blocked("HA and RSI ok, but Price not ok");
        }
        AverageDownCheck::Ready("HA, RSI and price ok")
    }

    fn check_profit_take(
        &self,
        ledger: &PositionLedger,
        fills: &FillSnapshot,
        reference: f64,
    ) -> Option<Decision> {
        if ledger.is_empty() {
            return None;
        }
        if fills.limit_order_filled {
            return Some(Decision::ProfitTakeLimit);
        }

        let ready = self.evaluator.trend_reversed(Slot::ProfitTake)
            && self.evaluator.momentum_snapped(Slot::ProfitTake)
            && self.evaluator.price_offset_ok(Slot::ProfitTake, reference);
        ready.then_some(Decision::ProfitTakeMarket)
    }

    async fn gate_active(&mut self, ledger_size: usize) -> Result<bool> {
        if !self.gate.enabled() {
            return Ok(true);
        }
        let (equity, pnl) = self
            .ctx
            .driver
            .get_position_and_equity(&self.params.symbol, self.params.side)
            .await
            .context("Failed to read position for the drawdown gate")?;
        let loss = loss_pct(equity, pnl).context("Drawdown gate cannot evaluate")?;
        Ok(self.gate.evaluate(loss, ledger_size))
    }

    async fn write_status(&self, ledger: &PositionLedger, fills: &FillSnapshot) {
        let status = StatusSnapshot {
            stack_str: ledger.serialize(),
            stack_size: ledger.size(),
            tsl_enabled: self.params.tsl_enabled() && !fills.trailing_stop_finished,
            avdo_status: self.avdo_status.clone(),
            rsi: self.evaluator.momentum_value(Slot::Averaging),
            rsi_snapped: self.evaluator.momentum_snapped(Slot::Averaging),
            last_price: self.evaluator.last_price(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.ctx.store.save_status(&status).await {
            tracing::warn!("Failed to write status: {}", e);
        }
    }

    /// Run one cycle until an action is due
    pub async fn run(
        &mut self,
        ledger: &PositionLedger,
        stages: &StageMap,
        limit_orders: &LimitOrderManager,
    ) -> Result<Decision> {
        let symbol = self.params.symbol.clone();
        let current = self
            .ctx
            .driver
            .get_last_price(&symbol)
            .await
            .context("Failed to read last price")?;
        let reference = ledger.peek().map(|e| e.price).unwrap_or(current);

        if let Err(e) = limit_orders.ensure_placed(ledger.peek().ok()).await {
            tracing::error!("Failed to place profit-take limit: {}", e);
        }

        let depth = ledger.size();
        let stage = stages.stage_for(depth).clone();
        self.reset_signals(&stage);
        self.gate.rearm_logging();

        tracing::info!(
            "📚 Stack {} | depth {} | stage {:?} | price {}",
            ledger,
            depth,
            stage,
            current
        );

        loop {
            let fills = self.ctx.flags.snapshot();
            if fills.position_fully_closed {
                tracing::warn!("🛑 Position fully closed on {}", symbol);
                return Ok(Decision::PositionClosed);
            }

            if !self.gate_active(depth).await? {
                self.avdo_status = "gate inactive".to_string();
                tokio::time::sleep(GATE_INACTIVE_SLEEP).await;
                continue;
            }

            self.evaluator
                .refresh(self.ctx.driver.as_ref())
                .await
                .context("Failed to refresh signals")?;

            match self.check_average_down(ledger, &stage, reference) {
                AverageDownCheck::Ready(reason) => {
                    tracing::info!("📉 Average down: {}", reason);
                    self.avdo_status = reason.to_string();
                    return Ok(Decision::AverageDown {
                        reason: reason.to_string(),
                    });
                }
                AverageDownCheck::Blocked(label) => {
                    tracing::debug!("Average down blocked: {}", label);
                    self.avdo_status = label.to_string();
                }
            }

            if let Some(decision) = self.check_profit_take(ledger, &fills, reference) {
                tracing::info!("💰 Profit take: {:?}", decision);
                return Ok(decision);
            }

            self.write_status(ledger, &fills).await;
            tokio::time::sleep(stage_sleep(&stage)).await;
        }
    }
}
