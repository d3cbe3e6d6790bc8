use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::{notify_best_effort, DriverError, ExchangeDriver, Notifier, OrderRef};
use crate::execution::fill_flags::SharedFillFlags;
use crate::models::{round_to_step, Side};

/// Live trailing-stop order
#[derive(Debug, Clone, PartialEq)]
pub struct TslState {
    pub order_id: String,
    pub current_stop_price: f64,
    pub poll_interval: Duration,
}

/// Stop price for a position on `side` from the last closed Heikin-Ashi bar
///
/// Long positions trail under the bar's low, shorts above its high.
pub fn stop_price_from(side: Side, ha_low: f64, ha_high: f64, increment: f64) -> f64 {
    let raw = match side {
        Side::Buy => ha_low,
        Side::Sell => ha_high,
    };
    round_to_step(raw, increment)
}

/// Keeps a stop order trailing a share of the position
///
/// Runs as its own task. Every failure is logged and ends the worker; the
/// decision loop never sees it.
pub struct TrailingStopController {
    driver: Arc<dyn ExchangeDriver>,
    notifier: Arc<dyn Notifier>,
    symbol: String,
    side: Side,
    qty_factor: f64,
    timeframe: u32,
    /// Marked when the worker ends without being asked to
    completion: Option<SharedFillFlags>,
}

impl TrailingStopController {
    pub fn new(
        driver: Arc<dyn ExchangeDriver>,
        notifier: Arc<dyn Notifier>,
        symbol: impl Into<String>,
        side: Side,
        qty_factor: f64,
        timeframe: u32,
    ) -> Self {
        Self {
            driver,
            notifier,
            symbol: symbol.into(),
            side,
            qty_factor,
            timeframe,
            completion: None,
        }
    }

    /// Record a self-terminated run in `flags` so a restart skips the stop
    pub fn with_completion_flag(mut self, flags: SharedFillFlags) -> Self {
        self.completion = Some(flags);
        self
    }

    /// Five polls per candle
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeframe) * 60 / 5)
    }

    async fn stop_price(&self, increment: f64) -> Result<f64, DriverError> {
        let candle = self
            .driver
            .get_recent_closed_candle(&self.symbol, self.timeframe)
            .await?;
        Ok(stop_price_from(self.side, candle.low, candle.high, increment))
    }

    /// Place the initial stop order
    pub async fn initialize(&self) -> Result<TslState, DriverError> {
        let position = self.driver.get_position(&self.symbol, self.side).await?;
        if position.size <= 0.0 {
            return Err(DriverError::MissingData(format!(
                "no open {} position on {}",
                self.side, self.symbol
            )));
        }

        let qty = self
            .driver
            .round_order_qty(&self.symbol, self.qty_factor * position.size)
            .await?;
        let increment = self.driver.get_price_increment(&self.symbol).await?;
        let stop_price = self.stop_price(increment).await?;

        let ack = self
            .driver
            .place_stop_order(
                &self.symbol,
                self.side.inverse(),
                qty,
                stop_price,
                self.side.position_idx(),
            )
            .await?;

        tracing::info!(
            "🛡️  TSL placed: {} {} @ {} (order {})",
            self.side.inverse(),
            qty,
            stop_price,
            ack.order_id
        );

        Ok(TslState {
            order_id: ack.order_id,
            current_stop_price: stop_price,
            poll_interval: self.poll_interval(),
        })
    }

    /// Trail until the order disappears, an amend fails, or shutdown
    async fn trail(&self, state: &mut TslState, shutdown: &CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("TSL shutdown requested");
                    return;
                }
                _ = tokio::time::sleep(state.poll_interval) => {}
            }

            match self.driver.find_active_order(&self.symbol, &state.order_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::info!("🛡️  TSL order {} no longer active", state.order_id);
                    return;
                }
                Err(e) => {
                    tracing::warn!("TSL order lookup failed: {}", e);
                    continue;
                }
            }

            let increment = match self.driver.get_price_increment(&self.symbol).await {
                Ok(increment) => increment,
                Err(e) => {
                    tracing::warn!("TSL price increment unavailable: {}", e);
                    continue;
                }
            };
            let new_price = match self.stop_price(increment).await {
                Ok(price) => price,
                Err(e) => {
                    tracing::warn!("TSL stop price unavailable: {}", e);
                    continue;
                }
            };

            if (new_price - state.current_stop_price).abs() < increment {
                tracing::debug!("TSL unchanged at {}", state.current_stop_price);
                continue;
            }

            match self
                .driver
                .amend_stop_order(&self.symbol, &state.order_id, new_price)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        "🛡️  TSL moved {} -> {}",
                        state.current_stop_price,
                        new_price
                    );
                    state.current_stop_price = new_price;
                }
                Err(e) => {
                    tracing::error!("❌ TSL amend failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn teardown(&self, state: &TslState) {
        match self
            .driver
            .cancel_order(&self.symbol, &OrderRef::Id(state.order_id.clone()))
            .await
        {
            Ok(()) => tracing::info!("🗑️  TSL order {} cancelled", state.order_id),
            Err(e) if e.is_not_found() => {
                tracing::debug!("TSL order {} already gone", state.order_id)
            }
            Err(e) => tracing::error!("Failed to cancel TSL order {}: {}", state.order_id, e),
        }
    }

    /// Full worker lifecycle
    pub async fn run(self, shutdown: CancellationToken) {
        match self.initialize().await {
            Ok(mut state) => {
                self.trail(&mut state, &shutdown).await;
                self.teardown(&state).await;
            }
            Err(e) => {
                tracing::error!("❌ TSL initialization failed: {}", e);
            }
        }

        if !shutdown.is_cancelled() {
            if let Some(flags) = &self.completion {
                flags.mark_trailing_stop_finished();
            }
        }

        notify_best_effort(self.notifier.as_ref(), &format!("TSL finished for {}", self.symbol))
            .await;
    }

    /// Spawn the worker on a child of `shutdown`
    pub fn spawn(self, shutdown: &CancellationToken) -> TrailingStopHandle {
        let token = shutdown.child_token();
        let join = tokio::spawn(self.run(token.clone()));
        TrailingStopHandle { token, join }
    }
}

pub struct TrailingStopHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TrailingStopHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait up to `timeout`; returns false if the worker had to be abandoned
    pub async fn stop(self, timeout: Duration) -> bool {
        self.token.cancel();
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!("TSL task panicked: {}", e);
                true
            }
            Err(_) => {
                tracing::warn!("⚠️  TSL did not stop within {:?}", timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::paper::{PaperCall, PaperExchange};
    use crate::api::LogNotifier;

    fn controller(paper: &Arc<PaperExchange>, side: Side) -> TrailingStopController {
        TrailingStopController::new(
            paper.clone(),
            Arc::new(LogNotifier),
            "TESTUSDT",
            side,
            0.5,
            15,
        )
    }

    fn paper_with_position() -> Arc<PaperExchange> {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        paper.set_position(2.0, -10.0);
        paper.seed_falling_candles(30);
        paper
    }

    #[test]
    fn test_stop_price_by_side() {
        assert_eq!(stop_price_from(Side::Buy, 99.123, 101.0, 0.01), 99.12);
        assert_eq!(stop_price_from(Side::Sell, 99.0, 101.456, 0.01), 101.46);
    }

    #[test]
    fn test_poll_interval() {
        let paper = paper_with_position();
        assert_eq!(
            controller(&paper, Side::Buy).poll_interval(),
            Duration::from_secs(180)
        );
    }

    #[tokio::test]
    async fn test_initialize_places_stop_on_inverse_side() {
        let paper = paper_with_position();
        let state = controller(&paper, Side::Buy).initialize().await.unwrap();

        assert_eq!(paper.open_orders().len(), 1);
        match &paper.calls()[0] {
            PaperCall::Stop { side, qty, .. } => {
                assert_eq!(*side, Side::Sell);
                assert_eq!(*qty, 1.0);
            }
            other => panic!("unexpected call {:?}", other),
        }
        assert_eq!(state.poll_interval, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_stop_qty_is_rounded_down_to_lot() {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        paper.set_position(0.003, 0.0);
        paper.seed_falling_candles(30);

        controller(&paper, Side::Buy).initialize().await.unwrap();

        match &paper.calls()[0] {
            PaperCall::Stop { qty, .. } => assert_eq!(*qty, 0.001),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_below_one_lot_is_not_placed() {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        paper.set_position(0.001, 0.0);
        paper.seed_falling_candles(30);

        let err = tokio_test::assert_err!(controller(&paper, Side::Buy).initialize().await);
        assert!(matches!(err, DriverError::Rejected(_)));
        assert!(paper.open_orders().is_empty());
    }

    #[tokio::test]
    async fn test_zero_position_fails() {
        let paper = Arc::new(PaperExchange::new("TESTUSDT", 100.0));
        paper.seed_falling_candles(30);

        let err = tokio_test::assert_err!(controller(&paper, Side::Buy).initialize().await);
        assert!(matches!(err, DriverError::MissingData(_)));
        assert!(paper.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_stop_is_not_amended() {
        let paper = paper_with_position();
        let shutdown = CancellationToken::new();
        let handle = controller(&paper, Side::Buy).spawn(&shutdown);

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(handle.stop(Duration::from_secs(15)).await);

        let calls = paper.calls();
        assert!(matches!(calls[0], PaperCall::Stop { .. }));
        assert!(!calls.iter().any(|c| matches!(c, PaperCall::Amend { .. })));
        assert!(matches!(calls.last(), Some(PaperCall::Cancel(OrderRef::Id(_)))));
        assert!(paper.open_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_candles_move_stop() {
        let paper = paper_with_position();
        let shutdown = CancellationToken::new();
        let handle = controller(&paper, Side::Buy).spawn(&shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        paper.set_price(90.0);
        paper.seed_falling_candles(30);
        tokio::time::sleep(Duration::from_secs(200)).await;
        handle.stop(Duration::from_secs(15)).await;

        assert!(paper
            .calls()
            .iter()
            .any(|c| matches!(c, PaperCall::Amend { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_order_ends_worker() {
        let paper = paper_with_position();
        let shutdown = CancellationToken::new();
        let handle = controller(&paper, Side::Buy).spawn(&shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let order_id = paper.open_orders()[0].order_id.clone();
        paper.trigger_order(&order_id);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(handle.is_finished());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggered_stop_marks_completion() {
        let paper = paper_with_position();
        let flags = SharedFillFlags::new();
        let shutdown = CancellationToken::new();
        let handle = controller(&paper, Side::Buy)
            .with_completion_flag(flags.clone())
            .spawn(&shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let order_id = paper.open_orders()[0].order_id.clone();
        paper.trigger_order(&order_id);
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(handle.is_finished());
        assert!(flags.trailing_stop_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_does_not_mark_completion() {
        let paper = paper_with_position();
        let flags = SharedFillFlags::new();
        let shutdown = CancellationToken::new();
        let handle = controller(&paper, Side::Buy)
            .with_completion_flag(flags.clone())
            .spawn(&shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(handle.stop(Duration::from_secs(15)).await);

        assert!(!flags.trailing_stop_finished());
        assert!(paper.open_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_amend_ends_worker() {
        let paper = paper_with_position();
        paper.reject_amends(true);
        let shutdown = CancellationToken::new();
        let handle = controller(&paper, Side::Buy).spawn(&shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        paper.set_price(90.0);
        paper.seed_falling_candles(30);
        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(handle.is_finished());
        let calls = paper.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, PaperCall::Amend { .. }))
                .count(),
            1
        );
        assert!(paper.open_orders().is_empty());
    }
}
