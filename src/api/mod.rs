pub mod order_stream;
pub mod paper;
pub mod proxy;
pub mod telegram;

pub use order_stream::OrderStream;
pub use paper::PaperExchange;
pub use proxy::ProxyDriver;
pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use chrono::Utc;

use crate::indicators::heikin_ashi;
use crate::models::{ActiveOrder, Candle, OrderAck, PositionInfo, Side};

/// Candles requested when only the latest closed one is needed
const CLOSED_CANDLE_LOOKBACK: usize = 50;

/// Errors surfaced by an exchange driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The order (or other entity) no longer exists on the exchange
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected by exchange: {0}")]
    Rejected(String),

    /// A lookup returned nothing usable
    #[error("missing data: {0}")]
    MissingData(String),

    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }
}

/// Reference to an order by exchange id or by client link id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    Id(String),
    LinkId(String),
}

impl std::fmt::Display for OrderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderRef::Id(id) => write!(f, "id={}", id),
            OrderRef::LinkId(link) => write!(f, "link={}", link),
        }
    }
}

/// Exchange operations the strategy depends on
///
/// Timeframes are in minutes. Every order placement takes the hedge-mode
/// position index of the position it belongs to.
#[async_trait]
pub trait ExchangeDriver: Send + Sync {
    async fn get_last_price(&self, symbol: &str) -> Result<f64, DriverError>;

    async fn get_position(&self, symbol: &str, side: Side) -> Result<PositionInfo, DriverError>;

    async fn get_total_equity(&self) -> Result<f64, DriverError>;

    /// Order size for `fraction` of the account, rounded to the symbol's lot step
    async fn get_valid_order_qty(&self, symbol: &str, fraction: f64) -> Result<f64, DriverError>;

    /// `qty` rounded down to the symbol's lot step; a result of zero is rejected
    async fn round_order_qty(&self, symbol: &str, qty: f64) -> Result<f64, DriverError>;

    /// Adaptive order that follows the book until filled; returns once filled
    async fn place_chase_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        position_idx: u8,
        max_distance_pct: f64,
    ) -> Result<OrderAck, DriverError>;

    async fn get_filled_order_price(&self, symbol: &str, order_id: &str)
        -> Result<f64, DriverError>;

    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        position_idx: u8,
    ) -> Result<OrderAck, DriverError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        position_idx: u8,
        link_id: &str,
    ) -> Result<OrderAck, DriverError>;

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<(), DriverError>;

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
        position_idx: u8,
    ) -> Result<OrderAck, DriverError>;

    async fn amend_stop_order(
        &self,
        symbol: &str,
        order_id: &str,
        trigger_price: f64,
    ) -> Result<OrderAck, DriverError>;

    async fn find_active_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<ActiveOrder>, DriverError>;

    async fn get_price_increment(&self, symbol: &str) -> Result<f64, DriverError>;

    /// Latest candles, oldest first; the last one may still be forming
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: u32,
        limit: usize,
    ) -> Result<Vec<Candle>, DriverError>;

    /// (equity, unrealized PnL) of the position on `side`
    async fn get_position_and_equity(
        &self,
        symbol: &str,
        side: Side,
    ) -> Result<(f64, f64), DriverError> {
        let equity = self.get_total_equity().await?;
        let position = self.get_position(symbol, side).await?;
        Ok((equity, position.unrealized_pnl))
    }

    /// Heikin-Ashi candle of the most recently closed bar
    async fn get_recent_closed_candle(
        &self,
        symbol: &str,
        timeframe: u32,
    ) -> Result<Candle, DriverError> {
        let now = Utc::now();
        let closed: Vec<Candle> = self
            .get_candles(symbol, timeframe, CLOSED_CANDLE_LOOKBACK)
            .await?
            .into_iter()
            .filter(|c| c.is_closed(timeframe, now))
            .collect();

        heikin_ashi(&closed).pop().ok_or_else(|| {
            DriverError::MissingData(format!("no closed {}m candle for {}", timeframe, symbol))
        })
    }
}

/// Outbound announcements (trailing stop lifecycle, fatal errors)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        tracing::info!("📣 {}", text);
        Ok(())
    }
}

/// Send and swallow failures
pub async fn notify_best_effort(notifier: &dyn Notifier, text: &str) {
    if let Err(e) = notifier.send(text).await {
        tracing::warn!("Notification failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _text: &str) -> anyhow::Result<()> {
            anyhow::bail!("chat unreachable")
        }
    }

    #[tokio::test]
    async fn test_notify_best_effort_swallows_errors() {
        notify_best_effort(&FailingNotifier, "TSL finished").await;
        notify_best_effort(&LogNotifier, "TSL finished").await;
    }

    #[test]
    fn test_not_found_classification() {
        assert!(DriverError::NotFound("x".into()).is_not_found());
        assert!(!DriverError::Rejected("x".into()).is_not_found());
    }

    #[tokio::test]
    async fn test_recent_closed_candle_skips_forming_bar() {
        let paper = PaperExchange::new("TESTUSDT", 100.0);
        paper.seed_falling_candles(10);

        let ha = paper.get_recent_closed_candle("TESTUSDT", 5).await.unwrap();
        let raw = paper.get_candles("TESTUSDT", 5, 10).await.unwrap();

        // The last seeded bar is still forming
        assert!(ha.timestamp < raw.last().unwrap().timestamp);
    }

    #[tokio::test]
    async fn test_recent_closed_candle_without_data() {
        let paper = PaperExchange::new("TESTUSDT", 100.0);
        let err = paper.get_recent_closed_candle("TESTUSDT", 5).await.unwrap_err();
        assert!(matches!(err, DriverError::MissingData(_)));
    }
}
