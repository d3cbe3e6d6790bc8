use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order / position side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn inverse(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Hedge-mode position index of a position opened on this side
    pub fn position_idx(self) -> u8 {
        match self {
            Side::Buy => 1,
            Side::Sell => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buy" | "buy" | "BUY" => Ok(Side::Buy),
            "Sell" | "sell" | "SELL" => Ok(Side::Sell),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// OHLCV candlestick data
///
/// `timestamp` is the candle open time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Whether a candle of `timeframe_minutes` has closed by `now`
    pub fn is_closed(&self, timeframe_minutes: u32, now: DateTime<Utc>) -> bool {
        self.timestamp + Duration::minutes(timeframe_minutes as i64) <= now
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Acknowledgement of an accepted order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Order still resting on the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveOrder {
    pub order_id: String,
    pub symbol: String,
    #[serde(default)]
    pub trigger_price: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub qty: Option<f64>,
}

/// Open position on one side of a hedge-mode account
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PositionInfo {
    pub size: f64,
    pub unrealized_pnl: f64,
}

/// Last limit order fill seen on the order stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilledOrderInfo {
    pub order_id: String,
    pub side: String,
    pub qty: String,
    pub price: String,
}

/// Order update pushed by the order stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(rename = "orderStatus")]
    pub status: String,
    #[serde(default)]
    pub stop_order_type: String,
    #[serde(default)]
    pub tpsl_mode: String,
}

impl OrderEvent {
    pub fn is_filled(&self) -> bool {
        self.status == "Filled"
    }

    /// Full-position take-profit or stop-loss fill
    pub fn is_full_tp_sl(&self) -> bool {
        self.tpsl_mode == "Full"
            && (self.stop_order_type == "TakeProfit" || self.stop_order_type == "StopLoss")
    }

    /// Average fill price, falling back to the order price
    pub fn fill_price(&self) -> &str {
        if self.avg_price.is_empty() || self.avg_price == "0" {
            &self.price
        } else {
            &self.avg_price
        }
    }
}

/// Decimal places in the shortest decimal form of `step`
fn step_decimals(step: f64) -> i32 {
    let repr = step.to_string();
    repr.split_once('.')
        .map(|(_, frac)| frac.trim_end_matches('0').len() as i32)
        .unwrap_or(0)
}

/// Trim binary noise (e.g. 0.30000000000000004) to the step's precision
fn trim_to_step_precision(value: f64, step: f64) -> f64 {
    let factor = 10f64.powi(step_decimals(step));
    (value * factor).round() / factor
}

/// Round a price to the nearest multiple of `step`
pub fn round_to_step(price: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return price;
    }
    trim_to_step_precision((price / step).round() * step, step)
}

/// Round a quantity down to a multiple of `step`
pub fn floor_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    // Tolerate quotients like 2.9999999999999996 for exact multiples
    let lots = (qty / step + 1e-9).floor();
    trim_to_step_precision(lots * step, step)
}
