use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DriverError, ExchangeDriver, OrderRef};
use crate::models::{floor_to_step, round_to_step, ActiveOrder, Candle, OrderAck, PositionInfo, Side};

const QTY_STEP: f64 = 0.001;

/// Order-affecting call recorded by the paper exchange
#[derive(Debug, Clone, PartialEq)]
pub enum PaperCall {
    Chase { side: Side, qty: f64 },
    MarketClose { side: Side, qty: f64, position_idx: u8 },
    Limit { side: Side, qty: f64, price: f64, link_id: String },
    Cancel(OrderRef),
    Stop { side: Side, qty: f64, trigger_price: f64 },
    Amend { order_id: String, trigger_price: f64 },
}

#[derive(Debug)]
struct PaperState {
    price: f64,
    equity: f64,
    position: PositionInfo,
    increment: f64,
    candles: Vec<Candle>,
    /// Resting orders by order id
    orders: HashMap<String, ActiveOrder>,
    /// Client link id -> order id
    links: HashMap<String, String>,
    fills: HashMap<String, f64>,
    calls: Vec<PaperCall>,
    next_id: u64,
    reject_amends: bool,
}

impl PaperState {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }
}

/// In-memory exchange
///
/// Chase and market orders fill immediately at the current price; limit and
/// stop orders rest until cancelled. Candles are served as seeded, whatever
/// timeframe is requested.
pub struct PaperExchange {
    symbol: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            state: Mutex::new(PaperState {
                price,
                equity: 10_000.0,
                position: PositionInfo {
                    size: 0.0,
                    unrealized_pnl: 0.0,
                },
                increment: 0.01,
                candles: Vec::new(),
                orders: HashMap::new(),
                links: HashMap::new(),
                fills: HashMap::new(),
                calls: Vec::new(),
                next_id: 0,
                reject_amends: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), DriverError> {
        if symbol != self.symbol {
            return Err(DriverError::MissingData(format!("unknown symbol {}", symbol)));
        }
        Ok(())
    }

    pub fn set_price(&self, price: f64) {
        self.state().price = price;
    }

    pub fn set_equity(&self, equity: f64) {
        self.state().equity = equity;
    }

    pub fn set_position(&self, size: f64, unrealized_pnl: f64) {
        self.state().position = PositionInfo {
            size,
            unrealized_pnl,
        };
    }

    pub fn set_price_increment(&self, increment: f64) {
        self.state().increment = increment;
    }

    pub fn seed_candles(&self, candles: Vec<Candle>) {
        self.state().candles = candles;
    }

    /// Hourly bars stepping down by 0.5 towards the current price
    ///
    /// The newest bar opened a minute ago and is still forming for any
    /// timeframe above one minute.
    pub fn seed_falling_candles(&self, count: usize) {
        let price = self.state().price;
        let newest_open = Utc::now() - Duration::minutes(1);

        let candles = (0..count)
            .map(|i| {
                let age = (count - 1 - i) as i64;
                let close = price + age as f64 * 0.5;
                let open = close + 0.5;
                Candle {
                    timestamp: newest_open - Duration::hours(age),
                    open,
                    high: open + 0.1,
                    low: close - 0.1,
                    close,
                    volume: 1.0,
                }
            })
            .collect();

        self.seed_candles(candles);
    }

    /// Drop a resting order as if it had triggered
    pub fn trigger_order(&self, order_id: &str) {
        let mut state = self.state();
        state.orders.remove(order_id);
        state.links.retain(|_, id| id != order_id);
    }

    pub fn reject_amends(&self, reject: bool) {
        self.state().reject_amends = reject;
    }

    pub fn calls(&self) -> Vec<PaperCall> {
        self.state().calls.clone()
    }

    pub fn open_orders(&self) -> Vec<ActiveOrder> {
        self.state().orders.values().cloned().collect()
    }

    pub fn position(&self) -> PositionInfo {
        self.state().position
    }
}

#[async_trait]
impl ExchangeDriver for PaperExchange {
    async fn get_last_price(&self, symbol: &str) -> Result<f64, DriverError> {
        self.check_symbol(symbol)?;
        Ok(self.state().price)
    }

    async fn get_position(&self, symbol: &str, _side: Side) -> Result<PositionInfo, DriverError> {
        self.check_symbol(symbol)?;
        Ok(self.state().position)
    }

    async fn get_total_equity(&self) -> Result<f64, DriverError> {
        Ok(self.state().equity)
    }

    async fn get_valid_order_qty(&self, symbol: &str, fraction: f64) -> Result<f64, DriverError> {
        self.check_symbol(symbol)?;
        let state = self.state();
        if state.price <= 0.0 {
            return Err(DriverError::MissingData("no price".into()));
        }
        let qty = round_to_step(state.equity * fraction / state.price, QTY_STEP);
        if qty <= 0.0 {
            return Err(DriverError::Rejected(format!(
                "order qty for fraction {} rounds to zero",
                fraction
            )));
        }
        Ok(qty)
    }

    async fn round_order_qty(&self, symbol: &str, qty: f64) -> Result<f64, DriverError> {
        self.check_symbol(symbol)?;
        let rounded = floor_to_step(qty, QTY_STEP);
        if rounded <= 0.0 {
            return Err(DriverError::Rejected(format!(
                "qty {} is below the lot step {}",
                qty, QTY_STEP
            )));
        }
        Ok(rounded)
    }

    async fn place_chase_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        _position_idx: u8,
        _max_distance_pct: f64,
    ) -> Result<OrderAck, DriverError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        let order_id = state.next_order_id();
        let price = state.price;
        state.fills.insert(order_id.clone(), price);
        state.position.size += qty;
        state.calls.push(PaperCall::Chase { side, qty });

        Ok(OrderAck {
            order_id,
            status: Some("Filled".into()),
        })
    }

    async fn get_filled_order_price(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<f64, DriverError> {
        self.check_symbol(symbol)?;
        self.state()
            .fills
            .get(order_id)
            .copied()
            .ok_or_else(|| DriverError::MissingData(format!("no fill for order {}", order_id)))
    }

    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        position_idx: u8,
    ) -> Result<OrderAck, DriverError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        let order_id = state.next_order_id();
        let price = state.price;
        state.fills.insert(order_id.clone(), price);
        state.position.size = (state.position.size - qty).max(0.0);
        state.calls.push(PaperCall::MarketClose {
            side,
            qty,
            position_idx,
        });

        Ok(OrderAck {
            order_id,
            status: Some("Filled".into()),
        })
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        _position_idx: u8,
        link_id: &str,
    ) -> Result<OrderAck, DriverError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        let order_id = state.next_order_id();
        state.orders.insert(
            order_id.clone(),
            ActiveOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                trigger_price: None,
                price: Some(price),
                qty: Some(qty),
            },
        );
        state.links.insert(link_id.to_string(), order_id.clone());
        state.calls.push(PaperCall::Limit {
            side,
            qty,
            price,
            link_id: link_id.to_string(),
        });

        Ok(OrderAck {
            order_id,
            status: Some("New".into()),
        })
    }

    async fn cancel_order(&self, symbol: &str, order: &OrderRef) -> Result<(), DriverError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        state.calls.push(PaperCall::Cancel(order.clone()));

        let order_id = match order {
            OrderRef::Id(id) => Some(id.clone()),
            OrderRef::LinkId(link) => state.links.remove(link),
        };
        match order_id.and_then(|id| state.orders.remove(&id)) {
            Some(_) => Ok(()),
            None => Err(DriverError::NotFound(order.to_string())),
        }
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        trigger_price: f64,
        _position_idx: u8,
    ) -> Result<OrderAck, DriverError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        let order_id = state.next_order_id();
        state.orders.insert(
            order_id.clone(),
            ActiveOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                trigger_price: Some(trigger_price),
                price: None,
                qty: Some(qty),
            },
        );
        state.calls.push(PaperCall::Stop {
            side,
            qty,
            trigger_price,
        });

        Ok(OrderAck {
            order_id,
            status: Some("Untriggered".into()),
        })
    }

    async fn amend_stop_order(
        &self,
        symbol: &str,
        order_id: &str,
        trigger_price: f64,
    ) -> Result<OrderAck, DriverError> {
        self.check_symbol(symbol)?;
        let mut state = self.state();
        state.calls.push(PaperCall::Amend {
            order_id: order_id.to_string(),
            trigger_price,
        });
        if state.reject_amends {
            return Err(DriverError::Rejected("amend rejected".into()));
        }

        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| DriverError::NotFound(order_id.to_string()))?;
        order.trigger_price = Some(trigger_price);

        Ok(OrderAck {
            order_id: order_id.to_string(),
            status: Some("Untriggered".into()),
        })
    }

    async fn find_active_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<ActiveOrder>, DriverError> {
        self.check_symbol(symbol)?;
        Ok(self.state().orders.get(order_id).cloned())
    }

    async fn get_price_increment(&self, symbol: &str) -> Result<f64, DriverError> {
        self.check_symbol(symbol)?;
        Ok(self.state().increment)
    }

    async fn get_candles(
        &self,
        symbol: &str,
        _timeframe: u32,
        limit: usize,
    ) -> Result<Vec<Candle>, DriverError> {
        self.check_symbol(symbol)?;
        let state = self.state();
        let skip = state.candles.len().saturating_sub(limit);
        Ok(state.candles[skip..].to_vec())
    }
}
