use chrono::Utc;
use std::collections::BTreeSet;

use crate::api::{DriverError, ExchangeDriver};
use crate::models::Side;
use crate::strategy::detectors::{
    HeikinAshiReversal, MomentumDetector, MomentumSettings, RsiSnap, TrendDetector,
};

/// Candles fetched per timeframe on every refresh
pub const CANDLE_LOOKBACK: usize = 100;

/// Logical signal slot
///
/// `Averaging` is bound to the position side, `ProfitTake` to the inverse side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Averaging,
    ProfitTake,
}

impl Slot {
    pub fn name(&self) -> &'static str {
        match self {
            Slot::Averaging => "averaging",
            Slot::ProfitTake => "profit-take",
        }
    }
}

/// Parameters for re-baselining one slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotReset {
    pub trend_timeframe: u32,
    pub momentum_timeframe: u32,
    pub set_threshold: f64,
    pub reset_threshold: f64,
    pub side: Side,
}

struct SlotDetectors {
    trend: Box<dyn TrendDetector>,
    momentum: Box<dyn MomentumDetector>,
    side: Side,
    /// Minimum favourable move relative to a reference price, as a fraction
    offset_fraction: f64,
}

impl SlotDetectors {
    fn defaults(side: Side, offset_fraction: f64) -> Self {
        Self {
            trend: Box::new(HeikinAshiReversal::new(1, side)),
            momentum: Box::new(RsiSnap::new(MomentumSettings {
                timeframe: 1,
                set_threshold: 50.0,
                reset_threshold: 50.0,
                side,
            })),
            side,
            offset_fraction,
        }
    }
}

/// Favourable move from `reference` to `current` for a slot on `side`
///
/// Positive when a Buy-side slot sees the price fall or a Sell-side slot sees
/// it rise.
pub fn price_offset(side: Side, reference: f64, current: f64) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    match side {
        Side::Buy => (reference - current) / reference,
        Side::Sell => (current - reference) / reference,
    }
}

/// Combines trend, momentum and price-offset detectors into per-slot booleans
///
/// `refresh` is the only method that talks to the exchange; every query is a
/// read of the values computed by the last refresh.
pub struct SignalEvaluator {
    symbol: String,
    averaging: SlotDetectors,
    profit_take: SlotDetectors,
    last_price: Option<f64>,
}

impl SignalEvaluator {
    /// Evaluator with Heikin-Ashi and RSI detectors on both slots
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        averaging_offset: f64,
        profit_take_offset: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            averaging: SlotDetectors::defaults(side, averaging_offset),
            profit_take: SlotDetectors::defaults(side.inverse(), profit_take_offset),
            last_price: None,
        }
    }

    /// Replace the detectors of a slot
    pub fn with_detectors(
        mut self,
        slot: Slot,
        trend: Box<dyn TrendDetector>,
        momentum: Box<dyn MomentumDetector>,
    ) -> Self {
        let detectors = self.slot_mut(slot);
        detectors.trend = trend;
        detectors.momentum = momentum;
        self
    }

    fn slot(&self, slot: Slot) -> &SlotDetectors {
        match slot {
            Slot::Averaging => &self.averaging,
            Slot::ProfitTake => &self.profit_take,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut SlotDetectors {
        match slot {
            Slot::Averaging => &mut self.averaging,
            Slot::ProfitTake => &mut self.profit_take,
        }
    }

    /// Re-baseline both detectors of a slot
    pub fn reset(&mut self, slot: Slot, params: SlotReset) {
        tracing::debug!(
            "🔄 Reset {} signals: HA {}m, RSI {}m, set {:.1}, reset {:.1}, side {}",
            slot.name(),
            params.trend_timeframe,
            params.momentum_timeframe,
            params.set_threshold,
            params.reset_threshold,
            params.side
        );

        let detectors = self.slot_mut(slot);
        detectors.side = params.side;
        detectors.trend.reset(params.trend_timeframe, params.side);
        detectors.momentum.reset(MomentumSettings {
            timeframe: params.momentum_timeframe,
            set_threshold: params.set_threshold,
            reset_threshold: params.reset_threshold,
            side: params.side,
        });
    }

    /// Pull the last price and fresh candles, and feed every detector
    pub async fn refresh(&mut self, driver: &dyn ExchangeDriver) -> Result<(), DriverError> {
        let price = driver.get_last_price(&self.symbol).await?;
        self.last_price = Some(price);

        let mut timeframes = BTreeSet::new();
        for detectors in [&self.averaging, &self.profit_take] {
            timeframes.insert(detectors.trend.timeframe());
            timeframes.insert(detectors.momentum.timeframe());
        }

        let now = Utc::now();
        for tf in timeframes {
            let candles = driver.get_candles(&self.symbol, tf, CANDLE_LOOKBACK).await?;

            for detectors in [&mut self.averaging, &mut self.profit_take] {
                if detectors.trend.timeframe() == tf {
                    detectors.trend.update(&candles, now);
                }
                if detectors.momentum.timeframe() == tf {
                    detectors.momentum.update(&candles, now);
                }
            }
        }

        Ok(())
    }

    pub fn trend_reversed(&self, slot: Slot) -> bool {
        self.slot(slot).trend.reversed()
    }

    pub fn momentum_snapped(&self, slot: Slot) -> bool {
        self.slot(slot).momentum.snapped()
    }

    pub fn momentum_value(&self, slot: Slot) -> Option<f64> {
        self.slot(slot).momentum.value()
    }

    /// Whether the last price moved past the slot's offset fraction from `reference`
    pub fn price_offset_ok(&self, slot: Slot, reference: f64) -> bool {
        let Some(current) = self.last_price else {
            return false;
        };
        let detectors = self.slot(slot);
        price_offset(detectors.side, reference, current) > detectors.offset_fraction
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    #[cfg(test)]
    pub(crate) fn set_last_price(&mut self, price: f64) {
        self.last_price = Some(price);
    }
}
