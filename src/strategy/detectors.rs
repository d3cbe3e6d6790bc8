use chrono::{DateTime, Utc};

use crate::indicators::{calculate_rsi, heikin_ashi, RSI_PERIOD};
use crate::models::{Candle, Side};

/// Detects a trend reversal towards a side
pub trait TrendDetector: Send + Sync {
    /// Re-baseline on `timeframe` for `side`; clears any latched reversal
    fn reset(&mut self, timeframe: u32, side: Side);

    fn timeframe(&self) -> u32;

    /// Feed the latest candles (oldest first, the last one may still be forming)
    fn update(&mut self, candles: &[Candle], now: DateTime<Utc>);

    /// Whether the trend flipped since the last reset
    fn reversed(&self) -> bool;
}

/// Threshold settings for a momentum detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumSettings {
    pub timeframe: u32,
    /// Value the oscillator must reach to snap
    pub set_threshold: f64,
    /// Value that releases a snap when crossed back
    pub reset_threshold: f64,
    pub side: Side,
}

/// Detects a momentum oscillator crossing its trigger threshold
pub trait MomentumDetector: Send + Sync {
    fn reset(&mut self, settings: MomentumSettings);

    fn timeframe(&self) -> u32;

    fn update(&mut self, candles: &[Candle], now: DateTime<Utc>);

    fn snapped(&self) -> bool;

    /// Last computed oscillator value
    fn value(&self) -> Option<f64>;
}

/// Heikin-Ashi colour flip detector
///
/// On the first update after a reset the newest closed HA candle becomes the
/// baseline. The detector latches once a closed HA candle newer than the
/// baseline has the side's colour (green for Buy, red for Sell) right after an
/// opposite-coloured one.
#[derive(Debug, Clone)]
pub struct HeikinAshiReversal {
    timeframe: u32,
    side: Side,
    baseline: Option<DateTime<Utc>>,
    reversed: bool,
}

impl HeikinAshiReversal {
    pub fn new(timeframe: u32, side: Side) -> Self {
        Self {
            timeframe,
            side,
            baseline: None,
            reversed: false,
        }
    }

    fn favourable(&self, candle: &Candle) -> bool {
        match self.side {
            Side::Buy => candle.is_bullish(),
            Side::Sell => candle.is_bearish(),
        }
    }

    fn adverse(&self, candle: &Candle) -> bool {
        match self.side {
            Side::Buy => candle.is_bearish(),
            Side::Sell => candle.is_bullish(),
        }
    }
}

impl TrendDetector for HeikinAshiReversal {
    fn reset(&mut self, timeframe: u32, side: Side) {
        self.timeframe = timeframe;
        self.side = side;
        self.baseline = None;
        self.reversed = false;
    }

    fn timeframe(&self) -> u32 {
        self.timeframe
    }

    fn update(&mut self, candles: &[Candle], now: DateTime<Utc>) {
        if self.reversed {
            return;
        }

        let closed: Vec<Candle> = candles
            .iter()
            .filter(|c| c.is_closed(self.timeframe, now))
            .cloned()
            .collect();
        let ha = heikin_ashi(&closed);

        let Some(newest) = ha.last() else {
            return;
        };
        let baseline = *self.baseline.get_or_insert(newest.timestamp);

        let flipped = ha.windows(2).any(|pair| {
            pair[1].timestamp > baseline && self.adverse(&pair[0]) && self.favourable(&pair[1])
        });

        if flipped {
            tracing::debug!(
                "HA reversal ({} side, {}m) detected after {}",
                self.side,
                self.timeframe,
                baseline
            );
            self.reversed = true;
        }
    }

    fn reversed(&self) -> bool {
        self.reversed
    }
}

/// RSI threshold latch
///
/// Buy side snaps when RSI drops to `set_threshold` or below and releases when
/// it climbs back to `reset_threshold`. Sell side mirrors this.
#[derive(Debug, Clone)]
pub struct RsiSnap {
    settings: MomentumSettings,
    period: usize,
    value: Option<f64>,
    snapped: bool,
}

impl RsiSnap {
    pub fn new(settings: MomentumSettings) -> Self {
        Self {
            settings,
            period: RSI_PERIOD,
            value: None,
            snapped: false,
        }
    }

    pub fn with_period(mut self, period: usize) -> Self {
        self.period = period;
        self
    }

    fn crossed_set(&self, value: f64) -> bool {
        match self.settings.side {
            Side::Buy => value <= self.settings.set_threshold,
            Side::Sell => value >= self.settings.set_threshold,
        }
    }

    fn crossed_reset(&self, value: f64) -> bool {
        match self.settings.side {
            Side::Buy => value >= self.settings.reset_threshold,
            Side::Sell => value <= self.settings.reset_threshold,
        }
    }
}

impl MomentumDetector for RsiSnap {
    fn reset(&mut self, settings: MomentumSettings) {
        self.settings = settings;
        self.value = None;
        self.snapped = false;
    }

    fn timeframe(&self) -> u32 {
        self.settings.timeframe
    }

    fn update(&mut self, candles: &[Candle], _now: DateTime<Utc>) {
        // The forming candle's close is the live price, so it is included
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let Some(value) = calculate_rsi(&closes, self.period) else {
            return;
        };
        self.value = Some(value);

        if self.crossed_set(value) {
            if !self.snapped {
                tracing::debug!(
                    "RSI snapped ({} side): {:.2} vs threshold {:.2}",
                    self.settings.side,
                    value,
                    self.settings.set_threshold
                );
            }
            self.snapped = true;
        } else if self.snapped && self.crossed_reset(value) {
            tracing::debug!("RSI snap released at {:.2}", value);
            self.snapped = false;
        }
    }

    fn snapped(&self) -> bool {
        self.snapped
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Candles from a close series; each candle opens at the previous close
    fn candles_from_closes(closes: &[f64], tf: u32) -> Vec<Candle> {
        let mut prev = closes[0];
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = prev;
                prev = close;
                Candle {
                    timestamp: base_time() + Duration::minutes(i as i64 * tf as i64),
                    open,
                    high: open.max(close) + 0.1,
                    low: open.min(close) - 0.1,
                    close,
                    volume: 1.0,
                }
            })
            .collect()
    }

    fn far_future() -> DateTime<Utc> {
        base_time() + Duration::days(365)
    }

    #[test]
    fn test_ha_first_update_only_sets_baseline() {
        let mut det = HeikinAshiReversal::new(5, Side::Buy);
        // Falling then rising: a flip exists but entirely before the baseline
        let candles = candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 8.0, 9.0, 10.0], 5);

        det.update(&candles, far_future());
        assert!(!det.reversed());
    }

    #[test]
    fn test_ha_detects_flip_after_baseline() {
        let mut det = HeikinAshiReversal::new(5, Side::Buy);
        let falling = candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0], 5);
        det.update(&falling, far_future());
        assert!(!det.reversed());

        let rebound = candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 7.5, 9.0], 5);
        det.update(&rebound, far_future());
        assert!(det.reversed());
    }

    #[test]
    fn test_ha_sell_side_wants_red() {
        let mut det = HeikinAshiReversal::new(5, Side::Sell);
        let rising = candles_from_closes(&[6.0, 7.0, 8.0, 9.0, 10.0], 5);
        det.update(&rising, far_future());

        let still_rising = candles_from_closes(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0], 5);
        det.update(&still_rising, far_future());
        assert!(!det.reversed());

        let drop = candles_from_closes(&[6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 8.0, 6.0], 5);
        det.update(&drop, far_future());
        assert!(det.reversed());
    }

    #[test]
    fn test_ha_reset_clears_latch() {
        let mut det = HeikinAshiReversal::new(5, Side::Buy);
        det.update(&candles_from_closes(&[10.0, 9.0, 8.0], 5), far_future());
        det.update(
            &candles_from_closes(&[10.0, 9.0, 8.0, 9.5, 11.0], 5),
            far_future(),
        );
        assert!(det.reversed());

        det.reset(15, Side::Buy);
        assert!(!det.reversed());
        assert_eq!(det.timeframe(), 15);
    }

    #[test]
    fn test_ha_ignores_forming_candle() {
        let mut det = HeikinAshiReversal::new(5, Side::Buy);
        let falling = candles_from_closes(&[10.0, 9.0, 8.0, 7.0], 5);
        det.update(&falling, far_future());

        // The bullish candle opened at +20m has not closed at +22m
        let with_forming = candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 12.0], 5);
        det.update(&with_forming, base_time() + Duration::minutes(22));
        assert!(!det.reversed());
    }

    fn settings(side: Side, set: f64, reset: f64) -> MomentumSettings {
        MomentumSettings {
            timeframe: 5,
            set_threshold: set,
            reset_threshold: reset,
            side,
        }
    }

    #[test]
    fn test_rsi_snap_buy_side() {
        let mut det = RsiSnap::new(settings(Side::Buy, 30.0, 70.0)).with_period(5);

        let falling = candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0], 5);
        det.update(&falling, far_future());
        assert!(det.snapped());
        assert!(det.value().unwrap() < 30.0);
    }

    #[test]
    fn test_rsi_snap_stays_latched_between_thresholds() {
        let mut det = RsiSnap::new(settings(Side::Buy, 30.0, 70.0)).with_period(5);
        det.update(
            &candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0], 5),
            far_future(),
        );
        assert!(det.snapped());

        // Small bounce: RSI back between thresholds, latch holds
        det.update(
            &candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 6.0], 5),
            far_future(),
        );
        let v = det.value().unwrap();
        assert!(v > 30.0 && v < 70.0, "rsi {}", v);
        assert!(det.snapped());
    }

    #[test]
    fn test_rsi_snap_released_at_reset_threshold() {
        let mut det = RsiSnap::new(settings(Side::Buy, 30.0, 70.0)).with_period(5);
        det.update(
            &candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0], 5),
            far_future(),
        );
        assert!(det.snapped());

        det.update(
            &candles_from_closes(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0], 5),
            far_future(),
        );
        assert!(!det.snapped());
    }

    #[test]
    fn test_rsi_snap_sell_side() {
        let mut det = RsiSnap::new(settings(Side::Sell, 70.0, 30.0)).with_period(5);
        det.update(
            &candles_from_closes(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0], 5),
            far_future(),
        );
        assert!(det.snapped());
    }

    #[test]
    fn test_rsi_reset_clears_value() {
        let mut det = RsiSnap::new(settings(Side::Buy, 30.0, 70.0)).with_period(5);
        det.update(
            &candles_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0, 4.0], 5),
            far_future(),
        );
        det.reset(settings(Side::Buy, 25.0, 75.0));

        assert!(!det.snapped());
        assert!(det.value().is_none());
    }
}
