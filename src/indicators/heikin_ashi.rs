use crate::models::Candle;

/// Convert regular candles into Heikin-Ashi candles
///
/// - HA close = (open + high + low + close) / 4
/// - HA open  = (prev HA open + prev HA close) / 2, seeded with (open + close) / 2
/// - HA high  = max(high, HA open, HA close)
/// - HA low   = min(low, HA open, HA close)
///
/// Timestamps and volumes are carried over unchanged.
pub fn heikin_ashi(candles: &[Candle]) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());

    for candle in candles {
        let ha_close = (candle.open + candle.high + candle.low + candle.close) / 4.0;
        let ha_open = match out.last() {
            Some(prev) => (prev.open + prev.close) / 2.0,
            None => (candle.open + candle.close) / 2.0,
        };

        out.push(Candle {
            timestamp: candle.timestamp,
            open: ha_open,
            high: candle.high.max(ha_open).max(ha_close),
            low: candle.low.min(ha_open).min(ha_close),
            close: ha_close,
            volume: candle.volume,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_first_candle_seed() {
        let ha = heikin_ashi(&[candle(0, 10.0, 12.0, 9.0, 11.0)]);

        assert_eq!(ha.len(), 1);
        assert_eq!(ha[0].open, 10.5);
        assert_eq!(ha[0].close, 10.5);
        assert_eq!(ha[0].high, 12.0);
        assert_eq!(ha[0].low, 9.0);
    }

    #[test]
    fn test_open_uses_previous_ha_body() {
        let ha = heikin_ashi(&[
            candle(0, 10.0, 12.0, 9.0, 11.0),
            candle(1, 11.0, 14.0, 10.0, 13.0),
        ]);

        // prev HA open 10.5, prev HA close 10.5
        assert_eq!(ha[1].open, 10.5);
        assert_eq!(ha[1].close, 12.0);
        assert!(ha[1].is_bullish());
    }

    #[test]
    fn test_downtrend_turns_bearish() {
        let ha = heikin_ashi(&[
            candle(0, 20.0, 20.5, 18.0, 18.5),
            candle(1, 18.5, 19.0, 16.0, 16.5),
            candle(2, 16.5, 17.0, 14.0, 14.5),
        ]);

        assert!(ha[1].is_bearish());
        assert!(ha[2].is_bearish());
    }

    #[test]
    fn test_empty_input() {
        assert!(heikin_ashi(&[]).is_empty());
    }
}
