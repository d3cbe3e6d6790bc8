use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Per-stage directive attached to a ledger depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StageFlag {
    /// "BS": average down on trend + momentum alone while price has not moved past the top entry
    BuySignals,
    /// "RS<tf>": once this depth is reached, re-baseline the averaging timeframes to `tf`
    ResetTimeframe(u32),
}

impl FromStr for StageFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "BS" {
            return Ok(StageFlag::BuySignals);
        }
        if let Some(tf) = s.strip_prefix("RS") {
            return tf
                .parse::<u32>()
                .map(StageFlag::ResetTimeframe)
                .map_err(|_| format!("invalid reset timeframe in stage flag: {}", s));
        }
        Err(format!("unknown stage flag: {}", s))
    }
}

impl TryFrom<String> for StageFlag {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StageFlag> for String {
    fn from(flag: StageFlag) -> Self {
        flag.to_string()
    }
}

impl fmt::Display for StageFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFlag::BuySignals => write!(f, "BS"),
            StageFlag::ResetTimeframe(tf) => write!(f, "RS{}", tf),
        }
    }
}

/// Strategy settings for one ledger depth
///
/// Timeframes are in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Averaging order size, percent of the account
    pub qty_pct: f64,
    /// Averaging trend (Heikin-Ashi) timeframe
    pub at_ha: u32,
    /// Averaging momentum (RSI) timeframe
    pub at_rsi: u32,
    /// Profit-take trend timeframe
    pub pt_ha: u32,
    /// Profit-take momentum timeframe
    pub pt_rsi: u32,
    #[serde(default)]
    pub flag: Option<StageFlag>,
}

impl StageConfig {
    pub fn is_buy_signals(&self) -> bool {
        matches!(self.flag, Some(StageFlag::BuySignals))
    }

    pub fn reset_timeframe(&self) -> Option<u32> {
        match self.flag {
            Some(StageFlag::ResetTimeframe(tf)) => Some(tf),
            _ => None,
        }
    }

    /// The four timeframes that drive signal polling
    pub fn timeframes(&self) -> [u32; 4] {
        [self.at_ha, self.at_rsi, self.pt_ha, self.pt_rsi]
    }

    /// Averaging quantity as a fraction of the account
    pub fn qty_fraction(&self) -> f64 {
        self.qty_pct / 100.0
    }
}

/// Stage descriptors keyed by ledger depth
///
/// `base` applies to an empty ledger; `stages[i]` applies at depth `i + 1`.
/// Depths past the last configured stage keep using the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMap {
    pub base: StageConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl StageMap {
    pub fn new(base: StageConfig, stages: Vec<StageConfig>) -> Self {
        Self { base, stages }
    }

    /// Stage in force at `depth`
    pub fn stage_for(&self, depth: usize) -> &StageConfig {
        if depth == 0 {
            return &self.base;
        }
        self.stages
            .get(depth - 1)
            .or_else(|| self.stages.last())
            .unwrap_or(&self.base)
    }

    /// Mutable access to the stage in force at `depth`
    pub fn stage_for_mut(&mut self, depth: usize) -> &mut StageConfig {
        if depth == 0 || self.stages.is_empty() {
            return &mut self.base;
        }
        let idx = (depth - 1).min(self.stages.len() - 1);
        &mut self.stages[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(tf: u32, flag: Option<StageFlag>) -> StageConfig {
        StageConfig {
            qty_pct: 10.0,
            at_ha: tf,
            at_rsi: tf,
            pt_ha: tf,
            pt_rsi: tf,
            flag,
        }
    }

    #[test]
    fn test_flag_parsing() {
        assert_eq!("BS".parse::<StageFlag>().unwrap(), StageFlag::BuySignals);
        assert_eq!(
            "RS15".parse::<StageFlag>().unwrap(),
            StageFlag::ResetTimeframe(15)
        );
        assert!("RSx".parse::<StageFlag>().is_err());
        assert!("XX".parse::<StageFlag>().is_err());
        assert_eq!(StageFlag::ResetTimeframe(60).to_string(), "RS60");
    }

    #[test]
    fn test_flag_serde_as_string() {
        let json = serde_json::to_string(&stage(5, Some(StageFlag::ResetTimeframe(30)))).unwrap();
        assert!(json.contains("\"flag\":\"RS30\""));

        let parsed: StageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.reset_timeframe(), Some(30));
    }

    #[test]
    fn test_stage_for_depth() {
        let map = StageMap::new(
            stage(1, None),
            vec![stage(5, Some(StageFlag::BuySignals)), stage(15, None)],
        );

        assert_eq!(map.stage_for(0).at_ha, 1);
        assert_eq!(map.stage_for(1).at_ha, 5);
        assert!(map.stage_for(1).is_buy_signals());
        assert_eq!(map.stage_for(2).at_ha, 15);
        // Past the end: last stage
        assert_eq!(map.stage_for(7).at_ha, 15);
    }

    #[test]
    fn test_stage_for_without_depth_stages() {
        let mut map = StageMap::new(stage(3, None), vec![]);

        assert_eq!(map.stage_for(4).at_ha, 3);
        map.stage_for_mut(4).at_ha = 30;
        assert_eq!(map.base.at_ha, 30);
    }

    #[test]
    fn test_stage_for_mut_targets_same_stage() {
        let mut map = StageMap::new(stage(1, None), vec![stage(5, None), stage(15, None)]);

        map.stage_for_mut(9).at_rsi = 60;
        assert_eq!(map.stage_for(9).at_rsi, 60);
        assert_eq!(map.stages[1].at_rsi, 60);
        assert_eq!(map.stages[0].at_rsi, 5);
    }
}
