//! Strategy parameters and runtime settings
//!
//! Strategy parameters come from `{data_dir}/config/{tag}.toml`, with
//! `STACKBOT__<FIELD>` environment overrides. Endpoints and secrets come from
//! the environment (a `.env` file is honoured).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::models::Side;
use crate::strategy::stages::{StageConfig, StageMap};

const ENV_PREFIX: &str = "STACKBOT";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ::config::ConfigError,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn default_true() -> bool {
    true
}

fn default_tsl_timeframe() -> u32 {
    15
}

/// Strategy parameters for one bot instance
///
/// Percent fields are in percent (`2.0` means 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParameters {
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub debug: bool,
    /// Gate the strategy on drawdown
    #[serde(default = "default_true")]
    pub is_loss_check: bool,
    /// Unrealized loss, percent of equity, that activates the strategy
    pub loss_limit_pct: f64,
    /// RSI level that snaps the averaging slot
    pub avdo_rsi_threshold: f64,
    /// RSI level that snaps the profit-take slot
    pub prta_rsi_threshold: f64,
    /// Adverse move from the ledger top required before averaging
    pub avdo_offset_pct: f64,
    /// Minimum profit over an entry before it is closed
    pub prta_offset_min_pct: f64,
    /// Maximum distance a chase order may follow the book
    pub pool_dist_threshold_pct: f64,
    /// Share of the position protected by the trailing stop; 0 disables it
    #[serde(default)]
    pub tsl_qty_factor: f64,
    #[serde(default = "default_tsl_timeframe")]
    pub tsl_timeframe: u32,
    /// Initial stage map; persisted state takes precedence once it exists
    pub stages: StageMap,
}

impl StrategyParameters {
    /// Load and validate `{data_dir}/config/{tag}.toml`
    pub fn load(data_dir: &Path, tag: &str) -> Result<Self, ConfigError> {
        let path = Self::path_for(data_dir, tag);
        Self::load_from(&path)
    }

    pub fn path_for(data_dir: &Path, tag: &str) -> PathBuf {
        data_dir.join("config").join(format!("{}.toml", tag))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let load_err = |source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        };

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).required(true))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(load_err)?;

        let params: StrategyParameters = settings.try_deserialize().map_err(load_err)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol", "must not be empty"));
        }
        if self.loss_limit_pct < 0.0 {
            return Err(invalid("loss_limit_pct", "must be >= 0"));
        }

        for (field, value) in [
            ("avdo_rsi_threshold", self.avdo_rsi_threshold),
            ("prta_rsi_threshold", self.prta_rsi_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid(field, format!("{} is outside 0..=100", value)));
            }
        }
        let ordered = match self.side {
            Side::Buy => self.avdo_rsi_threshold < self.prta_rsi_threshold,
            Side::Sell => self.avdo_rsi_threshold > self.prta_rsi_threshold,
        };
        if !ordered {
            return Err(invalid(
                "avdo_rsi_threshold",
                format!(
                    "must be on the {} side of prta_rsi_threshold for a {} position",
                    if self.side == Side::Buy { "low" } else { "high" },
                    self.side
                ),
            ));
        }

        for (field, value) in [
            ("avdo_offset_pct", self.avdo_offset_pct),
            ("prta_offset_min_pct", self.prta_offset_min_pct),
            ("pool_dist_threshold_pct", self.pool_dist_threshold_pct),
        ] {
            if value < 0.0 {
                return Err(invalid(field, "must be >= 0"));
            }
        }

        if !(0.0..=1.0).contains(&self.tsl_qty_factor) {
            return Err(invalid("tsl_qty_factor", "must be between 0 and 1"));
        }
        if self.tsl_enabled() && self.tsl_timeframe == 0 {
            return Err(invalid("tsl_timeframe", "must be > 0 when the trailing stop is on"));
        }

        for stage in std::iter::once(&self.stages.base).chain(self.stages.stages.iter()) {
            validate_stage(stage)?;
        }

        Ok(())
    }

    /// Averaging price offset as a fraction
    pub fn avdo_offset(&self) -> f64 {
        self.avdo_offset_pct / 100.0
    }

    /// Minimum profit offset as a fraction
    pub fn min_profit_offset(&self) -> f64 {
        self.prta_offset_min_pct / 100.0
    }

    pub fn tsl_enabled(&self) -> bool {
        self.tsl_qty_factor > 0.0
    }
}

fn validate_stage(stage: &StageConfig) -> Result<(), ConfigError> {
    if stage.qty_pct <= 0.0 || stage.qty_pct > 100.0 {
        return Err(invalid("stages.qty_pct", format!("{} is outside (0, 100]", stage.qty_pct)));
    }
    if stage.timeframes().contains(&0) {
        return Err(invalid("stages", "timeframes must be > 0"));
    }
    if stage.reset_timeframe() == Some(0) {
        return Err(invalid("stages.flag", "reset timeframe must be > 0"));
    }
    Ok(())
}

/// Telegram credentials
#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

/// Endpoints and secrets from the environment
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub proxy_url: Option<String>,
    pub order_stream_url: Option<String>,
    pub redis_url: String,
    pub telegram: Option<TelegramSettings>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());

        let telegram = match (var("TELEGRAM_BOT_TOKEN"), var("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
            _ => None,
        };

        Self {
            proxy_url: var("PROXY_URL"),
            order_stream_url: var("ORDER_STREAM_URL"),
            redis_url: var("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            telegram,
        }
    }

    pub fn require_proxy_url(&self) -> Result<&str, ConfigError> {
        self.proxy_url
            .as_deref()
            .ok_or(ConfigError::MissingEnv("PROXY_URL"))
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Single-stage parameters on "TESTUSDT" with the loss check off
    pub fn params(side: Side) -> StrategyParameters {
        let (avdo, prta) = match side {
            Side::Buy => (30.0, 70.0),
            Side::Sell => (70.0, 30.0),
        };
        StrategyParameters {
            symbol: "TESTUSDT".into(),
            side,
            debug: false,
            is_loss_check: false,
            loss_limit_pct: 5.0,
            avdo_rsi_threshold: avdo,
            prta_rsi_threshold: prta,
            avdo_offset_pct: 2.0,
            prta_offset_min_pct: 2.0,
            pool_dist_threshold_pct: 0.3,
            tsl_qty_factor: 0.0,
            tsl_timeframe: 15,
            stages: StageMap::new(
                StageConfig {
                    qty_pct: 10.0,
                    at_ha: 5,
                    at_rsi: 5,
                    pt_ha: 5,
                    pt_rsi: 5,
                    flag: None,
                },
                vec![],
            ),
        }
    }
}
