use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-cycle status written for external observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Ledger in human-readable form
    pub stack_str: String,
    pub stack_size: usize,
    pub tsl_enabled: bool,
    /// Averaging status label, e.g. "HA ok, but RSI not snapped"
    pub avdo_status: String,
    /// Averaging-slot RSI
    pub rsi: Option<f64>,
    pub rsi_snapped: bool,
    #[serde(default)]
    pub last_price: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    /// One-line summary for the `status` command
    pub fn summary(&self) -> String {
        let rsi = self
            .rsi
            .map(|v| format!("{:.2}", v))
            .unwrap_or_else(|| "n/a".to_string());
        let price = self
            .last_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "n/a".to_string());

        format!(
            "stack {} (size {}) | price {} | RSI {}{} | TSL {} | {} | updated {}",
            self.stack_str,
            self.stack_size,
            price,
            rsi,
            if self.rsi_snapped { " (snapped)" } else { "" },
            if self.tsl_enabled { "on" } else { "off" },
            self.avdo_status,
            self.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}
