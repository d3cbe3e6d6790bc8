use std::time::Duration;

/// Sleep while the gate is closed
pub const GATE_INACTIVE_SLEEP: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GateError {
    #[error("account equity {0} is not positive, drawdown is undefined")]
    NonPositiveEquity(f64),
}

/// Unrealized PnL as percent of equity
pub fn loss_pct(equity: f64, unrealized_pnl: f64) -> Result<f64, GateError> {
    if equity <= 0.0 {
        return Err(GateError::NonPositiveEquity(equity));
    }
    Ok(unrealized_pnl / equity * 100.0)
}

/// Drawdown gate
///
/// The strategy only runs once the position's unrealized loss reaches the
/// configured limit, or while the ledger still holds entries.
#[derive(Debug, Clone)]
pub struct DrawdownGate {
    enabled: bool,
    loss_limit_pct: f64,
    /// Last logged state; `None` until the first evaluation of a cycle
    last_active: Option<bool>,
}

impl DrawdownGate {
    pub fn new(enabled: bool, loss_limit_pct: f64) -> Self {
        Self {
            enabled,
            loss_limit_pct: loss_limit_pct.abs(),
            last_active: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Log the next evaluation even if the state is unchanged
    pub fn rearm_logging(&mut self) {
        self.last_active = None;
    }

    /// Pure activation rule
    pub fn is_active(&self, loss_pct: f64, ledger_size: usize) -> bool {
        !self.enabled || loss_pct <= -self.loss_limit_pct || ledger_size > 0
    }

    /// Evaluate and log on transitions only
    pub fn evaluate(&mut self, loss_pct: f64, ledger_size: usize) -> bool {
        let active = self.is_active(loss_pct, ledger_size);

        if self.last_active != Some(active) {
            if active {
                tracing::info!(
                    "🟢 Drawdown gate active (loss {:.2}% vs limit -{:.2}%, stack {})",
                    loss_pct,
                    self.loss_limit_pct,
                    ledger_size
                );
            } else {
                tracing::info!(
                    "⏸️  Drawdown gate inactive (loss {:.2}% vs limit -{:.2}%), sleeping {}s",
                    loss_pct,
                    self.loss_limit_pct,
                    GATE_INACTIVE_SLEEP.as_secs()
                );
            }
            self.last_active = Some(active);
        }

        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_pct() {
        assert_eq!(loss_pct(1000.0, -60.0), Ok(-6.0));
        assert_eq!(loss_pct(0.0, -60.0), Err(GateError::NonPositiveEquity(0.0)));
        assert!(loss_pct(-10.0, 5.0).is_err());
    }

    #[test]
    fn test_gate_thresholds() {
        let gate = DrawdownGate::new(true, 5.0);

        assert!(gate.is_active(-6.0, 0));
        assert!(gate.is_active(-5.0, 0));
        assert!(!gate.is_active(-4.0, 0));
        // Open entries keep the gate open regardless of loss
        assert!(gate.is_active(-4.0, 1));
        assert!(gate.is_active(3.0, 2));
    }

    #[test]
    fn test_negative_limit_is_normalized() {
        let gate = DrawdownGate::new(true, -5.0);
        assert!(gate.is_active(-6.0, 0));
        assert!(!gate.is_active(-4.0, 0));
    }

    #[test]
    fn test_disabled_gate_always_active() {
        let gate = DrawdownGate::new(false, 5.0);
        assert!(gate.is_active(0.0, 0));
    }

    #[test]
    fn test_evaluate_tracks_transitions() {
        let mut gate = DrawdownGate::new(true, 5.0);

        assert!(!gate.evaluate(-1.0, 0));
        assert_eq!(gate.last_active, Some(false));
        assert!(gate.evaluate(-7.0, 0));
        assert_eq!(gate.last_active, Some(true));

        gate.rearm_logging();
        assert_eq!(gate.last_active, None);
    }
}
