// Drawdown gating and trailing-stop protection
pub mod drawdown;
pub mod trailing_stop;

pub use drawdown::DrawdownGate;
pub use trailing_stop::{TrailingStopController, TrailingStopHandle};
