// Technical indicators module
// Heikin-Ashi candles for trend reversals, RSI for momentum

pub mod heikin_ashi;
pub mod rsi;

pub use heikin_ashi::heikin_ashi;
pub use rsi::{calculate_rsi, RSI_PERIOD};
