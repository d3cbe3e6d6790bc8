// Signal detection and per-depth stage settings
pub mod detectors;
pub mod signals;
pub mod stages;

pub use detectors::{HeikinAshiReversal, MomentumDetector, RsiSnap, TrendDetector};
pub use signals::{SignalEvaluator, Slot, SlotReset};
pub use stages::{StageConfig, StageFlag, StageMap};
