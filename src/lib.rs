// Core modules
pub mod api;
pub mod config;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::{DriverError, ExchangeDriver, Notifier};
pub use models::*;

// Error handling
pub type Result<T> = anyhow::Result<T>;
