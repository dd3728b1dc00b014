//! Infrastructure - configuration and metrics
//!
//! - `config` - application configuration (TOML loading, defaults)
//! - `metrics` - lock-free metrics collection

pub mod config;
pub mod metrics;

pub use config::Config;
pub use metrics::Metrics;
