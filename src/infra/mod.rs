//! Infrastructure - configuration, metrics, and caching
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `cache` - Bounded insertion-order cache shared across sessions

pub mod cache;
pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use cache::BoundedCache;
pub use config::Config;
pub use metrics::Metrics;
