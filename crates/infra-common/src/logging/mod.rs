//! Logging setup and scenario-aware log contexts

pub mod context;
pub mod setup;

pub use context::LogContext;
pub use setup::{parse_log_level, setup_logging, LoggingConfig};
