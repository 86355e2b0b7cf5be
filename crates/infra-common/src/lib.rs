//! Common infrastructure for the sipdrill workspace
//!
//! Shared by every crate in the workspace:
//!
//! - [`logging`]: `tracing` subscriber setup and scenario log contexts
//! - [`errors`]: the generic infrastructure error type and context helpers
//! - [`config`]: layered configuration loading (TOML file, then environment)

pub mod config;
pub mod errors;
pub mod logging;

pub use errors::types::{Error, Result};
pub use logging::context::LogContext;
pub use logging::setup::{setup_logging, LoggingConfig};
