//! # sipdrill-sim-core
//!
//! An in-process stand-in for the IMS core a scenario suite normally runs
//! against. It keeps registrations, serves the `reg` event package, and
//! bridges calls through a B2BUA that applies each subscriber's
//! communication-diversion rules.
//!
//! ```
//! use std::sync::Arc;
//! use sipdrill_scenario_core::{HarnessConfig, Orchestrator, SipNetwork};
//! use sipdrill_sim_core::{SimConfig, SimNetwork};
//!
//! # tokio_test::block_on(async {
//! let network: Arc<dyn SipNetwork> = SimNetwork::start(SimConfig::default()).unwrap();
//! let orchestrator = Orchestrator::new(HarnessConfig::default(), network).unwrap();
//! let report = orchestrator.run_suite(&[]).await;
//! assert!(report.is_success());
//! # });
//! ```

mod b2bua;
mod config;
mod core;
mod error;
mod events;
mod network;
mod notifier;
pub mod registrar;

pub use config::SimConfig;
pub use error::{SimError, SimResult};
pub use network::SimNetwork;
