//! RUKH analysis planner.
//!
//! Accepts analysis jobs, runs each job's phases strictly in order by
//! publishing tasks to per-phase engine pools, correlates the engines'
//! asynchronous replies, and reports progress and consolidated results.
//!
//! - [`planner::Planner`]: the service, consuming intake, cancel and result
//!   topics.
//! - [`registry::JobRegistry`]: authoritative per-job state with checked
//!   transitions.
//! - [`sequencer`] / [`correlator`]: the phase state machine and the
//!   reply/deadline matching that feeds it.
//! - [`client::PlannerClient`]: gateway-side submit/cancel/watch handle.
//! - [`sim`]: simulated engines for demo mode and tests.

pub mod client;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod planner;
pub mod publisher;
pub mod registry;
pub mod retention;
pub mod sequencer;
pub mod sim;

pub use client::PlannerClient;
pub use config::{ConfigError, LogFormat, PlannerConfig};
pub use error::{PlannerError, RegistryError};
pub use planner::Planner;
