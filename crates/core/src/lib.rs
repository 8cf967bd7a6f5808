//! Domain types shared by the RUKH analysis planner, its transport and its
//! clients.
//!
//! - [`job`]: jobs, phase results, status invariants, intake validation.
//! - [`phase`]: the fixed phase catalog and per-phase deadlines.
//! - [`messages`]: JSON payloads for intake, tasks, results and reports.
//! - [`progress`]: progress events and fraction arithmetic.
//! - [`topics`]: topic naming.
//!
//! Nothing here performs I/O.

pub mod error;
pub mod job;
pub mod messages;
pub mod phase;
pub mod progress;
pub mod topics;
pub mod types;
