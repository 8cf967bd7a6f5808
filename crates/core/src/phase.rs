//! The fixed, ordered catalog of analysis phases.
//!
//! Each [`Phase`] maps to exactly one engine pool, one task topic and one
//! result topic. Job phase lists are carried as plain names so that names
//! outside the catalog can be recorded as skipped rather than rejected; use
//! [`Phase::from_name`] to resolve them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A named stage of the analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Static,
    Bytecode,
    Fuzz,
    Symbolic,
    AttackGraph,
    TestSynthesis,
    Reporting,
}

impl Phase {
    /// Every phase, in default execution order.
    pub const CATALOG: [Phase; 7] = [
        Phase::Static,
        Phase::Bytecode,
        Phase::Fuzz,
        Phase::Symbolic,
        Phase::AttackGraph,
        Phase::TestSynthesis,
        Phase::Reporting,
    ];

    /// Wire name, also used as the topic segment for the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Static => "static",
            Phase::Bytecode => "bytecode",
            Phase::Fuzz => "fuzz",
            Phase::Symbolic => "symbolic",
            Phase::AttackGraph => "attack_graph",
            Phase::TestSynthesis => "test_synthesis",
            Phase::Reporting => "reporting",
        }
    }

    /// Resolve a phase name from a job's phase list.
    ///
    /// Returns `None` for names outside the catalog.
    pub fn from_name(name: &str) -> Option<Phase> {
        Self::CATALOG.iter().copied().find(|p| p.as_str() == name)
    }

    /// Default engine deadline for one attempt of this phase.
    ///
    /// Fuzzing and symbolic execution are long-running engines; reporting is
    /// a formatting pass over earlier results.
    pub fn default_timeout(self) -> Duration {
        let secs = match self {
            Phase::Static | Phase::Bytecode => 300,
            Phase::Fuzz | Phase::Symbolic => 1800,
            Phase::AttackGraph | Phase::TestSynthesis => 600,
            Phase::Reporting => 120,
        };
        Duration::from_secs(secs)
    }

    /// Catalog names in default order, for a job intake without a phase list.
    pub fn default_plan() -> Vec<String> {
        Self::CATALOG.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::from_name(s).ok_or_else(|| CoreError::Validation(format!("Unknown phase: \"{s}\"")))
    }
}
