//! # heapforge-harness
//!
//! Drives a heapforge heap through deterministic allocation workloads
//! ("storms") and the reference scenarios, and emits JSON reports.

#![forbid(unsafe_code)]

pub mod error;
pub mod logging;
pub mod rng;
pub mod scenario;
pub mod storm;

pub use error::HarnessError;
pub use rng::XorShift64;
pub use scenario::{ScenarioOutcome, run_scenarios};
pub use storm::{StormConfig, StormReport, StormType, run_storm};

/// Parse a seed given in decimal or `0x` hex, with optional `_` separators.
pub fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect();
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|_| HarnessError::InvalidSeed(raw.to_string()))
}
