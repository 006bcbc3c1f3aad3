//! Harness error type.

use heapforge_core::HeapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
    #[error("unknown storm type: {0}")]
    UnknownStorm(String),
    #[error("invalid seed: {0}")]
    InvalidSeed(String),
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("storm {storm} left the heap inconsistent: {detail}")]
    Integrity { storm: &'static str, detail: String },
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },
}
