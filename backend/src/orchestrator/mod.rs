//! Orchestrator - one run from resolved configuration to persisted results
//!
//! See `run.rs` for the full sequence.

mod run;

pub use run::{Orchestrator, RunSummary};
