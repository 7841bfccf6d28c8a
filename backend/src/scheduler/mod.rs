//! Worker scheduling
//!
//! [`schedule`] turns a configuration into a [`RunManifest`] of independent
//! worker plans. [`RunScheduler::run`] gives every worker its own thread,
//! engine and environment controller. Workers report complete ticks over a
//! channel, and the single coordinator loop feeds those ticks to the output
//! aggregator and applies the failure policy.

mod plan;
mod runner;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigValidationError;
use crate::output::AggregationError;

pub use plan::{schedule, RunManifest, WorkerPlan};
pub use runner::{RunReport, RunScheduler};

// ============================================================================
// Stop signal
// ============================================================================

/// Shared flag observed by workers at tick boundaries
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every worker to finish its current tick and stop
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Faults and outcomes
// ============================================================================

/// Why a worker stopped early
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    #[error("engine failure: {0}")]
    Engine(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("no output within {}s", .0.as_secs_f64())]
    Hung(Duration),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("output channel closed")]
    OutputClosed,
}

/// Unrecoverable failure of one worker
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("worker {ordinal} failed: {kind}")]
pub struct WorkerFault {
    pub ordinal: usize,
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Ran every requested tick
    Completed,
    /// Ended on the stop signal
    Stopped,
    Failed,
    Hung,
}

/// Final state of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub ordinal: usize,
    pub seed: u64,
    pub status: WorkerStatus,
    /// Ticks accepted by the aggregator
    pub ticks: u64,
    pub records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
}

/// Errors ending a run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigValidationError),

    #[error(transparent)]
    Worker(#[from] WorkerFault),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error("failed to start worker {ordinal}: {source}")]
    Spawn {
        ordinal: usize,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_shared_between_clones() {
        let signal = StopSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_stopped());
        signal.stop();
        assert!(observer.is_stopped());
    }

    #[test]
    fn test_fault_message_names_worker() {
        let fault = WorkerFault {
            ordinal: 3,
            kind: FaultKind::Hung(Duration::from_secs(2)),
        };
        assert_eq!(fault.to_string(), "worker 3 failed: no output within 2s");
    }
}
