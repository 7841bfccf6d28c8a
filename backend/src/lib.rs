//! Particle Shower Simulation Core - Rust Orchestrator
//!
//! Drives repeated, time-stepped particle-transport simulations through a
//! modeled atmosphere. The physics itself runs in an external engine; this
//! crate owns configuration, environmental state, worker scheduling and
//! output aggregation.
//!
//! # Architecture
//!
//! - **config**: Layered configuration (file < CLI < environment) over a static schema
//! - **core**: Simulated time and time buckets
//! - **environment**: Per-worker magnetic field and density profile state
//! - **engine**: Narrow adapter to the external physics engine
//! - **scheduler**: Worker planning, tick loops and the join point
//! - **output**: CSV streaming, bucket aggregates and the save directory
//! - **orchestrator**: One complete run from resolved config to persisted results
//! - **rng**: Deterministic per-worker seed derivation
//!
//! # Critical Invariants
//!
//! 1. Precedence is environment > CLI > file > schema default, per leaf
//! 2. Workers never share a random stream or mutable state
//! 3. Every persisted record has a unique `(run_ID, timestamp)` pair
//! 4. No partial tick is ever written

// Module declarations
pub mod config;
pub mod core;
pub mod engine;
pub mod environment;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod rng;
pub mod scheduler;

// Re-exports for convenience
pub use config::{resolve, ConfigValidationError, Configuration};
pub use crate::core::time::SimClock;
pub use engine::{Engine, EngineError, EngineFactory, EngineHit, EngineSetup};
pub use environment::{EnvironmentStateController, EnvironmentStateError, TimeBucket};
pub use models::{record::ParticleRecord, summary::BucketSummary};
pub use orchestrator::{Orchestrator, RunSummary};
pub use output::{AggregationError, OutputAggregator, ResultWriter, TickBatch};
pub use rng::{derive_worker_seed, RngManager};
pub use scheduler::{
    schedule, FaultKind, RunError, RunManifest, RunReport, RunScheduler, StopSignal, WorkerFault,
    WorkerOutcome, WorkerPlan, WorkerStatus,
};
