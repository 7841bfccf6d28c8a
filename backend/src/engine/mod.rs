//! Adapter to the external physics engine
//!
//! The engine tracks particles; this crate only tells it what to build,
//! which macros to run, what the environment looks like and how many
//! primaries to shoot. Every worker owns one [`Engine`] created by an
//! [`EngineFactory`], so engines never share state.

pub mod process;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConstructorConfig, GeneratorConfig, SensitiveDetectorConfig};
use crate::environment::TimeBucket;
use crate::scheduler::WorkerPlan;

pub use process::{ProcessEngine, ProcessEngineFactory};

/// File name of the exported geometry inside the run directory
pub const GEOMETRY_EXPORT_FILE: &str = "geometry.gdml";

/// Engine failures, all fatal for the owning worker
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch engine `{command}`: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },

    #[error("engine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine exited unexpectedly (status {status:?})")]
    Exited { status: Option<i32> },

    #[error("engine rejected `{op}`: {message}")]
    Rejected { op: String, message: String },

    #[error("malformed engine response: {0}")]
    Protocol(String),
}

/// One particle reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHit {
    pub event_id: u64,
    pub track_id: u64,
    /// Species name, e.g. `mu-`
    pub particle: String,
    pub pdg: i64,
    pub momentum: [f64; 3],
    pub position: [f64; 3],
    pub theta: f64,
    pub phi: f64,
    /// Global time since the primary was created
    pub time: f64,
    pub local_time: f64,
    /// Sensitive detector label, if the hit came from one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector: Option<String>,
}

/// Everything an engine needs before the first macro
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSetup {
    pub worker: usize,
    pub seed: u64,
    pub generator: GeneratorConfig,
    pub constructor: ConstructorConfig,
    pub sensitive_detectors: SensitiveDetectorConfig,
    /// Target of the geometry export, set for worker 1 only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_gdml: Option<PathBuf>,
    /// Dataset directory forwarded from the environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_dir: Option<PathBuf>,
}

impl EngineSetup {
    /// Setup for a planned worker writing into `run_dir`
    pub fn for_plan(plan: &WorkerPlan, run_dir: &Path) -> Self {
        let config = &plan.config;
        Self {
            worker: plan.ordinal,
            seed: plan.seed,
            generator: config.generator.clone(),
            constructor: config.constructor.clone(),
            sensitive_detectors: config.constructor.sensitive_detectors.clone(),
            export_gdml: plan
                .export_gdml
                .then(|| run_dir.join(GEOMETRY_EXPORT_FILE)),
            dataset_dir: std::env::var_os(&config.engine.dataset_dir_var).map(PathBuf::from),
        }
    }
}

/// One engine instance, driven by exactly one worker thread
pub trait Engine: Send {
    /// Build geometry, physics and generator
    fn initialize(&mut self, setup: &EngineSetup) -> Result<(), EngineError>;

    /// Run one macro file
    fn execute_macro(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Install the field and density profile of `bucket`
    fn apply_environment(&mut self, bucket: &TimeBucket) -> Result<(), EngineError>;

    /// Shoot `n_events` primaries and return every recorded particle
    fn beam_on(&mut self, n_events: u64) -> Result<Vec<EngineHit>, EngineError>;

    fn shutdown(&mut self) -> Result<(), EngineError>;
}

/// Creates one engine per worker
pub trait EngineFactory: Send + Sync {
    fn create(&self, setup: &EngineSetup) -> Result<Box<dyn Engine>, EngineError>;
}
