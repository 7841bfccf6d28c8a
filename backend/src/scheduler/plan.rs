//! Run planning

use std::path::PathBuf;

use uuid::Uuid;

use crate::config::{ConfigValidationError, Configuration};
use crate::rng::derive_worker_seed;

/// Everything one worker needs, fixed before it starts
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// 1-based worker number
    pub ordinal: usize,
    pub seed: u64,
    /// Executed in this order before the first tick
    pub macro_files: Vec<PathBuf>,
    /// Private copy of the configuration
    pub config: Configuration,
    /// Whether this worker exports the geometry
    pub export_gdml: bool,
}

/// Complete plan of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub config: Configuration,
    pub workers: Vec<WorkerPlan>,
}

impl RunManifest {
    /// Number of ticks per worker, `None` for an unbounded run
    pub fn tick_limit(&self) -> Option<u64> {
        self.config.tick_limit()
    }
}

/// Plan `num_processes` independent workers
///
/// # Example
/// ```no_run
/// use particle_sim_core::{resolve, schedule};
///
/// let config = resolve(Some("config.yaml".as_ref()), &[], std::env::vars()).unwrap();
/// let manifest = schedule(&config).unwrap();
/// assert_eq!(manifest.workers.len(), config.num_processes);
/// ```
pub fn schedule(config: &Configuration) -> Result<RunManifest, ConfigValidationError> {
    config.validate()?;

    let export = config.constructor.export_gdml && config.num_processes == 1;
    let workers = (1..=config.num_processes)
        .map(|ordinal| {
            let export_gdml = export && ordinal == 1;
            let mut private = config.clone();
            private.constructor.export_gdml = export_gdml;
            WorkerPlan {
                ordinal,
                seed: derive_worker_seed(config.random_seed, ordinal),
                macro_files: config.macro_files.clone(),
                config: private,
                export_gdml,
            }
        })
        .collect();

    Ok(RunManifest {
        run_id: Uuid::new_v4(),
        config: config.clone(),
        workers,
    })
}
