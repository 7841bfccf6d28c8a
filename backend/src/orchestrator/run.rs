//! Orchestrator - one complete run
//!
//! Ties the components together:
//!
//! ```text
//! 1. Plan workers (validation errors end the run here, nothing is written)
//! 2. Write config.json into a fresh run directory
//! 3. Open particles.csv
//! 4. Run the workers, streaming ticks into the CSV
//! 5. Write aggregates.json once, after the join
//! 6. If the run was stopped, write the restart snapshot
//! 7. If a worker fault aborted the run, report it as an error
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use particle_sim_core::{resolve, Orchestrator};
//! use particle_sim_core::engine::ProcessEngineFactory;
//! use std::sync::Arc;
//!
//! let config = resolve(Some("config.yaml".as_ref()), &[], std::env::vars())?;
//! let factory = Arc::new(ProcessEngineFactory::new(config.engine.clone()));
//! let summary = Orchestrator::new(config, factory).run()?;
//! println!("{} records in {}", summary.records, summary.run_dir.display());
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::engine::EngineFactory;
use crate::output::snapshot::validate_document;
use crate::output::{
    compute_config_hash, restart_config, AggregateDocument, OutputAggregator, ResultWriter,
};
use crate::scheduler::{schedule, RunError, RunScheduler, StopSignal, WorkerOutcome};

/// Result of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_dir: PathBuf,
    pub config_hash: String,
    /// Rows written to the particle CSV
    pub records: u64,
    /// Buckets present in the aggregate
    pub buckets: usize,
    /// Ended on the external stop signal
    pub stopped: bool,
    pub outcomes: Vec<WorkerOutcome>,
    /// Written when the run was stopped
    pub restart_path: Option<PathBuf>,
}

/// Runs one configuration end to end
pub struct Orchestrator {
    config: Configuration,
    factory: Arc<dyn EngineFactory>,
    stop: StopSignal,
}

impl Orchestrator {
    pub fn new(config: Configuration, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            config,
            factory,
            stop: StopSignal::new(),
        }
    }

    /// Share an existing stop signal, e.g. one wired to Ctrl-C
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Signal that stops unbounded runs at the next tick boundary
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run into a fresh directory under `save_dir`
    pub fn run(&self) -> Result<RunSummary, RunError> {
        self.config.validate()?;
        let writer = ResultWriter::create(&self.config.save_dir)?;
        self.run_with(writer)
    }

    /// Run into a run directory that has already been claimed
    pub fn run_with(&self, writer: ResultWriter) -> Result<RunSummary, RunError> {
        let manifest = schedule(&self.config)?;
        let run_id = manifest.run_id;

        writer.write_config(&self.config)?;
        let config_hash = compute_config_hash(&self.config)?;
        let mut output = OutputAggregator::create(
            &writer.particles_path(),
            run_id,
            self.config.time_resolution_us(),
        )?;

        let scheduler = RunScheduler::new(manifest)
            .with_output_dir(writer.run_dir())
            .with_stop_signal(self.stop.clone());
        let report = scheduler.run(Arc::clone(&self.factory), &mut output)?;

        let buckets = output.finish()?;
        let document = AggregateDocument {
            run_id,
            config_hash: config_hash.clone(),
            created_at: Utc::now(),
            stopped: report.stopped,
            records: report.records(),
            workers: report.outcomes.clone(),
            buckets,
        };
        validate_document(&document)?;
        writer.write_aggregates(&document)?;

        let restart_path = if report.stopped {
            Some(writer.write_restart(&restart_config(&self.config))?)
        } else {
            None
        };

        for fault in report.skipped() {
            warn!(worker = fault.ordinal, fault = %fault.kind, "worker skipped");
        }
        if let Some(fault) = report.abort {
            return Err(RunError::Worker(fault));
        }

        info!(
            run_id = %run_id,
            records = document.records,
            buckets = document.buckets.len(),
            "results written"
        );

        Ok(RunSummary {
            run_id,
            run_dir: writer.run_dir().to_path_buf(),
            config_hash,
            records: document.records,
            buckets: document.buckets.len(),
            stopped: report.stopped,
            outcomes: report.outcomes,
            restart_path,
        })
    }
}
