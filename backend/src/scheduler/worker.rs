//! Worker tick loop
//!
//! A worker owns its engine and its environment controller and shares
//! nothing else. Each tick it advances the environment to the tick's bucket,
//! installs it in the engine, shoots the configured number of primaries and
//! sends the complete tick to the coordinator. The stop signal is only
//! checked between ticks.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use super::{FaultKind, StopSignal, WorkerPlan};
use crate::engine::{EngineError, EngineFactory, EngineSetup};
use crate::environment::{EnvironmentStateController, EnvironmentStateError};
use crate::models::record::ParticleRecord;
use crate::output::TickBatch;

/// Messages from workers to the coordinator
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Tick(TickBatch),
    Finished { worker: usize, stopped: bool },
    Failed { worker: usize, kind: FaultKind },
}

impl WorkerMessage {
    pub(crate) fn worker(&self) -> usize {
        match self {
            WorkerMessage::Tick(batch) => batch.worker,
            WorkerMessage::Finished { worker, .. } | WorkerMessage::Failed { worker, .. } => *worker,
        }
    }
}

impl From<EngineError> for FaultKind {
    fn from(e: EngineError) -> Self {
        FaultKind::Engine(e.to_string())
    }
}

impl From<EnvironmentStateError> for FaultKind {
    fn from(e: EnvironmentStateError) -> Self {
        FaultKind::Environment(e.to_string())
    }
}

/// Inputs of one worker thread
pub(crate) struct WorkerContext {
    pub plan: WorkerPlan,
    pub factory: Arc<dyn EngineFactory>,
    pub run_dir: PathBuf,
    pub tick_limit: Option<u64>,
    pub stop: StopSignal,
    pub tx: Sender<WorkerMessage>,
}

/// Thread body: run the loop and report how it ended
pub(crate) fn run_worker(ctx: WorkerContext) {
    let worker = ctx.plan.ordinal;
    let result = panic::catch_unwind(AssertUnwindSafe(|| drive(&ctx)));

    let message = match result {
        Ok(Ok(stopped)) => WorkerMessage::Finished { worker, stopped },
        Ok(Err(kind)) => WorkerMessage::Failed { worker, kind },
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            WorkerMessage::Failed {
                worker,
                kind: FaultKind::Panicked(reason),
            }
        }
    };
    // The coordinator may already be gone after an abort
    let _ = ctx.tx.send(message);
}

/// Returns whether the loop ended on the stop signal
fn drive(ctx: &WorkerContext) -> Result<bool, FaultKind> {
    let plan = &ctx.plan;
    let config = &plan.config;
    let worker = plan.ordinal;

    info!(worker, seed = plan.seed, "worker started");

    let setup = EngineSetup::for_plan(plan, &ctx.run_dir);
    let mut environment = EnvironmentStateController::new(config, worker)?;
    let mut engine = ctx.factory.create(&setup)?;
    engine.initialize(&setup)?;
    for macro_file in &plan.macro_files {
        debug!(worker, macro_file = %macro_file.display(), "executing macro");
        engine.execute_macro(macro_file)?;
    }

    let resolution_us = config.time_resolution_us();
    let detectors = &config.constructor.sensitive_detectors;
    let site = (
        config.constructor.magnetic_field.latitude,
        config.constructor.magnetic_field.longitude,
    );

    let mut tick: u64 = 0;
    let mut stopped = false;
    loop {
        if ctx.tick_limit.is_some_and(|limit| tick >= limit) {
            break;
        }
        if ctx.stop.is_stopped() {
            stopped = true;
            break;
        }

        let bucket = environment.advance(tick.saturating_mul(resolution_us))?;
        engine.apply_environment(&bucket)?;
        let hits = engine.beam_on(config.particles_per_run)?;

        let records: Vec<ParticleRecord> = hits
            .into_iter()
            .filter(|hit| detectors.accepts(&hit.particle))
            .map(|hit| ParticleRecord::from_hit(hit, worker, &bucket, site))
            .collect();
        debug!(worker, bucket = bucket.index, records = records.len(), "tick complete");

        let batch = TickBatch {
            worker,
            bucket,
            primaries: config.particles_per_run,
            records,
        };
        ctx.tx
            .send(WorkerMessage::Tick(batch))
            .map_err(|_| FaultKind::OutputClosed)?;
        tick += 1;
    }

    environment.terminate();
    engine.shutdown()?;
    info!(worker, ticks = tick, stopped, "worker finished");
    Ok(stopped)
}
