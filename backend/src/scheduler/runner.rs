//! Coordinator loop
//!
//! The coordinator is the join point of a run. It receives worker messages,
//! forwards ticks to the aggregator, detects silent workers and applies
//! `scheduler.on_worker_failure`:
//!
//! - `abort`: the first fault raises the stop signal, later ticks from every
//!   worker are discarded and the fault is returned in the report
//! - `skip`: the faulty worker is recorded and the others keep going
//!
//! Ticks of a worker that has already been declared failed or hung are
//! always discarded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::{run_worker, WorkerContext, WorkerMessage};
use super::{
    FaultKind, RunError, RunManifest, StopSignal, WorkerFault, WorkerOutcome, WorkerStatus,
};
use crate::config::FailurePolicy;
use crate::engine::EngineFactory;
use crate::output::{AggregationError, OutputAggregator};

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    /// One entry per worker, by ordinal
    pub outcomes: Vec<WorkerOutcome>,
    /// The stop signal was raised from outside the scheduler
    pub stopped: bool,
    /// Fault that aborted the run under the `abort` policy
    pub abort: Option<WorkerFault>,
}

impl RunReport {
    pub fn records(&self) -> u64 {
        self.outcomes.iter().map(|o| o.records).sum()
    }

    /// Faults of skipped workers
    pub fn skipped(&self) -> Vec<WorkerFault> {
        self.outcomes
            .iter()
            .filter_map(|o| {
                o.fault.clone().map(|kind| WorkerFault {
                    ordinal: o.ordinal,
                    kind,
                })
            })
            .filter(|fault| Some(fault) != self.abort.as_ref())
            .collect()
    }
}

/// Runs the workers of a manifest and joins them
pub struct RunScheduler {
    manifest: RunManifest,
    run_dir: PathBuf,
    stop: StopSignal,
}

impl RunScheduler {
    pub fn new(manifest: RunManifest) -> Self {
        let run_dir = manifest.config.save_dir.clone();
        Self {
            manifest,
            run_dir,
            stop: StopSignal::new(),
        }
    }

    /// Directory engines write side artifacts (geometry export) into
    pub fn with_output_dir(mut self, run_dir: impl AsRef<Path>) -> Self {
        self.run_dir = run_dir.as_ref().to_path_buf();
        self
    }

    /// Use an existing stop signal, e.g. one wired to Ctrl-C
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// Run every worker to completion and feed their ticks to `output`
    ///
    /// # Errors
    /// Output failures and worker threads that cannot be started end the run
    /// with an error. Worker faults are reported in [`RunReport`].
    pub fn run(
        &self,
        factory: Arc<dyn EngineFactory>,
        output: &mut OutputAggregator,
    ) -> Result<RunReport, RunError> {
        let config = &self.manifest.config;
        let policy = config.scheduler.on_worker_failure;
        let grace = config.worker_grace_period();
        let tick_limit = self.manifest.tick_limit();

        info!(
            run_id = %self.manifest.run_id,
            workers = self.manifest.workers.len(),
            ticks = ?tick_limit,
            ?policy,
            "run started"
        );

        let (tx, rx) = crossbeam_channel::bounded(2 * self.manifest.workers.len().max(1));
        let mut handles: BTreeMap<usize, JoinHandle<()>> = BTreeMap::new();
        let mut outcomes: BTreeMap<usize, WorkerOutcome> = BTreeMap::new();

        for plan in &self.manifest.workers {
            let ordinal = plan.ordinal;
            outcomes.insert(
                ordinal,
                WorkerOutcome {
                    ordinal,
                    seed: plan.seed,
                    status: WorkerStatus::Completed,
                    ticks: 0,
                    records: 0,
                    fault: None,
                },
            );

            let ctx = WorkerContext {
                plan: plan.clone(),
                factory: Arc::clone(&factory),
                run_dir: self.run_dir.clone(),
                tick_limit,
                stop: self.stop.clone(),
                tx: tx.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("worker-{ordinal}"))
                .spawn(move || run_worker(ctx));
            match spawned {
                Ok(handle) => {
                    handles.insert(ordinal, handle);
                }
                Err(source) => {
                    error!(worker = ordinal, %source, "failed to start worker thread");
                    self.stop.stop();
                    drop(tx);
                    // Let the started workers see the stop signal and exit
                    while rx.recv().is_ok() {}
                    for (_, handle) in handles {
                        let _ = handle.join();
                    }
                    return Err(RunError::Spawn { ordinal, source });
                }
            }
        }
        drop(tx);

        let mut coordinator = Coordinator {
            policy,
            stop: &self.stop,
            outcomes,
            last_seen: handles.keys().map(|&o| (o, Instant::now())).collect(),
            abort: None,
            output_error: None,
            raised_stop: false,
        };

        while !coordinator.last_seen.is_empty() {
            let wait = coordinator.next_deadline(grace);
            match rx.recv_timeout(wait) {
                Ok(message) => coordinator.handle(message, output),
                Err(RecvTimeoutError::Timeout) => coordinator.expire(grace),
                Err(RecvTimeoutError::Disconnected) => {
                    let orphaned: Vec<usize> = coordinator.last_seen.keys().copied().collect();
                    for ordinal in orphaned {
                        coordinator.fail(ordinal, WorkerStatus::Failed, FaultKind::OutputClosed);
                    }
                }
            }
        }

        for (ordinal, handle) in handles {
            if coordinator.outcomes.get(&ordinal).map(|o| o.status) == Some(WorkerStatus::Hung) {
                // A hung thread may never return; leave it detached
                continue;
            }
            if handle.join().is_err() {
                warn!(worker = ordinal, "worker thread ended with a panic");
            }
        }

        if let Some(e) = coordinator.output_error {
            return Err(RunError::Aggregation(e));
        }

        let stopped = self.stop.is_stopped() && !coordinator.raised_stop;
        let report = RunReport {
            run_id: self.manifest.run_id,
            outcomes: coordinator.outcomes.into_values().collect(),
            stopped,
            abort: coordinator.abort,
        };
        info!(
            records = report.records(),
            stopped,
            aborted = report.abort.is_some(),
            "run finished"
        );
        Ok(report)
    }
}

/// Mutable state of the coordinator loop
struct Coordinator<'a> {
    policy: FailurePolicy,
    stop: &'a StopSignal,
    outcomes: BTreeMap<usize, WorkerOutcome>,
    /// Workers still running, with the time of their last message
    last_seen: BTreeMap<usize, Instant>,
    abort: Option<WorkerFault>,
    output_error: Option<AggregationError>,
    raised_stop: bool,
}

impl Coordinator<'_> {
    fn next_deadline(&self, grace: Duration) -> Duration {
        let oldest = self.last_seen.values().min().copied().unwrap_or_else(Instant::now);
        match oldest.checked_add(grace) {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    fn handle(&mut self, message: WorkerMessage, output: &mut OutputAggregator) {
        let worker = message.worker();
        if !self.last_seen.contains_key(&worker) {
            debug!(worker, "discarding message from retired worker");
            return;
        }
        self.last_seen.insert(worker, Instant::now());

        match message {
            WorkerMessage::Tick(batch) => {
                if self.abort.is_some() || self.output_error.is_some() {
                    debug!(worker, bucket = batch.bucket.index, "discarding tick after abort");
                    return;
                }
                let records = batch.records.len() as u64;
                match output.submit(batch) {
                    Ok(()) => {
                        if let Some(outcome) = self.outcomes.get_mut(&worker) {
                            outcome.ticks += 1;
                            outcome.records += records;
                        }
                    }
                    Err(e) => {
                        error!(worker, error = %e, "output failed, stopping run");
                        self.output_error = Some(e);
                        self.raise_stop();
                    }
                }
            }
            WorkerMessage::Finished { stopped, .. } => {
                self.last_seen.remove(&worker);
                if let Some(outcome) = self.outcomes.get_mut(&worker) {
                    outcome.status = if stopped {
                        WorkerStatus::Stopped
                    } else {
                        WorkerStatus::Completed
                    };
                }
            }
            WorkerMessage::Failed { kind, .. } => {
                self.fail(worker, WorkerStatus::Failed, kind);
            }
        }
    }

    /// Declare every worker silent for longer than `grace` hung
    fn expire(&mut self, grace: Duration) {
        let now = Instant::now();
        let silent: Vec<usize> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= grace)
            .map(|(&ordinal, _)| ordinal)
            .collect();
        for ordinal in silent {
            self.fail(ordinal, WorkerStatus::Hung, FaultKind::Hung(grace));
        }
    }

    fn fail(&mut self, ordinal: usize, status: WorkerStatus, kind: FaultKind) {
        self.last_seen.remove(&ordinal);
        if let Some(outcome) = self.outcomes.get_mut(&ordinal) {
            outcome.status = status;
            outcome.fault = Some(kind.clone());
        }

        let fault = WorkerFault { ordinal, kind };
        error!(worker = ordinal, fault = %fault.kind, "worker failed");
        match self.policy {
            FailurePolicy::Abort => {
                if self.abort.is_none() {
                    self.abort = Some(fault);
                    self.raise_stop();
                }
            }
            FailurePolicy::Skip => {
                warn!(worker = ordinal, "skipping failed worker, others continue");
            }
        }
    }

    fn raise_stop(&mut self) {
        if !self.stop.is_stopped() {
            self.raised_stop = true;
        }
        self.stop.stop();
    }
}
