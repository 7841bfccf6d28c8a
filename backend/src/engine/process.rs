//! Engine running as a child process
//!
//! Each worker spawns `engine.command engine.args...` and talks to it with
//! one JSON object per line: requests `{"op": "...", ...}` on stdin,
//! responses `{"ok": true, ...}` or `{"ok": false, "error": "..."}` on
//! stdout. The child's stderr is inherited so engine diagnostics reach the
//! terminal.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Engine, EngineError, EngineFactory, EngineHit, EngineSetup};
use crate::config::EngineConfig;
use crate::environment::TimeBucket;

/// Environment variable carrying the worker ordinal to the engine
pub const WORKER_ENV_VAR: &str = "PARTICLE_SIM_WORKER";

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Initialize { setup: &'a EngineSetup },
    ExecuteMacro { path: &'a Path },
    ApplyEnvironment { bucket: BucketMessage<'a> },
    BeamOn { n_events: u64 },
    Shutdown,
}

impl Request<'_> {
    fn name(&self) -> &'static str {
        match self {
            Request::Initialize { .. } => "initialize",
            Request::ExecuteMacro { .. } => "execute_macro",
            Request::ApplyEnvironment { .. } => "apply_environment",
            Request::BeamOn { .. } => "beam_on",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Serialize)]
struct BucketMessage<'a> {
    index: u64,
    start_time: DateTime<Utc>,
    density_day_idx: u32,
    heights: &'a [f64],
    temperature: &'a [f64],
    density: &'a [f64],
    /// Per layer, (north, east, up) in tesla
    magnetic_field: &'a [[f64; 3]],
}

impl<'a> From<&'a TimeBucket> for BucketMessage<'a> {
    fn from(bucket: &'a TimeBucket) -> Self {
        Self {
            index: bucket.index,
            start_time: bucket.start_time,
            density_day_idx: bucket.density_day_idx,
            heights: &bucket.density.heights,
            temperature: &bucket.density.temperature,
            density: &bucket.density.density,
            magnetic_field: &bucket.magnetic_field.layers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    hits: Vec<EngineHit>,
}

/// Engine child process owned by one worker
#[derive(Debug)]
pub struct ProcessEngine {
    worker: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl ProcessEngine {
    /// Launch the engine process of `worker`
    pub fn spawn(config: &EngineConfig, setup: &EngineSetup) -> Result<Self, EngineError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .env(WORKER_ENV_VAR, setup.worker.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &setup.dataset_dir {
            command.env(&config.dataset_dir_var, dir);
        }

        let mut child = command.spawn().map_err(|source| EngineError::Launch {
            command: config.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdout not captured".to_string()))?;

        info!(worker = setup.worker, pid = child.id(), command = %config.command, "engine started");

        Ok(Self {
            worker: setup.worker,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }

    fn call(&mut self, request: &Request<'_>) -> Result<Response, EngineError> {
        let op = request.name();
        let stdin = self.stdin.as_mut().ok_or(EngineError::Exited { status: None })?;

        let mut payload = serde_json::to_vec(request)
            .map_err(|e| EngineError::Protocol(format!("cannot encode `{op}`: {e}")))?;
        payload.push(b'\n');
        if let Err(e) = stdin.write_all(&payload).and_then(|_| stdin.flush()) {
            return Err(self.exit_error().unwrap_or(EngineError::Io(e)));
        }

        self.line.clear();
        let read = self.stdout.read_line(&mut self.line)?;
        if read == 0 {
            return Err(self
                .exit_error()
                .unwrap_or(EngineError::Exited { status: None }));
        }

        let response: Response = serde_json::from_str(self.line.trim())
            .map_err(|e| EngineError::Protocol(format!("`{op}`: {e}")))?;
        if !response.ok {
            return Err(EngineError::Rejected {
                op: op.to_string(),
                message: response.error.unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        debug!(worker = self.worker, op, "engine call completed");
        Ok(response)
    }

    /// Exit status if the child is already gone
    fn exit_error(&mut self) -> Option<EngineError> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(EngineError::Exited {
                status: status.code(),
            }),
            _ => None,
        }
    }
}

impl Engine for ProcessEngine {
    fn initialize(&mut self, setup: &EngineSetup) -> Result<(), EngineError> {
        self.call(&Request::Initialize { setup }).map(|_| ())
    }

    fn execute_macro(&mut self, path: &Path) -> Result<(), EngineError> {
        self.call(&Request::ExecuteMacro { path }).map(|_| ())
    }

    fn apply_environment(&mut self, bucket: &TimeBucket) -> Result<(), EngineError> {
        self.call(&Request::ApplyEnvironment {
            bucket: BucketMessage::from(bucket),
        })
        .map(|_| ())
    }

    fn beam_on(&mut self, n_events: u64) -> Result<Vec<EngineHit>, EngineError> {
        self.call(&Request::BeamOn { n_events }).map(|r| r.hits)
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        if self.stdin.is_none() {
            return Ok(());
        }
        let result = self.call(&Request::Shutdown).map(|_| ());
        // Closing stdin lets the child reach end of input and exit
        self.stdin = None;
        let status = self.child.wait()?;
        info!(worker = self.worker, status = ?status.code(), "engine stopped");
        result
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!(worker = self.worker, "killing engine process");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawns one [`ProcessEngine`] per worker
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    config: EngineConfig,
}

impl ProcessEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self, setup: &EngineSetup) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(ProcessEngine::spawn(&self.config, setup)?))
    }
}
