//! particle-sim - run a particle shower simulation
//!
//! ```text
//! particle-sim --config_file config.yaml --random_seed 42 \
//!     --constructor.sensitive_detectors.enabled True
//! ```
//!
//! Any dotted-path flag overrides the matching configuration leaf.
//! Environment variables (`CONSTRUCTOR__MAGNETIC_FIELD__LATITUDE=42.23`)
//! override both.

mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use particle_sim_core::engine::ProcessEngineFactory;
use particle_sim_core::output::writer::RESTART_FILE;
use particle_sim_core::{resolve, Configuration, Orchestrator, ResultWriter};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "particle-sim")]
#[command(about = "Time-stepped particle shower simulation through a modeled atmosphere")]
struct Cli {
    /// YAML or JSON configuration file
    #[arg(long = "config_file")]
    config_file: Option<PathBuf>,

    /// Start from the restart snapshot in `save_dir` when there is one
    #[arg(long)]
    resume: bool,

    /// Dotted-path overrides, e.g. `--random_seed 42`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    overrides: Vec<String>,
}

impl Cli {
    /// Pull `--config_file` and `--resume` out of the trailing overrides
    fn normalize(mut self) -> Result<Self, String> {
        let mut rest = Vec::with_capacity(self.overrides.len());
        let mut args = std::mem::take(&mut self.overrides).into_iter();
        while let Some(arg) = args.next() {
            if arg == "--resume" {
                self.resume = true;
            } else if arg == "--config_file" {
                let path = args
                    .next()
                    .ok_or_else(|| "--config_file requires a path".to_string())?;
                self.config_file = Some(PathBuf::from(path));
            } else if let Some(path) = arg.strip_prefix("--config_file=") {
                self.config_file = Some(PathBuf::from(path));
            } else {
                rest.push(arg);
            }
        }
        self.overrides = rest;
        Ok(self)
    }
}

fn main() -> ExitCode {
    let cli = match Cli::parse().normalize() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(&cli).map_err(|e| e.to_string())?;
    config.preflight().map_err(|e| e.to_string())?;

    let writer = ResultWriter::create(&config.save_dir).map_err(|e| e.to_string())?;
    logging::init_logging(config.logger_level, &writer.log_path())
        .map_err(|e| format!("cannot open {}: {e}", writer.log_path().display()))?;
    info!(run_dir = %writer.run_dir().display(), "configuration resolved");

    let factory = Arc::new(ProcessEngineFactory::new(config.engine.clone()));
    let orchestrator = Orchestrator::new(config, factory);

    let stop = orchestrator.stop_signal();
    if let Err(e) = ctrlc::set_handler(move || stop.stop()) {
        warn!(error = %e, "cannot install the interrupt handler");
    }

    let summary = orchestrator.run_with(writer).map_err(|e| e.to_string())?;
    info!(
        run_id = %summary.run_id,
        records = summary.records,
        buckets = summary.buckets,
        stopped = summary.stopped,
        "run complete"
    );
    if let Some(path) = summary.restart_path {
        info!(restart = %path.display(), "resume with --resume");
    }
    println!("{}", summary.run_dir.display());
    Ok(())
}

/// Resolve the configuration, preferring the restart snapshot on `--resume`
fn load_config(cli: &Cli) -> Result<Configuration, particle_sim_core::ConfigValidationError> {
    let config = resolve(cli.config_file.as_deref(), &cli.overrides, std::env::vars())?;
    if !cli.resume {
        return Ok(config);
    }

    let snapshot = restart_snapshot(&config.save_dir);
    if snapshot.is_file() {
        eprintln!("resuming from {}", snapshot.display());
        resolve(Some(&snapshot), &cli.overrides, std::env::vars())
    } else {
        eprintln!("no restart snapshot at {}, starting fresh", snapshot.display());
        Ok(config)
    }
}

fn restart_snapshot(save_dir: &Path) -> PathBuf {
    save_dir.join(RESTART_FILE)
}
