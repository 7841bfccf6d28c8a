//! Save-directory layout
//!
//! ```text
//! save_dir/
//! ├── last_config.json      restart snapshot (after a stopped run)
//! └── run_000/
//!     ├── config.json       resolved configuration
//!     ├── run.log
//!     ├── particles.csv
//!     ├── aggregates.json
//!     └── geometry.gdml     only when export_gdml is set
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use super::snapshot::AggregateDocument;
use super::AggregationError;
use crate::config::Configuration;

pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "run.log";
pub const PARTICLES_FILE: &str = "particles.csv";
pub const AGGREGATES_FILE: &str = "aggregates.json";
pub const RESTART_FILE: &str = "last_config.json";

/// Prefix of incremental run directories
pub const RUN_DIR_PREFIX: &str = "run_";

/// Persists run artifacts under one fresh run directory
#[derive(Debug, Clone)]
pub struct ResultWriter {
    save_dir: PathBuf,
    run_dir: PathBuf,
}

impl ResultWriter {
    /// Create `save_dir` if needed and claim the first unused `run_NNN`
    pub fn create(save_dir: &Path) -> Result<Self, AggregationError> {
        fs::create_dir_all(save_dir).map_err(|source| AggregationError::Io {
            path: save_dir.to_path_buf(),
            source,
        })?;

        for index in 0..1000u32 {
            let run_dir = save_dir.join(format!("{RUN_DIR_PREFIX}{index:03}"));
            match fs::create_dir(&run_dir) {
                Ok(()) => {
                    info!(run_dir = %run_dir.display(), "run directory created");
                    return Ok(Self {
                        save_dir: save_dir.to_path_buf(),
                        run_dir,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(AggregationError::Io { path: run_dir, source }),
            }
        }
        Err(AggregationError::Inconsistent(format!(
            "no free run directory in {}",
            save_dir.display()
        )))
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join(LOG_FILE)
    }

    pub fn particles_path(&self) -> PathBuf {
        self.run_dir.join(PARTICLES_FILE)
    }

    pub fn restart_path(&self) -> PathBuf {
        self.save_dir.join(RESTART_FILE)
    }

    /// Write the resolved configuration snapshot
    pub fn write_config(&self, config: &Configuration) -> Result<PathBuf, AggregationError> {
        let path = self.run_dir.join(CONFIG_FILE);
        write_json(&path, config)?;
        Ok(path)
    }

    /// Write the bucket aggregates, once, at the end of the run
    pub fn write_aggregates(&self, document: &AggregateDocument) -> Result<PathBuf, AggregationError> {
        let path = self.run_dir.join(AGGREGATES_FILE);
        write_json(&path, document)?;
        Ok(path)
    }

    /// Write the configuration a resumed run should start from
    pub fn write_restart(&self, config: &Configuration) -> Result<PathBuf, AggregationError> {
        let path = self.restart_path();
        write_json(&path, config)?;
        info!(path = %path.display(), seed = config.random_seed, "restart snapshot written");
        Ok(path)
    }
}

/// Pretty JSON through a temporary file and a rename
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AggregationError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| AggregationError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.write_all(b"\n").map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)
}
