//! Run configuration
//!
//! A [`Configuration`] is resolved once at process start from three override
//! layers over a static schema (see [`schema::SCHEMA`]) and is immutable
//! afterwards. Its JSON form is the `config.json` snapshot written next to the
//! results, and feeding that snapshot back through [`resolver::resolve_snapshot`]
//! yields the same configuration.

pub mod resolver;
pub mod schema;
pub mod sources;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::time::SimClock;
use schema::KNOWN_SPECIES;

pub use resolver::resolve;

/// Species filter value accepting every particle
pub const ALL_SPECIES: &str = "all";

// ============================================================================
// Errors
// ============================================================================

/// Invalid configuration, always reported with the offending dotted path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration at `{path}`: {reason}")]
pub struct ConfigValidationError {
    pub path: String,
    pub reason: String,
}

impl ConfigValidationError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Error for a path that is not in the schema
    pub fn unknown(path: impl Into<String>) -> Self {
        Self::new(path, "unknown configuration key")
    }
}

// ============================================================================
// Enumerated leaves
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorType {
    Gps,
    ParticleGun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputGeometry {
    Custom,
    Gdml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Geometry {
    Flat,
    Curved,
}

/// Where the magnetic field comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MagneticSourceKind {
    /// Tabulated CSV file
    File,
    /// Geomagnetic model evaluated at the site
    Estimated,
}

/// What happens to the run when one worker fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop every worker and fail the run
    Abort,
    /// Record the failure and let the other workers finish
    Skip,
}

/// One entry of `atmos_comp`: an element symbol or its percentage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CompositionItem {
    Fraction(f64),
    Element(String),
}

// ============================================================================
// Configuration tree
// ============================================================================

/// Resolved, validated run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Global seed; worker seeds are derived from it
    pub random_seed: u64,
    pub num_processes: usize,
    pub logger_level: LogLevel,
    /// Primary events requested from the engine per tick
    pub particles_per_run: u64,
    /// Executed in order by every worker before the first tick
    pub macro_files: Vec<PathBuf>,
    pub save_dir: PathBuf,
    /// Tick length in microseconds of simulated time
    pub time_resolution: f64,
    /// Number of ticks, or -1 to run until stopped
    pub sim_cycles: i64,
    pub start_time: DateTime<Utc>,
    pub generator: GeneratorConfig,
    pub constructor: ConstructorConfig,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    pub gen_type: GeneratorType,
    pub n_events: u32,
    /// GeV
    pub energy: f64,
    pub particle: String,
    /// km from the centre of the geometry
    pub position: [f64; 3],
    pub direction: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstructorConfig {
    pub input_geom: InputGeometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdml_file: Option<PathBuf>,
    pub export_gdml: bool,
    pub geometry: Geometry,
    /// km, only meaningful for curved geometry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earth_radius: Option<f64>,
    pub atmos_size: f64,
    pub atmos_height: f64,
    pub atmos_comp: Vec<CompositionItem>,
    pub atmos_n_points: usize,
    pub magnetic_field: MagneticFieldConfig,
    pub sensitive_detectors: SensitiveDetectorConfig,
    pub density_profile: DensityProfileConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MagneticFieldConfig {
    pub enabled: bool,
    pub mag_source: MagneticSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mag_file: Option<PathBuf>,
    pub latitude: f64,
    pub longitude: f64,
    pub mag_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensitiveDetectorConfig {
    pub enabled: bool,
    /// km above ground, one detector layer each
    pub altitude: Vec<f64>,
    pub particles: Vec<String>,
}

impl SensitiveDetectorConfig {
    /// Whether a hit of `species` is recorded
    pub fn accepts(&self, species: &str) -> bool {
        self.enabled
            && self
                .particles
                .iter()
                .any(|p| p == ALL_SPECIES || p == species)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DensityProfileConfig {
    pub density_file: PathBuf,
    pub day_idx: u32,
}

/// External engine process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Environment variable naming the engine dataset directory
    pub dataset_dir_var: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub on_worker_failure: FailurePolicy,
    /// Seconds a worker may stay silent before it counts as hung
    pub worker_grace_period: f64,
}

impl Configuration {
    /// Cross-field constraints the per-leaf schema cannot express
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.macro_files.is_empty() {
            return Err(ConfigValidationError::new(
                "macro_files",
                "at least one macro file is required",
            ));
        }

        if self.generator.gen_type == GeneratorType::ParticleGun
            && !KNOWN_SPECIES.contains(&self.generator.particle.as_str())
        {
            return Err(ConfigValidationError::new(
                "generator.particle",
                format!("unknown particle `{}`", self.generator.particle),
            ));
        }

        let constructor = &self.constructor;
        if constructor.geometry == Geometry::Curved && constructor.earth_radius.is_none() {
            return Err(ConfigValidationError::new(
                "constructor.earth_radius",
                "required when geometry is `curved`",
            ));
        }
        if constructor.input_geom == InputGeometry::Gdml && constructor.gdml_file.is_none() {
            return Err(ConfigValidationError::new(
                "constructor.gdml_file",
                "required when input_geom is `gdml`",
            ));
        }
        if constructor.export_gdml && self.num_processes > 1 {
            return Err(ConfigValidationError::new(
                "constructor.export_gdml",
                format!(
                    "geometry export needs num_processes == 1 (got {})",
                    self.num_processes
                ),
            ));
        }
        validate_composition(&constructor.atmos_comp)?;

        let field = &constructor.magnetic_field;
        if field.enabled && field.mag_source == MagneticSourceKind::File && field.mag_file.is_none()
        {
            return Err(ConfigValidationError::new(
                "constructor.magnetic_field.mag_file",
                "required when mag_source is `file`",
            ));
        }

        let detectors = &constructor.sensitive_detectors;
        if detectors.enabled {
            if detectors.altitude.is_empty() {
                return Err(ConfigValidationError::new(
                    "constructor.sensitive_detectors.altitude",
                    "at least one altitude is required",
                ));
            }
            if detectors.particles.is_empty() {
                return Err(ConfigValidationError::new(
                    "constructor.sensitive_detectors.particles",
                    "at least one particle is required",
                ));
            }
            if let Some(bad) = detectors
                .particles
                .iter()
                .find(|p| p.as_str() != ALL_SPECIES && !KNOWN_SPECIES.contains(&p.as_str()))
            {
                return Err(ConfigValidationError::new(
                    "constructor.sensitive_detectors.particles",
                    format!("unknown particle `{bad}`"),
                ));
            }
        }

        let density_file = &constructor.density_profile.density_file;
        let is_json = density_file
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ConfigValidationError::new(
                "constructor.density_profile.density_file",
                format!("{} is not a .json file", density_file.display()),
            ));
        }

        if self.engine.command.trim().is_empty() {
            return Err(ConfigValidationError::new("engine.command", "must not be empty"));
        }

        Ok(())
    }

    /// Check that every referenced input file exists
    ///
    /// Kept apart from [`Configuration::validate`] so resolution stays pure.
    pub fn preflight(&self) -> Result<(), ConfigValidationError> {
        for macro_file in &self.macro_files {
            require_file("macro_files", macro_file)?;
        }
        require_file(
            "constructor.density_profile.density_file",
            &self.constructor.density_profile.density_file,
        )?;

        let field = &self.constructor.magnetic_field;
        if field.enabled && field.mag_source == MagneticSourceKind::File {
            if let Some(mag_file) = &field.mag_file {
                require_file("constructor.magnetic_field.mag_file", mag_file)?;
            }
        }
        if self.constructor.input_geom == InputGeometry::Gdml {
            if let Some(gdml_file) = &self.constructor.gdml_file {
                require_file("constructor.gdml_file", gdml_file)?;
            }
        }
        Ok(())
    }

    /// Tick length in whole microseconds (at least 1)
    pub fn time_resolution_us(&self) -> u64 {
        (self.time_resolution.round() as u64).max(1)
    }

    /// Clock mapping elapsed simulated time to buckets
    pub fn clock(&self) -> SimClock {
        SimClock::new(self.start_time, self.time_resolution_us())
    }

    /// Tick count, `None` when the run is unbounded
    pub fn tick_limit(&self) -> Option<u64> {
        u64::try_from(self.sim_cycles).ok()
    }

    pub fn worker_grace_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.scheduler.worker_grace_period).unwrap_or(Duration::MAX)
    }
}

fn validate_composition(items: &[CompositionItem]) -> Result<(), ConfigValidationError> {
    let alternating = items.len() >= 2
        && items.len() % 2 == 0
        && items.chunks(2).all(|pair| {
            matches!(
                pair,
                [CompositionItem::Element(_), CompositionItem::Fraction(_)]
            )
        });
    if alternating {
        Ok(())
    } else {
        Err(ConfigValidationError::new(
            "constructor.atmos_comp",
            "expected element/percentage pairs",
        ))
    }
}

fn require_file(path: &str, file: &Path) -> Result<(), ConfigValidationError> {
    if file.is_file() {
        Ok(())
    } else {
        Err(ConfigValidationError::new(
            path,
            format!("file not found: {}", file.display()),
        ))
    }
}
