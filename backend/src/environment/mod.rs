//! Per-worker environmental state
//!
//! Each worker owns one [`EnvironmentStateController`]. It maps elapsed
//! simulated time to [`TimeBucket`]s and recomputes the magnetic field and
//! the density-profile day whenever a new bucket starts.
//!
//! # Day stepping
//!
//! The density day advances by at most one index per new bucket, whenever
//! the bucket start lies past more whole simulated days than have been
//! applied so far. It never decreases and clamps at the last day of the
//! density table (logged once per controller).

pub mod density;
pub mod magnetic;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Configuration, MagneticSourceKind};
use crate::core::time::SimClock;
use density::{linspace, DensityProfile, DensityTable};
use magnetic::{DipoleModel, MagneticProfile, MagneticSource, MagneticTable};

/// Errors raised while loading or evaluating environment data
#[derive(Debug, Error)]
pub enum EnvironmentStateError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed {table} table: {reason}")]
    MalformedTable { table: String, reason: String },

    #[error("density day {day_idx} is not in the table (last day is {last_day})")]
    MissingDay { day_idx: u32, last_day: u32 },

    #[error("no data for {what}")]
    OutOfRange { what: String },

    #[error("bucket index went backwards from {current} to {requested}")]
    NonMonotonic { current: u64, requested: u64 },

    #[error("environment controller is terminated")]
    Terminated,
}

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No bucket computed yet
    Idle,
    /// Current bucket index
    Active(u64),
    Terminated,
}

/// One discretized interval of simulated time and the environment valid in it
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBucket {
    pub index: u64,
    /// Calendar instant at the start of the bucket
    pub start_time: DateTime<Utc>,
    /// `start_time` in microseconds since the Unix epoch
    pub start_micros: i64,
    /// Elapsed simulated time at the start of the bucket
    pub elapsed_us: u64,
    pub magnetic_field: MagneticProfile,
    pub density_day_idx: u32,
    pub density: Arc<DensityProfile>,
}

/// Loaded environment inputs of a worker
#[derive(Debug, Clone)]
pub struct EnvironmentSources {
    pub magnetic: MagneticSource,
    pub density: DensityTable,
    /// Configured `day_idx`, the day of bucket 0
    pub base_day: u32,
    pub atmos_height: f64,
    pub n_points: usize,
    /// Date of the field at elapsed time zero
    pub mag_epoch: DateTime<Utc>,
}

impl EnvironmentSources {
    /// Load the density table and, when needed, the magnetic table
    pub fn from_config(config: &Configuration) -> Result<Self, EnvironmentStateError> {
        let constructor = &config.constructor;
        let field = &constructor.magnetic_field;

        let magnetic = if !field.enabled {
            MagneticSource::Disabled
        } else {
            match (field.mag_source, &field.mag_file) {
                (MagneticSourceKind::File, Some(path)) => MagneticSource::Table {
                    table: MagneticTable::load(path)?,
                    latitude: field.latitude,
                    longitude: field.longitude,
                },
                (MagneticSourceKind::File, None) => {
                    return Err(EnvironmentStateError::OutOfRange {
                        what: "magnetic field file (none configured)".to_string(),
                    })
                }
                (MagneticSourceKind::Estimated, _) => MagneticSource::Estimated {
                    model: DipoleModel::default(),
                    latitude: field.latitude,
                    longitude: field.longitude,
                },
            }
        };

        Ok(Self {
            magnetic,
            density: DensityTable::load(&constructor.density_profile.density_file)?,
            base_day: constructor.density_profile.day_idx,
            atmos_height: constructor.atmos_height,
            n_points: constructor.atmos_n_points,
            mag_epoch: field.mag_time,
        })
    }
}

/// Ticked environment of one worker
#[derive(Debug)]
pub struct EnvironmentStateController {
    worker: usize,
    clock: SimClock,
    sources: EnvironmentSources,
    heights: Vec<f64>,
    /// Days applied on top of `base_day`
    day_offset: u32,
    clamp_reported: bool,
    density: Option<Arc<DensityProfile>>,
    state: ControllerState,
    current: Option<TimeBucket>,
}

impl EnvironmentStateController {
    /// Build the controller of worker `worker` from the resolved config
    pub fn new(config: &Configuration, worker: usize) -> Result<Self, EnvironmentStateError> {
        Self::from_sources(config.clock(), EnvironmentSources::from_config(config)?, worker)
    }

    pub fn from_sources(
        clock: SimClock,
        sources: EnvironmentSources,
        worker: usize,
    ) -> Result<Self, EnvironmentStateError> {
        if !sources.density.contains_day(sources.base_day) {
            return Err(EnvironmentStateError::MissingDay {
                day_idx: sources.base_day,
                last_day: sources.density.last_day(),
            });
        }
        let heights = linspace(0.0, sources.atmos_height, sources.n_points);
        Ok(Self {
            worker,
            clock,
            sources,
            heights,
            day_offset: 0,
            clamp_reported: false,
            density: None,
            state: ControllerState::Idle,
            current: None,
        })
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn current_bucket(&self) -> Option<&TimeBucket> {
        self.current.as_ref()
    }

    /// Layer heights in km
    pub fn heights(&self) -> &[f64] {
        &self.heights
    }

    /// Bucket containing `elapsed_us` of simulated time
    ///
    /// Calling again inside the same bucket returns the same bucket without
    /// recomputing anything. Going back to an earlier bucket is an error, as
    /// is a bucket whose start lies past the calendar range.
    pub fn advance(&mut self, elapsed_us: u64) -> Result<TimeBucket, EnvironmentStateError> {
        if self.state == ControllerState::Terminated {
            return Err(EnvironmentStateError::Terminated);
        }

        let index = self.clock.bucket_index(elapsed_us);
        if let Some(current) = &self.current {
            if index == current.index {
                return Ok(current.clone());
            }
            if index < current.index {
                return Err(EnvironmentStateError::NonMonotonic {
                    current: current.index,
                    requested: index,
                });
            }
        }

        let start_time = self.clock.checked_bucket_start(index).ok_or_else(|| {
            EnvironmentStateError::OutOfRange {
                what: format!("calendar start of bucket {index}"),
            }
        })?;
        let bucket_elapsed = self.clock.elapsed_at(index);
        let target_days = SimClock::days_elapsed(bucket_elapsed);
        if u64::from(self.day_offset) < target_days {
            self.day_offset = self.day_offset.saturating_add(1);
        }
        let day_idx = self.day_index();
        let density = self.density_for(day_idx)?;

        let field_date = SimClock::advance_date(self.sources.mag_epoch, bucket_elapsed).date_naive();
        let magnetic_field = self.sources.magnetic.profile(field_date, &self.heights)?;

        let bucket = TimeBucket {
            index,
            start_time,
            start_micros: start_time.timestamp_micros(),
            elapsed_us: bucket_elapsed,
            magnetic_field,
            density_day_idx: day_idx,
            density,
        };

        debug!(
            worker = self.worker,
            bucket = index,
            day = day_idx,
            "environment advanced"
        );

        self.state = ControllerState::Active(index);
        self.current = Some(bucket.clone());
        Ok(bucket)
    }

    /// Stop accepting ticks
    pub fn terminate(&mut self) {
        self.state = ControllerState::Terminated;
    }

    fn day_index(&mut self) -> u32 {
        let last_day = self.sources.density.last_day();
        let wanted = self.sources.base_day.saturating_add(self.day_offset);
        if wanted <= last_day {
            return wanted;
        }
        if !self.clamp_reported {
            warn!(
                worker = self.worker,
                wanted,
                last_day,
                "density profile day out of range, clamping to last day"
            );
            self.clamp_reported = true;
        }
        last_day
    }

    /// Interpolated profile of `day_idx`, recomputed only when the day changes
    fn density_for(&mut self, day_idx: u32) -> Result<Arc<DensityProfile>, EnvironmentStateError> {
        if let Some(profile) = &self.density {
            if profile.day_idx == day_idx {
                return Ok(Arc::clone(profile));
            }
        }
        let profile = Arc::new(self.sources.density.interpolate(
            day_idx,
            self.sources.atmos_height,
            self.sources.n_points,
        )?);
        debug!(worker = self.worker, day = day_idx, "density profile interpolated");
        self.density = Some(Arc::clone(&profile));
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::MICROS_PER_DAY;
    use chrono::TimeZone;

    fn controller(resolution_us: u64, base_day: u32) -> EnvironmentStateController {
        let density = DensityTable::from_json_str(
            r#"{
                "0": {"altitude": [0, 70], "T": [290, 220], "density": [1.2, 0.0001]},
                "1": {"altitude": [0, 70], "T": [291, 221], "density": [1.3, 0.0002]},
                "2": {"altitude": [0, 70], "T": [292, 222], "density": [1.4, 0.0003]}
            }"#,
        )
        .unwrap();
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let sources = EnvironmentSources {
            magnetic: MagneticSource::Estimated {
                model: DipoleModel::default(),
                latitude: 42.224,
                longitude: -8.716,
            },
            density,
            base_day,
            atmos_height: 70.0,
            n_points: 8,
            mag_epoch: start,
        };
        EnvironmentStateController::from_sources(SimClock::new(start, resolution_us), sources, 1)
            .unwrap()
    }

    #[test]
    fn test_starts_idle() {
        let env = controller(60_000_000, 0);
        assert_eq!(env.state(), ControllerState::Idle);
        assert!(env.current_bucket().is_none());
    }

    #[test]
    fn test_backwards_rejected() {
        let mut env = controller(60_000_000, 0);
        env.advance(600_000_000).unwrap();
        assert!(matches!(
            env.advance(0),
            Err(EnvironmentStateError::NonMonotonic { current: 10, requested: 0 })
        ));
    }

    #[test]
    fn test_density_shared_within_day() {
        let mut env = controller(3_600_000_000, 0);
        let a = env.advance(0).unwrap();
        let b = env.advance(3_600_000_000).unwrap();
        assert!(Arc::ptr_eq(&a.density, &b.density));
    }

    #[test]
    fn test_missing_base_day() {
        let density = DensityTable::from_json_str(
            r#"{"0": {"altitude": [0], "T": [1], "density": [1]}}"#,
        )
        .unwrap();
        let sources = EnvironmentSources {
            magnetic: MagneticSource::Disabled,
            density,
            base_day: 4,
            atmos_height: 70.0,
            n_points: 2,
            mag_epoch: Utc::now(),
        };
        let result = EnvironmentStateController::from_sources(SimClock::new(Utc::now(), 1), sources, 2);
        assert!(matches!(
            result,
            Err(EnvironmentStateError::MissingDay { day_idx: 4, last_day: 0 })
        ));
    }

    #[test]
    fn test_terminated_rejects_advance() {
        let mut env = controller(MICROS_PER_DAY, 0);
        env.advance(0).unwrap();
        env.terminate();
        assert!(matches!(env.advance(MICROS_PER_DAY), Err(EnvironmentStateError::Terminated)));
    }
}
