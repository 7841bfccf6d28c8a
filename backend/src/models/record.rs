//! Per-particle output record
//!
//! One row of `particles.csv`. Field order is the column order.
//!
//! CRITICAL: `run_ID` and `timestamp` are assigned by the output aggregator,
//! never by workers. Workers leave them at their zero values.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::EngineHit;
use crate::environment::TimeBucket;

/// Column header of the particle CSV, in order
pub const CSV_COLUMNS: [&str; 22] = [
    "EventID",
    "TrackID",
    "process_ID",
    "Particle",
    "ParticleID",
    "px",
    "py",
    "pz",
    "x",
    "y",
    "z",
    "theta",
    "phi",
    "time",
    "local_time",
    "detector_type",
    "latitude",
    "longitude",
    "timestamp",
    "start_time",
    "density_day_idx",
    "run_ID",
];

/// Detector label used when the engine does not name one
pub const DEFAULT_DETECTOR: &str = "sensitive_detector";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleRecord {
    #[serde(rename = "EventID")]
    pub event_id: u64,
    #[serde(rename = "TrackID")]
    pub track_id: u64,
    /// Worker ordinal
    #[serde(rename = "process_ID")]
    pub process_id: usize,
    #[serde(rename = "Particle")]
    pub particle: String,
    /// PDG code
    #[serde(rename = "ParticleID")]
    pub particle_id: i64,
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub theta: f64,
    pub phi: f64,
    pub time: f64,
    pub local_time: f64,
    pub detector_type: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Microseconds since the Unix epoch, unique within the run
    pub timestamp: i64,
    /// Start of the bucket the record was produced in (RFC 3339)
    pub start_time: String,
    pub density_day_idx: u32,
    #[serde(rename = "run_ID")]
    pub run_id: Uuid,
    /// Bucket the record belongs to
    #[serde(skip)]
    pub bucket_index: u64,
}

impl ParticleRecord {
    /// Build the record of `hit`, produced by `worker` during `bucket`
    pub fn from_hit(
        hit: EngineHit,
        worker: usize,
        bucket: &TimeBucket,
        site: (f64, f64),
    ) -> Self {
        let [px, py, pz] = hit.momentum;
        let [x, y, z] = hit.position;
        Self {
            event_id: hit.event_id,
            track_id: hit.track_id,
            process_id: worker,
            particle: hit.particle,
            particle_id: hit.pdg,
            px,
            py,
            pz,
            x,
            y,
            z,
            theta: hit.theta,
            phi: hit.phi,
            time: hit.time,
            local_time: hit.local_time,
            detector_type: hit.detector.unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            latitude: site.0,
            longitude: site.1,
            timestamp: 0,
            start_time: bucket
                .start_time
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            density_day_idx: bucket.density_day_idx,
            run_id: Uuid::nil(),
            bucket_index: bucket.index,
        }
    }
}
