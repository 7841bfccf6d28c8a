//! Per-bucket aggregate
//!
//! Summaries are built per worker as ticks arrive and merged by bucket index.
//! Merging adds counts; it never overwrites them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::record::ParticleRecord;
use crate::environment::TimeBucket;

/// Counts accumulated during one time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub bucket_index: u64,
    /// Bucket start (RFC 3339)
    pub start_time: String,
    pub density_day_idx: u32,
    /// Ground-layer field (north, east, up) in tesla
    pub ground_field: [f64; 3],
    /// Primary events requested from all engines
    pub primaries: u64,
    /// Particle records written
    pub particles: u64,
    /// Records per species
    pub species: BTreeMap<String, u64>,
    /// Records per worker ordinal
    pub workers: BTreeMap<usize, u64>,
}

impl BucketSummary {
    /// Empty summary for `bucket`
    pub fn new(bucket: &TimeBucket) -> Self {
        Self {
            bucket_index: bucket.index,
            start_time: bucket
                .start_time
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
            density_day_idx: bucket.density_day_idx,
            ground_field: bucket.magnetic_field.ground(),
            primaries: 0,
            particles: 0,
            species: BTreeMap::new(),
            workers: BTreeMap::new(),
        }
    }

    /// Add one worker tick
    pub fn absorb(&mut self, worker: usize, primaries: u64, records: &[ParticleRecord]) {
        self.primaries += primaries;
        self.particles += records.len() as u64;
        *self.workers.entry(worker).or_insert(0) += records.len() as u64;
        for record in records {
            *self.species.entry(record.particle.clone()).or_insert(0) += 1;
        }
    }

    /// Add another summary of the same bucket
    pub fn merge(&mut self, other: &BucketSummary) {
        debug_assert_eq!(self.bucket_index, other.bucket_index);
        self.primaries += other.primaries;
        self.particles += other.particles;
        for (species, count) in &other.species {
            *self.species.entry(species.clone()).or_insert(0) += count;
        }
        for (worker, count) in &other.workers {
            *self.workers.entry(*worker).or_insert(0) += count;
        }
    }
}
