//! Output aggregation
//!
//! Workers hand complete ticks to the [`OutputAggregator`], which is the
//! single writer of `particles.csv`. For each record it assigns the run ID
//! and a timestamp, then appends it in arrival order. Per-bucket summaries
//! are merged across workers and returned at the end of the run.
//!
//! # Timestamps
//!
//! A record's timestamp is its bucket's start (µs since the Unix epoch) plus
//! the record's ordinal within that bucket across all workers. Ordinals stay
//! below `time_resolution`, so timestamps never collide across buckets.

pub mod snapshot;
pub mod writer;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::environment::TimeBucket;
use crate::models::record::{ParticleRecord, CSV_COLUMNS};
use crate::models::summary::BucketSummary;

pub use snapshot::{compute_config_hash, restart_config, AggregateDocument};
pub use writer::ResultWriter;

/// Output failures, always fatal for the run
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("cannot write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV output failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON output failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker {worker} sent a record for bucket {record_bucket} (day {record_day}) with bucket {bucket} (day {day})")]
    StaleRecord {
        worker: usize,
        bucket: u64,
        day: u32,
        record_bucket: u64,
        record_day: u32,
    },

    #[error("bucket {bucket} holds more than {capacity} records, timestamps would collide")]
    TimestampOverflow { bucket: u64, capacity: u64 },

    #[error("inconsistent aggregate: {0}")]
    Inconsistent(String),
}

/// Records produced by one worker during one tick
#[derive(Debug, Clone)]
pub struct TickBatch {
    pub worker: usize,
    pub bucket: TimeBucket,
    /// Primary events requested for this tick
    pub primaries: u64,
    pub records: Vec<ParticleRecord>,
}

/// Single writer of the particle CSV and owner of bucket summaries
pub struct OutputAggregator {
    run_id: Uuid,
    resolution_us: u64,
    csv_path: PathBuf,
    csv: csv::Writer<BufWriter<File>>,
    buckets: BTreeMap<u64, BucketSummary>,
    next_ordinal: BTreeMap<u64, u64>,
    records_written: u64,
}

impl OutputAggregator {
    /// Create `csv_path` and write the header
    pub fn create(csv_path: &Path, run_id: Uuid, resolution_us: u64) -> Result<Self, AggregationError> {
        let file = File::create(csv_path).map_err(|source| AggregationError::Io {
            path: csv_path.to_path_buf(),
            source,
        })?;
        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        csv.write_record(CSV_COLUMNS)?;
        csv.flush().map_err(|source| AggregationError::Io {
            path: csv_path.to_path_buf(),
            source,
        })?;

        info!(run_id = %run_id, path = %csv_path.display(), "particle output opened");

        Ok(Self {
            run_id,
            resolution_us: resolution_us.max(1),
            csv_path: csv_path.to_path_buf(),
            csv,
            buckets: BTreeMap::new(),
            next_ordinal: BTreeMap::new(),
            records_written: 0,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn summaries(&self) -> &BTreeMap<u64, BucketSummary> {
        &self.buckets
    }

    /// Append one complete tick
    ///
    /// The batch is checked before anything is written, so a rejected batch
    /// leaves the CSV untouched.
    pub fn submit(&mut self, batch: TickBatch) -> Result<(), AggregationError> {
        let TickBatch {
            worker,
            bucket,
            primaries,
            mut records,
        } = batch;

        if let Some(stale) = records.iter().find(|r| {
            r.bucket_index != bucket.index || r.density_day_idx != bucket.density_day_idx
        }) {
            return Err(AggregationError::StaleRecord {
                worker,
                bucket: bucket.index,
                day: bucket.density_day_idx,
                record_bucket: stale.bucket_index,
                record_day: stale.density_day_idx,
            });
        }

        let first = self.next_ordinal.get(&bucket.index).copied().unwrap_or(0);
        let end = first + records.len() as u64;
        if end > self.resolution_us {
            return Err(AggregationError::TimestampOverflow {
                bucket: bucket.index,
                capacity: self.resolution_us,
            });
        }

        for (ordinal, record) in (first..end).zip(records.iter_mut()) {
            record.run_id = self.run_id;
            record.process_id = worker;
            record.timestamp = bucket.start_micros.saturating_add(ordinal as i64);
            self.csv.serialize(&*record)?;
        }
        self.csv.flush().map_err(|source| AggregationError::Io {
            path: self.csv_path.clone(),
            source,
        })?;
        self.next_ordinal.insert(bucket.index, end);
        self.records_written += records.len() as u64;

        let mut tick = BucketSummary::new(&bucket);
        tick.absorb(worker, primaries, &records);
        self.buckets
            .entry(bucket.index)
            .or_insert_with(|| BucketSummary::new(&bucket))
            .merge(&tick);

        debug!(
            worker,
            bucket = bucket.index,
            records = records.len(),
            "tick aggregated"
        );
        Ok(())
    }

    /// Flush the CSV and hand back the bucket summaries
    pub fn finish(mut self) -> Result<BTreeMap<u64, BucketSummary>, AggregationError> {
        self.csv.flush().map_err(|source| AggregationError::Io {
            path: self.csv_path.clone(),
            source,
        })?;
        info!(
            records = self.records_written,
            buckets = self.buckets.len(),
            "particle output closed"
        );
        Ok(self.buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHit;
    use crate::environment::density::DensityProfile;
    use crate::environment::magnetic::MagneticProfile;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn bucket(index: u64, day: u32) -> TimeBucket {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(index as i64);
        TimeBucket {
            index,
            start_time: start,
            start_micros: start.timestamp_micros(),
            elapsed_us: index * 1_000_000,
            magnetic_field: MagneticProfile::zeros(1),
            density_day_idx: day,
            density: Arc::new(DensityProfile {
                day_idx: day,
                heights: vec![0.0],
                temperature: vec![288.0],
                density: vec![1.2],
            }),
        }
    }

    fn record(bucket: &TimeBucket, particle: &str) -> ParticleRecord {
        let hit = EngineHit {
            event_id: 0,
            track_id: 1,
            particle: particle.to_string(),
            pdg: 13,
            momentum: [0.0, 0.0, -1.0],
            position: [0.0; 3],
            theta: 0.0,
            phi: 0.0,
            time: 0.0,
            local_time: 0.0,
            detector: None,
        };
        ParticleRecord::from_hit(hit, 1, bucket, (42.0, -8.0))
    }

    #[test]
    fn test_stale_record_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut output =
            OutputAggregator::create(&dir.path().join("p.csv"), Uuid::new_v4(), 1_000_000).unwrap();
        let old = bucket(0, 0);
        let batch = TickBatch {
            worker: 1,
            bucket: bucket(1, 0),
            primaries: 1,
            records: vec![record(&old, "mu-")],
        };
        assert!(matches!(
            output.submit(batch),
            Err(AggregationError::StaleRecord { record_bucket: 0, bucket: 1, .. })
        ));
        assert_eq!(output.records_written(), 0);
    }

    #[test]
    fn test_overflow_when_bucket_exceeds_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut output =
            OutputAggregator::create(&dir.path().join("p.csv"), Uuid::new_v4(), 2).unwrap();
        let b = bucket(0, 0);
        let batch = TickBatch {
            worker: 1,
            bucket: b.clone(),
            primaries: 1,
            records: vec![record(&b, "mu-"), record(&b, "mu-"), record(&b, "mu+")],
        };
        assert!(matches!(
            output.submit(batch),
            Err(AggregationError::TimestampOverflow { bucket: 0, capacity: 2 })
        ));
    }

    #[test]
    fn test_summaries_merge_across_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut output =
            OutputAggregator::create(&dir.path().join("p.csv"), Uuid::new_v4(), 1_000_000).unwrap();
        let b = bucket(0, 0);
        for worker in [1, 2] {
            output
                .submit(TickBatch {
                    worker,
                    bucket: b.clone(),
                    primaries: 5,
                    records: vec![record(&b, "mu-"), record(&b, "gamma")],
                })
                .unwrap();
        }
        let summaries = output.finish().unwrap();
        let summary = &summaries[&0];
        assert_eq!(summary.primaries, 10);
        assert_eq!(summary.particles, 4);
        assert_eq!(summary.species["mu-"], 2);
        assert_eq!(summary.workers[&2], 2);
    }
}
