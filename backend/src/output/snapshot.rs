//! Aggregate document and restart snapshot
//!
//! # Critical Invariants
//!
//! - **Config Matching**: `aggregates.json` carries the SHA-256 hash of the
//!   canonical configuration, so results can be matched to `config.json`
//! - **Count Conservation**: per-bucket species and worker counts add up to
//!   the bucket's particle count, and bucket counts add up to the CSV rows

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AggregationError;
use crate::config::Configuration;
use crate::models::summary::BucketSummary;
use crate::scheduler::WorkerOutcome;

/// Seed increment applied to a restart snapshot on top of `num_processes`
pub const RESTART_SEED_STRIDE: u64 = 10;

// ============================================================================
// Aggregate Document
// ============================================================================

/// Contents of `aggregates.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDocument {
    pub run_id: Uuid,
    /// SHA256 of the canonical configuration
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    /// True when the run ended on the stop signal
    pub stopped: bool,
    /// Rows written to the particle CSV
    pub records: u64,
    pub workers: Vec<WorkerOutcome>,
    /// Summaries keyed by bucket index
    pub buckets: BTreeMap<u64, BucketSummary>,
}

// ============================================================================
// Config Hashing
// ============================================================================

/// Compute deterministic SHA256 hash of a configuration
///
/// Uses canonical JSON serialization with sorted keys, so the hash does not
/// depend on field or map ordering.
pub fn compute_config_hash<T: Serialize>(config: &T) -> Result<String, AggregationError> {
    use serde_json::Value;

    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    let canonical = canonicalize(serde_json::to_value(config)?);
    let json = serde_json::to_string(&canonical)?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Restart
// ============================================================================

/// Configuration for the run that resumes a stopped one
///
/// Identical except for the seed, advanced by `num_processes + 10`.
pub fn restart_config(config: &Configuration) -> Configuration {
    let mut next = config.clone();
    next.random_seed = config
        .random_seed
        .saturating_add(config.num_processes as u64 + RESTART_SEED_STRIDE);
    next
}

// ============================================================================
// Validation
// ============================================================================

/// Check that the document's counts are consistent
pub fn validate_document(document: &AggregateDocument) -> Result<(), AggregationError> {
    let mut total = 0u64;
    for (index, summary) in &document.buckets {
        if *index != summary.bucket_index {
            return Err(AggregationError::Inconsistent(format!(
                "bucket key {index} holds summary of bucket {}",
                summary.bucket_index
            )));
        }
        let by_species: u64 = summary.species.values().sum();
        let by_worker: u64 = summary.workers.values().sum();
        if by_species != summary.particles || by_worker != summary.particles {
            return Err(AggregationError::Inconsistent(format!(
                "bucket {index}: {} particles but {by_species} by species and {by_worker} by worker",
                summary.particles
            )));
        }
        total += summary.particles;
    }

    if total != document.records {
        return Err(AggregationError::Inconsistent(format!(
            "buckets hold {total} particles but {} records were written",
            document.records
        )));
    }
    Ok(())
}
