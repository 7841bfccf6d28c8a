//! Output data models

pub mod record;
pub mod summary;

// Re-exports
pub use record::{ParticleRecord, CSV_COLUMNS};
pub use summary::BucketSummary;
