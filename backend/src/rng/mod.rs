//! Deterministic random number generation
//!
//! Uses xorshift64* for deterministic streams and SplitMix64 to spread the
//! global seed across workers.
//! All seeds handed to engines MUST be derived through this module.

mod xorshift;

pub use xorshift::{derive_worker_seed, RngManager};
