//! xorshift64* random number generator and worker seed derivation
//!
//! xorshift64* is a variant of xorshift that passes TestU01's BigCrush
//! statistical tests. It uses 64-bit state and produces 64-bit output.
//!
//! # Determinism
//!
//! Same seed → same sequence. Worker seeds are derived from
//! `(random_seed, ordinal)` through a SplitMix64 finalizer, so a rerun with
//! the same global seed reproduces every worker's stream while distinct
//! ordinals start from unrelated states.

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// SplitMix64 finalizer
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Derive the engine seed of one worker
///
/// The result is never zero and depends only on the global seed and the
/// worker ordinal, never on the number of workers in the run.
///
/// # Example
/// ```
/// use particle_sim_core::derive_worker_seed;
///
/// let a = derive_worker_seed(42, 1);
/// assert_eq!(a, derive_worker_seed(42, 1));
/// assert_ne!(a, derive_worker_seed(42, 2));
/// ```
pub fn derive_worker_seed(random_seed: u64, ordinal: usize) -> u64 {
    let mixed = splitmix64(random_seed ^ splitmix64(ordinal as u64).rotate_left(17));
    let mut rng = RngManager::new(mixed);
    let seed = rng.next() >> 1;
    if seed == 0 {
        1
    } else {
        seed
    }
}

/// Deterministic random number generator using xorshift64*
///
/// # Example
/// ```
/// use particle_sim_core::RngManager;
///
/// let mut a = RngManager::new(12345);
/// let mut b = RngManager::new(12345);
/// assert_eq!(a.next(), b.next());
/// ```
#[derive(Debug, Clone)]
pub struct RngManager {
    /// Internal state (64-bit)
    state: u64,
}

impl RngManager {
    /// Create a new RNG with given seed
    pub fn new(seed: u64) -> Self {
        // Ensure seed is never zero (xorshift requirement)
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Generate next random u64 value
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}
