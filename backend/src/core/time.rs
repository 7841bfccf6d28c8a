//! Simulated time for the tick loop
//!
//! The simulation advances in discrete ticks. Every tick covers exactly one
//! `time_resolution` interval of simulated time, counted in whole
//! microseconds from the configured start time. Simulated days (86,400 s)
//! drive the density-profile day index and never depend on wall-clock time.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Microseconds in one simulated second
pub const MICROS_PER_SECOND: u64 = 1_000_000;

/// Microseconds in one simulated day (86,400 s)
pub const MICROS_PER_DAY: u64 = 86_400 * MICROS_PER_SECOND;

/// Maps elapsed simulated time onto bucket indices and calendar instants
///
/// # Example
/// ```
/// use particle_sim_core::SimClock;
/// use chrono::{TimeZone, Utc};
///
/// let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
/// let clock = SimClock::new(start, 60_000_000); // one minute per bucket
/// assert_eq!(clock.bucket_index(0), 0);
/// assert_eq!(clock.bucket_index(59_999_999), 0);
/// assert_eq!(clock.bucket_index(60_000_000), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimClock {
    /// Calendar instant of elapsed time zero
    start_time: DateTime<Utc>,
    /// Duration of one bucket in microseconds
    resolution_us: u64,
}

impl SimClock {
    /// Create a new SimClock
    ///
    /// # Arguments
    /// * `start_time` - Calendar instant at which simulated time starts
    /// * `resolution_us` - Length of one bucket in microseconds
    pub fn new(start_time: DateTime<Utc>, resolution_us: u64) -> Self {
        assert!(resolution_us > 0, "time_resolution must be positive");
        Self {
            start_time,
            resolution_us,
        }
    }

    /// Start of simulated time
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Bucket length in microseconds
    pub fn resolution_us(&self) -> u64 {
        self.resolution_us
    }

    /// Index of the bucket containing `elapsed_us`
    pub fn bucket_index(&self, elapsed_us: u64) -> u64 {
        elapsed_us / self.resolution_us
    }

    /// Elapsed simulated time at the start of bucket `index`
    pub fn elapsed_at(&self, index: u64) -> u64 {
        index.saturating_mul(self.resolution_us)
    }

    /// Calendar instant at the start of bucket `index`
    ///
    /// # Example
    /// ```
    /// use particle_sim_core::SimClock;
    /// use chrono::{TimeZone, Utc};
    ///
    /// let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    /// let clock = SimClock::new(start, 3_600_000_000); // one hour
    /// let third = clock.bucket_start(3);
    /// assert_eq!(third, Utc.with_ymd_and_hms(2021, 1, 1, 3, 0, 0).unwrap());
    /// ```
    pub fn bucket_start(&self, index: u64) -> DateTime<Utc> {
        self.instant_after(self.elapsed_at(index))
    }

    /// Calendar instant at the start of bucket `index`, `None` past the calendar range
    pub fn checked_bucket_start(&self, index: u64) -> Option<DateTime<Utc>> {
        let elapsed = index.checked_mul(self.resolution_us)?;
        let micros = i64::try_from(elapsed).ok()?;
        self.start_time.checked_add_signed(Duration::microseconds(micros))
    }

    /// Calendar instant `elapsed_us` after an arbitrary epoch
    pub fn advance_date(epoch: DateTime<Utc>, elapsed_us: u64) -> DateTime<Utc> {
        let micros = i64::try_from(elapsed_us).unwrap_or(i64::MAX);
        epoch
            .checked_add_signed(Duration::microseconds(micros))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Calendar instant `elapsed_us` after the start time
    pub fn instant_after(&self, elapsed_us: u64) -> DateTime<Utc> {
        Self::advance_date(self.start_time, elapsed_us)
    }

    /// Whole simulated days contained in `elapsed_us`
    pub fn days_elapsed(elapsed_us: u64) -> u64 {
        elapsed_us / MICROS_PER_DAY
    }
}

/// Decimal year of a calendar date (day precision)
///
/// # Example
/// ```
/// use particle_sim_core::core::time::decimal_year;
/// use chrono::NaiveDate;
///
/// let mid = decimal_year(NaiveDate::from_ymd_opt(2021, 7, 2).unwrap());
/// assert!((mid - 2021.4986).abs() < 1e-3);
/// ```
pub fn decimal_year(date: NaiveDate) -> f64 {
    let year_length = if NaiveDate::from_ymd_opt(date.year(), 2, 29).is_some() {
        366.0
    } else {
        365.0
    };
    date.year() as f64 + date.ordinal0() as f64 / year_length
}
