//! Atmospheric density tables
//!
//! The density file is a JSON object keyed by day index (`"0"`, `"1"`, ...).
//! Each day holds equal-length `altitude` (km), `T` (K) and `density`
//! (kg/m³) arrays, which are resampled onto evenly spaced layer heights.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::EnvironmentStateError;

/// One day of the density file as stored on disk
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RawDay {
    altitude: Vec<f64>,
    #[serde(rename = "T")]
    temperature: Vec<f64>,
    density: Vec<f64>,
}

/// Validated, altitude-sorted density profile of one day
#[derive(Debug, Clone, PartialEq)]
struct DayProfile {
    altitude: Vec<f64>,
    temperature: Vec<f64>,
    density: Vec<f64>,
}

/// Density profile interpolated onto the atmosphere layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityProfile {
    /// Day index the profile was taken from
    pub day_idx: u32,
    /// Layer heights in km, from 0 to `atmos_height`
    pub heights: Vec<f64>,
    /// Temperature per layer in K
    pub temperature: Vec<f64>,
    /// Density per layer in kg/m³
    pub density: Vec<f64>,
}

/// All days of a density file
#[derive(Debug, Clone, PartialEq)]
pub struct DensityTable {
    days: BTreeMap<u32, DayProfile>,
}

impl DensityTable {
    /// Read and validate a density file
    pub fn load(path: &Path) -> Result<Self, EnvironmentStateError> {
        let text = fs::read_to_string(path).map_err(|source| EnvironmentStateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text).map_err(|e| match e {
            EnvironmentStateError::MalformedTable { reason, .. } => {
                EnvironmentStateError::MalformedTable {
                    table: path.display().to_string(),
                    reason,
                }
            }
            other => other,
        })
    }

    /// Parse a density document
    ///
    /// # Example
    /// ```
    /// use particle_sim_core::environment::density::DensityTable;
    ///
    /// let table = DensityTable::from_json_str(
    ///     r#"{"0": {"altitude": [0, 10], "T": [288, 223], "density": [1.2, 0.4]}}"#,
    /// ).unwrap();
    /// assert_eq!(table.last_day(), 0);
    /// let profile = table.interpolate(0, 10.0, 3).unwrap();
    /// assert_eq!(profile.heights, vec![0.0, 5.0, 10.0]);
    /// assert!((profile.density[1] - 0.8).abs() < 1e-12);
    /// ```
    pub fn from_json_str(text: &str) -> Result<Self, EnvironmentStateError> {
        let raw: BTreeMap<String, RawDay> =
            serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;

        let mut days = BTreeMap::new();
        for (key, day) in raw {
            let index: u32 = key
                .trim()
                .parse()
                .map_err(|_| malformed(format!("day key `{key}` is not a non-negative integer")))?;
            days.insert(index, DayProfile::new(&key, day)?);
        }

        if days.is_empty() {
            return Err(malformed("no days in table".to_string()));
        }
        Ok(Self { days })
    }

    /// Largest day index in the table
    pub fn last_day(&self) -> u32 {
        self.days.keys().next_back().copied().unwrap_or(0)
    }

    pub fn contains_day(&self, day_idx: u32) -> bool {
        self.days.contains_key(&day_idx)
    }

    /// Resample one day onto `n_points` heights spanning `[0, atmos_height]`
    pub fn interpolate(
        &self,
        day_idx: u32,
        atmos_height: f64,
        n_points: usize,
    ) -> Result<DensityProfile, EnvironmentStateError> {
        let day = self
            .days
            .get(&day_idx)
            .ok_or(EnvironmentStateError::MissingDay {
                day_idx,
                last_day: self.last_day(),
            })?;

        let heights = linspace(0.0, atmos_height, n_points);
        let temperature = heights
            .iter()
            .map(|&h| interp(h, &day.altitude, &day.temperature))
            .collect();
        let density = heights
            .iter()
            .map(|&h| interp(h, &day.altitude, &day.density))
            .collect();

        Ok(DensityProfile {
            day_idx,
            heights,
            temperature,
            density,
        })
    }
}

impl DayProfile {
    fn new(key: &str, raw: RawDay) -> Result<Self, EnvironmentStateError> {
        let n = raw.altitude.len();
        if n == 0 {
            return Err(malformed(format!("day {key} has no samples")));
        }
        if raw.temperature.len() != n || raw.density.len() != n {
            return Err(malformed(format!(
                "day {key} has ragged arrays (altitude {n}, T {}, density {})",
                raw.temperature.len(),
                raw.density.len()
            )));
        }
        if raw
            .altitude
            .iter()
            .chain(&raw.temperature)
            .chain(&raw.density)
            .any(|v| !v.is_finite())
        {
            return Err(malformed(format!("day {key} contains non-finite values")));
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| raw.altitude[a].total_cmp(&raw.altitude[b]));

        Ok(Self {
            altitude: order.iter().map(|&i| raw.altitude[i]).collect(),
            temperature: order.iter().map(|&i| raw.temperature[i]).collect(),
            density: order.iter().map(|&i| raw.density[i]).collect(),
        })
    }
}

fn malformed(reason: String) -> EnvironmentStateError {
    EnvironmentStateError::MalformedTable {
        table: "density".to_string(),
        reason,
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Piecewise-linear interpolation over sorted `xs`, clamped at both ends
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return f64::NAN;
    };
    if x <= first {
        return ys[0];
    }
    if x >= last {
        return ys[ys.len() - 1];
    }
    let upper = xs.partition_point(|&v| v <= x);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    if x1 == x0 {
        return y1;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}
