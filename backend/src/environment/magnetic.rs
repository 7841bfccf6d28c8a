//! Geomagnetic field sources
//!
//! A field profile holds one vector per atmosphere layer, expressed as
//! (north, east, up) in tesla. Vectors come from a tabulated CSV file or
//! from a tilted-dipole estimate; a disabled field is all zeros.

use std::io::Read;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::density::interp;
use super::EnvironmentStateError;
use crate::core::time::decimal_year;

/// Nanotesla to tesla
pub const NANOTESLA: f64 = 1e-9;

/// Geomagnetic reference radius in km
pub const REFERENCE_RADIUS_KM: f64 = 6371.2;

/// Field vectors for every layer, (north, east, up) in tesla
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MagneticProfile {
    pub layers: Vec<[f64; 3]>,
}

impl MagneticProfile {
    pub fn zeros(n_layers: usize) -> Self {
        Self {
            layers: vec![[0.0; 3]; n_layers],
        }
    }

    /// Field at the lowest layer
    pub fn ground(&self) -> [f64; 3] {
        self.layers.first().copied().unwrap_or([0.0; 3])
    }
}

// ============================================================================
// Tilted dipole
// ============================================================================

/// First-degree Gauss coefficients with linear secular variation
///
/// Defaults are IGRF-13 at epoch 2020.0 (nT, nT/yr).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DipoleModel {
    pub epoch: f64,
    pub g10: f64,
    pub g11: f64,
    pub h11: f64,
    pub g10_sv: f64,
    pub g11_sv: f64,
    pub h11_sv: f64,
}

impl Default for DipoleModel {
    fn default() -> Self {
        Self {
            epoch: 2020.0,
            g10: -29404.8,
            g11: -1450.9,
            h11: 4652.5,
            g10_sv: 5.7,
            g11_sv: 7.4,
            h11_sv: -25.9,
        }
    }
}

impl DipoleModel {
    /// Field at a site in nT as (north, east, down)
    pub fn field_ned(&self, latitude: f64, longitude: f64, altitude_km: f64, year: f64) -> [f64; 3] {
        let dt = year - self.epoch;
        let g10 = self.g10 + self.g10_sv * dt;
        let g11 = self.g11 + self.g11_sv * dt;
        let h11 = self.h11 + self.h11_sv * dt;

        let colatitude = (90.0 - latitude).to_radians();
        let (sin_t, cos_t) = colatitude.sin_cos();
        let (sin_l, cos_l) = longitude.to_radians().sin_cos();
        let ratio = REFERENCE_RADIUS_KM / (REFERENCE_RADIUS_KM + altitude_km);
        let scale = ratio.powi(3);

        let equatorial = g11 * cos_l + h11 * sin_l;
        let north = scale * (-g10 * sin_t + equatorial * cos_t);
        let east = scale * (g11 * sin_l - h11 * cos_l);
        let down = -2.0 * scale * (g10 * cos_t + equatorial * sin_t);
        [north, east, down]
    }

    /// Field in tesla as (north, east, up), the engine's convention
    pub fn field_tesla(&self, latitude: f64, longitude: f64, altitude_km: f64, year: f64) -> [f64; 3] {
        let [north, east, down] = self.field_ned(latitude, longitude, altitude_km, year);
        [north * NANOTESLA, east * NANOTESLA, -down * NANOTESLA]
    }
}

// ============================================================================
// Tabulated field
// ============================================================================

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(rename = "Bx", alias = "x")]
    bx: f64,
    #[serde(rename = "By", alias = "y")]
    by: f64,
    #[serde(rename = "Bz", alias = "z")]
    bz: f64,
    altitude: f64,
    latitude: f64,
    longitude: f64,
    date: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    field_nt: [f64; 3],
    altitude: f64,
    latitude: f64,
    longitude: f64,
    date: NaiveDate,
}

/// Magnetic field table read from `Bx,By,Bz,altitude,latitude,longitude,date`
#[derive(Debug, Clone, PartialEq)]
pub struct MagneticTable {
    samples: Vec<Sample>,
}

impl MagneticTable {
    pub fn load(path: &Path) -> Result<Self, EnvironmentStateError> {
        let file = std::fs::File::open(path).map_err(|source| EnvironmentStateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file).map_err(|e| match e {
            EnvironmentStateError::MalformedTable { reason, .. } => {
                EnvironmentStateError::MalformedTable {
                    table: path.display().to_string(),
                    reason,
                }
            }
            other => other,
        })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, EnvironmentStateError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut samples = Vec::new();
        for (line, row) in csv_reader.deserialize::<Row>().enumerate() {
            let row = row.map_err(|e| malformed(format!("row {}: {e}", line + 1)))?;
            let date = parse_date(&row.date)
                .ok_or_else(|| malformed(format!("row {}: bad date `{}`", line + 1, row.date)))?;
            let values = [
                ("Bx", row.bx),
                ("By", row.by),
                ("Bz", row.bz),
                ("altitude", row.altitude),
                ("latitude", row.latitude),
                ("longitude", row.longitude),
            ];
            if let Some((column, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
                return Err(malformed(format!("row {}: {column} is {value}", line + 1)));
            }
            samples.push(Sample {
                field_nt: [row.bx, row.by, row.bz],
                altitude: row.altitude,
                latitude: row.latitude,
                longitude: row.longitude,
                date,
            });
        }

        if samples.is_empty() {
            return Err(malformed("table has no rows".to_string()));
        }
        Ok(Self { samples })
    }

    /// Field at each height for the date and site nearest the request
    pub fn profile(
        &self,
        date: NaiveDate,
        latitude: f64,
        longitude: f64,
        heights: &[f64],
    ) -> Result<MagneticProfile, EnvironmentStateError> {
        let nearest_date = self
            .samples
            .iter()
            .map(|s| s.date)
            .min_by_key(|d| ((*d - date).num_days().abs(), *d))
            .ok_or_else(|| out_of_range(date, latitude, longitude))?;

        let site = self
            .samples
            .iter()
            .filter(|s| s.date == nearest_date)
            .min_by(|a, b| {
                site_distance(a, latitude, longitude).total_cmp(&site_distance(b, latitude, longitude))
            })
            .map(|s| (s.latitude, s.longitude))
            .ok_or_else(|| out_of_range(date, latitude, longitude))?;

        let mut column: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|s| s.date == nearest_date && (s.latitude, s.longitude) == site)
            .collect();
        column.sort_by(|a, b| a.altitude.total_cmp(&b.altitude));

        let altitudes: Vec<f64> = column.iter().map(|s| s.altitude).collect();
        let component = |axis: usize| -> Vec<f64> { column.iter().map(|s| s.field_nt[axis]).collect() };
        let (bx, by, bz) = (component(0), component(1), component(2));

        let layers = heights
            .iter()
            .map(|&h| {
                [
                    interp(h, &altitudes, &bx) * NANOTESLA,
                    interp(h, &altitudes, &by) * NANOTESLA,
                    interp(h, &altitudes, &bz) * NANOTESLA,
                ]
            })
            .collect();
        Ok(MagneticProfile { layers })
    }
}

fn site_distance(sample: &Sample, latitude: f64, longitude: f64) -> f64 {
    let dlat = sample.latitude - latitude;
    let mut dlon = (sample.longitude - longitude).abs() % 360.0;
    if dlon > 180.0 {
        dlon = 360.0 - dlon;
    }
    let dlon = dlon * latitude.to_radians().cos();
    dlat * dlat + dlon * dlon
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn malformed(reason: String) -> EnvironmentStateError {
    EnvironmentStateError::MalformedTable {
        table: "magnetic field".to_string(),
        reason,
    }
}

fn out_of_range(date: NaiveDate, latitude: f64, longitude: f64) -> EnvironmentStateError {
    EnvironmentStateError::OutOfRange {
        what: format!("magnetic field at ({latitude}, {longitude}) on {date}"),
    }
}

// ============================================================================
// Source selection
// ============================================================================

/// Configured origin of the magnetic field
#[derive(Debug, Clone, PartialEq)]
pub enum MagneticSource {
    Disabled,
    Estimated {
        model: DipoleModel,
        latitude: f64,
        longitude: f64,
    },
    Table {
        table: MagneticTable,
        latitude: f64,
        longitude: f64,
    },
}

impl MagneticSource {
    /// Field profile for `date` over the given layer heights (km)
    pub fn profile(&self, date: NaiveDate, heights: &[f64]) -> Result<MagneticProfile, EnvironmentStateError> {
        match self {
            MagneticSource::Disabled => Ok(MagneticProfile::zeros(heights.len())),
            MagneticSource::Estimated {
                model,
                latitude,
                longitude,
            } => {
                let year = decimal_year(date);
                Ok(MagneticProfile {
                    layers: heights
                        .iter()
                        .map(|&h| model.field_tesla(*latitude, *longitude, h, year))
                        .collect(),
                })
            }
            MagneticSource::Table {
                table,
                latitude,
                longitude,
            } => table.profile(date, *latitude, *longitude, heights),
        }
    }
}
