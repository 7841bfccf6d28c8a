//! Environment State Tests
//!
//! Critical invariants tested:
//! - Monotonicity: buckets never go backwards
//! - Idempotence: advancing within the current bucket changes nothing
//! - Day stepping: the density day moves at most one index per new bucket
//!   and clamps at the last day of the table
//! - Magnetic source selection: disabled, estimated and tabulated

use std::fs;
use std::sync::Arc;

use particle_sim_core::core::time::MICROS_PER_DAY;
use particle_sim_core::environment::ControllerState;
use particle_sim_core::{EnvironmentStateController, EnvironmentStateError};
use serde_json::json;

mod common;
use common::Fixture;

const HOUR_US: u64 = MICROS_PER_DAY / 24;

fn controller(fixture: &Fixture, overrides: serde_json::Value) -> EnvironmentStateController {
    let config = fixture.config(overrides);
    EnvironmentStateController::new(&config, 1).unwrap()
}

/// Density day of each tick `0..ticks`, advancing one bucket per tick
fn day_sequence(controller: &mut EnvironmentStateController, resolution_us: u64, ticks: u64) -> Vec<u32> {
    (0..ticks)
        .map(|tick| controller.advance(tick * resolution_us).unwrap().density_day_idx)
        .collect()
}

// ============================================================================
// Bucket progression
// ============================================================================

#[test]
fn test_controller_activates_on_first_advance() {
    let fixture = Fixture::new(3);
    let mut env = controller(&fixture, json!({}));
    assert_eq!(env.state(), ControllerState::Idle);

    let bucket = env.advance(0).unwrap();
    assert_eq!(bucket.index, 0);
    assert_eq!(env.state(), ControllerState::Active(0));
    assert_eq!(env.current_bucket(), Some(&bucket));
}

#[test]
fn test_advance_within_bucket_is_idempotent() {
    let fixture = Fixture::new(3);
    let mut env = controller(&fixture, json!({ "time_resolution": 1000.0 }));

    let first = env.advance(2_000).unwrap();
    let again = env.advance(2_999).unwrap();
    assert_eq!(first, again);
    assert!(Arc::ptr_eq(&first.density, &again.density));
}

#[test]
fn test_going_back_is_rejected() {
    let fixture = Fixture::new(3);
    let mut env = controller(&fixture, json!({ "time_resolution": 1000.0 }));
    env.advance(5_000).unwrap();

    let err = env.advance(1_000).unwrap_err();
    assert!(matches!(
        err,
        EnvironmentStateError::NonMonotonic {
            current: 5,
            requested: 1
        }
    ));
}

#[test]
fn test_bucket_start_tracks_start_time() {
    let fixture = Fixture::new(3);
    let mut env = controller(
        &fixture,
        json!({ "time_resolution": HOUR_US as f64, "start_time": "2021-03-01T00:00:00Z" }),
    );
    let bucket = env.advance(5 * HOUR_US).unwrap();
    assert_eq!(bucket.start_time.to_rfc3339(), "2021-03-01T05:00:00+00:00");
    assert_eq!(bucket.start_micros, bucket.start_time.timestamp_micros());
    assert_eq!(bucket.elapsed_us, 5 * HOUR_US);
}

#[test]
fn test_bucket_past_calendar_range_rejected() {
    let fixture = Fixture::new(1);
    let resolution_us: u64 = 100_000_000_000_000_000;
    let mut env = controller(&fixture, json!({ "time_resolution": resolution_us as f64 }));

    let first = env.advance(0).unwrap();
    let second = env.advance(resolution_us).unwrap();
    assert!(second.start_micros > first.start_micros);

    let err = env.advance(100 * resolution_us).unwrap_err();
    assert!(matches!(err, EnvironmentStateError::OutOfRange { .. }));
    assert_eq!(env.current_bucket(), Some(&second));
}

// ============================================================================
// Density day
// ============================================================================

#[test]
fn test_day_follows_simulated_days() {
    let fixture = Fixture::new(4);
    let mut env = controller(&fixture, json!({ "time_resolution": MICROS_PER_DAY as f64 }));
    assert_eq!(day_sequence(&mut env, MICROS_PER_DAY, 4), vec![0, 1, 2, 3]);
}

#[test]
fn test_day_steps_once_per_bucket() {
    let fixture = Fixture::new(10);
    let two_days = 2 * MICROS_PER_DAY;
    let mut env = controller(&fixture, json!({ "time_resolution": two_days as f64 }));
    assert_eq!(day_sequence(&mut env, two_days, 5), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_day_constant_within_a_day() {
    let fixture = Fixture::new(3);
    let mut env = controller(&fixture, json!({ "time_resolution": HOUR_US as f64 }));

    let days = day_sequence(&mut env, HOUR_US, 26);
    assert!(days[..24].iter().all(|&d| d == 0));
    assert_eq!(&days[24..], &[1, 1]);
}

#[test]
fn test_density_profile_shared_within_a_day() {
    let fixture = Fixture::new(3);
    let mut env = controller(&fixture, json!({ "time_resolution": HOUR_US as f64 }));
    let a = env.advance(0).unwrap();
    let b = env.advance(HOUR_US).unwrap();
    assert_ne!(a.index, b.index);
    assert!(Arc::ptr_eq(&a.density, &b.density));
}

#[test]
fn test_day_clamps_at_last_day() {
    let fixture = Fixture::new(2);
    let mut env = controller(&fixture, json!({ "time_resolution": MICROS_PER_DAY as f64 }));
    assert_eq!(day_sequence(&mut env, MICROS_PER_DAY, 5), vec![0, 1, 1, 1, 1]);
}

#[test]
fn test_day_counts_from_configured_day() {
    let fixture = Fixture::new(4);
    let mut env = controller(
        &fixture,
        json!({
            "time_resolution": MICROS_PER_DAY as f64,
            "constructor": { "density_profile": { "day_idx": 2 } }
        }),
    );
    assert_eq!(day_sequence(&mut env, MICROS_PER_DAY, 4), vec![2, 3, 3, 3]);
}

#[test]
fn test_configured_day_missing_from_table() {
    let fixture = Fixture::new(2);
    let config = fixture.config(json!({ "constructor": { "density_profile": { "day_idx": 7 } } }));
    let err = EnvironmentStateController::new(&config, 1).unwrap_err();
    assert!(matches!(
        err,
        EnvironmentStateError::MissingDay {
            day_idx: 7,
            last_day: 1
        }
    ));
}

#[test]
fn test_density_resampled_onto_layers() {
    let fixture = Fixture::new(2);
    let mut env = controller(
        &fixture,
        json!({ "constructor": { "atmos_height": 80.0, "atmos_n_points": 5 } }),
    );
    let bucket = env.advance(0).unwrap();
    assert_eq!(bucket.density.heights, vec![0.0, 20.0, 40.0, 60.0, 80.0]);
    assert!((bucket.density.density[0] - 1.2).abs() < 1e-12);
    assert_eq!(bucket.density.day_idx, 0);
}

#[test]
fn test_terminated_controller_rejects_ticks() {
    let fixture = Fixture::new(2);
    let mut env = controller(&fixture, json!({}));
    env.advance(0).unwrap();
    env.terminate();
    assert!(matches!(env.advance(0), Err(EnvironmentStateError::Terminated)));
}

// ============================================================================
// Magnetic field
// ============================================================================

#[test]
fn test_disabled_field_is_zero() {
    let fixture = Fixture::new(1);
    let mut env = controller(
        &fixture,
        json!({ "constructor": { "magnetic_field": { "enabled": false } } }),
    );
    let bucket = env.advance(0).unwrap();
    assert_eq!(bucket.magnetic_field.layers.len(), 5);
    assert!(bucket.magnetic_field.layers.iter().all(|v| *v == [0.0; 3]));
}

#[test]
fn test_estimated_field_has_earth_magnitude() {
    let fixture = Fixture::new(1);
    let mut env = controller(&fixture, json!({}));
    let [n, e, u] = env.advance(0).unwrap().magnetic_field.ground();
    let magnitude = (n * n + e * e + u * u).sqrt();
    assert!(magnitude > 20e-6 && magnitude < 70e-6, "{magnitude}");
}

#[test]
fn test_tabulated_field_from_file() {
    let fixture = Fixture::new(1);
    let mag_file = fixture.dir.path().join("field.csv");
    fs::write(
        &mag_file,
        "Bx,By,Bz,altitude,latitude,longitude,date\n\
         25000,-500,-38000,0,42.224,-8.716,2021-01-01\n\
         24000,-400,-36000,80,42.224,-8.716,2021-01-01\n",
    )
    .unwrap();

    let mut env = controller(
        &fixture,
        json!({
            "constructor": {
                "atmos_height": 80.0,
                "magnetic_field": { "mag_source": "file", "mag_file": mag_file }
            }
        }),
    );
    let field = env.advance(0).unwrap().magnetic_field;
    assert!((field.layers[0][0] - 25000e-9).abs() < 1e-15);
    assert!((field.layers[4][2] + 36000e-9).abs() < 1e-15);
}

#[test]
fn test_missing_field_file_reported() {
    let fixture = Fixture::new(1);
    let config = fixture.config(json!({
        "constructor": {
            "magnetic_field": { "mag_source": "file", "mag_file": fixture.dir.path().join("none.csv") }
        }
    }));
    let err = EnvironmentStateController::new(&config, 1).unwrap_err();
    assert!(matches!(err, EnvironmentStateError::Io { .. }));
}

#[test]
fn test_nan_in_field_file_rejected() {
    let fixture = Fixture::new(1);
    let mag_file = fixture.dir.path().join("field.csv");
    fs::write(
        &mag_file,
        "Bx,By,Bz,altitude,latitude,longitude,date\n\
         25000,-500,-38000,0,NaN,-8.716,2021-01-01\n\
         24000,-400,-36000,80,NaN,-8.716,2021-01-01\n",
    )
    .unwrap();
    let config = fixture.config(json!({
        "constructor": { "magnetic_field": { "mag_source": "file", "mag_file": mag_file } }
    }));
    let err = EnvironmentStateController::new(&config, 1).unwrap_err();
    assert!(matches!(err, EnvironmentStateError::MalformedTable { .. }));
}
