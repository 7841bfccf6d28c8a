//! Configuration Resolution Tests
//!
//! Critical invariants tested:
//! - Precedence: environment > CLI > file > schema default, per leaf
//! - Fallback: a leaf absent from every layer takes its schema default
//! - Fixed point: resolving the `config.json` snapshot yields the same config
//! - Errors always name the offending dotted path

use std::fs;
use std::path::PathBuf;

use particle_sim_core::config::resolver::resolve_snapshot;
use particle_sim_core::config::{FailurePolicy, Geometry, LogLevel};
use particle_sim_core::{resolve, ResultWriter};
use proptest::prelude::*;
use serde_json::json;

mod common;
use common::Fixture;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn env(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Write `tree` as the YAML config file of the fixture
fn write_yaml(fixture: &Fixture, tree: &serde_json::Value) -> PathBuf {
    let path = fixture.dir.path().join("config.yaml");
    fs::write(&path, serde_yaml::to_string(tree).unwrap()).unwrap();
    path
}

// ============================================================================
// Precedence
// ============================================================================

#[test]
fn test_env_beats_cli_beats_file() {
    let fixture = Fixture::new(1);
    let mut tree = fixture.tree();
    tree["constructor"]["magnetic_field"] = json!({ "latitude": 10.0, "longitude": 20.0 });
    let file = write_yaml(&fixture, &tree);

    let config = resolve(
        Some(&file),
        &args(&[
            "--constructor.magnetic_field.latitude",
            "30.0",
            "--constructor.magnetic_field.longitude=40.0",
        ]),
        env(&[("CONSTRUCTOR__MAGNETIC_FIELD__LATITUDE", "42.23")]),
    )
    .unwrap();

    assert_eq!(config.constructor.magnetic_field.latitude, 42.23);
    assert_eq!(config.constructor.magnetic_field.longitude, 40.0);
}

#[test]
fn test_absent_leaves_fall_back_to_defaults() {
    let fixture = Fixture::new(1);
    let file = write_yaml(&fixture, &fixture.tree());
    let config = resolve(Some(&file), &[], env(&[])).unwrap();

    assert_eq!(config.num_processes, 1);
    assert_eq!(config.logger_level, LogLevel::Info);
    assert_eq!(config.constructor.geometry, Geometry::Flat);
    assert_eq!(config.constructor.atmos_height, 70.0);
    assert_eq!(config.constructor.magnetic_field.latitude, 42.224);
    assert_eq!(config.scheduler.on_worker_failure, FailurePolicy::Abort);
}

#[test]
fn test_cli_python_style_bool() {
    let fixture = Fixture::new(1);
    let file = write_yaml(&fixture, &fixture.tree());
    let config = resolve(
        Some(&file),
        &args(&["--constructor.sensitive_detectors.enabled", "False"]),
        env(&[]),
    )
    .unwrap();
    assert!(!config.constructor.sensitive_detectors.enabled);
}

#[test]
fn test_unrelated_environment_is_ignored() {
    let fixture = Fixture::new(1);
    let file = write_yaml(&fixture, &fixture.tree());
    let config = resolve(
        Some(&file),
        &[],
        env(&[("PATH", "/usr/bin"), ("HOME", "/root"), ("RUST_LOG", "debug")]),
    )
    .unwrap();
    assert_eq!(config.random_seed, 1234);
}

#[test]
fn test_section_named_variables_are_ignored() {
    let fixture = Fixture::new(1);
    let file = write_yaml(&fixture, &fixture.tree());
    let config = resolve(
        Some(&file),
        &[],
        env(&[("ENGINE", "v8"), ("SCHEDULER", "slurm"), ("GENERATOR", "x")]),
    )
    .unwrap();
    assert_eq!(config.engine.command, "particle-engine");
}

#[test]
fn test_json_config_file() {
    let fixture = Fixture::new(1);
    let path = fixture.dir.path().join("config.json");
    fs::write(&path, fixture.tree().to_string()).unwrap();
    let config = resolve(Some(&path), &[], env(&[])).unwrap();
    assert_eq!(config.sim_cycles, 3);
}

#[test]
fn test_cli_only_configuration() {
    let fixture = Fixture::new(1);
    let config = resolve(
        None,
        &[
            "--save_dir".to_string(),
            fixture.save_dir.display().to_string(),
            "--macro_files".to_string(),
            fixture.macro_file.display().to_string(),
            "--constructor.density_profile.density_file".to_string(),
            fixture.density_file.display().to_string(),
            "--random_seed".to_string(),
            "5".to_string(),
        ],
        env(&[]),
    )
    .unwrap();
    assert_eq!(config.macro_files, vec![fixture.macro_file.clone()]);
    assert_eq!(config.random_seed, 5);
}

proptest! {
    /// The highest-precedence layer that sets a leaf decides its value
    #[test]
    fn prop_precedence_law(
        file in proptest::option::of(1usize..64),
        cli in proptest::option::of(1usize..64),
        env_value in proptest::option::of(1usize..64),
    ) {
        let fixture = Fixture::new(1);
        let mut tree = fixture.tree();
        if let Some(n) = file {
            tree["num_processes"] = json!(n);
        }
        let path = write_yaml(&fixture, &tree);

        let cli_args = match cli {
            Some(n) => vec!["--num_processes".to_string(), n.to_string()],
            None => Vec::new(),
        };
        let vars = match env_value {
            Some(n) => vec![("NUM_PROCESSES".to_string(), n.to_string())],
            None => Vec::new(),
        };

        let config = resolve(Some(&path), &cli_args, vars).unwrap();
        let expected = env_value.or(cli).or(file).unwrap_or(1);
        prop_assert_eq!(config.num_processes, expected);
    }
}

// ============================================================================
// Snapshot fixed point
// ============================================================================

#[test]
fn test_snapshot_resolves_to_same_configuration() {
    let fixture = Fixture::new(1);
    let config = fixture.config(json!({
        "num_processes": 3,
        "logger_level": "debug",
        "constructor": {
            "geometry": "curved",
            "earth_radius": 6371.0,
            "atmos_comp": ["N", 78.0, "O", 21.0, "Ar", 1.0],
            "magnetic_field": { "enabled": false }
        },
        "scheduler": { "on_worker_failure": "skip" }
    }));

    let writer = ResultWriter::create(&fixture.save_dir).unwrap();
    let path = writer.write_config(&config).unwrap();
    let snapshot: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();

    assert_eq!(resolve_snapshot(&snapshot).unwrap(), config);
}

#[test]
fn test_snapshot_usable_as_config_file() {
    let fixture = Fixture::new(1);
    let config = fixture.config(json!({ "random_seed": 77 }));
    let writer = ResultWriter::create(&fixture.save_dir).unwrap();
    let path = writer.write_config(&config).unwrap();

    assert_eq!(resolve(Some(&path), &[], env(&[])).unwrap(), config);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_missing_density_file_names_path() {
    let fixture = Fixture::new(1);
    let mut tree = fixture.tree();
    tree["constructor"]["density_profile"] = json!({ "day_idx": 0 });
    let path = write_yaml(&fixture, &tree);

    let err = resolve(Some(&path), &[], env(&[])).unwrap_err();
    assert_eq!(err.path, "constructor.density_profile.density_file");
}

#[test]
fn test_export_gdml_with_two_workers_rejected() {
    let fixture = Fixture::new(1);
    let path = write_yaml(&fixture, &fixture.tree());
    let err = resolve(
        Some(&path),
        &args(&["--constructor.export_gdml", "--num_processes", "2"]),
        env(&[]),
    )
    .unwrap_err();
    assert_eq!(err.path, "constructor.export_gdml");
}

#[test]
fn test_unknown_file_key_rejected() {
    let fixture = Fixture::new(1);
    let mut tree = fixture.tree();
    tree["constructor"]["atmos_colour"] = json!("blue");
    let path = write_yaml(&fixture, &tree);

    let err = resolve(Some(&path), &[], env(&[])).unwrap_err();
    assert_eq!(err.path, "constructor.atmos_colour");
}

#[test]
fn test_bad_env_value_names_path() {
    let fixture = Fixture::new(1);
    let path = write_yaml(&fixture, &fixture.tree());
    let err = resolve(
        Some(&path),
        &[],
        env(&[("CONSTRUCTOR__MAGNETIC_FIELD__LATITUDE", "north")]),
    )
    .unwrap_err();
    assert_eq!(err.path, "constructor.magnetic_field.latitude");
}

#[test]
fn test_out_of_range_latitude_rejected() {
    let fixture = Fixture::new(1);
    let path = write_yaml(&fixture, &fixture.tree());
    let err = resolve(
        Some(&path),
        &args(&["--constructor.magnetic_field.latitude", "91"]),
        env(&[]),
    )
    .unwrap_err();
    assert_eq!(err.path, "constructor.magnetic_field.latitude");
}

#[test]
fn test_u32_overflow_names_path() {
    let fixture = Fixture::new(1);
    let path = write_yaml(&fixture, &fixture.tree());
    for leaf in ["generator.n_events", "constructor.density_profile.day_idx"] {
        let flag = format!("--{leaf}");
        let err = resolve(Some(&path), &args(&[flag.as_str(), "5000000000"]), env(&[])).unwrap_err();
        assert_eq!(err.path, leaf);
    }
}

#[test]
fn test_preflight_reports_missing_density_file() {
    let fixture = Fixture::new(1);
    let config = fixture.config(json!({
        "constructor": { "density_profile": { "density_file": fixture.dir.path().join("gone.json") } }
    }));
    let err = config.preflight().unwrap_err();
    assert_eq!(err.path, "constructor.density_profile.density_file");
}

#[test]
fn test_preflight_accepts_fixture() {
    let fixture = Fixture::new(1);
    fixture.config(json!({})).preflight().unwrap();
}
