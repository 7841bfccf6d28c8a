//! Layer merge and validation
//!
//! Precedence is environment > CLI > file > schema default, decided per leaf.
//! Because layers are flat leaf maps, a deep merge is a plain map overlay:
//! a layer that sets `constructor.magnetic_field.latitude` leaves every
//! sibling leaf untouched.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use super::schema::SCHEMA;
use super::sources::{self, Layer};
use super::{ConfigValidationError, Configuration};

/// Resolve a configuration from its three override layers
///
/// # Arguments
/// * `file` - Optional YAML/JSON file (lowest precedence after defaults)
/// * `cli_args` - Dotted-path flags, without the program name
/// * `env_vars` - Environment variables (highest precedence)
///
/// # Errors
/// Returns the first [`ConfigValidationError`] found, naming the dotted path.
pub fn resolve<I>(
    file: Option<&Path>,
    cli_args: &[String],
    env_vars: I,
) -> Result<Configuration, ConfigValidationError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let file_layer = match file {
        Some(path) => sources::file_layer(path)?,
        None => Layer::new(),
    };
    let cli_layer = sources::cli_layer(cli_args)?;
    let env_layer = sources::env_layer(env_vars)?;

    debug!(
        file = file_layer.len(),
        cli = cli_layer.len(),
        env = env_layer.len(),
        "configuration layers loaded"
    );

    resolve_layers(&[file_layer, cli_layer, env_layer])
}

/// Merge layers (lowest precedence first) over the schema defaults
pub fn resolve_layers(layers: &[Layer]) -> Result<Configuration, ConfigValidationError> {
    let mut merged = Layer::new();
    for leaf in SCHEMA {
        if let Some(value) = leaf.default_value() {
            merged.insert(leaf.path, value);
        }
    }
    for layer in layers {
        for (path, value) in layer {
            merged.insert(path, value.clone());
        }
    }

    for leaf in SCHEMA {
        if leaf.required && !merged.contains_key(leaf.path) {
            return Err(ConfigValidationError::new(leaf.path, "required value is missing"));
        }
    }

    let tree = expand(&merged);
    let config: Configuration = serde_json::from_value(tree)
        .map_err(|e| ConfigValidationError::new("<root>", e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Re-resolve a serialized configuration (e.g. a `config.json` snapshot)
pub fn resolve_snapshot(tree: &Value) -> Result<Configuration, ConfigValidationError> {
    resolve_layers(&[sources::tree_layer(tree)?])
}

/// Expand flat leaf paths into a nested mapping
fn expand(layer: &Layer) -> Value {
    let mut root = Map::new();
    for (path, value) in layer {
        let mut node = &mut root;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.insert(segment.to_string(), value.clone());
                break;
            }
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            // No schema path is both a leaf and a branch
            node = match child {
                Value::Object(map) => map,
                _ => break,
            };
        }
    }
    Value::Object(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Layer {
        sources::tree_layer(&json!({
            "save_dir": "/tmp/x",
            "macro_files": "a.mac",
            "random_seed": 1,
            "constructor": { "density_profile": { "density_file": "d.json" } }
        }))
        .unwrap()
    }

    #[test]
    fn test_expand_nests_paths() {
        let mut layer = Layer::new();
        layer.insert("constructor.magnetic_field.latitude", json!(1.0));
        layer.insert("constructor.geometry", json!("flat"));
        assert_eq!(
            expand(&layer),
            json!({"constructor": {"geometry": "flat", "magnetic_field": {"latitude": 1.0}}})
        );
    }

    #[test]
    fn test_defaults_fill_everything_optional() {
        let config = resolve_layers(&[minimal()]).unwrap();
        assert_eq!(config.num_processes, 1);
        assert_eq!(config.sim_cycles, -1);
        assert_eq!(config.constructor.atmos_n_points, 100);
        assert_eq!(config.constructor.sensitive_detectors.particles, vec!["mu-"]);
    }

    #[test]
    fn test_later_layer_overrides_single_leaf_only() {
        let mut cli = Layer::new();
        cli.insert("constructor.magnetic_field.latitude", json!(10.0));
        let config = resolve_layers(&[minimal(), cli]).unwrap();
        assert_eq!(config.constructor.magnetic_field.latitude, 10.0);
        assert_eq!(config.constructor.magnetic_field.longitude, -8.716);
    }

    #[test]
    fn test_required_reported_in_schema_order() {
        let err = resolve_layers(&[]).unwrap_err();
        assert_eq!(err.path, "macro_files");
    }
}
