//! Override layers
//!
//! Each source (file, command line, environment) is flattened into a
//! [`Layer`]: a map from schema leaf path to a canonical JSON value. Layers
//! never contain unknown paths or ill-typed values; null counts as absent.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use super::schema::{self, Leaf, LeafKind};
use super::ConfigValidationError;

/// Canonical leaf values of one override layer
pub type Layer = BTreeMap<&'static str, Value>;

/// Dotted path used in errors about the config file itself
pub const CONFIG_FILE_PATH: &str = "config_file";

/// Separator between path segments in environment variable names
pub const ENV_SEPARATOR: &str = "__";

// ============================================================================
// File layer
// ============================================================================

/// Load a YAML or JSON document and flatten it
///
/// Files ending in `.json` are parsed as JSON, everything else as YAML
/// (which also accepts JSON).
pub fn file_layer(path: &Path) -> Result<Layer, ConfigValidationError> {
    let text = fs::read_to_string(path).map_err(|e| {
        ConfigValidationError::new(
            CONFIG_FILE_PATH,
            format!("cannot read {}: {e}", path.display()),
        )
    })?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let tree: Value = if is_json {
        serde_json::from_str(&text).map_err(|e| {
            ConfigValidationError::new(
                CONFIG_FILE_PATH,
                format!("{} is not valid JSON: {e}", path.display()),
            )
        })?
    } else {
        serde_yaml::from_str(&text).map_err(|e| {
            ConfigValidationError::new(
                CONFIG_FILE_PATH,
                format!("{} is not valid YAML: {e}", path.display()),
            )
        })?
    };

    tree_layer(&tree)
}

/// Flatten a nested mapping into a layer
pub fn tree_layer(tree: &Value) -> Result<Layer, ConfigValidationError> {
    let mut layer = Layer::new();
    match tree {
        Value::Null => {}
        Value::Object(_) => flatten_into(tree, "", &mut layer)?,
        other => {
            return Err(ConfigValidationError::new(
                CONFIG_FILE_PATH,
                format!("top level must be a mapping, got {other}"),
            ))
        }
    }
    Ok(layer)
}

fn flatten_into(node: &Value, prefix: &str, layer: &mut Layer) -> Result<(), ConfigValidationError> {
    let Value::Object(map) = node else {
        return Ok(());
    };
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        if let Some(leaf) = schema::leaf(&path) {
            insert(layer, leaf, value.clone())?;
        } else if schema::is_branch(&path) {
            match value {
                Value::Object(_) => flatten_into(value, &path, layer)?,
                Value::Null => {}
                other => {
                    return Err(ConfigValidationError::new(
                        path,
                        format!("expected a mapping, got {other}"),
                    ))
                }
            }
        } else {
            return Err(ConfigValidationError::unknown(path));
        }
    }
    Ok(())
}

fn insert(layer: &mut Layer, leaf: &'static Leaf, value: Value) -> Result<(), ConfigValidationError> {
    if value.is_null() {
        layer.remove(leaf.path);
        return Ok(());
    }
    let value = leaf
        .normalize(value)
        .map_err(|reason| ConfigValidationError::new(leaf.path, reason))?;
    layer.insert(leaf.path, value);
    Ok(())
}

fn insert_raw(layer: &mut Layer, leaf: &'static Leaf, raw: &str) -> Result<(), ConfigValidationError> {
    let value = leaf
        .coerce_str(raw)
        .map_err(|reason| ConfigValidationError::new(leaf.path, reason))?;
    layer.insert(leaf.path, value);
    Ok(())
}

// ============================================================================
// Command-line layer
// ============================================================================

/// Parse dotted-path flags
///
/// Accepts `--path value` and `--path=value`. A boolean leaf given as a bare
/// flag (followed by nothing or by another flag) is set to `true`. Later
/// occurrences of the same flag win.
///
/// # Example
/// ```
/// use particle_sim_core::config::sources::cli_layer;
///
/// let args: Vec<String> = ["--random_seed", "42", "--constructor.export_gdml"]
///     .iter()
///     .map(|s| s.to_string())
///     .collect();
/// let layer = cli_layer(&args).unwrap();
/// assert_eq!(layer["random_seed"], 42);
/// assert_eq!(layer["constructor.export_gdml"], true);
/// ```
pub fn cli_layer(args: &[String]) -> Result<Layer, ConfigValidationError> {
    let mut layer = Layer::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(ConfigValidationError::new(
                arg.as_str(),
                "expected a `--dotted.path` flag",
            ));
        };

        let (path, inline_value) = match flag.split_once('=') {
            Some((path, value)) => (path, Some(value)),
            None => (flag, None),
        };

        let leaf = schema::leaf(path).ok_or_else(|| ConfigValidationError::unknown(path))?;

        match inline_value {
            Some(raw) => insert_raw(&mut layer, leaf, raw)?,
            None => {
                let next_is_value = iter.peek().map(|next| !next.starts_with("--")).unwrap_or(false);
                if next_is_value {
                    if let Some(raw) = iter.next() {
                        insert_raw(&mut layer, leaf, raw)?;
                    }
                } else if leaf.kind == LeafKind::Bool {
                    layer.insert(leaf.path, Value::Bool(true));
                } else {
                    return Err(ConfigValidationError::new(leaf.path, "missing value"));
                }
            }
        }
    }

    Ok(layer)
}

// ============================================================================
// Environment layer
// ============================================================================

/// Collect environment overrides
///
/// A variable is considered only when its first `__`-separated segment,
/// lower-cased, names a top-level key of the schema. Considered variables
/// must then name a leaf exactly, except a bare section name such as
/// `ENGINE`, which is ignored.
///
/// # Example
/// ```
/// use particle_sim_core::config::sources::env_layer;
///
/// let vars = vec![
///     ("CONSTRUCTOR__MAGNETIC_FIELD__LATITUDE".to_string(), "42.23".to_string()),
///     ("HOME".to_string(), "/root".to_string()),
/// ];
/// let layer = env_layer(vars).unwrap();
/// assert_eq!(layer.len(), 1);
/// assert_eq!(layer["constructor.magnetic_field.latitude"], 42.23);
/// ```
pub fn env_layer<I>(vars: I) -> Result<Layer, ConfigValidationError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut layer = Layer::new();
    // Sorted so that the outcome never depends on platform iteration order
    let vars: BTreeMap<String, String> = vars.into_iter().collect();

    for (name, raw) in &vars {
        let lowered = name.to_ascii_lowercase();
        let mut segments = lowered.split(ENV_SEPARATOR);
        let first = segments.next().unwrap_or_default();
        if !schema::is_top_level(first) {
            continue;
        }

        let path = lowered.replace(ENV_SEPARATOR, ".");
        // `ENGINE=...` or `SCHEDULER=...` name a whole section, not a leaf
        if schema::is_branch(&path) {
            continue;
        }
        let leaf = schema::leaf(&path).ok_or_else(|| {
            ConfigValidationError::new(
                path.as_str(),
                format!("unknown configuration key (from environment variable {name})"),
            )
        })?;
        insert_raw(&mut layer, leaf, raw)?;
    }

    Ok(layer)
}
