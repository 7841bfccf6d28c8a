//! Static schema of configuration leaves
//!
//! Every configurable value is a leaf with a dotted path, a declared kind,
//! an optional default, a required flag and range/choice constraints. The
//! resolver only ever reads and writes paths listed here, which makes
//! precedence and validation independent of where a value came from.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Number, Value};

/// Particle species the sensitive detectors and the particle gun know about
pub const KNOWN_SPECIES: &[&str] = &[
    "e-",
    "e+",
    "gamma",
    "mu-",
    "mu+",
    "nu_e",
    "nu_mu",
    "proton",
    "neutron",
    "geantino",
    "chargedgeantino",
];

/// Declared type of a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Bool,
    Int,
    Float,
    Text,
    Path,
    /// A single path or a list of paths
    PathList,
    FloatList,
    TextList,
    /// Exactly three floats
    FloatTriple,
    /// RFC 3339 or `YYYY-MM-DDTHH:MM:SS` (UTC)
    DateTime,
    /// Alternating element symbols and percentages
    Composition,
}

/// Case normalisation applied to text values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    Keep,
    Lower,
    Upper,
}

/// Numeric constraint, applied to every element of list leaves
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Unbounded,
    /// value >= min
    AtLeast(f64),
    /// value > min
    Above(f64),
    /// min <= value <= max
    Within(f64, f64),
}

/// Default of a leaf
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Unset,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(&'static str),
    FloatList(&'static [f64]),
    TextList(&'static [&'static str]),
    Triple([f64; 3]),
    Composition(&'static [(&'static str, f64)]),
    /// Current Unix time in seconds, taken at resolution
    UnixNow,
}

/// One configuration leaf
#[derive(Debug, Clone, Copy)]
pub struct Leaf {
    pub path: &'static str,
    pub kind: LeafKind,
    pub default: DefaultValue,
    pub required: bool,
    pub bound: Bound,
    pub choices: &'static [&'static str],
    pub case: Case,
}

impl Leaf {
    const fn new(path: &'static str, kind: LeafKind) -> Self {
        Leaf {
            path,
            kind,
            default: DefaultValue::Unset,
            required: false,
            bound: Bound::Unbounded,
            choices: &[],
            case: Case::Keep,
        }
    }

    const fn default(self, default: DefaultValue) -> Self {
        Leaf { default, ..self }
    }

    const fn required(self) -> Self {
        Leaf {
            required: true,
            ..self
        }
    }

    const fn bound(self, bound: Bound) -> Self {
        Leaf { bound, ..self }
    }

    const fn choices(self, choices: &'static [&'static str], case: Case) -> Self {
        Leaf {
            choices,
            case,
            ..self
        }
    }

    /// Default as a canonical JSON value, if the leaf has one
    pub fn default_value(&self) -> Option<Value> {
        match self.default {
            DefaultValue::Unset => None,
            DefaultValue::Bool(b) => Some(Value::Bool(b)),
            DefaultValue::Int(i) => Some(json!(i)),
            DefaultValue::Float(f) => Number::from_f64(f).map(Value::Number),
            DefaultValue::Text(s) => Some(Value::String(s.to_string())),
            DefaultValue::FloatList(list) => Some(json!(list)),
            DefaultValue::TextList(list) => Some(json!(list)),
            DefaultValue::Triple(t) => Some(json!(t)),
            DefaultValue::Composition(pairs) => Some(Value::Array(
                pairs
                    .iter()
                    .flat_map(|(element, fraction)| [json!(element), json!(fraction)])
                    .collect(),
            )),
            DefaultValue::UnixNow => Some(json!(Utc::now().timestamp().max(1))),
        }
    }

    /// Coerce a raw CLI or environment string into the leaf's canonical value
    pub fn coerce_str(&self, raw: &str) -> Result<Value, String> {
        let raw = raw.trim();
        let value = match self.kind {
            LeafKind::Bool => Value::Bool(parse_bool(raw)?),
            LeafKind::Int => json!(parse_int(raw)?),
            LeafKind::Float => float_value(parse_float(raw)?)?,
            LeafKind::Text | LeafKind::Path | LeafKind::DateTime => Value::String(raw.to_string()),
            LeafKind::PathList
            | LeafKind::FloatList
            | LeafKind::TextList
            | LeafKind::FloatTriple
            | LeafKind::Composition => {
                if raw.starts_with('[') {
                    serde_json::from_str(raw).map_err(|e| format!("invalid list `{raw}`: {e}"))?
                } else {
                    Value::Array(
                        raw.split(',')
                            .map(str::trim)
                            .filter(|item| !item.is_empty())
                            .map(|item| Value::String(item.to_string()))
                            .collect(),
                    )
                }
            }
        };
        self.normalize(value)
    }

    /// Type-check a value and convert it to its canonical form
    ///
    /// Strings are accepted for every kind and coerced with the CLI rules,
    /// so `"True"` in a YAML file means the same as `--flag True`.
    pub fn normalize(&self, value: Value) -> Result<Value, String> {
        let canonical = match (self.kind, value) {
            (LeafKind::Bool, Value::Bool(b)) => Value::Bool(b),
            (LeafKind::Int, Value::Number(n)) => match n.as_i64() {
                Some(i) => json!(i),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => json!(f as i64),
                    _ => return Err(format!("expected an integer, got {n}")),
                },
            },
            (LeafKind::Float, Value::Number(n)) => {
                float_value(n.as_f64().ok_or_else(|| format!("expected a number, got {n}"))?)?
            }
            (LeafKind::Text, Value::String(s)) => Value::String(match self.case {
                Case::Keep => s,
                Case::Lower => s.to_lowercase(),
                Case::Upper => s.to_uppercase(),
            }),
            (LeafKind::Path, Value::String(s)) => Value::String(s),
            (LeafKind::DateTime, Value::String(s)) => Value::String(
                parse_datetime(&s)?.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            (LeafKind::PathList, Value::String(s)) => Value::Array(vec![Value::String(s)]),
            (LeafKind::PathList, Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(Value::String(s)),
                        other => Err(format!("expected a path, got {other}")),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            (LeafKind::TextList, Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(Value::String(s.trim().to_string())),
                        other => Err(format!("expected a string, got {other}")),
                    })
                    .collect::<Result<_, _>>()?,
            ),
            (LeafKind::FloatList, Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .map(element_as_float)
                    .collect::<Result<_, _>>()?,
            ),
            (LeafKind::FloatList, Value::Number(n)) => Value::Array(vec![element_as_float(
                Value::Number(n),
            )?]),
            (LeafKind::FloatTriple, Value::Array(items)) => {
                if items.len() != 3 {
                    return Err(format!("expected exactly 3 values, got {}", items.len()));
                }
                Value::Array(
                    items
                        .into_iter()
                        .map(element_as_float)
                        .collect::<Result<_, _>>()?,
                )
            }
            (LeafKind::Composition, Value::Array(items)) => normalize_composition(items)?,
            (kind, Value::String(s)) if !matches!(kind, LeafKind::Text | LeafKind::Path) => {
                return self.coerce_str(&s);
            }
            (kind, other) => return Err(format!("expected {}, got {other}", kind_name(kind))),
        };
        self.check_constraints(&canonical)?;
        Ok(canonical)
    }

    fn check_constraints(&self, value: &Value) -> Result<(), String> {
        match value {
            Value::Number(n) => check_bound(self.bound, n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) if !self.choices.is_empty() => check_choice(self.choices, s),
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Number(n) if self.kind != LeafKind::Composition => {
                            check_bound(self.bound, n.as_f64().unwrap_or(f64::NAN))?
                        }
                        Value::String(s) if !self.choices.is_empty() => {
                            check_choice(self.choices, s)?
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn kind_name(kind: LeafKind) -> &'static str {
    match kind {
        LeafKind::Bool => "a boolean",
        LeafKind::Int => "an integer",
        LeafKind::Float => "a number",
        LeafKind::Text => "a string",
        LeafKind::Path => "a path",
        LeafKind::PathList => "a path or list of paths",
        LeafKind::FloatList => "a list of numbers",
        LeafKind::TextList => "a list of strings",
        LeafKind::FloatTriple => "three numbers",
        LeafKind::DateTime => "a date-time",
        LeafKind::Composition => "an element/percentage list",
    }
}

fn check_bound(bound: Bound, v: f64) -> Result<(), String> {
    let ok = match bound {
        Bound::Unbounded => v.is_finite(),
        Bound::AtLeast(min) => v >= min,
        Bound::Above(min) => v > min,
        Bound::Within(min, max) => (min..=max).contains(&v),
    };
    if ok {
        return Ok(());
    }
    Err(match bound {
        Bound::Unbounded => format!("{v} is not a finite number"),
        Bound::AtLeast(min) => format!("{v} must be >= {min}"),
        Bound::Above(min) => format!("{v} must be > {min}"),
        Bound::Within(min, max) => format!("{v} must be within [{min}, {max}]"),
    })
}

fn check_choice(choices: &[&str], s: &str) -> Result<(), String> {
    if choices.contains(&s) {
        Ok(())
    } else {
        Err(format!("`{s}` is not one of: {}", choices.join(", ")))
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("`{raw}` is not a boolean")),
    }
}

fn parse_int(raw: &str) -> Result<i64, String> {
    raw.parse::<i64>()
        .map_err(|_| format!("`{raw}` is not an integer"))
}

fn parse_float(raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .map_err(|_| format!("`{raw}` is not a number"))
}

fn float_value(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("{f} is not a finite number"))
}

fn element_as_float(item: Value) -> Result<Value, String> {
    match item {
        Value::Number(n) => float_value(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => float_value(parse_float(s.trim())?),
        other => Err(format!("expected a number, got {other}")),
    }
}

fn normalize_composition(items: Vec<Value>) -> Result<Value, String> {
    if items.len() < 2 || items.len() % 2 != 0 {
        return Err("expected element/percentage pairs".to_string());
    }
    let mut out = Vec::with_capacity(items.len());
    for pair in items.chunks(2) {
        let element = match &pair[0] {
            Value::String(s) if !s.trim().is_empty() && s.parse::<f64>().is_err() => {
                s.trim().to_string()
            }
            other => return Err(format!("expected an element symbol, got {other}")),
        };
        let fraction = match &pair[1] {
            Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
            Value::String(s) => parse_float(s.trim())?,
            other => return Err(format!("expected a percentage, got {other}")),
        };
        check_bound(Bound::Within(0.0, 100.0), fraction)?;
        out.push(Value::String(element));
        out.push(float_value(fraction)?);
    }
    Ok(Value::Array(out))
}

/// Parse an RFC 3339 instant, a naive `YYYY-MM-DDTHH:MM:SS` (UTC) or a date
pub fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("`{raw}` is not a date-time (expected YYYY-MM-DDTHH:MM:SS)"))
}

use Bound::{Above, AtLeast, Within};
use DefaultValue as D;
use LeafKind as K;

/// Upper bound of leaves stored as `u32`
const U32_MAX: f64 = u32::MAX as f64;

/// Every configuration leaf, in snapshot order
pub const SCHEMA: &[Leaf] = &[
    Leaf::new("random_seed", K::Int).default(D::UnixNow).bound(Above(0.0)),
    Leaf::new("num_processes", K::Int).default(D::Int(1)).bound(AtLeast(1.0)),
    Leaf::new("logger_level", K::Text).default(D::Text("INFO")).choices(
        &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"],
        Case::Upper,
    ),
    Leaf::new("particles_per_run", K::Int).default(D::Int(1)).bound(AtLeast(1.0)),
    Leaf::new("macro_files", K::PathList).required(),
    Leaf::new("save_dir", K::Path).required(),
    Leaf::new("time_resolution", K::Float).default(D::Float(1e6)).bound(AtLeast(1.0)),
    Leaf::new("sim_cycles", K::Int).default(D::Int(-1)).bound(AtLeast(-1.0)),
    Leaf::new("start_time", K::DateTime).default(D::Text("2021-01-01T00:00:00Z")),
    // generator
    Leaf::new("generator.gen_type", K::Text)
        .default(D::Text("gps"))
        .choices(&["gps", "particle_gun"], Case::Lower),
    Leaf::new("generator.n_events", K::Int)
        .default(D::Int(1))
        .bound(Within(1.0, U32_MAX)),
    Leaf::new("generator.energy", K::Float).default(D::Float(100.0)).bound(Above(0.0)),
    Leaf::new("generator.particle", K::Text)
        .default(D::Text("proton"))
        .choices(&[], Case::Lower),
    Leaf::new("generator.position", K::FloatTriple).default(D::Triple([0.0, 0.0, 0.0])),
    Leaf::new("generator.direction", K::FloatTriple).default(D::Triple([0.0, 0.0, 1.0])),
    // constructor
    Leaf::new("constructor.input_geom", K::Text)
        .default(D::Text("custom"))
        .choices(&["gdml", "custom"], Case::Lower),
    Leaf::new("constructor.gdml_file", K::Path),
    Leaf::new("constructor.export_gdml", K::Bool).default(D::Bool(false)),
    Leaf::new("constructor.geometry", K::Text)
        .default(D::Text("flat"))
        .choices(&["flat", "curved"], Case::Lower),
    Leaf::new("constructor.earth_radius", K::Float).bound(Above(0.0)),
    Leaf::new("constructor.atmos_size", K::Float).default(D::Float(100.0)).bound(Above(0.0)),
    Leaf::new("constructor.atmos_height", K::Float).default(D::Float(70.0)).bound(Above(0.0)),
    Leaf::new("constructor.atmos_comp", K::Composition).default(D::Composition(&[
        ("N", 70.0),
        ("O", 27.0),
        ("Ar", 3.0),
    ])),
    Leaf::new("constructor.atmos_n_points", K::Int).default(D::Int(100)).bound(AtLeast(1.0)),
    Leaf::new("constructor.magnetic_field.enabled", K::Bool).default(D::Bool(true)),
    Leaf::new("constructor.magnetic_field.mag_source", K::Text)
        .default(D::Text("estimated"))
        .choices(&["file", "estimated"], Case::Lower),
    Leaf::new("constructor.magnetic_field.mag_file", K::Path),
    Leaf::new("constructor.magnetic_field.latitude", K::Float)
        .default(D::Float(42.224))
        .bound(Within(-90.0, 90.0)),
    Leaf::new("constructor.magnetic_field.longitude", K::Float)
        .default(D::Float(-8.716))
        .bound(Within(-180.0, 180.0)),
    Leaf::new("constructor.magnetic_field.mag_time", K::DateTime)
        .default(D::Text("2021-01-01T00:00:00Z")),
    Leaf::new("constructor.sensitive_detectors.enabled", K::Bool).default(D::Bool(true)),
    Leaf::new("constructor.sensitive_detectors.altitude", K::FloatList)
        .default(D::FloatList(&[0.0]))
        .bound(AtLeast(0.0)),
    Leaf::new("constructor.sensitive_detectors.particles", K::TextList)
        .default(D::TextList(&["mu-"])),
    Leaf::new("constructor.density_profile.density_file", K::Path).required(),
    Leaf::new("constructor.density_profile.day_idx", K::Int)
        .default(D::Int(0))
        .bound(Within(0.0, U32_MAX)),
    // engine adapter
    Leaf::new("engine.command", K::Text).default(D::Text("particle-engine")),
    Leaf::new("engine.args", K::TextList).default(D::TextList(&[])),
    Leaf::new("engine.dataset_dir_var", K::Text).default(D::Text("G4DATA_DIR")),
    // scheduler policy
    Leaf::new("scheduler.on_worker_failure", K::Text)
        .default(D::Text("abort"))
        .choices(&["abort", "skip"], Case::Lower),
    Leaf::new("scheduler.worker_grace_period", K::Float)
        .default(D::Float(600.0))
        .bound(Above(0.0)),
];

/// Look up a leaf by dotted path
pub fn leaf(path: &str) -> Option<&'static Leaf> {
    SCHEMA.iter().find(|leaf| leaf.path == path)
}

/// True when `path` names an interior node of the tree
pub fn is_branch(path: &str) -> bool {
    SCHEMA.iter().any(|leaf| {
        leaf.path.len() > path.len()
            && leaf.path.starts_with(path)
            && leaf.path.as_bytes()[path.len()] == b'.'
    })
}

/// True when `key` is the first segment of some leaf path
pub fn is_top_level(key: &str) -> bool {
    leaf(key).is_some() || is_branch(key)
}
