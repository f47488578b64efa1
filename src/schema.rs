//! Declarative parameter schema and concrete parameter sets.
//!
//! A schema file maps each field name to its descriptor:
//!
//! ```json
//! {
//!   "fast":   { "type": "int", "min": 5, "max": 40, "period": true },
//!   "slow":   { "type": "int", "min": 20, "max": 200, "period": true },
//!   "stop":   { "type": "float", "min": 0.01, "max": 0.2, "precision": 3 },
//!   "symbol": { "type": "choice", "values": ["SPY", "QQQ", "IWM"] }
//! }
//! ```
//!
//! Fields are kept in a `BTreeMap` so iteration order, and therefore every
//! seeded draw, is stable across runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EvolveError, Result};

pub const DEFAULT_PRECISION: u32 = 4;

fn default_precision() -> u32 {
    DEFAULT_PRECISION
}

/// A concrete parameter value.
///
/// Variant order matters for untagged decoding: `10` must land in `Int`
/// and `10.5` in `Real`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Real(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Real(_) => "float",
            ParamValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Real(x) => write!(f, "{x}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Real(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Mapping from parameter name to value.
pub type ParameterSet = BTreeMap<String, ParamValue>;

/// Descriptor for one mutable parameter. Bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Field {
    #[serde(rename = "int")]
    Integer {
        min: i64,
        max: i64,
        /// Lookback/period length; never jittered below 1.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        period: bool,
    },
    #[serde(rename = "float")]
    Real {
        min: f64,
        max: f64,
        #[serde(default = "default_precision")]
        precision: u32,
    },
    #[serde(rename = "choice")]
    Choice { values: Vec<ParamValue> },
}

impl Field {
    pub fn int(min: i64, max: i64) -> Self {
        Field::Integer {
            min,
            max,
            period: false,
        }
    }

    pub fn period(min: i64, max: i64) -> Self {
        Field::Integer {
            min,
            max,
            period: true,
        }
    }

    pub fn real(min: f64, max: f64) -> Self {
        Field::Real {
            min,
            max,
            precision: DEFAULT_PRECISION,
        }
    }

    pub fn choice<V: Into<ParamValue>>(values: impl IntoIterator<Item = V>) -> Self {
        Field::Choice {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Field::Choice { .. })
    }

    /// Whether `value` has the right type and sits inside the field's domain.
    pub fn admits(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (Field::Integer { min, max, .. }, v) => {
                v.as_i64().is_some_and(|i| (*min..=*max).contains(&i))
            }
            (Field::Real { min, max, .. }, v) => v
                .as_f64()
                .is_some_and(|x| x.is_finite() && x >= *min && x <= *max),
            (Field::Choice { values }, v) => values.contains(v),
        }
    }

    fn type_fits(&self, value: &ParamValue) -> bool {
        match self {
            Field::Integer { .. } => value.as_i64().is_some(),
            Field::Real { .. } => value.as_f64().is_some(),
            Field::Choice { values } => values
                .iter()
                .any(|c| std::mem::discriminant(c) == std::mem::discriminant(value)),
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        match self {
            Field::Integer { min, max, .. } if min > max => Err(EvolveError::bounds(format!(
                "field {name}: min {min} > max {max}"
            ))),
            Field::Real { min, max, .. } if !min.is_finite() || !max.is_finite() => Err(
                EvolveError::bounds(format!("field {name}: non-finite bounds")),
            ),
            Field::Real { min, max, .. } if min > max => Err(EvolveError::bounds(format!(
                "field {name}: min {min} > max {max}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Name → field descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema {
    fields: BTreeMap<String, Field>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let schema: ParameterSchema = serde_json::from_str(text)
            .map_err(|e| EvolveError::schema(format!("invalid schema document: {e}")))?;
        schema.check()?;
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EvolveError::schema(format!("cannot read schema {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Rejects inverted or non-finite numeric bounds.
    pub fn check(&self) -> Result<()> {
        for (name, field) in &self.fields {
            field.check(name)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every name in `set` must be declared and every value must fit its type.
    /// Bounds are not checked here; see [`validate`](Self::validate).
    pub fn check_names_and_types(&self, set: &ParameterSet) -> Result<()> {
        for (name, value) in set {
            let Some(field) = self.fields.get(name) else {
                return Err(EvolveError::schema(format!("undeclared field `{name}`")));
            };
            if !field.type_fits(value) {
                return Err(EvolveError::schema(format!(
                    "field `{name}` expects {}, got {} ({value})",
                    field_type_name(field),
                    value.kind()
                )));
            }
        }
        Ok(())
    }

    /// Full conformance: declared names, every field present, values in domain.
    pub fn validate(&self, set: &ParameterSet) -> Result<()> {
        self.check_names_and_types(set)?;
        for (name, field) in &self.fields {
            let Some(value) = set.get(name) else {
                return Err(EvolveError::schema(format!("missing field `{name}`")));
            };
            if !field.admits(value) {
                return Err(EvolveError::schema(format!(
                    "field `{name}` value {value} outside its declared domain"
                )));
            }
        }
        Ok(())
    }
}

fn field_type_name(field: &Field) -> &'static str {
    match field {
        Field::Integer { .. } => "int",
        Field::Real { .. } => "float",
        Field::Choice { .. } => "one of the declared choices",
    }
}

pub(crate) fn round_to(v: f64, digits: u32) -> f64 {
    let f = 10_f64.powi(digits as i32);
    (v * f).round() / f
}

pub(crate) fn round_half_up(v: f64) -> i64 {
    (v + 0.5).floor() as i64
}
