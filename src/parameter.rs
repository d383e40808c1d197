//! Typed, validated procedure parameters.
//!
//! A [`Parameter`] is a named value bound to a procedure instance before it is
//! queued. Every assignment goes through the parameter's kind (type coercion) and
//! its optional [`Validator`], so an invalid binding fails immediately with
//! [`DaqError::Validation`] and never surfaces at run time.
//!
//! Parameters serialize to a single line of text (see [`Parameter::serialized`]) and
//! parse back through [`ParameterKind::parse`], which is what lets a results header
//! be turned back into typed values.
//!
//! # Example
//!
//! ```rust
//! use daq_runner::parameter::{Parameter, ParameterSet};
//!
//! let mut params = ParameterSet::from_parameters([
//!     Parameter::integer("Loop count", 10).with_range(0.0, 1000.0),
//!     Parameter::float("Delay", 0.1).with_unit("s").with_range(0.0, 10.0).clamped(),
//! ])?;
//!
//! params.set("Loop count", 25)?;
//! params.set("Delay", 50.0)?; // clamped to 10 s
//! assert_eq!(params.float("Delay")?, 10.0);
//! assert!(params.set("Loop count", -1).is_err());
//! # Ok::<(), daq_runner::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Names reserved by the results header layout.
pub(crate) const RESERVED_NAMES: &[&str] = &["Procedure", "Parameters", "Metadata", "Data"];

/// Value held by a parameter or metadata field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean flag.
    Boolean(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// Fixed list of floats.
    Vector(Vec<f64>),
    /// Single-line text.
    Text(String),
}

impl ParameterValue {
    /// Numeric view used by range validators.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Integer view; floats only convert when they are whole and fit in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(v) => Some(*v),
            // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound.
            ParameterValue::Float(v)
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 =>
            {
                Some(*v as i64)
            }
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(v) => write!(f, "{v}"),
            ParameterValue::Integer(v) => write!(f, "{v}"),
            ParameterValue::Float(v) => write!(f, "{v}"),
            ParameterValue::Text(v) => f.write_str(v),
            ParameterValue::Vector(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Boolean(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Integer(value)
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Integer(value.into())
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Integer(value.into())
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        ParameterValue::Vector(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// `true` or `false`.
    Boolean,
    /// Signed integer.
    Integer,
    /// Floating point number.
    Float,
    /// Float list, optionally of fixed length.
    Vector {
        /// Required number of items.
        length: Option<usize>,
    },
    /// Single-line text without surrounding whitespace.
    Text,
}

impl ParameterKind {
    /// Parse the serialized form written by [`ParameterValue`]'s `Display`.
    pub fn parse(&self, raw: &str) -> Result<ParameterValue, String> {
        let raw = raw.trim();
        match self {
            ParameterKind::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" => Ok(ParameterValue::Boolean(true)),
                "false" => Ok(ParameterValue::Boolean(false)),
                other => Err(format!("'{other}' is not a boolean")),
            },
            ParameterKind::Integer => raw
                .parse::<i64>()
                .map(ParameterValue::Integer)
                .map_err(|e| format!("'{raw}' is not an integer: {e}")),
            ParameterKind::Float => raw
                .parse::<f64>()
                .map(ParameterValue::Float)
                .map_err(|e| format!("'{raw}' is not a number: {e}")),
            ParameterKind::Vector { .. } => {
                let inner = raw
                    .strip_prefix('[')
                    .and_then(|r| r.strip_suffix(']'))
                    .ok_or_else(|| format!("'{raw}' is not a [..] list"))?;
                if inner.trim().is_empty() {
                    return Ok(ParameterValue::Vector(Vec::new()));
                }
                inner
                    .split(',')
                    .map(|item| {
                        item.trim()
                            .parse::<f64>()
                            .map_err(|e| format!("list item '{}': {e}", item.trim()))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(ParameterValue::Vector)
            }
            ParameterKind::Text => Ok(ParameterValue::Text(raw.to_string())),
        }
    }

    /// Coerce `value` into this kind, or explain why it does not fit.
    fn coerce(&self, value: ParameterValue) -> Result<ParameterValue, String> {
        match (self, value) {
            (ParameterKind::Text, ParameterValue::Text(text)) => {
                if text.contains(['\n', '\r']) {
                    Err("text must fit on a single line".to_string())
                } else if text.trim() != text {
                    Err("text must not start or end with whitespace".to_string())
                } else {
                    Ok(ParameterValue::Text(text))
                }
            }
            (_, ParameterValue::Text(raw)) => self.parse(&raw),
            (ParameterKind::Boolean, v @ ParameterValue::Boolean(_)) => Ok(v),
            (ParameterKind::Integer, v) => v
                .as_i64()
                .map(ParameterValue::Integer)
                .ok_or_else(|| format!("{v} is not an integer")),
            (ParameterKind::Float, v) => v
                .as_f64()
                .map(ParameterValue::Float)
                .ok_or_else(|| format!("{v} is not a number")),
            (ParameterKind::Vector { length }, ParameterValue::Vector(values)) => match length {
                Some(n) if values.len() != *n => {
                    Err(format!("expected {n} values, got {}", values.len()))
                }
                _ => Ok(ParameterValue::Vector(values)),
            },
            (kind, v) => Err(format!("{v} does not fit a {kind:?} parameter")),
        }
    }
}

/// Assignment-time check attached to a parameter.
#[derive(Clone)]
pub enum Validator {
    /// Inclusive numeric range; out-of-range values are rejected, or clamped when `clamp` is set.
    Range {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
        /// Clamp instead of rejecting.
        clamp: bool,
    },
    /// Value must equal one of the listed choices.
    Choices(Vec<ParameterValue>),
    /// Arbitrary check returning a reason on rejection.
    Custom(Arc<dyn Fn(&ParameterValue) -> Result<(), String> + Send + Sync>),
}

impl Validator {
    /// Validate (and possibly clamp) `value`.
    pub fn apply(&self, value: ParameterValue) -> Result<ParameterValue, String> {
        match self {
            Validator::Range { min, max, clamp } => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| format!("range check needs a number, got {value}"))?;
                if number.is_nan() {
                    return Err("NaN is outside every range".to_string());
                }
                if number >= *min && number <= *max {
                    return Ok(value);
                }
                if !clamp {
                    return Err(format!("{number} is outside [{min}, {max}]"));
                }
                let clamped = number.clamp(*min, *max);
                Ok(match value {
                    ParameterValue::Integer(_) => ParameterValue::Integer(clamped.round() as i64),
                    _ => ParameterValue::Float(clamped),
                })
            }
            Validator::Choices(choices) => {
                if choices.contains(&value) {
                    Ok(value)
                } else {
                    let listed: Vec<String> = choices.iter().map(ToString::to_string).collect();
                    Err(format!("{value} is not one of [{}]", listed.join(", ")))
                }
            }
            Validator::Custom(check) => check(&value).map(|()| value),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::Range { min, max, clamp } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .field("clamp", clamp)
                .finish(),
            Validator::Choices(choices) => f.debug_tuple("Choices").field(choices).finish(),
            Validator::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

/// A named, typed, validated value.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    kind: ParameterKind,
    default: ParameterValue,
    value: ParameterValue,
    unit: Option<String>,
    description: Option<String>,
    validator: Option<Validator>,
}

impl Parameter {
    fn new(name: impl Into<String>, kind: ParameterKind, default: ParameterValue) -> Self {
        Self {
            name: name.into(),
            kind,
            value: default.clone(),
            default,
            unit: None,
            description: None,
            validator: None,
        }
    }

    /// Floating point parameter.
    pub fn float(name: impl Into<String>, default: f64) -> Self {
        Self::new(name, ParameterKind::Float, ParameterValue::Float(default))
    }

    /// Integer parameter.
    pub fn integer(name: impl Into<String>, default: i64) -> Self {
        Self::new(name, ParameterKind::Integer, ParameterValue::Integer(default))
    }

    /// Boolean parameter.
    pub fn boolean(name: impl Into<String>, default: bool) -> Self {
        Self::new(name, ParameterKind::Boolean, ParameterValue::Boolean(default))
    }

    /// Single-line text parameter.
    pub fn text(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self::new(name, ParameterKind::Text, ParameterValue::Text(default.into()))
    }

    /// Float-list parameter; the default's length becomes the required length.
    pub fn vector(name: impl Into<String>, default: Vec<f64>) -> Self {
        let length = Some(default.len());
        Self::new(
            name,
            ParameterKind::Vector { length },
            ParameterValue::Vector(default),
        )
    }

    /// Text parameter restricted to `choices`.
    pub fn list(name: impl Into<String>, choices: &[&str], default: &str) -> Self {
        Self::text(name, default).with_choices(
            choices
                .iter()
                .map(|c| ParameterValue::Text(c.to_string()))
                .collect(),
        )
    }

    /// Attach a physical unit, written after the value in the results header.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Attach a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Reject values outside `[min, max]`.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.validator = Some(Validator::Range {
            min,
            max,
            clamp: false,
        });
        self
    }

    /// Turn an attached range into a clamping range.
    pub fn clamped(mut self) -> Self {
        if let Some(Validator::Range { clamp, .. }) = self.validator.as_mut() {
            *clamp = true;
        }
        self
    }

    /// Restrict to a set of choices.
    pub fn with_choices(mut self, choices: Vec<ParameterValue>) -> Self {
        self.validator = Some(Validator::Choices(choices));
        self
    }

    /// Attach a custom validator.
    pub fn with_validator(
        mut self,
        check: impl Fn(&ParameterValue) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Validator::Custom(Arc::new(check)));
        self
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared kind.
    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    /// Current value.
    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    /// Declared default.
    pub fn default_value(&self) -> &ParameterValue {
        &self.default
    }

    /// Optional unit symbol.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Coerce and validate `value` without storing it.
    pub fn check(&self, value: ParameterValue) -> AppResult<ParameterValue> {
        let value = self
            .kind
            .coerce(value)
            .map_err(|reason| DaqError::validation(&self.name, reason))?;
        match &self.validator {
            Some(validator) => validator
                .apply(value)
                .map_err(|reason| DaqError::validation(&self.name, reason)),
            None => Ok(value),
        }
    }

    /// Validate and store `value`.
    pub fn set(&mut self, value: impl Into<ParameterValue>) -> AppResult<()> {
        self.value = self.check(value.into())?;
        Ok(())
    }

    /// Parse a serialized value (optionally followed by this parameter's unit) and store it.
    pub fn set_serialized(&mut self, raw: &str) -> AppResult<()> {
        let raw = raw.trim();
        let raw = match &self.unit {
            Some(unit) => raw
                .strip_suffix(unit.as_str())
                .map(str::trim_end)
                .unwrap_or(raw),
            None => raw,
        };
        let parsed = self
            .kind
            .parse(raw)
            .map_err(|reason| DaqError::validation(&self.name, reason))?;
        self.set(parsed)
    }

    /// Header representation: `<value>` or `<value> <unit>`.
    pub fn serialized(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{} {}", self.value, unit),
            None => self.value.to_string(),
        }
    }
}

/// Check that a name can be written to and read back from a results header.
pub(crate) fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(DaqError::validation(name, "name must not be empty"));
    }
    if name.contains([':', '\n', '\r']) || name.starts_with('#') {
        return Err(DaqError::validation(
            name,
            "name must not contain ':' or line breaks, nor start with '#'",
        ));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(DaqError::validation(name, "name is reserved by the results header"));
    }
    Ok(())
}

/// Parameters of one procedure, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl ParameterSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare every parameter in order.
    pub fn from_parameters(parameters: impl IntoIterator<Item = Parameter>) -> AppResult<Self> {
        let mut set = Self::new();
        for parameter in parameters {
            set.declare(parameter)?;
        }
        Ok(set)
    }

    /// Add a parameter; its name must be unique and its default must validate.
    pub fn declare(&mut self, mut parameter: Parameter) -> AppResult<()> {
        validate_name(&parameter.name)?;
        if self.get(&parameter.name).is_some() {
            return Err(DaqError::validation(&parameter.name, "declared twice"));
        }
        parameter.default = parameter.check(parameter.default.clone())?;
        parameter.value = parameter.default.clone();
        self.parameters.push(parameter);
        Ok(())
    }

    /// Look up a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    fn get_mut(&mut self, name: &str) -> AppResult<&mut Parameter> {
        self.parameters
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))
    }

    /// Current value of a parameter.
    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.get(name).map(Parameter::value)
    }

    /// Validate and bind a value.
    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) -> AppResult<()> {
        self.get_mut(name)?.set(value)
    }

    /// Bind from text, e.g. a command line `NAME=VALUE` pair or a header line.
    pub fn bind_str(&mut self, name: &str, raw: &str) -> AppResult<()> {
        self.get_mut(name)?.set_serialized(raw)
    }

    /// Typed accessor for float parameters.
    pub fn float(&self, name: &str) -> AppResult<f64> {
        self.value(name)
            .and_then(ParameterValue::as_f64)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))
    }

    /// Typed accessor for integer parameters.
    pub fn integer(&self, name: &str) -> AppResult<i64> {
        self.value(name)
            .and_then(ParameterValue::as_i64)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))
    }

    /// Typed accessor for boolean parameters.
    pub fn boolean(&self, name: &str) -> AppResult<bool> {
        self.value(name)
            .and_then(ParameterValue::as_bool)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))
    }

    /// Typed accessor for text parameters.
    pub fn text(&self, name: &str) -> AppResult<&str> {
        self.value(name)
            .and_then(ParameterValue::as_str)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    /// Number of declared parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether no parameters are declared.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_at_assignment() {
        let mut p = Parameter::float("Voltage", 1.0).with_range(0.0, 5.0);
        assert!(p.set(7.5).is_err());
        assert_eq!(p.value(), &ParameterValue::Float(1.0));
    }

    #[test]
    fn clamps_when_requested() {
        let mut p = Parameter::integer("Averages", 4)
            .with_range(1.0, 10.0)
            .clamped();
        p.set(50).unwrap();
        assert_eq!(p.value(), &ParameterValue::Integer(10));
    }

    #[test]
    fn integer_accepts_integral_float_only() {
        let mut p = Parameter::integer("Points", 3);
        p.set(4.0).unwrap();
        assert_eq!(p.value(), &ParameterValue::Integer(4));
        assert!(p.set(4.5).is_err());
    }

    #[test]
    fn float_accepts_integers() {
        let mut p = Parameter::float("Delay", 0.5);
        p.set(2).unwrap();
        assert_eq!(p.value(), &ParameterValue::Float(2.0));
    }

    #[test]
    fn text_rejects_line_breaks() {
        let mut p = Parameter::text("Sample", "A1");
        assert!(p.set("two\nlines").is_err());
    }

    #[test]
    fn text_rejects_surrounding_whitespace() {
        let mut p = Parameter::text("Sample", "A1");
        assert!(matches!(
            p.set("  padded  "),
            Err(DaqError::Validation { .. })
        ));
        assert_eq!(p.value(), &ParameterValue::Text("A1".to_string()));
        p.set_serialized("  padded  ").unwrap();
        assert_eq!(p.value(), &ParameterValue::Text("padded".to_string()));
    }

    #[test]
    fn integer_rejects_floats_beyond_i64() {
        let mut p = Parameter::integer("N", 1);
        assert!(matches!(p.set(1e20), Err(DaqError::Validation { .. })));
        assert!(p.set(-1e20).is_err());
        assert!(p.set(f64::INFINITY).is_err());
        assert!(p.set(f64::NAN).is_err());
        assert!(p.set(9_223_372_036_854_775_808.0).is_err());
        assert_eq!(p.value(), &ParameterValue::Integer(1));

        p.set(-9_223_372_036_854_775_808.0).unwrap();
        assert_eq!(p.value(), &ParameterValue::Integer(i64::MIN));
    }

    #[test]
    fn choices_are_enforced() {
        let mut p = Parameter::list("Range", &["auto", "1 V", "10 V"], "auto");
        p.set("10 V").unwrap();
        assert!(p.set("100 V").is_err());
    }

    #[test]
    fn custom_validator_runs() {
        let mut p = Parameter::integer("Even", 2).with_validator(|v| match v.as_i64() {
            Some(n) if n % 2 == 0 => Ok(()),
            _ => Err("must be even".to_string()),
        });
        p.set(8).unwrap();
        let err = p.set(7).unwrap_err();
        assert!(err.to_string().contains("must be even"));
    }

    #[test]
    fn vector_length_is_fixed_by_default() {
        let mut p = Parameter::vector("Offsets", vec![0.0, 0.0]);
        p.set(vec![1.0, 2.0]).unwrap();
        assert!(p.set(vec![1.0]).is_err());
    }

    #[test]
    fn serialized_form_parses_back() {
        let mut p = Parameter::vector("Offsets", vec![0.0, 0.0]);
        p.set(vec![1.5, -2.25]).unwrap();
        let text = p.serialized();
        assert_eq!(text, "[1.5, -2.25]");

        let mut q = Parameter::vector("Offsets", vec![0.0, 0.0]);
        q.set_serialized(&text).unwrap();
        assert_eq!(q.value(), p.value());
    }

    #[test]
    fn unit_suffix_is_stripped_when_binding() {
        let mut p = Parameter::float("Delay", 0.1).with_unit("s");
        p.set(0.25).unwrap();
        assert_eq!(p.serialized(), "0.25 s");
        let mut q = Parameter::float("Delay", 0.1).with_unit("s");
        q.set_serialized("0.25 s").unwrap();
        assert_eq!(q.value(), &ParameterValue::Float(0.25));
    }

    #[test]
    fn declare_rejects_bad_names_and_defaults() {
        let mut set = ParameterSet::new();
        assert!(set.declare(Parameter::float("Data", 0.0)).is_err());
        assert!(set.declare(Parameter::float("a:b", 0.0)).is_err());
        assert!(set
            .declare(Parameter::float("Voltage", 9.0).with_range(0.0, 5.0))
            .is_err());
        set.declare(Parameter::float("Voltage", 1.0)).unwrap();
        assert!(set.declare(Parameter::float("Voltage", 1.0)).is_err());
    }

    #[test]
    fn unknown_parameter_is_an_error() {
        let mut set = ParameterSet::from_parameters([Parameter::float("Voltage", 1.0)]).unwrap();
        assert!(matches!(
            set.set("Current", 1.0),
            Err(DaqError::UnknownParameter(_))
        ));
    }
}
