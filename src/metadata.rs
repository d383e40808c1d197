//! Procedure metadata.
//!
//! Metadata has the same shape as a parameter (name, value, optional unit) but is
//! owned by the procedure itself: it is declared with an optional default, and can
//! only be written through a [`MetadataWriter`], which the worker hands to
//! `Procedure::startup()`. Everything else sees a read-only [`MetadataSet`].
//! Once startup succeeds the values are appended to the results header.

use crate::error::{AppResult, DaqError};
use crate::parameter::{validate_name, ParameterValue};

/// One declared metadata entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataField {
    name: String,
    unit: Option<String>,
    default: Option<ParameterValue>,
    value: Option<ParameterValue>,
}

impl MetadataField {
    /// Field without a default; absent until startup writes it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            default: None,
            value: None,
        }
    }

    /// Value reported before startup has run.
    pub fn with_default(mut self, default: impl Into<ParameterValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Attach a unit symbol.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit symbol, if any.
    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Written value, falling back to the default.
    pub fn value(&self) -> Option<&ParameterValue> {
        self.value.as_ref().or(self.default.as_ref())
    }

    /// Header representation, or `None` while the field is absent.
    pub fn serialized(&self) -> Option<String> {
        let value = self.value()?;
        Some(match &self.unit {
            Some(unit) => format!("{value} {unit}"),
            None => value.to_string(),
        })
    }
}

/// Declared metadata of one procedure, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataSet {
    fields: Vec<MetadataField>,
}

impl MetadataSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare every field in order.
    pub fn from_fields(fields: impl IntoIterator<Item = MetadataField>) -> AppResult<Self> {
        let mut set = Self::new();
        for field in fields {
            validate_name(&field.name)?;
            if set.field(&field.name).is_some() {
                return Err(DaqError::validation(&field.name, "declared twice"));
            }
            set.fields.push(field);
        }
        Ok(set)
    }

    /// Look up a field.
    pub fn field(&self, name: &str) -> Option<&MetadataField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Current value (written or default).
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.field(name).and_then(MetadataField::value)
    }

    /// Iterate in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &MetadataField> {
        self.fields.iter()
    }

    /// Whether no fields are declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Write access to a [`MetadataSet`], only handed out during startup.
#[derive(Debug)]
pub struct MetadataWriter<'a> {
    set: &'a mut MetadataSet,
}

impl<'a> MetadataWriter<'a> {
    pub(crate) fn new(set: &'a mut MetadataSet) -> Self {
        Self { set }
    }

    /// Record the value of a declared field.
    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) -> AppResult<()> {
        let value = value.into();
        if let ParameterValue::Text(text) = &value {
            if text.contains(['\n', '\r']) {
                return Err(DaqError::validation(name, "text must fit on a single line"));
            }
        }
        let field = self
            .set
            .fields
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| DaqError::UnknownParameter(name.to_string()))?;
        field.value = Some(value);
        Ok(())
    }

    /// Read back what has been recorded so far.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.set.get(name)
    }
}
