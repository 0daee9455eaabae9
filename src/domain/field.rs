//! Field schema and values
//!
//! Field names follow the legacy persisted format: at most
//! [`MAX_FIELD_NAME_LEN`] characters, unique case-insensitively within a layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest field name the persisted format can hold
pub const MAX_FIELD_NAME_LEN: usize = 10;

/// Default maximum length for text fields
pub const DEFAULT_TEXT_LEN: usize = 254;

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("Field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        found: &'static str,
    },

    #[error("Value for text field '{field}' is {len} characters, maximum is {max}")]
    TextTooLong { field: String, len: usize, max: usize },

    #[error("Value for real field '{field}' is not a finite number")]
    NonFiniteReal { field: String },

    #[error("Field name '{0}' is longer than 10 characters")]
    NameTooLong(String),

    #[error("Invalid field name '{0}'")]
    InvalidName(String),

    #[error("Field '{0}' already exists (names are compared case-insensitively)")]
    Duplicate(String),

    #[error("Unknown field: {0}")]
    Unknown(String),

    #[error("Unknown field type: {0}")]
    UnknownType(String),
}

/// How over-long field names are handled when a field is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldNamePolicy {
    /// Cut the name to the first ten characters
    #[default]
    Truncate,
    /// Fail with [`FieldError::NameTooLong`]
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Real,
    Text,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Text => "text",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" => Ok(FieldType::Integer),
            "real" | "float" | "double" => Ok(FieldType::Real),
            "text" | "string" => Ok(FieldType::Text),
            other => Err(FieldError::UnknownType(other.to_string())),
        }
    }
}

/// A field descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefn {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Maximum length in characters, text fields only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<usize>,
}

impl FieldDefn {
    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Integer,
            max_len: None,
        }
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Real,
            max_len: None,
        }
    }

    pub fn text(name: impl Into<String>, max_len: usize) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Text,
            max_len: Some(max_len),
        }
    }

    /// Checks that `value` may be stored in this field
    pub fn check(&self, value: &FieldValue) -> Result<(), FieldError> {
        let matches = matches!(
            (self.field_type, value),
            (_, FieldValue::Null)
                | (FieldType::Integer, FieldValue::Integer(_))
                | (FieldType::Real, FieldValue::Real(_))
                | (FieldType::Text, FieldValue::Text(_))
        );
        if !matches {
            return Err(FieldError::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type,
                found: value.type_name(),
            });
        }

        if let FieldValue::Real(v) = value {
            if !v.is_finite() {
                return Err(FieldError::NonFiniteReal {
                    field: self.name.clone(),
                });
            }
        }

        if let (FieldValue::Text(text), Some(max)) = (value, self.max_len) {
            let len = text.chars().count();
            if len > max {
                return Err(FieldError::TextTooLong {
                    field: self.name.clone(),
                    len,
                    max,
                });
            }
        }

        Ok(())
    }
}

/// A field value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Integer(_) => "integer",
            FieldValue::Real(_) => "real",
            FieldValue::Text(_) => "text",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Real(v) => write!(f, "{}", v),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Real(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Ordered set of field descriptors for a layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<FieldDefn>,
}

impl Schema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn fields(&self) -> &[FieldDefn] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Finds a field by exact (case-sensitive) name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefn> {
        self.index_of(name).map(|idx| &self.fields[idx])
    }

    /// Applies the naming rules and appends the field.
    ///
    /// Returns the name actually stored, which differs from the requested
    /// name when it was truncated.
    pub fn add(&mut self, mut defn: FieldDefn, policy: FieldNamePolicy) -> Result<String, FieldError> {
        defn.name = normalize_name(&defn.name, policy)?;

        if self
            .fields
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(&defn.name))
        {
            return Err(FieldError::Duplicate(defn.name));
        }

        if defn.field_type == FieldType::Text && defn.max_len.is_none() {
            defn.max_len = Some(DEFAULT_TEXT_LEN);
        }

        let name = defn.name.clone();
        self.fields.push(defn);
        Ok(name)
    }
}

/// Validates a field name and applies the length policy
pub fn normalize_name(name: &str, policy: FieldNamePolicy) -> Result<String, FieldError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(FieldError::InvalidName(name.to_string()));
    }

    if name.len() <= MAX_FIELD_NAME_LEN {
        return Ok(name.to_string());
    }

    match policy {
        FieldNamePolicy::Truncate => Ok(name[..MAX_FIELD_NAME_LEN].to_string()),
        FieldNamePolicy::Reject => Err(FieldError::NameTooLong(name.to_string())),
    }
}
