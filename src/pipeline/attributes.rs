//! Named, typed node parameters.
//!
//! Nodes publish their tunable parameters as a list of [`Attribute`]s. The
//! graph reads and writes them by name on behalf of an editing surface or a
//! graph document, and refuses writes to attributes marked read-only while
//! the node is processing.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Value of a node attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Double(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    /// One of a fixed set of options.
    Enum { selected: String, options: Vec<String> },
    FilePath(PathBuf),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Doubles, and ints widened to doubles.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(v) => Some(*v),
            AttributeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text, or the selected option of an enum.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            AttributeValue::Enum { selected, .. } => Some(selected),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&std::path::Path> {
        match self {
            AttributeValue::FilePath(p) => Some(p),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Double(_) => "double",
            AttributeValue::Int(_) => "int",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Text(_) => "string",
            AttributeValue::Enum { .. } => "enum",
            AttributeValue::FilePath(_) => "file path",
        }
    }

    /// Checked accessor for a positive integer such as a samplerate.
    pub fn expect_positive(&self, attribute: &str) -> Result<u32> {
        let v = self.as_int().ok_or_else(|| mismatch(attribute, "int", self))?;
        if v <= 0 || v > u32::MAX as i64 {
            return Err(EngineError::InvalidAttribute {
                attribute: attribute.to_string(),
                message: format!("{} is out of range", v),
            });
        }
        Ok(v as u32)
    }

    pub fn expect_float(&self, attribute: &str) -> Result<f64> {
        self.as_float()
            .ok_or_else(|| mismatch(attribute, "double", self))
    }

    pub fn expect_bool(&self, attribute: &str) -> Result<bool> {
        self.as_bool().ok_or_else(|| mismatch(attribute, "bool", self))
    }

    pub fn expect_str(&self, attribute: &str) -> Result<&str> {
        self.as_str().ok_or_else(|| mismatch(attribute, "string", self))
    }

    /// Select `option` among `options`, accepting either a text value or an enum value.
    pub fn expect_option(&self, attribute: &str, options: &[&str]) -> Result<String> {
        let selected = self.expect_str(attribute)?;
        if options.contains(&selected) {
            Ok(selected.to_string())
        } else {
            Err(EngineError::InvalidAttribute {
                attribute: attribute.to_string(),
                message: format!("'{}' is not one of {:?}", selected, options),
            })
        }
    }
}

fn mismatch(attribute: &str, expected: &str, got: &AttributeValue) -> EngineError {
    EngineError::InvalidAttribute {
        attribute: attribute.to_string(),
        message: format!("expected {}, got {}", expected, got.kind()),
    }
}

/// A named attribute as published by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
    /// Writes are rejected while the node is not stopped.
    #[serde(default)]
    pub read_only_while_running: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
            read_only_while_running: false,
        }
    }

    pub fn locked_while_running(mut self) -> Self {
        self.read_only_while_running = true;
        self
    }

    pub fn enumeration(name: impl Into<String>, selected: &str, options: &[&str]) -> Self {
        Self::new(
            name,
            AttributeValue::Enum {
                selected: selected.to_string(),
                options: options.iter().map(|s| s.to_string()).collect(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::approx_constant)]
    fn test_accessors() {
        assert_eq!(AttributeValue::Bool(true).as_bool(), Some(true));
        assert_eq!(AttributeValue::Int(42).as_int(), Some(42));
        assert_eq!(AttributeValue::Int(42).as_float(), Some(42.0));
        assert_eq!(AttributeValue::Double(3.14).as_float(), Some(3.14));
        assert_eq!(AttributeValue::Text("hello".into()).as_str(), Some("hello"));
        assert_eq!(AttributeValue::Double(1.0).as_str(), None);
    }

    #[test]
    fn test_expect_positive() {
        assert_eq!(AttributeValue::Int(1000).expect_positive("samplerate").unwrap(), 1000);
        assert!(AttributeValue::Int(0).expect_positive("samplerate").is_err());
        let err = AttributeValue::Text("x".into()).expect_positive("samplerate").unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn test_expect_option() {
        let attr = Attribute::enumeration("window", "hann", &["rectangular", "hann"]);
        assert_eq!(attr.value.expect_option("window", &["rectangular", "hann"]).unwrap(), "hann");
        let bad = AttributeValue::Text("kaiser".into());
        assert!(bad.expect_option("window", &["rectangular", "hann"]).is_err());
    }

    #[test]
    fn test_serde_shape() {
        let attr = Attribute::new("factor", AttributeValue::Double(2.5)).locked_while_running();
        let json = serde_json::to_string(&attr).unwrap();
        assert!(json.contains("\"double\":2.5"));
        let parsed: Attribute = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, attr);
    }
}
