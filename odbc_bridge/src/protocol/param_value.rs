use crate::error::{OdbcError, Result};
use serde::Serialize;
use serde_json::Value;

/// Host-level value of a parameter, before binding or after reading an
/// output buffer back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Boolean(bool),
    Integer(i32),
    BigInt(i64),
    Double(f64),
    Decimal(String),
    String(String),
    Binary(Vec<u8>),
}

impl ParamValue {
    /// Converts a host scalar. Arrays and objects are not values.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(ParamValue::Null),
            Value::Bool(b) => Ok(ParamValue::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(match i32::try_from(i) {
                        Ok(small) => ParamValue::Integer(small),
                        Err(_) => ParamValue::BigInt(i),
                    })
                } else if let Some(f) = n.as_f64() {
                    Ok(ParamValue::Double(f))
                } else {
                    Err(OdbcError::Usage(format!("Unsupported numeric value: {}", n)))
                }
            }
            Value::String(s) => Ok(ParamValue::String(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(OdbcError::Usage(
                "Parameter value must be a scalar".to_string(),
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Integer(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::BigInt(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Double(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Boolean(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(v: Vec<u8>) -> Self {
        ParamValue::Binary(v)
    }
}
