//! Dynamically typed field values.
//!
//! Every read from a structure or packet produces a [`Value`], and every
//! write accepts one. Integers keep their signedness so that a 64-bit UINT
//! round-trips without loss.

use crate::error::{Error, Result};
use crate::structure::DataType;
use serde::Serialize;
use std::fmt;

/// A value read from or written to a packet field
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// No value (e.g. a derived item without a conversion)
    #[default]
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point number
    Float(f64),
    /// Text
    String(String),
    /// Raw bytes
    Block(Vec<u8>),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Returns true for Int, UInt and Float values
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::UInt(_) | Value::Float(_))
    }

    /// Returns true for Null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Integer value widened to i128; floats are not integers here
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::Int(v) => Some(v as i128),
            Value::UInt(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Text content for String values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte content for String and Block values
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Block(b) => Some(b),
            _ => None,
        }
    }

    /// Elements of an Array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Converts a value to an integer the way a field write does.
    ///
    /// Floats truncate toward zero and numeric strings are parsed
    /// (decimal, or hexadecimal with a `0x` prefix).
    pub fn to_integer(&self) -> Result<i128> {
        match self {
            Value::Int(v) => Ok(*v as i128),
            Value::UInt(v) => Ok(*v as i128),
            Value::Float(v) if v.is_finite() => Ok(v.trunc() as i128),
            Value::String(s) => parse_integer(s)
                .ok_or_else(|| Error::invalid_value("INTEGER", format!("'{}' is not an integer", s))),
            other => Err(Error::invalid_value(
                "INTEGER",
                format!("{} is not an integer", other.type_name()),
            )),
        }
    }

    /// Converts a value to a float the way a field write does
    pub fn to_float(&self) -> Result<f64> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::UInt(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::String(s) => parse_float(s)
                .ok_or_else(|| Error::invalid_value("FLOAT", format!("'{}' is not a number", s))),
            other => Err(Error::invalid_value(
                "FLOAT",
                format!("{} is not a number", other.type_name()),
            )),
        }
    }

    /// Compares two raw values, treating Int and UInt of equal magnitude as equal
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), b) | (b, Value::Float(a)) if b.is_numeric() => {
                b.as_f64().map(|b| b == *a).unwrap_or(false)
            }
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_i128() == b.as_i128(),
            (Value::String(a), Value::Block(b)) | (Value::Block(b), Value::String(a)) => {
                a.as_bytes() == b.as_slice()
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.raw_eq(y))
            }
            (a, b) => a == b,
        }
    }

    /// Short name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Block(_) => "block",
            Value::Array(_) => "array",
        }
    }

    /// Parses definition text into a value of the given data type.
    ///
    /// BLOCK text starting with `0x` is decoded as hex bytes.
    pub fn parse_for(data_type: DataType, text: &str) -> Result<Value> {
        match data_type {
            DataType::Int | DataType::Uint => {
                let v = parse_integer(text).ok_or_else(|| {
                    Error::invalid_value(data_type, format!("'{}' is not an integer", text))
                })?;
                Ok(Value::from_i128(v))
            }
            DataType::Float => parse_float(text)
                .map(Value::Float)
                .ok_or_else(|| Error::invalid_value(data_type, format!("'{}' is not a number", text))),
            DataType::String => Ok(Value::String(text.to_string())),
            DataType::Block => {
                if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    decode_hex(hex).map(Value::Block).ok_or_else(|| {
                        Error::invalid_value(data_type, format!("'{}' is not valid hex", text))
                    })
                } else {
                    Ok(Value::Block(text.as_bytes().to_vec()))
                }
            }
            DataType::Derived => {
                if let Some(v) = parse_integer(text) {
                    Ok(Value::from_i128(v))
                } else if let Some(v) = parse_float(text) {
                    Ok(Value::Float(v))
                } else {
                    Ok(Value::String(text.to_string()))
                }
            }
        }
    }

    /// Builds the narrowest integer variant holding `v`
    pub fn from_i128(v: i128) -> Value {
        if v <= i64::MAX as i128 {
            Value::Int(v as i64)
        } else {
            Value::UInt(v as u64)
        }
    }
}

/// Parses a decimal or `0x` hexadecimal integer, with optional sign
pub(crate) fn parse_integer(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i128::from_str_radix(&hex.replace('_', ""), 16).ok()?
    } else if let Some(bin) = digits
        .strip_prefix("0b")
        .or_else(|| digits.strip_prefix("0B"))
    {
        i128::from_str_radix(&bin.replace('_', ""), 2).ok()?
    } else {
        digits.replace('_', "").parse::<i128>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

/// Parses a float, accepting integer syntax as well
pub(crate) fn parse_float(text: &str) -> Option<f64> {
    let text = text.trim();
    match text.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => parse_integer(text).map(|v| v as f64),
    }
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let hex: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    let hex = if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex
    };
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::String(s) => f.write_str(s),
            Value::Block(b) => {
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{:02X}", byte)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Block(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Block(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_forms() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("-42"), Some(-42));
        assert_eq!(parse_integer("0x1ACF"), Some(0x1ACF));
        assert_eq!(parse_integer("0b101"), Some(5));
        assert_eq!(parse_integer("abc"), None);
    }

    #[test]
    fn test_raw_eq_mixed_signedness() {
        assert!(Value::Int(5).raw_eq(&Value::UInt(5)));
        assert!(!Value::Int(-1).raw_eq(&Value::UInt(u64::MAX)));
        assert!(Value::Float(2.0).raw_eq(&Value::Int(2)));
        assert!(Value::String("AB".into()).raw_eq(&Value::Block(vec![0x41, 0x42])));
    }

    #[test]
    fn test_parse_for_block_hex() {
        let v = Value::parse_for(DataType::Block, "0xDEADBEEF").unwrap();
        assert_eq!(v, Value::Block(vec![0xDE, 0xAD, 0xBE, 0xEF]));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Float(10.0).to_string(), "10.0");
        assert_eq!(Value::Block(vec![0x0A, 0xFF]).to_string(), "0A FF");
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Int(2)]).to_string(),
            "[1, 2]"
        );
    }

    #[test]
    fn test_to_integer_truncates_floats() {
        assert_eq!(Value::Float(2.9).to_integer().unwrap(), 2);
        assert_eq!(Value::Float(-2.9).to_integer().unwrap(), -2);
        assert!(Value::Block(vec![1]).to_integer().is_err());
    }
}
