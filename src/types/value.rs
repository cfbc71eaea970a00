//! Scalar values exchanged with the server in text format

use crate::{Error, Result};
use std::fmt::Write as _;

/// Type OIDs decoded into something other than [`Value::Text`]
pub mod oid {
    /// bool
    pub const BOOL: u32 = 16;
    /// bytea
    pub const BYTEA: u32 = 17;
    /// int8
    pub const INT8: u32 = 20;
    /// int2
    pub const INT2: u32 = 21;
    /// int4
    pub const INT4: u32 = 23;
    /// oid
    pub const OID: u32 = 26;
    /// float4
    pub const FLOAT4: u32 = 700;
    /// float8
    pub const FLOAT8: u32 = 701;
    /// numeric
    pub const NUMERIC: u32 = 1700;
}

/// A single parameter or column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// bool
    Bool(bool),
    /// Any integer type
    Int(i64),
    /// float4 / float8
    Float(f64),
    /// numeric, kept as its exact decimal text
    Numeric(String),
    /// Text and every type without a dedicated variant
    Text(String),
    /// bytea
    Bytes(Vec<u8>),
}

impl Value {
    /// Whether this is SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text-format wire encoding (`None` = NULL)
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { b"true".to_vec() } else { b"false".to_vec() }),
            Value::Int(i) => Some(i.to_string().into_bytes()),
            Value::Float(f) => Some(float_text(*f).into_bytes()),
            Value::Numeric(n) => Some(n.clone().into_bytes()),
            Value::Text(s) => Some(s.clone().into_bytes()),
            Value::Bytes(b) => {
                let mut out = String::with_capacity(2 + b.len() * 2);
                out.push_str("\\x");
                for byte in b {
                    let _ = write!(out, "{:02x}", byte);
                }
                Some(out.into_bytes())
            }
        }
    }

    /// Decode a text-format column value by type OID
    pub fn from_text(type_oid: u32, raw: Option<&[u8]>) -> Result<Value> {
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(Value::Null),
        };
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::Column(format!("non UTF-8 text for type {}", type_oid)))?;

        let value = match type_oid {
            oid::BOOL => match text {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                other => return Err(Error::Column(format!("invalid bool '{}'", other))),
            },
            oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
                .parse()
                .map(Value::Int)
                .map_err(|_| Error::Column(format!("invalid integer '{}'", text)))?,
            oid::FLOAT4 | oid::FLOAT8 => Value::Float(parse_float(text)?),
            oid::NUMERIC => Value::Numeric(text.to_string()),
            oid::BYTEA => Value::Bytes(decode_bytea(text)?),
            _ => Value::Text(text.to_string()),
        };
        Ok(value)
    }
}

fn float_text(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

fn parse_float(text: &str) -> Result<f64> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse()
            .map_err(|_| Error::Column(format!("invalid float '{}'", text))),
    }
}

fn decode_bytea(text: &str) -> Result<Vec<u8>> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| Error::Column("bytea is not in hex format".into()))?;
    if hex.len() % 2 != 0 {
        return Err(Error::Column("odd-length bytea hex".into()));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(Error::Column(format!(
                "invalid bytea hex '{}'",
                String::from_utf8_lossy(pair)
            ))),
        })
        .collect()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v.into())
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Conversion out of a column [`Value`]
pub trait FromValue: Sized {
    /// Convert, failing on NULL or a type mismatch
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(want: &str, got: &Value) -> Error {
    match got {
        Value::Null => Error::Column(format!("unexpected NULL, expected {}", want)),
        other => Error::Column(format!("cannot read {:?} as {}", other, want)),
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Numeric(n) => n.parse().map_err(|_| mismatch("i64", value)),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| Error::Column(format!("{} out of range for i32", wide)))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Numeric(n) => n.parse().map_err(|_| mismatch("f64", value)),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Numeric(s) => Ok(s.clone()),
            other => Err(mismatch("String", other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(mismatch("bytes", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
