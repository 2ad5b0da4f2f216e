//! Typed parameter and result values, and their self-describing textual
//! encoding.
//!
//! On disk every value is a `{type, value}` pair: `type` names the primitive
//! (`boolean`, `uint64`, `sint64`, `real64`, `string`, `datetime`,
//! `reference`), with a `[]` suffix for arrays, and `value` holds the printed
//! text (a list of printed texts for arrays).
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::ValueError;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(into = "TaggedValue", try_from = "TaggedValue")]
pub enum Value {
    Boolean(bool),
    Uint64(u64),
    Sint64(i64),
    Real64(f64),
    String(String),
    DateTime(DateTime<Utc>),
    /// Path of another managed object.
    Reference(String),
    BooleanArray(Vec<bool>),
    Uint64Array(Vec<u64>),
    Sint64Array(Vec<i64>),
    Real64Array(Vec<f64>),
    StringArray(Vec<String>),
    DateTimeArray(Vec<DateTime<Utc>>),
    ReferenceArray(Vec<String>),
}

/// Primitive type of a value, shared by scalars and arrays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType {
    Boolean,
    Uint64,
    Sint64,
    Real64,
    String,
    DateTime,
    Reference,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        use ValueType::*;

        match self {
            Boolean => "boolean",
            Uint64 => "uint64",
            Sint64 => "sint64",
            Real64 => "real64",
            String => "string",
            DateTime => "datetime",
            Reference => "reference",
        }
    }

    fn tag(self, is_array: bool) -> std::string::String {
        if is_array {
            format!("{}[]", self.as_str())
        } else {
            self.as_str().to_owned()
        }
    }

    fn parse<T: FromStr>(self, text: &str) -> Result<T, ValueError> {
        text.parse().map_err(|_| ValueError::BadText {
            ty: self.as_str().to_owned(),
            text: text.to_owned(),
        })
    }

    fn parse_datetime(self, text: &str) -> Result<DateTime<Utc>, ValueError> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ValueError::BadText {
                ty: self.as_str().to_owned(),
                text: text.to_owned(),
            })
    }

    fn parse_scalar(self, text: &str) -> Result<Value, ValueError> {
        use ValueType::*;

        Ok(match self {
            Boolean => Value::Boolean(self.parse(text)?),
            Uint64 => Value::Uint64(self.parse(text)?),
            Sint64 => Value::Sint64(self.parse(text)?),
            Real64 => Value::Real64(self.parse(text)?),
            String => Value::String(text.to_owned()),
            DateTime => Value::DateTime(self.parse_datetime(text)?),
            Reference => Value::Reference(text.to_owned()),
        })
    }

    fn parse_array(
        self,
        items: &[std::string::String],
    ) -> Result<Value, ValueError> {
        use ValueType::*;

        let texts = items.iter().map(|s| s.as_str());
        Ok(match self {
            Boolean => Value::BooleanArray(
                texts.map(|t| self.parse(t)).collect::<Result<_, _>>()?,
            ),
            Uint64 => Value::Uint64Array(
                texts.map(|t| self.parse(t)).collect::<Result<_, _>>()?,
            ),
            Sint64 => Value::Sint64Array(
                texts.map(|t| self.parse(t)).collect::<Result<_, _>>()?,
            ),
            Real64 => Value::Real64Array(
                texts.map(|t| self.parse(t)).collect::<Result<_, _>>()?,
            ),
            String => Value::StringArray(items.to_vec()),
            DateTime => Value::DateTimeArray(
                texts
                    .map(|t| self.parse_datetime(t))
                    .collect::<Result<_, _>>()?,
            ),
            Reference => Value::ReferenceArray(items.to_vec()),
        })
    }
}

impl FromStr for ValueType {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ValueType::*;

        Ok(match s {
            "boolean" => Boolean,
            "uint64" => Uint64,
            "sint64" => Sint64,
            "real64" => Real64,
            "string" => String,
            "datetime" => DateTime,
            "reference" => Reference,
            _ => return Err(ValueError::UnknownType(s.to_owned())),
        })
    }
}

/// The persisted form of a [`Value`].
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TaggedValue {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: Printed,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Printed {
    Scalar(String),
    Array(Vec<String>),
}

fn print_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn scalar<T: ToString>(v: &T) -> Printed {
    Printed::Scalar(v.to_string())
}

fn array<T: ToString>(v: &[T]) -> Printed {
    Printed::Array(v.iter().map(ToString::to_string).collect())
}

impl Value {
    /// Primitive type, and whether this is an array of it.
    pub fn value_type(&self) -> (ValueType, bool) {
        use Value::*;

        match self {
            Boolean(_) => (ValueType::Boolean, false),
            Uint64(_) => (ValueType::Uint64, false),
            Sint64(_) => (ValueType::Sint64, false),
            Real64(_) => (ValueType::Real64, false),
            String(_) => (ValueType::String, false),
            DateTime(_) => (ValueType::DateTime, false),
            Reference(_) => (ValueType::Reference, false),
            BooleanArray(_) => (ValueType::Boolean, true),
            Uint64Array(_) => (ValueType::Uint64, true),
            Sint64Array(_) => (ValueType::Sint64, true),
            Real64Array(_) => (ValueType::Real64, true),
            StringArray(_) => (ValueType::String, true),
            DateTimeArray(_) => (ValueType::DateTime, true),
            ReferenceArray(_) => (ValueType::Reference, true),
        }
    }

    pub fn to_tagged(&self) -> TaggedValue {
        use Value::*;

        let value = match self {
            Boolean(v) => scalar(v),
            Uint64(v) => scalar(v),
            Sint64(v) => scalar(v),
            Real64(v) => scalar(v),
            String(v) | Reference(v) => Printed::Scalar(v.clone()),
            DateTime(v) => Printed::Scalar(print_datetime(v)),
            BooleanArray(v) => array(v),
            Uint64Array(v) => array(v),
            Sint64Array(v) => array(v),
            Real64Array(v) => array(v),
            StringArray(v) | ReferenceArray(v) => Printed::Array(v.clone()),
            DateTimeArray(v) => {
                Printed::Array(v.iter().map(print_datetime).collect())
            },
        };
        let (ty, is_array) = self.value_type();

        TaggedValue {
            ty: ty.tag(is_array),
            value,
        }
    }

    pub fn reference(path: impl Into<String>) -> Self {
        Self::Reference(path.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Reference(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Uint64(v) => Some(v),
            Self::Sint64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Sint64(v) => Some(v),
            Self::Uint64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Boolean(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for TaggedValue {
    fn from(value: Value) -> Self {
        value.to_tagged()
    }
}

impl TryFrom<TaggedValue> for Value {
    type Error = ValueError;

    fn try_from(tagged: TaggedValue) -> Result<Self, Self::Error> {
        let (base, is_array) = match tagged.ty.strip_suffix("[]") {
            Some(base) => (base, true),
            None => (tagged.ty.as_str(), false),
        };
        let ty: ValueType = base
            .parse()
            .map_err(|_| ValueError::UnknownType(tagged.ty.clone()))?;

        match (is_array, &tagged.value) {
            (false, Printed::Scalar(text)) => ty.parse_scalar(text),
            (true, Printed::Array(items)) => ty.parse_array(items),
            (false, Printed::Array(_)) => {
                Err(ValueError::ExpectedScalar(tagged.ty))
            },
            (true, Printed::Scalar(_)) => {
                Err(ValueError::ExpectedArray(tagged.ty))
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_tagged().value {
            Printed::Scalar(s) => f.write_str(&s),
            Printed::Array(items) => write!(f, "[{}]", items.iter().join(", ")),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Uint64(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Sint64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Sint64(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Self::StringArray(v)
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Self::StringArray(v.into_iter().map(str::to_owned).collect())
    }
}

impl From<Vec<u64>> for Value {
    fn from(v: Vec<u64>) -> Self {
        Self::Uint64Array(v)
    }
}
