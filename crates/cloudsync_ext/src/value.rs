//! Host values and typed conversions.
//!
//! The host hands arguments over as dynamically typed values, the way an
//! embedding database passes SQL function arguments. Handlers convert them
//! with [`FromHostValue`] and return anything that converts into a
//! [`HostValue`].

use crate::error::{BridgeError, BridgeResult};

/// A dynamically typed value crossing the host boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// SQL-style NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl HostValue {
    /// Name of the value's type, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Null => "null",
            HostValue::Integer(_) => "integer",
            HostValue::Real(_) => "real",
            HostValue::Text(_) => "text",
            HostValue::Blob(_) => "blob",
        }
    }

    /// Returns true for [`HostValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null)
    }
}

/// Conversion from a host value.
pub trait FromHostValue: Sized {
    /// Type name reported when the conversion fails.
    const EXPECTED: &'static str;

    /// Converts, or returns `None` if the value has the wrong type.
    fn from_host_value(value: &HostValue) -> Option<Self>;
}

impl FromHostValue for i64 {
    const EXPECTED: &'static str = "integer";

    fn from_host_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromHostValue for f64 {
    const EXPECTED: &'static str = "real";

    #[allow(clippy::cast_precision_loss)]
    fn from_host_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Real(r) => Some(*r),
            HostValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromHostValue for bool {
    const EXPECTED: &'static str = "integer";

    fn from_host_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl FromHostValue for String {
    const EXPECTED: &'static str = "text";

    fn from_host_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Text and blobs both convert to bytes; keys and values may be either.
impl FromHostValue for Vec<u8> {
    const EXPECTED: &'static str = "blob or text";

    fn from_host_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Blob(b) => Some(b.clone()),
            HostValue::Text(s) => Some(s.clone().into_bytes()),
            _ => None,
        }
    }
}

impl<T: FromHostValue> FromHostValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_host_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Null => Some(None),
            other => T::from_host_value(other).map(Some),
        }
    }
}

/// Converts argument `index` of `function`.
///
/// # Errors
///
/// Returns [`BridgeError::Type`] if the argument has the wrong type, or
/// [`BridgeError::Arity`] if it is missing.
pub fn arg<T: FromHostValue>(function: &str, args: &[HostValue], index: usize) -> BridgeResult<T> {
    let value = args.get(index).ok_or_else(|| BridgeError::Arity {
        function: function.to_string(),
        expected: index + 1,
        got: args.len(),
    })?;
    T::from_host_value(value).ok_or_else(|| BridgeError::Type {
        function: function.to_string(),
        index,
        expected: T::EXPECTED,
        got: value.type_name(),
    })
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        HostValue::Integer(v)
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Integer(i64::from(v))
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Real(v)
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        HostValue::Text(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        HostValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        HostValue::Blob(v)
    }
}

impl From<()> for HostValue {
    fn from((): ()) -> Self {
        HostValue::Null
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(HostValue::Null, Into::into)
    }
}
