//! The runtime value model used to drive the marshaller and unmarshaller.
//!
//! D-Bus values are a tagged sum mirroring [`Element`](crate::signature::Element):
//! every container case holds further [`Value`]s, and [`Variant`] pairs a
//! single complete signature with the value it describes.

use std::fmt;

use crate::object_path::ObjectPathBuf;
use crate::signature::Signature;

/// A self-describing value: a signature paired with the payload it shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    signature: Signature,
    value: Box<Value>,
}

impl Variant {
    /// Construct a new variant, pairing a single-element signature with a
    /// value shaped like it.
    pub fn new(signature: Signature, value: Value) -> Variant {
        Variant {
            signature,
            value: Box::new(value),
        }
    }

    /// The signature describing this variant's payload.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The payload of this variant.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume this variant, returning its value.
    pub fn into_value(self) -> Value {
        *self.value
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.signature, self.value)
    }
}

/// A decoded or to-be-encoded D-Bus value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `y`
    Byte(u8),
    /// `b`
    Bool(bool),
    /// `n`
    Int16(i16),
    /// `q`
    Uint16(u16),
    /// `i`
    Int32(i32),
    /// `u`
    Uint32(u32),
    /// `x`
    Int64(i64),
    /// `t`
    Uint64(u64),
    /// `d`
    Double(f64),
    /// `s`
    Str(String),
    /// `o`
    ObjectPath(ObjectPathBuf),
    /// `g`
    Signature(Signature),
    /// `v`
    Variant(Variant),
    /// `h`
    UnixFd(u32),
    /// `a<e>`
    Array(Vec<Value>),
    /// `a{kv}`, as a flat list of `(key, value)` pairs.
    Dict(Vec<(Value, Value)>),
    /// `(e1 e2 ...)`
    Struct(Vec<Value>),
}

impl Value {
    /// A human-readable name of this value's shape, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int16",
            Value::Uint16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object_path",
            Value::Signature(_) => "signature",
            Value::Variant(_) => "variant",
            Value::UnixFd(_) => "unix_fd",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
        }
    }

    /// Borrow this value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            _ => None,
        }
    }

    /// Borrow this value as a `u32`, if it is one.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Uint16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Uint32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::ObjectPath(v) => write!(f, "{v}"),
            Value::Signature(v) => write!(f, "{v}"),
            Value::Variant(v) => write!(f, "{v}"),
            Value::UnixFd(v) => write!(f, "{v}"),
            Value::Array(items) => {
                f.write_str("[")?;

                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }

                    write!(f, "{item}")?;
                }

                f.write_str("]")
            }
            Value::Dict(entries) => {
                f.write_str("{")?;

                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }

                    write!(f, "{key}: {value}")?;
                }

                f.write_str("}")
            }
            Value::Struct(fields) => {
                f.write_str("(")?;

                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }

                    write!(f, "{field}")?;
                }

                f.write_str(")")
            }
        }
    }
}
