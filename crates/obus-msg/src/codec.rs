//! Value codec: marshals host values against a type signature.
//!
//! This is the single mechanism used for every method argument, return
//! value, signal argument, and property value. `encode` is total over values
//! whose shape matches the node and rejects every value of the wrong shape
//! with a typed error; `decode` is total over well-formed `MsgArg` trees and
//! `decode(encode(v, n)) == v` holds for every `v` matching `n`.

use thiserror::Error;

use crate::signature::{Signature, SignatureError, TypeNode};
use crate::validation::validate_object_path;
use crate::value::MsgArg;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while marshaling values.
///
/// These are malformed-call errors: raised synchronously at the call site,
/// never sent over the wire.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarshalError {
    /// Value shape does not match the signature node
    #[error("type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// Wrong number of values for the signature
    #[error("argument count mismatch: expected {expected}, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    /// Dict contained the same key twice
    #[error("duplicate dict key")]
    DuplicateDictKey,

    /// An object-path payload failed syntactic validation
    #[error("invalid object path: {0}")]
    InvalidObjectPath(String),

    /// A signature-string payload failed to parse
    #[error("invalid signature payload: {0}")]
    Signature(#[from] SignatureError),

    /// A required dictionary entry was absent
    #[error("missing required entry '{0}'")]
    MissingEntry(String),
}

impl MarshalError {
    pub(crate) fn mismatch(expected: &TypeNode, found: &TypeNode) -> Self {
        MarshalError::TypeMismatch {
            expected: expected.signature_string(),
            found: found.signature_string(),
        }
    }

    fn mismatch_value(expected: &TypeNode, found: &Value) -> Self {
        MarshalError::TypeMismatch {
            expected: expected.signature_string(),
            found: found.kind().to_string(),
        }
    }
}

// ============================================================================
// Host Values
// ============================================================================

/// A host-facing dynamic value, prior to marshaling.
///
/// Containers are untyped on the host side; the signature node supplies the
/// wire type at encode time. A variant is the exception: it carries its own
/// node, and is opaque to its containing node.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Handle(u64),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Variant { node: TypeNode, value: Box<Value> },
}

impl Value {
    /// Short label used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Byte(_) => "byte",
            Value::Int16(_) => "int16",
            Value::Uint16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::Handle(_) => "handle",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant { .. } => "variant",
        }
    }

    /// Convenience accessor for string payloads.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

// Dicts compare order-insensitively, mirroring MsgArg.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Uint16(a), Value::Uint16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Uint32(a), Value::Uint32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Uint64(a), Value::Uint64(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::ObjectPath(a), Value::ObjectPath(b)) => a == b,
            (Value::Signature(a), Value::Signature(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.iter().any(|(k2, v2)| k == k2 && v == v2))
            }
            (
                Value::Variant { node: na, value: va },
                Value::Variant { node: nb, value: vb },
            ) => na == nb && va == vb,
            _ => false,
        }
    }
}

// ============================================================================
// Encode
// ============================================================================

/// Marshal one host value against one signature node.
pub fn encode(value: &Value, node: &TypeNode) -> Result<MsgArg, MarshalError> {
    match (node, value) {
        (TypeNode::Bool, Value::Bool(b)) => Ok(MsgArg::Bool(*b)),
        (TypeNode::Byte, Value::Byte(b)) => Ok(MsgArg::Byte(*b)),
        (TypeNode::Int16, Value::Int16(v)) => Ok(MsgArg::Int16(*v)),
        (TypeNode::Uint16, Value::Uint16(v)) => Ok(MsgArg::Uint16(*v)),
        (TypeNode::Int32, Value::Int32(v)) => Ok(MsgArg::Int32(*v)),
        (TypeNode::Uint32, Value::Uint32(v)) => Ok(MsgArg::Uint32(*v)),
        (TypeNode::Int64, Value::Int64(v)) => Ok(MsgArg::Int64(*v)),
        (TypeNode::Uint64, Value::Uint64(v)) => Ok(MsgArg::Uint64(*v)),
        (TypeNode::Double, Value::Double(v)) => Ok(MsgArg::Double(*v)),
        (TypeNode::Str, Value::Str(s)) => Ok(MsgArg::Str(s.clone())),
        (TypeNode::Handle, Value::Handle(h)) => Ok(MsgArg::Handle(*h)),

        (TypeNode::ObjectPath, Value::ObjectPath(p)) => {
            validate_object_path(p)
                .map_err(|e| MarshalError::InvalidObjectPath(e.to_string()))?;
            Ok(MsgArg::ObjectPath(p.clone()))
        }

        (TypeNode::SignatureStr, Value::Signature(s)) => {
            Signature::parse(s)?;
            Ok(MsgArg::SignatureStr(s.clone()))
        }

        (TypeNode::Array(elem), Value::Array(items)) => {
            let mut encoded = Vec::with_capacity(items.len());
            for item in items {
                encoded.push(encode(item, elem)?);
            }
            Ok(MsgArg::Array {
                elem: elem.as_ref().clone(),
                items: encoded,
            })
        }

        (TypeNode::Struct(fields), Value::Struct(values)) => {
            if values.len() != fields.len() {
                return Err(MarshalError::ArityMismatch {
                    expected: fields.len(),
                    found: values.len(),
                });
            }
            let mut encoded = Vec::with_capacity(values.len());
            for (v, f) in values.iter().zip(fields) {
                encoded.push(encode(v, f)?);
            }
            Ok(MsgArg::Struct(encoded))
        }

        (TypeNode::Dict(key_node, value_node), Value::Dict(entries)) => {
            let mut encoded: Vec<(MsgArg, MsgArg)> = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let ek = encode(k, key_node)?;
                if encoded.iter().any(|(existing, _)| *existing == ek) {
                    return Err(MarshalError::DuplicateDictKey);
                }
                let ev = encode(v, value_node)?;
                encoded.push((ek, ev));
            }
            Ok(MsgArg::Dict {
                key: key_node.as_ref().clone(),
                value: value_node.as_ref().clone(),
                entries: encoded,
            })
        }

        (TypeNode::Variant, Value::Variant { node: inner, value }) => {
            let payload = encode(value, inner)?;
            Ok(MsgArg::Variant {
                node: inner.clone(),
                value: Box::new(payload),
            })
        }

        (expected, found) => Err(MarshalError::mismatch_value(expected, found)),
    }
}

/// Marshal an argument list against a full signature.
pub fn encode_all(values: &[Value], sig: &Signature) -> Result<Vec<MsgArg>, MarshalError> {
    if values.len() != sig.len() {
        return Err(MarshalError::ArityMismatch {
            expected: sig.len(),
            found: values.len(),
        });
    }
    values
        .iter()
        .zip(sig.nodes())
        .map(|(v, n)| encode(v, n))
        .collect()
}

// ============================================================================
// Decode
// ============================================================================

/// Unmarshal one `MsgArg` back into a host value. Total on well-formed trees.
pub fn decode(arg: &MsgArg) -> Value {
    match arg {
        MsgArg::Bool(b) => Value::Bool(*b),
        MsgArg::Byte(b) => Value::Byte(*b),
        MsgArg::Int16(v) => Value::Int16(*v),
        MsgArg::Uint16(v) => Value::Uint16(*v),
        MsgArg::Int32(v) => Value::Int32(*v),
        MsgArg::Uint32(v) => Value::Uint32(*v),
        MsgArg::Int64(v) => Value::Int64(*v),
        MsgArg::Uint64(v) => Value::Uint64(*v),
        MsgArg::Double(v) => Value::Double(*v),
        MsgArg::Str(s) => Value::Str(s.clone()),
        MsgArg::ObjectPath(p) => Value::ObjectPath(p.clone()),
        MsgArg::SignatureStr(s) => Value::Signature(s.clone()),
        MsgArg::Handle(h) => Value::Handle(*h),
        MsgArg::Array { items, .. } => Value::Array(items.iter().map(decode).collect()),
        MsgArg::Struct(fields) => Value::Struct(fields.iter().map(decode).collect()),
        MsgArg::Dict { entries, .. } => Value::Dict(
            entries
                .iter()
                .map(|(k, v)| (decode(k), decode(v)))
                .collect(),
        ),
        MsgArg::Variant { node, value } => Value::Variant {
            node: node.clone(),
            value: Box::new(decode(value)),
        },
    }
}

/// Unmarshal an argument list.
pub fn decode_all(args: &[MsgArg]) -> Vec<Value> {
    args.iter().map(decode).collect()
}

// ============================================================================
// Unit Tests
// ============================================================================
