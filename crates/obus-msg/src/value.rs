//! `MsgArg`: the tagged runtime representation of one signature-typed value.
//!
//! A `MsgArg` carries exactly the shape described by one [`TypeNode`]: a
//! scalar, an ordered sequence (array/struct), a mapping with unique scalar
//! keys (dict, insertion order irrelevant), or a (type, value) pair
//! (variant). A decoded tree's runtime shape always matches its originating
//! node exactly; shape checks fail rather than coerce.

use serde::{Deserialize, Serialize};

use crate::codec::MarshalError;
use crate::signature::{Signature, TypeNode};
use crate::validation::{validate_object_path, ValidationError};

// ============================================================================
// MsgArg
// ============================================================================

/// One marshaled value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MsgArg {
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
    SignatureStr(String),
    Handle(u64),
    /// Ordered sequence sharing a single element node
    Array { elem: TypeNode, items: Vec<MsgArg> },
    /// Fields in declared order
    Struct(Vec<MsgArg>),
    /// Unique scalar keys; insertion order is irrelevant for equality
    Dict {
        key: TypeNode,
        value: TypeNode,
        entries: Vec<(MsgArg, MsgArg)>,
    },
    /// Carries its own embedded type node alongside the value
    Variant { node: TypeNode, value: Box<MsgArg> },
}

impl MsgArg {
    /// Reconstruct the type node this value was marshaled against.
    pub fn type_node(&self) -> TypeNode {
        match self {
            MsgArg::Bool(_) => TypeNode::Bool,
            MsgArg::Byte(_) => TypeNode::Byte,
            MsgArg::Int16(_) => TypeNode::Int16,
            MsgArg::Uint16(_) => TypeNode::Uint16,
            MsgArg::Int32(_) => TypeNode::Int32,
            MsgArg::Uint32(_) => TypeNode::Uint32,
            MsgArg::Int64(_) => TypeNode::Int64,
            MsgArg::Uint64(_) => TypeNode::Uint64,
            MsgArg::Double(_) => TypeNode::Double,
            MsgArg::Str(_) => TypeNode::Str,
            MsgArg::ObjectPath(_) => TypeNode::ObjectPath,
            MsgArg::SignatureStr(_) => TypeNode::SignatureStr,
            MsgArg::Handle(_) => TypeNode::Handle,
            MsgArg::Array { elem, .. } => TypeNode::Array(Box::new(elem.clone())),
            MsgArg::Struct(fields) => {
                TypeNode::Struct(fields.iter().map(MsgArg::type_node).collect())
            }
            MsgArg::Dict { key, value, .. } => {
                TypeNode::Dict(Box::new(key.clone()), Box::new(value.clone()))
            }
            MsgArg::Variant { .. } => TypeNode::Variant,
        }
    }

    /// Confirm this tree's runtime shape matches `node` exactly.
    ///
    /// Mismatch is an error, never a coercion. Array items are checked
    /// against the shared element node, dict entries against the key/value
    /// nodes, struct fields against the declared field list, and a variant
    /// payload against its own embedded node.
    pub fn check_against(&self, node: &TypeNode) -> Result<(), MarshalError> {
        match (self, node) {
            (MsgArg::Bool(_), TypeNode::Bool)
            | (MsgArg::Byte(_), TypeNode::Byte)
            | (MsgArg::Int16(_), TypeNode::Int16)
            | (MsgArg::Uint16(_), TypeNode::Uint16)
            | (MsgArg::Int32(_), TypeNode::Int32)
            | (MsgArg::Uint32(_), TypeNode::Uint32)
            | (MsgArg::Int64(_), TypeNode::Int64)
            | (MsgArg::Uint64(_), TypeNode::Uint64)
            | (MsgArg::Double(_), TypeNode::Double)
            | (MsgArg::Str(_), TypeNode::Str)
            | (MsgArg::Handle(_), TypeNode::Handle) => Ok(()),

            (MsgArg::ObjectPath(p), TypeNode::ObjectPath) => validate_object_path(p)
                .map_err(|e: ValidationError| MarshalError::InvalidObjectPath(e.to_string())),

            (MsgArg::SignatureStr(s), TypeNode::SignatureStr) => Signature::parse(s)
                .map(|_| ())
                .map_err(MarshalError::Signature),

            (MsgArg::Array { elem, items }, TypeNode::Array(expected_elem)) => {
                if elem != expected_elem.as_ref() {
                    return Err(MarshalError::mismatch(node, &self.type_node()));
                }
                for item in items {
                    item.check_against(elem)?;
                }
                Ok(())
            }

            (MsgArg::Struct(fields), TypeNode::Struct(expected_fields)) => {
                if fields.len() != expected_fields.len() {
                    return Err(MarshalError::ArityMismatch {
                        expected: expected_fields.len(),
                        found: fields.len(),
                    });
                }
                for (field, expected) in fields.iter().zip(expected_fields) {
                    field.check_against(expected)?;
                }
                Ok(())
            }

            (
                MsgArg::Dict {
                    key,
                    value,
                    entries,
                },
                TypeNode::Dict(expected_key, expected_value),
            ) => {
                if key != expected_key.as_ref() || value != expected_value.as_ref() {
                    return Err(MarshalError::mismatch(node, &self.type_node()));
                }
                for (k, v) in entries {
                    k.check_against(key)?;
                    v.check_against(value)?;
                }
                for (i, (k, _)) in entries.iter().enumerate() {
                    if entries[i + 1..].iter().any(|(other, _)| other == k) {
                        return Err(MarshalError::DuplicateDictKey);
                    }
                }
                Ok(())
            }

            (MsgArg::Variant { node: inner, value }, TypeNode::Variant) => {
                value.check_against(inner)
            }

            _ => Err(MarshalError::mismatch(node, &self.type_node())),
        }
    }

    /// Compute the signature of an argument list.
    pub fn signature_of(args: &[MsgArg]) -> Signature {
        Signature::from_nodes(args.iter().map(MsgArg::type_node).collect())
    }
}

// Dict equality is order-insensitive; everything else is structural.
impl PartialEq for MsgArg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MsgArg::Bool(a), MsgArg::Bool(b)) => a == b,
            (MsgArg::Byte(a), MsgArg::Byte(b)) => a == b,
            (MsgArg::Int16(a), MsgArg::Int16(b)) => a == b,
            (MsgArg::Uint16(a), MsgArg::Uint16(b)) => a == b,
            (MsgArg::Int32(a), MsgArg::Int32(b)) => a == b,
            (MsgArg::Uint32(a), MsgArg::Uint32(b)) => a == b,
            (MsgArg::Int64(a), MsgArg::Int64(b)) => a == b,
            (MsgArg::Uint64(a), MsgArg::Uint64(b)) => a == b,
            (MsgArg::Double(a), MsgArg::Double(b)) => a == b,
            (MsgArg::Str(a), MsgArg::Str(b)) => a == b,
            (MsgArg::ObjectPath(a), MsgArg::ObjectPath(b)) => a == b,
            (MsgArg::SignatureStr(a), MsgArg::SignatureStr(b)) => a == b,
            (MsgArg::Handle(a), MsgArg::Handle(b)) => a == b,
            (
                MsgArg::Array { elem: ea, items: ia },
                MsgArg::Array { elem: eb, items: ib },
            ) => ea == eb && ia == ib,
            (MsgArg::Struct(a), MsgArg::Struct(b)) => a == b,
            (
                MsgArg::Dict {
                    key: ka,
                    value: va,
                    entries: ea,
                },
                MsgArg::Dict {
                    key: kb,
                    value: vb,
                    entries: eb,
                },
            ) => {
                ka == kb
                    && va == vb
                    && ea.len() == eb.len()
                    && ea
                        .iter()
                        .all(|(k, v)| eb.iter().any(|(k2, v2)| k == k2 && v == v2))
            }
            (
                MsgArg::Variant { node: na, value: va },
                MsgArg::Variant { node: nb, value: vb },
            ) => na == nb && va == vb,
            _ => false,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
