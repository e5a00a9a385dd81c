//! Type signature grammar and parser.
//!
//! A signature is a compact ASCII string describing the shape of a marshaled
//! value sequence. The grammar is wire-compatible with D-Bus: single codes
//! for basic types (`b y n q i u x t d s o g h`), `a<T>` for array-of-T,
//! `(T1T2...)` for struct, `a{KV}` for dict with basic key K, and `v` for
//! variant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum container nesting depth accepted by the parser (wire limit).
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum length in bytes of a signature string.
pub const MAX_SIGNATURE_LEN: usize = 255;

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced while parsing a signature string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// A character that is not a known type code
    #[error("unknown type code '{0}'")]
    UnknownTypeCode(char),

    /// Signature ended inside an open container
    #[error("unexpected end of signature")]
    UnexpectedEof,

    /// A ')' with no matching '('
    #[error("unmatched ')' at offset {0}")]
    UnmatchedParen(usize),

    /// A '}' with no matching '{'
    #[error("unmatched '}}' at offset {0}")]
    UnmatchedBrace(usize),

    /// A '{' not immediately preceded by 'a'
    #[error("dict entry at offset {0} must be the element of an array")]
    DictEntryOutsideArray(usize),

    /// Dict key was a container type
    #[error("dict key must be a basic type, got '{0}'")]
    DictKeyNotBasic(char),

    /// A struct with no fields
    #[error("empty struct at offset {0}")]
    EmptyStruct(usize),

    /// Container nesting exceeded the wire limit
    #[error("container nesting exceeds {MAX_NESTING_DEPTH} levels")]
    TooDeep,

    /// Signature string exceeded the wire limit
    #[error("signature exceeds {MAX_SIGNATURE_LEN} bytes")]
    TooLong,

    /// Input continued after a single complete type was requested
    #[error("trailing characters after complete type")]
    TrailingGarbage,

    /// A single complete type was requested but the input was empty
    #[error("expected exactly one complete type")]
    NotSingleType,
}

// ============================================================================
// Type Nodes
// ============================================================================

/// One node of a parsed type signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeNode {
    Bool,
    Byte,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    Str,
    ObjectPath,
    SignatureStr,
    Handle,
    /// `a<T>`: ordered sequence of one element type
    Array(Box<TypeNode>),
    /// `(T1T2...)`: fixed fields in declared order
    Struct(Vec<TypeNode>),
    /// `a{KV}`: mapping with a basic key type
    Dict(Box<TypeNode>, Box<TypeNode>),
    /// `v`: carries its own embedded signature alongside the value
    Variant,
}

impl TypeNode {
    /// Whether this node is a basic (non-container) type.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            TypeNode::Array(_) | TypeNode::Struct(_) | TypeNode::Dict(_, _) | TypeNode::Variant
        )
    }

    /// The single-character code for a basic type, if any.
    pub fn signature_char(&self) -> Option<char> {
        let c = match self {
            TypeNode::Bool => 'b',
            TypeNode::Byte => 'y',
            TypeNode::Int16 => 'n',
            TypeNode::Uint16 => 'q',
            TypeNode::Int32 => 'i',
            TypeNode::Uint32 => 'u',
            TypeNode::Int64 => 'x',
            TypeNode::Uint64 => 't',
            TypeNode::Double => 'd',
            TypeNode::Str => 's',
            TypeNode::ObjectPath => 'o',
            TypeNode::SignatureStr => 'g',
            TypeNode::Handle => 'h',
            TypeNode::Variant => 'v',
            _ => return None,
        };
        Some(c)
    }

    /// Render this node back into signature text.
    pub fn write_signature(&self, out: &mut String) {
        match self {
            TypeNode::Array(elem) => {
                out.push('a');
                elem.write_signature(out);
            }
            TypeNode::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.write_signature(out);
                }
                out.push(')');
            }
            TypeNode::Dict(key, value) => {
                out.push_str("a{");
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            other => {
                // All remaining nodes are single-character codes.
                if let Some(c) = other.signature_char() {
                    out.push(c);
                }
            }
        }
    }

    /// The signature text for this single node.
    pub fn signature_string(&self) -> String {
        let mut s = String::new();
        self.write_signature(&mut s);
        s
    }
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature_string())
    }
}

// ============================================================================
// Signature
// ============================================================================

/// An ordered sequence of type nodes parsed from a signature string.
///
/// The empty signature is valid and describes zero values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature {
    nodes: Vec<TypeNode>,
}

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Parse a full signature string.
    ///
    /// The input must fully consume to EOF with brackets balanced.
    pub fn parse(input: &str) -> Result<Self, SignatureError> {
        if input.len() > MAX_SIGNATURE_LEN {
            return Err(SignatureError::TooLong);
        }

        let chars: Vec<char> = input.chars().collect();
        let mut pos = 0usize;
        let mut nodes = Vec::new();
        while pos < chars.len() {
            let node = parse_one(&chars, &mut pos, 0)?;
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    /// Parse a string that must contain exactly one complete type.
    ///
    /// Used for variant payload signatures and dict key checks.
    pub fn parse_single(input: &str) -> Result<TypeNode, SignatureError> {
        let sig = Self::parse(input)?;
        match sig.nodes.len() {
            1 => Ok(sig.nodes.into_iter().next().unwrap()),
            0 => Err(SignatureError::NotSingleType),
            _ => Err(SignatureError::TrailingGarbage),
        }
    }

    /// Build a signature from already-validated nodes.
    pub fn from_nodes(nodes: Vec<TypeNode>) -> Self {
        Self { nodes }
    }

    /// The parsed nodes in order.
    pub fn nodes(&self) -> &[TypeNode] {
        &self.nodes
    }

    /// Number of top-level types.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether this signature describes zero values.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Render the canonical signature text.
    pub fn text(&self) -> String {
        let mut s = String::new();
        for n in &self.nodes {
            n.write_signature(&mut s);
        }
        s
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Parse one complete type starting at `pos`, advancing `pos` past it.
fn parse_one(chars: &[char], pos: &mut usize, depth: usize) -> Result<TypeNode, SignatureError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(SignatureError::TooDeep);
    }

    let c = *chars.get(*pos).ok_or(SignatureError::UnexpectedEof)?;
    *pos += 1;

    match c {
        'b' => Ok(TypeNode::Bool),
        'y' => Ok(TypeNode::Byte),
        'n' => Ok(TypeNode::Int16),
        'q' => Ok(TypeNode::Uint16),
        'i' => Ok(TypeNode::Int32),
        'u' => Ok(TypeNode::Uint32),
        'x' => Ok(TypeNode::Int64),
        't' => Ok(TypeNode::Uint64),
        'd' => Ok(TypeNode::Double),
        's' => Ok(TypeNode::Str),
        'o' => Ok(TypeNode::ObjectPath),
        'g' => Ok(TypeNode::SignatureStr),
        'h' => Ok(TypeNode::Handle),
        'v' => Ok(TypeNode::Variant),
        'a' => {
            // Array element, or dict entry when followed by '{'.
            match chars.get(*pos) {
                Some('{') => {
                    let brace_at = *pos;
                    *pos += 1;
                    let key = parse_one(chars, pos, depth + 1)?;
                    if !key.is_basic() {
                        let key_char = chars
                            .get(brace_at + 1)
                            .copied()
                            .unwrap_or('?');
                        return Err(SignatureError::DictKeyNotBasic(key_char));
                    }
                    let value = parse_one(chars, pos, depth + 1)?;
                    match chars.get(*pos) {
                        Some('}') => {
                            *pos += 1;
                            Ok(TypeNode::Dict(Box::new(key), Box::new(value)))
                        }
                        Some(_) => Err(SignatureError::UnmatchedBrace(brace_at)),
                        None => Err(SignatureError::UnexpectedEof),
                    }
                }
                Some(_) => {
                    let elem = parse_one(chars, pos, depth + 1)?;
                    Ok(TypeNode::Array(Box::new(elem)))
                }
                None => Err(SignatureError::UnexpectedEof),
            }
        }
        '(' => {
            let open_at = *pos - 1;
            let mut fields = Vec::new();
            loop {
                match chars.get(*pos) {
                    Some(')') => {
                        *pos += 1;
                        if fields.is_empty() {
                            return Err(SignatureError::EmptyStruct(open_at));
                        }
                        return Ok(TypeNode::Struct(fields));
                    }
                    Some(_) => {
                        fields.push(parse_one(chars, pos, depth + 1)?);
                    }
                    None => return Err(SignatureError::UnexpectedEof),
                }
            }
        }
        ')' => Err(SignatureError::UnmatchedParen(*pos - 1)),
        '{' => Err(SignatureError::DictEntryOutsideArray(*pos - 1)),
        '}' => Err(SignatureError::UnmatchedBrace(*pos - 1)),
        other => Err(SignatureError::UnknownTypeCode(other)),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
