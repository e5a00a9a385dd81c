//! Wire format definitions for the obus object bus.
//!
//! This crate implements:
//! - The type signature grammar and its parser
//! - `MsgArg`, the tagged runtime representation of one signature-typed value
//! - The value codec that marshals host values against a signature
//! - The wire message model (method calls, replies, errors, signals)
//! - Name and object path validation

#![forbid(unsafe_code)]

pub mod codec;
pub mod message;
pub mod signature;
pub mod validation;
pub mod value;

pub use codec::{decode, decode_all, encode, encode_all, MarshalError, Value};
pub use message::{Message, MessageHeader, MessageType};
pub use signature::{Signature, SignatureError, TypeNode};
pub use value::MsgArg;
