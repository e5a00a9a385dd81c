//! Interface descriptions: named method/signal/property tables.
//!
//! An `InterfaceDescription` is built with `InterfaceBuilder`, validated at
//! build time, and frozen by `build()`. The returned `Arc` is immutable and
//! may be attached to any number of bus objects.

use std::sync::Arc;

use thiserror::Error;

use obus_msg::signature::{Signature, SignatureError, TypeNode};
use obus_msg::validation::{validate_interface_name, validate_member_name, ValidationError};

// ============================================================================
// Error Types
// ============================================================================

/// Errors building an interface description.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InterfaceError {
    #[error(transparent)]
    Name(#[from] ValidationError),

    #[error("bad signature for member '{member}': {source}")]
    BadSignature {
        member: String,
        source: SignatureError,
    },

    #[error("duplicate member '{0}'")]
    DuplicateMember(String),

    #[error("property signature must be a single complete type, got '{0}'")]
    PropertyNotSingleType(String),

    #[error("argument name count does not match signature for '{0}'")]
    ArgNameCount(String),
}

// ============================================================================
// Members
// ============================================================================

/// A rendered annotation, e.g. deprecation or no-reply markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

impl Annotation {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Standard annotation marking a method as expecting no reply.
pub const ANNOTATION_NO_REPLY: &str = "org.freedesktop.DBus.Method.NoReply";
/// Standard annotation marking a member as deprecated.
pub const ANNOTATION_DEPRECATED: &str = "org.freedesktop.DBus.Deprecated";

/// Property access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropAccess {
    Read,
    Write,
    ReadWrite,
}

impl PropAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            PropAccess::Read => "read",
            PropAccess::Write => "write",
            PropAccess::ReadWrite => "readwrite",
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, PropAccess::Read | PropAccess::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, PropAccess::Write | PropAccess::ReadWrite)
    }
}

/// A declared method.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub in_sig: Signature,
    pub out_sig: Signature,
    /// Input argument names followed by output argument names
    pub arg_names: Vec<String>,
    pub annotations: Vec<Annotation>,
    /// Declared NoReply: the caller gets no return and no timeout
    pub no_reply: bool,
}

/// A declared signal.
#[derive(Debug, Clone)]
pub struct SignalDef {
    pub name: String,
    pub sig: Signature,
    pub arg_names: Vec<String>,
    pub annotations: Vec<Annotation>,
}

/// A declared property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub sig: TypeNode,
    pub access: PropAccess,
    pub annotations: Vec<Annotation>,
}

// ============================================================================
// InterfaceDescription
// ============================================================================

/// An immutable, activated interface description.
#[derive(Debug)]
pub struct InterfaceDescription {
    pub name: String,
    pub methods: Vec<MethodDef>,
    pub signals: Vec<SignalDef>,
    pub properties: Vec<PropertyDef>,
    pub annotations: Vec<Annotation>,
    /// Calls on a secure interface require an authenticated peer
    pub secure: bool,
}

impl InterfaceDescription {
    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDef> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.method(name).is_some() || self.signal(name).is_some()
    }
}

// ============================================================================
// InterfaceBuilder
// ============================================================================

/// Builder for interface descriptions. Consumed by `build()`.
#[derive(Debug)]
pub struct InterfaceBuilder {
    name: String,
    methods: Vec<MethodDef>,
    signals: Vec<SignalDef>,
    properties: Vec<PropertyDef>,
    annotations: Vec<Annotation>,
    secure: bool,
}

impl InterfaceBuilder {
    /// Start a new interface. The name is validated here.
    pub fn new(name: &str) -> Result<Self, InterfaceError> {
        validate_interface_name(name)?;
        Ok(Self {
            name: name.to_string(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
            annotations: Vec::new(),
            secure: false,
        })
    }

    fn check_member(&self, name: &str) -> Result<(), InterfaceError> {
        validate_member_name(name)?;
        let taken = self.methods.iter().any(|m| m.name == name)
            || self.signals.iter().any(|s| s.name == name)
            || self.properties.iter().any(|p| p.name == name);
        if taken {
            return Err(InterfaceError::DuplicateMember(name.to_string()));
        }
        Ok(())
    }

    fn parse_sig(member: &str, text: &str) -> Result<Signature, InterfaceError> {
        Signature::parse(text).map_err(|source| InterfaceError::BadSignature {
            member: member.to_string(),
            source,
        })
    }

    /// Declare a method. `arg_names` covers inputs then outputs; pass `&[]`
    /// to omit names.
    pub fn add_method(
        mut self,
        name: &str,
        in_sig: &str,
        out_sig: &str,
        arg_names: &[&str],
    ) -> Result<Self, InterfaceError> {
        self.check_member(name)?;
        let in_sig = Self::parse_sig(name, in_sig)?;
        let out_sig = Self::parse_sig(name, out_sig)?;
        if !arg_names.is_empty() && arg_names.len() != in_sig.len() + out_sig.len() {
            return Err(InterfaceError::ArgNameCount(name.to_string()));
        }
        self.methods.push(MethodDef {
            name: name.to_string(),
            in_sig,
            out_sig,
            arg_names: arg_names.iter().map(|s| s.to_string()).collect(),
            annotations: Vec::new(),
            no_reply: false,
        });
        Ok(self)
    }

    /// Declare a signal.
    pub fn add_signal(
        mut self,
        name: &str,
        sig: &str,
        arg_names: &[&str],
    ) -> Result<Self, InterfaceError> {
        self.check_member(name)?;
        let sig = Self::parse_sig(name, sig)?;
        if !arg_names.is_empty() && arg_names.len() != sig.len() {
            return Err(InterfaceError::ArgNameCount(name.to_string()));
        }
        self.signals.push(SignalDef {
            name: name.to_string(),
            sig,
            arg_names: arg_names.iter().map(|s| s.to_string()).collect(),
            annotations: Vec::new(),
        });
        Ok(self)
    }

    /// Declare a property. The signature must be one complete type.
    pub fn add_property(
        mut self,
        name: &str,
        sig: &str,
        access: PropAccess,
    ) -> Result<Self, InterfaceError> {
        self.check_member(name)?;
        let node = Signature::parse_single(sig)
            .map_err(|_| InterfaceError::PropertyNotSingleType(sig.to_string()))?;
        self.properties.push(PropertyDef {
            name: name.to_string(),
            sig: node,
            access,
            annotations: Vec::new(),
        });
        Ok(self)
    }

    /// Attach an annotation to a previously declared member.
    ///
    /// `ANNOTATION_NO_REPLY` with value "true" on a method also sets its
    /// no-reply flag.
    pub fn annotate_member(
        mut self,
        member: &str,
        annotation: Annotation,
    ) -> Result<Self, InterfaceError> {
        if let Some(m) = self.methods.iter_mut().find(|m| m.name == member) {
            if annotation.name == ANNOTATION_NO_REPLY && annotation.value == "true" {
                m.no_reply = true;
            }
            m.annotations.push(annotation);
            return Ok(self);
        }
        if let Some(s) = self.signals.iter_mut().find(|s| s.name == member) {
            s.annotations.push(annotation);
            return Ok(self);
        }
        if let Some(p) = self.properties.iter_mut().find(|p| p.name == member) {
            p.annotations.push(annotation);
            return Ok(self);
        }
        Err(InterfaceError::DuplicateMember(format!(
            "no such member '{}'",
            member
        )))
    }

    /// Attach an interface-level annotation.
    pub fn annotate(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Mark the interface secure: calls require an authenticated peer.
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Freeze into an immutable, attachable description.
    pub fn build(self) -> Arc<InterfaceDescription> {
        Arc::new(InterfaceDescription {
            name: self.name,
            methods: self.methods,
            signals: self.signals,
            properties: self.properties,
            annotations: self.annotations,
            secure: self.secure,
        })
    }
}

// ============================================================================
// Built-in Interfaces
// ============================================================================

/// Interface and member names for the generated built-ins.
pub mod builtin {
    pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
    pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
    pub const PEER: &str = "org.freedesktop.DBus.Peer";

    pub const INTROSPECT: &str = "Introspect";
    pub const GET: &str = "Get";
    pub const SET: &str = "Set";
    pub const GET_ALL: &str = "GetAll";
    pub const PING: &str = "Ping";
    pub const GET_MACHINE_ID: &str = "GetMachineId";
}

/// `org.freedesktop.DBus.Introspectable`, generated.
pub fn introspectable_interface() -> Arc<InterfaceDescription> {
    InterfaceBuilder::new(builtin::INTROSPECTABLE)
        .expect("builtin name is valid")
        .add_method(builtin::INTROSPECT, "", "s", &["data"])
        .expect("builtin member is valid")
        .build()
}

/// `org.freedesktop.DBus.Properties`, generated.
pub fn properties_interface() -> Arc<InterfaceDescription> {
    InterfaceBuilder::new(builtin::PROPERTIES)
        .expect("builtin name is valid")
        .add_method(
            builtin::GET,
            "ss",
            "v",
            &["interface_name", "property_name", "value"],
        )
        .expect("builtin member is valid")
        .add_method(
            builtin::SET,
            "ssv",
            "",
            &["interface_name", "property_name", "value"],
        )
        .expect("builtin member is valid")
        .add_method(builtin::GET_ALL, "s", "a{sv}", &["interface_name", "values"])
        .expect("builtin member is valid")
        .build()
}

/// `org.freedesktop.DBus.Peer`, generated.
pub fn peer_interface() -> Arc<InterfaceDescription> {
    InterfaceBuilder::new(builtin::PEER)
        .expect("builtin name is valid")
        .add_method(builtin::PING, "", "", &[])
        .expect("builtin member is valid")
        .add_method(builtin::GET_MACHINE_ID, "", "s", &["machine_uuid"])
        .expect("builtin member is valid")
        .build()
}

// ============================================================================
// Unit Tests
// ============================================================================
