//! obus core - the bus behind the bindings.
//!
//! This crate implements:
//! - Interface descriptions and the object/path registry with introspection
//! - Outbound method dispatch with serials, pending calls, and timeouts
//! - Signal routing with replace-on-refresh registration semantics
//! - The session lifecycle state machine (ports, joins, membership)
//! - The mutual-authentication engine and the persisted key store
//! - About announcements
//! - The `BusAttachment` facade composing all of the above into one peer

#![forbid(unsafe_code)]

// Core state machines
pub mod auth;
pub mod sessions;

// Services
pub mod bus;
pub mod dispatch;
pub mod proxy;
pub mod signals;

// Registries
pub mod interface;
pub mod introspect;
pub mod object;

// Infrastructure
pub mod about;
pub mod keystore;

// Supporting modules
pub mod errors;

pub use about::{AboutData, AboutListener};
pub use auth::{AuthListener, Credentials};
pub use bus::{BusAttachment, BusListener, CallOpts, SignalOpts};
pub use errors::{BusError, ErrorCode};
pub use interface::{InterfaceBuilder, InterfaceDescription, PropAccess};
pub use keystore::{FileKeyStore, InMemoryKeyStore, KeyStore, KeyStoreEntry};
pub use object::{method_handler, BusObject, MethodContext, MethodHandler, PropertyHandler};
pub use proxy::ProxyObject;
pub use sessions::{
    SessionId, SessionListener, SessionLostReason, SessionOpts, SessionPort,
    SessionPortListener, TrafficType,
};
pub use signals::{signal_handler, SignalContext, SignalHandler};
