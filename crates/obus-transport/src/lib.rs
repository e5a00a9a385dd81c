//! Transport layer for the obus object bus.
//!
//! This crate defines the endpoint traits the bus core talks to, a
//! length-prefixed framing codec for byte transports, and the in-process
//! router hub used by tests and demos. Physical transport implementations
//! (TCP, UDP, local sockets) live outside the core and only need to satisfy
//! the traits here.

#![forbid(unsafe_code)]

pub mod framing;
pub mod hub;
pub mod traits;

pub use hub::MemoryHub;
pub use traits::{BusEndpoint, Transport, TransportError};
