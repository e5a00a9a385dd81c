//! Cryptographic primitives for the obus authentication engine.
//!
//! This crate implements:
//! - Hashing and GUID derivation
//! - Master secret derivation and constant-time verification
//! - Password-proof challenge/response (the SRP key-exchange mechanism)
//! - x25519 ephemeral key exchange (the ECDHE mechanisms)

#![forbid(unsafe_code)]

pub mod ecdhe;
pub mod guid;
pub mod hash;
pub mod secret;
pub mod srp;

pub use guid::Guid;
pub use secret::MasterSecret;

/// Error type for crypto operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("RNG failed")]
    Rng,

    #[error("proof verification failed")]
    BadProof,

    #[error("invalid key bytes")]
    InvalidKeyBytes,

    #[error("key derivation failed")]
    KdfFailed,
}
