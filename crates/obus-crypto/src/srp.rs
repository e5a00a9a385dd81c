//! Password-proof challenge/response primitives for the SRP key-exchange
//! mechanism.
//!
//! Both sides hold the password. The initiator and responder exchange fresh
//! nonces, then prove knowledge of the password with role-separated
//! HMAC-SHA256 proofs over the joint transcript. Neither proof reveals the
//! password, and a proof for one role cannot be replayed as the other. The
//! master secret binds the password to this handshake's nonces.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::hash::sha256;
use crate::secret::{derive_master_secret, MasterSecret};
use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

const MASTER_INFO: &[u8] = b"obus srp master v1";
const INITIATOR_LABEL: &[u8] = b"obus srp proof initiator v1";
const RESPONDER_LABEL: &[u8] = b"obus srp proof responder v1";

/// Which side of the handshake a proof belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Role::Initiator => INITIATOR_LABEL,
            Role::Responder => RESPONDER_LABEL,
        }
    }
}

fn password_key(password: &[u8]) -> [u8; 32] {
    sha256(password)
}

/// Compute the proof for `role` over the joint nonce transcript.
pub fn compute_proof(
    password: &[u8],
    initiator_nonce: &[u8; 32],
    responder_nonce: &[u8; 32],
    role: Role,
) -> [u8; 32] {
    let key = password_key(password);
    let mut mac =
        HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(role.label());
    mac.update(initiator_nonce);
    mac.update(responder_nonce);
    let out = mac.finalize().into_bytes();
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&out);
    arr
}

/// Verify a peer's proof in constant time.
pub fn verify_proof(
    password: &[u8],
    initiator_nonce: &[u8; 32],
    responder_nonce: &[u8; 32],
    role: Role,
    proof: &[u8],
) -> Result<(), CryptoError> {
    let expected = compute_proof(password, initiator_nonce, responder_nonce, role);
    if proof.len() != expected.len() {
        return Err(CryptoError::BadProof);
    }
    if !constant_time_eq::constant_time_eq(&expected, proof) {
        return Err(CryptoError::BadProof);
    }
    Ok(())
}

/// Derive the handshake's master secret from the password and nonces.
pub fn master_secret(
    password: &[u8],
    initiator_nonce: &[u8; 32],
    responder_nonce: &[u8; 32],
) -> Result<MasterSecret, CryptoError> {
    let key = password_key(password);
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(initiator_nonce);
    salt[32..].copy_from_slice(responder_nonce);
    derive_master_secret(&key, &salt, MASTER_INFO)
}
