//! Master secret type and derivation.
//!
//! A master secret is the output of a completed authentication handshake.
//! It is what the key store persists per peer GUID, and it is zeroized on
//! drop.

use constant_time_eq::constant_time_eq;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// A 32-byte shared secret established by authentication.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &MasterSecret) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("MasterSecret(..)")
    }
}

impl PartialEq for MasterSecret {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

/// Derive a master secret with HKDF-SHA256.
///
/// `ikm` is the mechanism's input keying material (password hash, ECDH
/// shared point), `salt` binds the handshake transcript (nonces), `info`
/// is the mechanism's domain separation label.
pub fn derive_master_secret(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<MasterSecret, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out).map_err(|_| CryptoError::KdfFailed)?;
    Ok(MasterSecret::from_bytes(out))
}

/// Generate a 32-byte handshake nonce.
pub fn generate_nonce() -> Result<[u8; 32], CryptoError> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce).map_err(|_| CryptoError::Rng)?;
    Ok(nonce)
}

/// A random u32, used for bus-assigned opaque identifiers.
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut bytes = [0u8; 4];
    getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::Rng)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_master_secret(b"ikm", b"salt", b"info").unwrap();
        let b = derive_master_secret(b"ikm", b"salt", b"info").unwrap();
        assert!(a.ct_eq(&b));
    }

    #[test]
    fn test_derivation_separates_inputs() {
        let a = derive_master_secret(b"ikm", b"salt", b"info").unwrap();
        let b = derive_master_secret(b"ikm", b"salt2", b"info").unwrap();
        let c = derive_master_secret(b"ikm2", b"salt", b"info").unwrap();
        assert!(!a.ct_eq(&b));
        assert!(!a.ct_eq(&c));
    }

    #[test]
    fn test_nonces_are_unique() {
        assert_ne!(generate_nonce().unwrap(), generate_nonce().unwrap());
    }

    #[test]
    fn test_debug_hides_material() {
        let s = MasterSecret::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", s), "MasterSecret(..)");
    }
}
