//! x25519 ephemeral key exchange for the ECDHE mechanisms.
//!
//! `ALLJOYN_ECDHE_NULL` derives a session secret from the raw shared point
//! with no authentication. `ALLJOYN_ECDHE_PSK` mixes a pre-shared key into
//! the derivation and adds a confirmation proof so each side demonstrates
//! possession of the PSK.

use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::secret::{derive_master_secret, MasterSecret};
use crate::CryptoError;

type HmacSha256 = Hmac<Sha256>;

const NULL_INFO: &[u8] = b"obus ecdhe null master v1";
const PSK_INFO: &[u8] = b"obus ecdhe psk master v1";

/// Confirmation proofs are role-separated so one side's proof cannot be
/// replayed as the other's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmRole {
    Initiator,
    Responder,
}

impl ConfirmRole {
    fn label(self) -> &'static [u8] {
        match self {
            ConfirmRole::Initiator => b"obus ecdhe psk confirm initiator v1",
            ConfirmRole::Responder => b"obus ecdhe psk confirm responder v1",
        }
    }
}

/// One side's ephemeral key pair for a single handshake.
pub struct EphemeralExchange {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralExchange {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes to send to the peer.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Complete the exchange against the peer's public key.
    ///
    /// The transcript binds both public keys in a role-independent order so
    /// the two sides derive the same secret.
    pub fn agree_null(&self, peer_public: &[u8]) -> Result<MasterSecret, CryptoError> {
        let shared = self.shared_point(peer_public)?;
        let salt = self.transcript(peer_public)?;
        derive_master_secret(&shared, &salt, NULL_INFO)
    }

    /// Complete a PSK-authenticated exchange.
    pub fn agree_psk(&self, peer_public: &[u8], psk: &[u8]) -> Result<MasterSecret, CryptoError> {
        let shared = self.shared_point(peer_public)?;
        let salt = self.transcript(peer_public)?;
        let mut ikm = Vec::with_capacity(shared.len() + psk.len());
        ikm.extend_from_slice(&shared);
        ikm.extend_from_slice(psk);
        derive_master_secret(&ikm, &salt, PSK_INFO)
    }

    /// Confirmation proof demonstrating possession of the PSK, in the role
    /// this side is playing.
    pub fn psk_confirmation(
        &self,
        peer_public: &[u8],
        psk: &[u8],
        role: ConfirmRole,
    ) -> Result<[u8; 32], CryptoError> {
        let secret = self.agree_psk(peer_public, psk)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(role.label());
        let out = mac.finalize().into_bytes();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&out);
        Ok(arr)
    }

    /// Verify the peer's PSK confirmation (in the peer's role) in constant
    /// time.
    pub fn verify_psk_confirmation(
        &self,
        peer_public: &[u8],
        psk: &[u8],
        role: ConfirmRole,
        proof: &[u8],
    ) -> Result<(), CryptoError> {
        let expected = self.psk_confirmation(peer_public, psk, role)?;
        if proof.len() != expected.len()
            || !constant_time_eq::constant_time_eq(&expected, proof)
        {
            return Err(CryptoError::BadProof);
        }
        Ok(())
    }

    fn shared_point(&self, peer_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let bytes: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyBytes)?;
        let peer = PublicKey::from(bytes);
        Ok(self.secret.diffie_hellman(&peer).to_bytes())
    }

    /// Both public keys, lexicographically ordered.
    fn transcript(&self, peer_public: &[u8]) -> Result<[u8; 64], CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyBytes)?;
        let mine = self.public.to_bytes();
        let mut out = [0u8; 64];
        if mine <= peer {
            out[..32].copy_from_slice(&mine);
            out[32..].copy_from_slice(&peer);
        } else {
            out[..32].copy_from_slice(&peer);
            out[32..].copy_from_slice(&mine);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_exchange_agrees() {
        let a = EphemeralExchange::generate();
        let b = EphemeralExchange::generate();

        let sa = a.agree_null(&b.public_bytes()).unwrap();
        let sb = b.agree_null(&a.public_bytes()).unwrap();
        assert!(sa.ct_eq(&sb));
    }

    #[test]
    fn test_psk_exchange_agrees() {
        let a = EphemeralExchange::generate();
        let b = EphemeralExchange::generate();

        let sa = a.agree_psk(&b.public_bytes(), b"pre-shared").unwrap();
        let sb = b.agree_psk(&a.public_bytes(), b"pre-shared").unwrap();
        assert!(sa.ct_eq(&sb));
    }

    #[test]
    fn test_psk_mismatch_diverges() {
        let a = EphemeralExchange::generate();
        let b = EphemeralExchange::generate();

        let sa = a.agree_psk(&b.public_bytes(), b"alpha").unwrap();
        let sb = b.agree_psk(&a.public_bytes(), b"beta").unwrap();
        assert!(!sa.ct_eq(&sb));
    }

    #[test]
    fn test_psk_confirmation_round_trip() {
        let a = EphemeralExchange::generate();
        let b = EphemeralExchange::generate();

        let proof = a
            .psk_confirmation(&b.public_bytes(), b"pre-shared", ConfirmRole::Initiator)
            .unwrap();
        b.verify_psk_confirmation(
            &a.public_bytes(),
            b"pre-shared",
            ConfirmRole::Initiator,
            &proof,
        )
        .unwrap();

        assert!(b
            .verify_psk_confirmation(&a.public_bytes(), b"wrong", ConfirmRole::Initiator, &proof)
            .is_err());

        // An initiator proof must not verify as a responder proof.
        assert!(b
            .verify_psk_confirmation(
                &a.public_bytes(),
                b"pre-shared",
                ConfirmRole::Responder,
                &proof
            )
            .is_err());
    }

    #[test]
    fn test_bad_peer_key_rejected() {
        let a = EphemeralExchange::generate();
        assert!(matches!(
            a.agree_null(&[0u8; 16]),
            Err(CryptoError::InvalidKeyBytes)
        ));
    }
}
