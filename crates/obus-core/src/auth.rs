//! The mutual-authentication engine.
//!
//! `enable_peer_security` arms the engine; it stays inert until a peer
//! interaction first requires security. A handshake intersects mechanism
//! lists, runs attempt-indexed challenge/response rounds through the
//! host-supplied `AuthListener`, and terminates in exactly one
//! `authentication_complete` per side. Success yields a master secret for
//! the key store, bounded by the listener-supplied expiration; failures
//! that violate security policy report `security_violation` first.
//!
//! The engine holds all handshake state; the attachment drives the wire
//! rounds. Initiator and responder contexts are tracked separately so two
//! peers may authenticate each other simultaneously.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use obus_crypto::ecdhe::{ConfirmRole, EphemeralExchange};
use obus_crypto::secret::{generate_nonce, MasterSecret};
use obus_crypto::srp::{self, Role};

use crate::errors::ErrorCode;

/// Shipped mechanism names, in default preference order.
pub const MECH_SRP_KEYX: &str = "ALLJOYN_SRP_KEYX";
pub const MECH_ECDHE_PSK: &str = "ALLJOYN_ECDHE_PSK";
pub const MECH_ECDHE_NULL: &str = "ALLJOYN_ECDHE_NULL";

/// Attempts allowed per mechanism before falling through to the next.
pub const MAX_ATTEMPTS: u16 = 3;

/// Wire dispositions for a handshake round.
pub const DISP_CONTINUE: u8 = 0;
pub const DISP_OK: u8 = 1;
pub const DISP_REJECT: u8 = 2;

// ============================================================================
// Credentials
// ============================================================================

/// Combinable credential request bits.
pub mod credential_bits {
    pub const PASSWORD: u16 = 0x0001;
    pub const USER_NAME: u16 = 0x0002;
    pub const CERT_CHAIN: u16 = 0x0004;
    pub const PRIVATE_KEY: u16 = 0x0008;
    pub const LOGON_ENTRY: u16 = 0x0010;
    pub const EXPIRATION: u16 = 0x0020;
    pub const NEW_PASSWORD: u16 = 0x0040;
    pub const ONE_TIME_PWD: u16 = 0x0080;
}

/// A bitmask of `credential_bits`.
pub type CredentialMask = u16;

/// Credentials supplied by the auth listener.
///
/// A fixed struct with one optional field per credential kind; a field is
/// "set" exactly when it is `Some`. Reading an unset expiration yields
/// `None`, never a default number.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    password: Option<String>,
    user_name: Option<String>,
    cert_chain: Option<String>,
    private_key: Option<String>,
    logon_entry: Option<String>,
    new_password: Option<String>,
    one_time_password: Option<String>,
    /// Seconds of validity for the resulting key store entry
    expiration: Option<u32>,
}

impl Credentials {
    pub fn set_password(&mut self, v: impl Into<String>) -> &mut Self {
        self.password = Some(v.into());
        self
    }

    pub fn set_user_name(&mut self, v: impl Into<String>) -> &mut Self {
        self.user_name = Some(v.into());
        self
    }

    pub fn set_cert_chain(&mut self, v: impl Into<String>) -> &mut Self {
        self.cert_chain = Some(v.into());
        self
    }

    pub fn set_private_key(&mut self, v: impl Into<String>) -> &mut Self {
        self.private_key = Some(v.into());
        self
    }

    pub fn set_logon_entry(&mut self, v: impl Into<String>) -> &mut Self {
        self.logon_entry = Some(v.into());
        self
    }

    pub fn set_new_password(&mut self, v: impl Into<String>) -> &mut Self {
        self.new_password = Some(v.into());
        self
    }

    pub fn set_one_time_password(&mut self, v: impl Into<String>) -> &mut Self {
        self.one_time_password = Some(v.into());
        self
    }

    pub fn set_expiration(&mut self, seconds: u32) -> &mut Self {
        self.expiration = Some(seconds);
        self
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn expiration(&self) -> Option<u32> {
        self.expiration
    }

    /// Bitmask of the fields that are set.
    pub fn mask(&self) -> CredentialMask {
        use credential_bits::*;
        let mut mask = 0;
        if self.password.is_some() {
            mask |= PASSWORD;
        }
        if self.user_name.is_some() {
            mask |= USER_NAME;
        }
        if self.cert_chain.is_some() {
            mask |= CERT_CHAIN;
        }
        if self.private_key.is_some() {
            mask |= PRIVATE_KEY;
        }
        if self.logon_entry.is_some() {
            mask |= LOGON_ENTRY;
        }
        if self.expiration.is_some() {
            mask |= EXPIRATION;
        }
        if self.new_password.is_some() {
            mask |= NEW_PASSWORD;
        }
        if self.one_time_password.is_some() {
            mask |= ONE_TIME_PWD;
        }
        mask
    }

    /// Whether every bit in `required` is set.
    pub fn satisfies(&self, required: CredentialMask) -> bool {
        self.mask() & required == required
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Host-supplied credential callbacks.
#[async_trait]
pub trait AuthListener: Send + Sync {
    /// Supply credentials for one handshake round. `requested` names the
    /// bits the mechanism needs; return None to abort the round.
    async fn request_credentials(
        &self,
        mechanism: &str,
        peer: &str,
        auth_count: u16,
        user_name: &str,
        requested: CredentialMask,
    ) -> Option<Credentials>;

    /// Verify peer-supplied material for mechanisms that need it.
    async fn verify_credentials(
        &self,
        _mechanism: &str,
        _peer: &str,
        _credentials: &Credentials,
    ) -> bool {
        true
    }

    /// A security-policy-violating failure (bad proof, replay, mismatched
    /// credentials). Reported before the handshake completes.
    async fn security_violation(&self, _code: ErrorCode, _message: &str) {}

    /// The single terminal notification for one handshake.
    async fn authentication_complete(&self, mechanism: &str, peer: &str, success: bool);
}

// ============================================================================
// Mechanism State Machines
// ============================================================================

/// Why a round or mechanism attempt stopped.
#[derive(Debug)]
pub enum AuthAbort {
    /// The listener declined or withheld a required credential bit
    CredentialsDenied,
    /// A security-policy violation (bad proof, replay)
    Violation(ErrorCode, String),
    /// Malformed or out-of-order handshake traffic
    Protocol(String),
}

/// Outcome of an initiator step.
pub enum InitiatorStep {
    /// Send this payload and wait for the next round
    Send(Vec<u8>),
    /// The responder accepted; the handshake succeeded
    Finished,
}

enum MechState {
    SrpInitiator {
        password: String,
        nonce_i: [u8; 32],
    },
    SrpResponder {
        password: String,
        nonce_i: [u8; 32],
        nonce_r: [u8; 32],
    },
    EcdheNullInitiator {
        exchange: EphemeralExchange,
    },
    EcdheNullResponder,
    EcdhePskInitiator {
        psk: String,
        exchange: EphemeralExchange,
    },
    EcdhePskResponder {
        psk: String,
        exchange: EphemeralExchange,
        peer_public: [u8; 32],
    },
}

struct AuthContext {
    mechanism: String,
    attempt: u16,
    state: MechState,
    secret: Option<MasterSecret>,
    expiration: Option<u32>,
}

fn required_bits(mechanism: &str) -> CredentialMask {
    match mechanism {
        MECH_SRP_KEYX | MECH_ECDHE_PSK => credential_bits::PASSWORD,
        _ => 0,
    }
}

fn requested_bits(mechanism: &str) -> CredentialMask {
    required_bits(mechanism) | credential_bits::EXPIRATION
}

fn parse32(payload: &[u8]) -> Result<[u8; 32], AuthAbort> {
    payload
        .try_into()
        .map_err(|_| AuthAbort::Protocol("bad payload length".into()))
}

fn split64(payload: &[u8]) -> Result<([u8; 32], [u8; 32]), AuthAbort> {
    if payload.len() != 64 {
        return Err(AuthAbort::Protocol("bad payload length".into()));
    }
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&payload[..32]);
    b.copy_from_slice(&payload[32..]);
    Ok((a, b))
}

fn bad_proof(context: &str) -> AuthAbort {
    AuthAbort::Violation(
        ErrorCode::BusSecurityViolation,
        format!("{}: proof verification failed", context),
    )
}

// ============================================================================
// AuthEngine
// ============================================================================

struct Security {
    mechanisms: Vec<String>,
    listener: Arc<dyn AuthListener>,
}

#[derive(Default)]
struct PeerState {
    guid: Option<String>,
    authenticated: bool,
}

/// The per-attachment authentication engine.
pub struct AuthEngine {
    local_guid: String,
    security: RwLock<Option<Security>>,
    initiator: Mutex<HashMap<String, AuthContext>>,
    responder: Mutex<HashMap<String, AuthContext>>,
    peers: RwLock<HashMap<String, PeerState>>,
}

impl AuthEngine {
    pub fn new(local_guid: impl Into<String>) -> Self {
        Self {
            local_guid: local_guid.into(),
            security: RwLock::new(None),
            initiator: Mutex::new(HashMap::new()),
            responder: Mutex::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Arm the engine. Nothing runs until a peer interaction first requires
    /// security.
    pub fn enable(&self, mechanisms: Vec<String>, listener: Arc<dyn AuthListener>) {
        *self.security.write() = Some(Security {
            mechanisms,
            listener,
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.security.read().is_some()
    }

    pub fn mechanisms(&self) -> Vec<String> {
        self.security
            .read()
            .as_ref()
            .map(|s| s.mechanisms.clone())
            .unwrap_or_default()
    }

    pub fn listener(&self) -> Option<Arc<dyn AuthListener>> {
        self.security.read().as_ref().map(|s| Arc::clone(&s.listener))
    }

    pub fn local_guid(&self) -> &str {
        &self.local_guid
    }

    // -------------------------------------------------------------------------
    // Peer bookkeeping
    // -------------------------------------------------------------------------

    /// Record the peer's GUID learned from the GUID exchange.
    pub fn record_peer_guid(&self, peer: &str, guid: &str) {
        self.peers
            .write()
            .entry(peer.to_string())
            .or_default()
            .guid = Some(guid.to_string());
    }

    pub fn peer_guid(&self, peer: &str) -> Option<String> {
        self.peers.read().get(peer).and_then(|p| p.guid.clone())
    }

    /// Mark a peer authenticated for this connection.
    pub fn mark_authenticated(&self, peer: &str) {
        self.peers
            .write()
            .entry(peer.to_string())
            .or_default()
            .authenticated = true;
        debug!(peer, "peer authenticated");
    }

    pub fn peer_authenticated(&self, peer: &str) -> bool {
        self.peers
            .read()
            .get(peer)
            .map(|p| p.authenticated)
            .unwrap_or(false)
    }

    /// Drop all per-connection peer state (disconnect path).
    pub fn reset_peers(&self) {
        self.peers.write().clear();
        self.initiator.lock().clear();
        self.responder.lock().clear();
    }

    /// Intersect the local mechanism list with the peer's, preserving local
    /// preference order.
    pub fn common_mechanisms(&self, offered: &[String]) -> Vec<String> {
        self.mechanisms()
            .into_iter()
            .filter(|m| offered.contains(m))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Initiator side
    // -------------------------------------------------------------------------

    /// Begin one mechanism attempt, producing the round-0 payload.
    pub async fn initiator_start(
        &self,
        peer: &str,
        mechanism: &str,
        attempt: u16,
    ) -> Result<Vec<u8>, AuthAbort> {
        let listener = self
            .listener()
            .ok_or_else(|| AuthAbort::Protocol("security not enabled".into()))?;

        let creds = listener
            .request_credentials(mechanism, peer, attempt, "", requested_bits(mechanism))
            .await
            .ok_or(AuthAbort::CredentialsDenied)?;
        if !creds.satisfies(required_bits(mechanism)) {
            return Err(AuthAbort::CredentialsDenied);
        }

        let (state, payload) = match mechanism {
            MECH_SRP_KEYX => {
                let nonce_i = generate_nonce()
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                (
                    MechState::SrpInitiator {
                        password: creds.password().unwrap_or_default().to_string(),
                        nonce_i,
                    },
                    nonce_i.to_vec(),
                )
            }
            MECH_ECDHE_NULL => {
                let exchange = EphemeralExchange::generate();
                let payload = exchange.public_bytes().to_vec();
                (MechState::EcdheNullInitiator { exchange }, payload)
            }
            MECH_ECDHE_PSK => {
                let exchange = EphemeralExchange::generate();
                let payload = exchange.public_bytes().to_vec();
                (
                    MechState::EcdhePskInitiator {
                        psk: creds.password().unwrap_or_default().to_string(),
                        exchange,
                    },
                    payload,
                )
            }
            other => {
                return Err(AuthAbort::Protocol(format!(
                    "unknown mechanism '{}'",
                    other
                )))
            }
        };

        self.initiator.lock().insert(
            peer.to_string(),
            AuthContext {
                mechanism: mechanism.to_string(),
                attempt,
                state,
                secret: None,
                expiration: creds.expiration(),
            },
        );
        Ok(payload)
    }

    /// Consume a responder round reply.
    pub fn initiator_step(
        &self,
        peer: &str,
        disposition: u8,
        payload: &[u8],
    ) -> Result<InitiatorStep, AuthAbort> {
        let mut contexts = self.initiator.lock();
        let ctx = contexts
            .get_mut(peer)
            .ok_or_else(|| AuthAbort::Protocol("no handshake in progress".into()))?;

        if disposition == DISP_REJECT {
            contexts.remove(peer);
            return Err(bad_proof("responder rejected"));
        }

        match &mut ctx.state {
            MechState::SrpInitiator { password, nonce_i } => {
                if disposition == DISP_OK {
                    // OK is only valid after our proof round.
                    return match ctx.secret {
                        Some(_) => Ok(InitiatorStep::Finished),
                        None => Err(AuthAbort::Protocol("premature OK".into())),
                    };
                }
                let (nonce_r, proof_r) = split64(payload)?;
                srp::verify_proof(password.as_bytes(), nonce_i, &nonce_r, Role::Responder, &proof_r)
                    .map_err(|_| bad_proof(MECH_SRP_KEYX))?;
                let proof_i =
                    srp::compute_proof(password.as_bytes(), nonce_i, &nonce_r, Role::Initiator);
                let secret = srp::master_secret(password.as_bytes(), nonce_i, &nonce_r)
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                ctx.secret = Some(secret);
                Ok(InitiatorStep::Send(proof_i.to_vec()))
            }

            MechState::EcdheNullInitiator { exchange } => {
                if disposition != DISP_OK {
                    return Err(AuthAbort::Protocol("unexpected disposition".into()));
                }
                let peer_public = parse32(payload)?;
                let secret = exchange
                    .agree_null(&peer_public)
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                ctx.secret = Some(secret);
                Ok(InitiatorStep::Finished)
            }

            MechState::EcdhePskInitiator { psk, exchange } => {
                if disposition == DISP_OK {
                    return match ctx.secret {
                        Some(_) => Ok(InitiatorStep::Finished),
                        None => Err(AuthAbort::Protocol("premature OK".into())),
                    };
                }
                let (peer_public, confirm_r) = split64(payload)?;
                exchange
                    .verify_psk_confirmation(
                        &peer_public,
                        psk.as_bytes(),
                        ConfirmRole::Responder,
                        &confirm_r,
                    )
                    .map_err(|_| bad_proof(MECH_ECDHE_PSK))?;
                let confirm_i = exchange
                    .psk_confirmation(&peer_public, psk.as_bytes(), ConfirmRole::Initiator)
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                let secret = exchange
                    .agree_psk(&peer_public, psk.as_bytes())
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                ctx.secret = Some(secret);
                Ok(InitiatorStep::Send(confirm_i.to_vec()))
            }

            _ => Err(AuthAbort::Protocol("not an initiator context".into())),
        }
    }

    /// Take the initiator's established secret after a finished handshake.
    pub fn initiator_take_secret(&self, peer: &str) -> Option<(MasterSecret, Option<u32>)> {
        let mut contexts = self.initiator.lock();
        let ctx = contexts.remove(peer)?;
        ctx.secret.map(|s| (s, ctx.expiration))
    }

    /// Abandon the initiator context (failed attempt or mechanism).
    pub fn initiator_abandon(&self, peer: &str) {
        self.initiator.lock().remove(peer);
    }

    // -------------------------------------------------------------------------
    // Responder side
    // -------------------------------------------------------------------------

    /// Handle one inbound handshake round, producing `(disposition, payload)`.
    pub async fn responder_round(
        &self,
        peer: &str,
        mechanism: &str,
        attempt: u16,
        round: u8,
        payload: &[u8],
    ) -> (u8, Vec<u8>) {
        match self
            .responder_round_inner(peer, mechanism, attempt, round, payload)
            .await
        {
            Ok(reply) => reply,
            Err(abort) => {
                if let AuthAbort::Violation(code, message) = &abort {
                    if let Some(listener) = self.listener() {
                        listener.security_violation(*code, message).await;
                    }
                }
                warn!(peer, mechanism, "handshake round rejected: {:?}", abort);
                self.responder.lock().remove(peer);
                (DISP_REJECT, Vec::new())
            }
        }
    }

    async fn responder_round_inner(
        &self,
        peer: &str,
        mechanism: &str,
        attempt: u16,
        round: u8,
        payload: &[u8],
    ) -> Result<(u8, Vec<u8>), AuthAbort> {
        let listener = self
            .listener()
            .ok_or_else(|| AuthAbort::Protocol("security not enabled".into()))?;
        if !self.mechanisms().iter().any(|m| m == mechanism) {
            return Err(AuthAbort::Protocol(format!(
                "mechanism '{}' not agreed",
                mechanism
            )));
        }

        if round == 0 {
            // Fresh attempt: request credentials and build responder state.
            let creds = listener
                .request_credentials(mechanism, peer, attempt, "", requested_bits(mechanism))
                .await
                .ok_or(AuthAbort::CredentialsDenied)?;
            if !creds.satisfies(required_bits(mechanism)) {
                return Err(AuthAbort::CredentialsDenied);
            }

            let (state, reply, secret) = match mechanism {
                MECH_SRP_KEYX => {
                    let password = creds.password().unwrap_or_default().to_string();
                    let nonce_i = parse32(payload)?;
                    let nonce_r = generate_nonce()
                        .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                    let proof_r = srp::compute_proof(
                        password.as_bytes(),
                        &nonce_i,
                        &nonce_r,
                        Role::Responder,
                    );
                    let mut reply = Vec::with_capacity(64);
                    reply.extend_from_slice(&nonce_r);
                    reply.extend_from_slice(&proof_r);
                    (
                        MechState::SrpResponder {
                            password,
                            nonce_i,
                            nonce_r,
                        },
                        (DISP_CONTINUE, reply),
                        None,
                    )
                }
                MECH_ECDHE_NULL => {
                    let peer_public = parse32(payload)?;
                    let exchange = EphemeralExchange::generate();
                    let secret = exchange
                        .agree_null(&peer_public)
                        .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                    let reply = exchange.public_bytes().to_vec();
                    (MechState::EcdheNullResponder, (DISP_OK, reply), Some(secret))
                }
                MECH_ECDHE_PSK => {
                    let psk = creds.password().unwrap_or_default().to_string();
                    let peer_public = parse32(payload)?;
                    let exchange = EphemeralExchange::generate();
                    let confirm_r = exchange
                        .psk_confirmation(&peer_public, psk.as_bytes(), ConfirmRole::Responder)
                        .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                    let mut reply = Vec::with_capacity(64);
                    reply.extend_from_slice(&exchange.public_bytes());
                    reply.extend_from_slice(&confirm_r);
                    (
                        MechState::EcdhePskResponder {
                            psk,
                            exchange,
                            peer_public,
                        },
                        (DISP_CONTINUE, reply),
                        None,
                    )
                }
                other => {
                    return Err(AuthAbort::Protocol(format!(
                        "unknown mechanism '{}'",
                        other
                    )))
                }
            };

            self.responder.lock().insert(
                peer.to_string(),
                AuthContext {
                    mechanism: mechanism.to_string(),
                    attempt,
                    state,
                    secret,
                    expiration: creds.expiration(),
                },
            );
            return Ok(reply);
        }

        // Later rounds advance the stored context.
        let mut contexts = self.responder.lock();
        let ctx = contexts
            .get_mut(peer)
            .ok_or_else(|| AuthAbort::Protocol("no handshake in progress".into()))?;
        if ctx.mechanism != mechanism || ctx.attempt != attempt {
            return Err(AuthAbort::Protocol("round does not match context".into()));
        }

        match &ctx.state {
            MechState::SrpResponder {
                password,
                nonce_i,
                nonce_r,
            } => {
                srp::verify_proof(
                    password.as_bytes(),
                    nonce_i,
                    nonce_r,
                    Role::Initiator,
                    payload,
                )
                .map_err(|_| bad_proof(MECH_SRP_KEYX))?;
                let secret = srp::master_secret(password.as_bytes(), nonce_i, nonce_r)
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                ctx.secret = Some(secret);
                Ok((DISP_OK, Vec::new()))
            }

            MechState::EcdhePskResponder {
                psk,
                exchange,
                peer_public,
            } => {
                exchange
                    .verify_psk_confirmation(
                        peer_public,
                        psk.as_bytes(),
                        ConfirmRole::Initiator,
                        payload,
                    )
                    .map_err(|_| bad_proof(MECH_ECDHE_PSK))?;
                let secret = exchange
                    .agree_psk(peer_public, psk.as_bytes())
                    .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
                ctx.secret = Some(secret);
                Ok((DISP_OK, Vec::new()))
            }

            _ => Err(AuthAbort::Protocol("unexpected round".into())),
        }
    }

    /// Take the responder's established secret at handshake completion.
    pub fn responder_take_secret(&self, peer: &str) -> Option<(MasterSecret, Option<u32>)> {
        let mut contexts = self.responder.lock();
        let ctx = contexts.remove(peer)?;
        ctx.secret.map(|s| (s, ctx.expiration))
    }

    /// Abandon the responder context without completing.
    pub fn responder_abandon(&self, peer: &str) {
        self.responder.lock().remove(peer);
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct TestListener {
        password: Option<String>,
        expiration: Option<u32>,
        completions: PlMutex<Vec<(String, String, bool)>>,
        violations: PlMutex<Vec<String>>,
        requests: PlMutex<u32>,
    }

    impl TestListener {
        fn with_password(password: &str) -> Arc<Self> {
            Arc::new(Self {
                password: Some(password.to_string()),
                expiration: None,
                completions: PlMutex::new(Vec::new()),
                violations: PlMutex::new(Vec::new()),
                requests: PlMutex::new(0),
            })
        }

        fn withholding() -> Arc<Self> {
            Arc::new(Self {
                password: None,
                expiration: None,
                completions: PlMutex::new(Vec::new()),
                violations: PlMutex::new(Vec::new()),
                requests: PlMutex::new(0),
            })
        }
    }

    #[async_trait]
    impl AuthListener for TestListener {
        async fn request_credentials(
            &self,
            _mechanism: &str,
            _peer: &str,
            _auth_count: u16,
            _user_name: &str,
            requested: CredentialMask,
        ) -> Option<Credentials> {
            *self.requests.lock() += 1;
            let mut creds = Credentials::default();
            if requested & credential_bits::PASSWORD != 0 {
                // Withholding listeners leave the required bit unset.
                if let Some(p) = &self.password {
                    creds.set_password(p.clone());
                }
            }
            if let Some(exp) = self.expiration {
                creds.set_expiration(exp);
            }
            Some(creds)
        }

        async fn security_violation(&self, _code: ErrorCode, message: &str) {
            self.violations.lock().push(message.to_string());
        }

        async fn authentication_complete(&self, mechanism: &str, peer: &str, success: bool) {
            self.completions
                .lock()
                .push((mechanism.to_string(), peer.to_string(), success));
        }
    }

    /// Drive a full handshake between two engines without a wire.
    async fn run_handshake(
        initiator: &AuthEngine,
        responder: &AuthEngine,
        mechanism: &str,
    ) -> Result<(), AuthAbort> {
        let payload = initiator.initiator_start(":resp.1", mechanism, 1).await?;
        let mut round = 0u8;
        let (mut disp, mut reply) = responder
            .responder_round(":init.1", mechanism, 1, round, &payload)
            .await;

        loop {
            if disp == DISP_REJECT {
                initiator.initiator_abandon(":resp.1");
                return Err(bad_proof("rejected"));
            }
            match initiator.initiator_step(":resp.1", disp, &reply)? {
                InitiatorStep::Finished => return Ok(()),
                InitiatorStep::Send(next) => {
                    round += 1;
                    let (d, r) = responder
                        .responder_round(":init.1", mechanism, 1, round, &next)
                        .await;
                    disp = d;
                    reply = r;
                }
            }
        }
    }

    fn engine(guid: &str, password: Option<&str>, mechs: &[&str]) -> (AuthEngine, Arc<TestListener>) {
        let engine = AuthEngine::new(guid);
        let listener = match password {
            Some(p) => TestListener::with_password(p),
            None => TestListener::withholding(),
        };
        engine.enable(
            mechs.iter().map(|m| m.to_string()).collect(),
            listener.clone() as Arc<dyn AuthListener>,
        );
        (engine, listener)
    }

    #[tokio::test]
    async fn test_srp_matching_passwords_agree() {
        let (init, _) = engine("guid-i", Some("123456"), &[MECH_SRP_KEYX]);
        let (resp, _) = engine("guid-r", Some("123456"), &[MECH_SRP_KEYX]);

        run_handshake(&init, &resp, MECH_SRP_KEYX).await.unwrap();

        let (si, _) = init.initiator_take_secret(":resp.1").unwrap();
        let (sr, _) = resp.responder_take_secret(":init.1").unwrap();
        assert!(si.ct_eq(&sr));
    }

    #[tokio::test]
    async fn test_srp_wrong_password_fails_with_violation() {
        let (init, _) = engine("guid-i", Some("123456"), &[MECH_SRP_KEYX]);
        let (resp, resp_listener) = engine("guid-r", Some("654321"), &[MECH_SRP_KEYX]);

        // The initiator detects the responder's bad proof locally.
        let err = run_handshake(&init, &resp, MECH_SRP_KEYX).await.unwrap_err();
        assert!(matches!(err, AuthAbort::Violation(..)));

        // Neither side has a secret to store.
        assert!(init.initiator_take_secret(":resp.1").is_none());
        assert!(resp.responder_take_secret(":init.1").is_none());
        let _ = resp_listener;
    }

    #[tokio::test]
    async fn test_srp_responder_detects_bad_initiator_proof() {
        let (resp, resp_listener) = engine("guid-r", Some("123456"), &[MECH_SRP_KEYX]);

        let nonce_i = generate_nonce().unwrap();
        let (disp, _) = resp
            .responder_round(":init.1", MECH_SRP_KEYX, 1, 0, &nonce_i)
            .await;
        assert_eq!(disp, DISP_CONTINUE);

        // A garbage proof violates security policy.
        let (disp, _) = resp
            .responder_round(":init.1", MECH_SRP_KEYX, 1, 1, &[0u8; 32])
            .await;
        assert_eq!(disp, DISP_REJECT);
        assert_eq!(resp_listener.violations.lock().len(), 1);
        assert!(resp.responder_take_secret(":init.1").is_none());
    }

    #[tokio::test]
    async fn test_ecdhe_null_agrees() {
        let (init, _) = engine("guid-i", None, &[MECH_ECDHE_NULL]);
        let (resp, _) = engine("guid-r", None, &[MECH_ECDHE_NULL]);

        run_handshake(&init, &resp, MECH_ECDHE_NULL).await.unwrap();

        let (si, _) = init.initiator_take_secret(":resp.1").unwrap();
        let (sr, _) = resp.responder_take_secret(":init.1").unwrap();
        assert!(si.ct_eq(&sr));
    }

    #[tokio::test]
    async fn test_ecdhe_psk_agrees() {
        let (init, _) = engine("guid-i", Some("pre-shared"), &[MECH_ECDHE_PSK]);
        let (resp, _) = engine("guid-r", Some("pre-shared"), &[MECH_ECDHE_PSK]);

        run_handshake(&init, &resp, MECH_ECDHE_PSK).await.unwrap();

        let (si, _) = init.initiator_take_secret(":resp.1").unwrap();
        let (sr, _) = resp.responder_take_secret(":init.1").unwrap();
        assert!(si.ct_eq(&sr));
    }

    #[tokio::test]
    async fn test_withheld_credential_aborts() {
        let (init, _) = engine("guid-i", None, &[MECH_SRP_KEYX]);

        let err = init
            .initiator_start(":resp.1", MECH_SRP_KEYX, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthAbort::CredentialsDenied));
        assert!(init.initiator_take_secret(":resp.1").is_none());
    }

    #[tokio::test]
    async fn test_responder_withheld_credential_rejects() {
        let (resp, _) = engine("guid-r", None, &[MECH_SRP_KEYX]);

        let nonce = generate_nonce().unwrap();
        let (disp, _) = resp
            .responder_round(":init.1", MECH_SRP_KEYX, 1, 0, &nonce)
            .await;
        assert_eq!(disp, DISP_REJECT);
    }

    #[test]
    fn test_common_mechanisms_preserve_local_order() {
        let engine = AuthEngine::new("guid");
        engine.enable(
            vec![MECH_SRP_KEYX.to_string(), MECH_ECDHE_NULL.to_string()],
            TestListener::with_password("x") as Arc<dyn AuthListener>,
        );

        let offered = vec![MECH_ECDHE_NULL.to_string(), MECH_SRP_KEYX.to_string()];
        assert_eq!(
            engine.common_mechanisms(&offered),
            vec![MECH_SRP_KEYX.to_string(), MECH_ECDHE_NULL.to_string()]
        );

        assert!(engine
            .common_mechanisms(&["ALLJOYN_RSA_KEYX".to_string()])
            .is_empty());
    }

    #[tokio::test]
    async fn test_unagreed_mechanism_rejected() {
        let (resp, _) = engine("guid-r", Some("x"), &[MECH_SRP_KEYX]);
        let (disp, _) = resp
            .responder_round(":init.1", MECH_ECDHE_NULL, 1, 0, &[0u8; 32])
            .await;
        assert_eq!(disp, DISP_REJECT);
    }

    #[test]
    fn test_credentials_set_flags() {
        let mut creds = Credentials::default();
        assert_eq!(creds.mask(), 0);
        assert_eq!(creds.expiration(), None);

        creds.set_password("pw").set_expiration(60);
        assert!(creds.satisfies(credential_bits::PASSWORD));
        assert!(creds.satisfies(credential_bits::PASSWORD | credential_bits::EXPIRATION));
        assert!(!creds.satisfies(credential_bits::USER_NAME));
        assert_eq!(creds.expiration(), Some(60));
    }

    #[test]
    fn test_peer_bookkeeping() {
        let engine = AuthEngine::new("guid");
        assert!(!engine.peer_authenticated(":p.1"));

        engine.record_peer_guid(":p.1", "peer-guid");
        engine.mark_authenticated(":p.1");
        assert!(engine.peer_authenticated(":p.1"));
        assert_eq!(engine.peer_guid(":p.1").as_deref(), Some("peer-guid"));

        engine.reset_peers();
        assert!(!engine.peer_authenticated(":p.1"));
    }
}
