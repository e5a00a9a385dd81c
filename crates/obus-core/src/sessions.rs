//! Session lifecycle: bound ports, joins, membership, and teardown.
//!
//! A bound port gates joiners through its `SessionPortListener` and keeps
//! serving joiners until explicitly unbound. Every teardown trigger (local
//! leave, remote departure, removal by the binder, link timeout) converges
//! on a single `session_lost` delivery, and the session entry is deleted
//! exactly once no matter which trigger fires first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use obus_crypto::secret::random_u32;

use crate::errors::{BusError, ErrorCode};

/// A session port. Port 0 asks the manager to pick a free port.
pub type SessionPort = u16;

/// A bus-assigned opaque session identifier. Never 0.
pub type SessionId = u32;

/// Requested when binding to let the manager pick a free port.
pub const SESSION_PORT_ANY: SessionPort = 0;

/// First port considered for automatic allocation.
const DYNAMIC_PORT_START: SessionPort = 0xC000;

// ============================================================================
// Session Options
// ============================================================================

/// Traffic profile carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrafficType {
    Messages = 0x01,
    RawUnreliable = 0x02,
    RawReliable = 0x04,
}

impl TrafficType {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(TrafficType::Messages),
            0x02 => Some(TrafficType::RawUnreliable),
            0x04 => Some(TrafficType::RawReliable),
            _ => None,
        }
    }
}

/// Proximity mask: any.
pub const PROXIMITY_ANY: u8 = 0xff;
/// Transport mask: any.
pub const TRANSPORT_ANY: u16 = 0xffff;

/// Negotiable session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOpts {
    pub traffic: TrafficType,
    pub multipoint: bool,
    pub proximity: u8,
    pub transports: u16,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: TrafficType::Messages,
            multipoint: false,
            proximity: PROXIMITY_ANY,
            transports: TRANSPORT_ANY,
        }
    }
}

impl SessionOpts {
    pub fn multipoint() -> Self {
        Self {
            multipoint: true,
            ..Self::default()
        }
    }

    /// Intersect host and joiner constraints.
    ///
    /// The result is never broader than either side: traffic and multipoint
    /// must agree exactly, proximity and transport masks are ANDed and must
    /// stay non-empty.
    pub fn negotiate(host: &SessionOpts, joiner: &SessionOpts) -> Option<SessionOpts> {
        if host.traffic != joiner.traffic || host.multipoint != joiner.multipoint {
            return None;
        }
        let proximity = host.proximity & joiner.proximity;
        let transports = host.transports & joiner.transports;
        if proximity == 0 || transports == 0 {
            return None;
        }
        Some(SessionOpts {
            traffic: host.traffic,
            multipoint: host.multipoint,
            proximity,
            transports,
        })
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SessionLostReason {
    /// The remote end left the session
    RemoteEndLeft = 1,
    /// The session binder removed this member
    RemovedByBinder = 2,
    /// The binder itself left
    BinderLeft = 3,
    /// The keep-alive window elapsed without confirmation
    LinkTimeout = 4,
    /// The local attachment disconnected
    LocalDisconnect = 5,
}

impl SessionLostReason {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            1 => Some(SessionLostReason::RemoteEndLeft),
            2 => Some(SessionLostReason::RemovedByBinder),
            3 => Some(SessionLostReason::BinderLeft),
            4 => Some(SessionLostReason::LinkTimeout),
            5 => Some(SessionLostReason::LocalDisconnect),
            _ => None,
        }
    }
}

/// Gates join attempts on a bound port.
#[async_trait]
pub trait SessionPortListener: Send + Sync {
    /// Accept or reject a joiner. Rejecting sends a bus-level denial and
    /// creates no session.
    async fn accept_session_joiner(
        &self,
        port: SessionPort,
        joiner: &str,
        opts: &SessionOpts,
    ) -> bool;

    /// An accepted joiner is now established.
    async fn session_joined(&self, _port: SessionPort, _id: SessionId, _joiner: &str) {}
}

/// Observes an established session.
#[async_trait]
pub trait SessionListener: Send + Sync {
    async fn session_lost(&self, _id: SessionId, _reason: SessionLostReason) {}

    async fn session_member_added(&self, _id: SessionId, _member: &str) {}

    async fn session_member_removed(&self, _id: SessionId, _member: &str) {}
}

// ============================================================================
// Table Entries
// ============================================================================

struct BoundPort {
    opts: SessionOpts,
    listener: Arc<dyn SessionPortListener>,
    /// Guards in-flight accepts against unbind racing past them
    epoch: u64,
}

/// One established session as seen by this attachment.
pub struct SessionEntry {
    pub id: SessionId,
    pub port: SessionPort,
    /// Unique name of the binder (our own name when hosting)
    pub host: String,
    pub opts: SessionOpts,
    /// Remote members, excluding this attachment
    pub members: Vec<String>,
    pub listener: Option<Arc<dyn SessionListener>>,
    pub is_host: bool,
    pub link_timeout_secs: Option<u32>,
}

/// Cloneable view of a session entry.
#[derive(Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub port: SessionPort,
    pub host: String,
    pub opts: SessionOpts,
    pub members: Vec<String>,
    pub listener: Option<Arc<dyn SessionListener>>,
    pub is_host: bool,
    pub link_timeout_secs: Option<u32>,
}

impl std::fmt::Debug for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInfo")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("host", &self.host)
            .field("opts", &self.opts)
            .field("members", &self.members)
            .field("listener", &self.listener.is_some())
            .field("is_host", &self.is_host)
            .field("link_timeout_secs", &self.link_timeout_secs)
            .finish()
    }
}

impl SessionEntry {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            port: self.port,
            host: self.host.clone(),
            opts: self.opts,
            members: self.members.clone(),
            listener: self.listener.clone(),
            is_host: self.is_host,
            link_timeout_secs: self.link_timeout_secs,
        }
    }
}

/// A port's accept gate, cloned out so the listener runs off the table lock.
pub struct AcceptGate {
    pub opts: SessionOpts,
    pub listener: Arc<dyn SessionPortListener>,
    pub epoch: u64,
}

// ============================================================================
// SessionManager
// ============================================================================

/// The port and session tables for one bus attachment.
#[derive(Default)]
pub struct SessionManager {
    ports: Mutex<HashMap<SessionPort, BoundPort>>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    epoch: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Port lifecycle
    // -------------------------------------------------------------------------

    /// Bind a session port. `SESSION_PORT_ANY` picks a free port.
    pub fn bind(
        &self,
        port: SessionPort,
        opts: SessionOpts,
        listener: Arc<dyn SessionPortListener>,
    ) -> Result<SessionPort, BusError> {
        let mut ports = self.ports.lock();
        let port = if port == SESSION_PORT_ANY {
            let mut candidate = DYNAMIC_PORT_START;
            while ports.contains_key(&candidate) {
                candidate = candidate.checked_add(1).ok_or_else(|| {
                    BusError::new(ErrorCode::BindSessionPortReplyFailed)
                })?;
            }
            candidate
        } else {
            if ports.contains_key(&port) {
                return Err(BusError::new(ErrorCode::BindSessionPortReplyAlreadyExists));
            }
            port
        };
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        ports.insert(
            port,
            BoundPort {
                opts,
                listener,
                epoch,
            },
        );
        debug!(port, "session port bound");
        Ok(port)
    }

    /// Unbind a port. In-flight accepts for the old binding are discarded
    /// when they try to establish, so no stale callbacks fire.
    pub fn unbind(&self, port: SessionPort) -> Result<(), BusError> {
        let mut ports = self.ports.lock();
        if ports.remove(&port).is_none() {
            return Err(BusError::new(ErrorCode::UnbindSessionPortReplyBadPort));
        }
        debug!(port, "session port unbound");
        Ok(())
    }

    pub fn is_bound(&self, port: SessionPort) -> bool {
        self.ports.lock().contains_key(&port)
    }

    /// Clone out a port's accept gate so the accept predicate runs without
    /// holding the table lock.
    pub fn accept_gate(&self, port: SessionPort) -> Option<AcceptGate> {
        let ports = self.ports.lock();
        ports.get(&port).map(|bound| AcceptGate {
            opts: bound.opts,
            listener: Arc::clone(&bound.listener),
            epoch: bound.epoch,
        })
    }

    // -------------------------------------------------------------------------
    // Establishment
    // -------------------------------------------------------------------------

    /// Record an accepted joiner on the host side.
    ///
    /// `gate_epoch` must still match the port's binding: an accept that
    /// raced with unbind (or unbind+rebind) establishes nothing. Multipoint
    /// ports funnel every joiner into one session; point-to-point ports get
    /// a fresh session per joiner. Returns the session id and the roster of
    /// members that were already present.
    pub fn establish_hosted(
        &self,
        port: SessionPort,
        gate_epoch: u64,
        host: &str,
        joiner: &str,
        opts: SessionOpts,
    ) -> Result<(SessionId, Vec<String>), BusError> {
        let ports = self.ports.lock();
        let bound = ports
            .get(&port)
            .ok_or_else(|| BusError::new(ErrorCode::JoinSessionReplyNoSession))?;
        if bound.epoch != gate_epoch {
            return Err(BusError::new(ErrorCode::JoinSessionReplyNoSession));
        }

        let mut sessions = self.sessions.lock();

        if opts.multipoint {
            if let Some(entry) = sessions
                .values_mut()
                .find(|e| e.is_host && e.port == port && e.opts.multipoint)
            {
                if entry.members.iter().any(|m| m == joiner) {
                    return Err(BusError::new(ErrorCode::JoinSessionReplyAlreadyJoined));
                }
                let existing = entry.members.clone();
                entry.members.push(joiner.to_string());
                return Ok((entry.id, existing));
            }
        }

        let id = Self::fresh_id(&sessions)?;
        sessions.insert(
            id,
            SessionEntry {
                id,
                port,
                host: host.to_string(),
                opts,
                members: vec![joiner.to_string()],
                listener: None,
                is_host: true,
                link_timeout_secs: None,
            },
        );
        Ok((id, Vec::new()))
    }

    fn fresh_id(
        sessions: &HashMap<SessionId, SessionEntry>,
    ) -> Result<SessionId, BusError> {
        for _ in 0..32 {
            let id = random_u32()
                .map_err(|_| BusError::with_message(ErrorCode::Fail, "RNG failed"))?;
            if id != 0 && !sessions.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(BusError::with_message(
            ErrorCode::Fail,
            "could not allocate a session id",
        ))
    }

    /// Record a session this attachment joined.
    pub fn insert_joined(
        &self,
        id: SessionId,
        port: SessionPort,
        host: &str,
        opts: SessionOpts,
        members: Vec<String>,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(), BusError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(BusError::new(ErrorCode::JoinSessionReplyAlreadyJoined));
        }
        sessions.insert(
            id,
            SessionEntry {
                id,
                port,
                host: host.to_string(),
                opts,
                members,
                listener,
                is_host: false,
                link_timeout_secs: None,
            },
        );
        Ok(())
    }

    /// Install the session listener for an established session.
    pub fn set_session_listener(
        &self,
        id: SessionId,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), BusError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&id)
            .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
        entry.listener = Some(listener);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    pub fn lookup(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.lock().get(&id).map(SessionEntry::info)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Sessions that involve `peer` as host or member.
    pub fn sessions_with_peer(&self, peer: &str) -> Vec<SessionId> {
        self.sessions
            .lock()
            .values()
            .filter(|e| e.host == peer || e.members.iter().any(|m| m == peer))
            .map(|e| e.id)
            .collect()
    }

    /// All current session ids.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().copied().collect()
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Delete a session entry. Exactly-once: the first caller gets the
    /// entry (and fires callbacks from it); later callers get None and must
    /// fire nothing.
    pub fn remove_session(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.lock().remove(&id).map(|e| e.info())
    }

    /// Record a member that joined a multipoint session we participate in.
    /// Returns None when the member was already known.
    pub fn add_member(&self, id: SessionId, member: &str) -> Option<SessionInfo> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&id)?;
        if entry.members.iter().any(|m| m == member) {
            return None;
        }
        entry.members.push(member.to_string());
        Some(entry.info())
    }

    /// Drop one member from a session, returning the updated view.
    pub fn remove_member(&self, id: SessionId, member: &str) -> Result<SessionInfo, BusError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&id)
            .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
        let before = entry.members.len();
        entry.members.retain(|m| m != member);
        if entry.members.len() == before {
            return Err(BusError::new(ErrorCode::RemoveSessionMemberNotFound));
        }
        Ok(entry.info())
    }

    /// Validate a `remove_session_member` request from the binder side.
    pub fn check_remove_member(&self, id: SessionId, member: &str) -> Result<(), BusError> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(&id)
            .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
        if !entry.is_host {
            return Err(BusError::new(ErrorCode::RemoveSessionMemberNotBinder));
        }
        if !entry.opts.multipoint {
            return Err(BusError::new(ErrorCode::RemoveSessionMemberNotMultipoint));
        }
        if !entry.members.iter().any(|m| m == member) {
            return Err(BusError::new(ErrorCode::RemoveSessionMemberNotFound));
        }
        Ok(())
    }

    /// Record a negotiated keep-alive interval.
    pub fn set_link_timeout(&self, id: SessionId, secs: u32) -> Result<(), BusError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(&id)
            .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
        entry.link_timeout_secs = Some(secs);
        Ok(())
    }

    /// Drop every port and session without callbacks. Destruction path.
    pub fn clear(&self) -> Vec<SessionInfo> {
        self.ports.lock().clear();
        let mut sessions = self.sessions.lock();
        let drained: Vec<SessionInfo> = sessions.values().map(SessionEntry::info).collect();
        sessions.clear();
        drained
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct AcceptAll;

    #[async_trait]
    impl SessionPortListener for AcceptAll {
        async fn accept_session_joiner(
            &self,
            _port: SessionPort,
            _joiner: &str,
            _opts: &SessionOpts,
        ) -> bool {
            true
        }
    }

    #[test]
    fn test_negotiation_is_intersection() {
        let host = SessionOpts {
            traffic: TrafficType::Messages,
            multipoint: true,
            proximity: 0x0f,
            transports: 0x00ff,
        };
        let joiner = SessionOpts {
            traffic: TrafficType::Messages,
            multipoint: true,
            proximity: 0xf1,
            transports: 0x0ff0,
        };
        let negotiated = SessionOpts::negotiate(&host, &joiner).unwrap();
        assert_eq!(negotiated.proximity, 0x01);
        assert_eq!(negotiated.transports, 0x00f0);
        // Never broader than either side.
        assert_eq!(negotiated.proximity & !host.proximity, 0);
        assert_eq!(negotiated.transports & !joiner.transports, 0);
    }

    #[test]
    fn test_negotiation_rejects_mismatch() {
        let host = SessionOpts::default();
        let raw = SessionOpts {
            traffic: TrafficType::RawReliable,
            ..SessionOpts::default()
        };
        assert!(SessionOpts::negotiate(&host, &raw).is_none());

        let mp = SessionOpts::multipoint();
        assert!(SessionOpts::negotiate(&host, &mp).is_none());

        let disjoint = SessionOpts {
            transports: 0x0001,
            ..SessionOpts::default()
        };
        let other = SessionOpts {
            transports: 0x0002,
            ..SessionOpts::default()
        };
        assert!(SessionOpts::negotiate(&disjoint, &other).is_none());
    }

    #[test]
    fn test_bind_unbind() {
        let mgr = SessionManager::new();
        let port = mgr.bind(42, SessionOpts::default(), Arc::new(AcceptAll)).unwrap();
        assert_eq!(port, 42);
        assert!(mgr.is_bound(42));

        let err = mgr
            .bind(42, SessionOpts::default(), Arc::new(AcceptAll))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BindSessionPortReplyAlreadyExists);

        mgr.unbind(42).unwrap();
        assert!(!mgr.is_bound(42));
        let err = mgr.unbind(42).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnbindSessionPortReplyBadPort);
    }

    #[test]
    fn test_bind_port_any_allocates() {
        let mgr = SessionManager::new();
        let a = mgr
            .bind(SESSION_PORT_ANY, SessionOpts::default(), Arc::new(AcceptAll))
            .unwrap();
        let b = mgr
            .bind(SESSION_PORT_ANY, SessionOpts::default(), Arc::new(AcceptAll))
            .unwrap();
        assert!(a >= DYNAMIC_PORT_START);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stale_accept_establishes_nothing() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::default(), Arc::new(AcceptAll)).unwrap();
        let gate = mgr.accept_gate(7).unwrap();

        // Unbind (and even rebind) while the accept was in flight.
        mgr.unbind(7).unwrap();
        mgr.bind(7, SessionOpts::default(), Arc::new(AcceptAll)).unwrap();

        let err = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":j.1", SessionOpts::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::JoinSessionReplyNoSession);
        assert_eq!(mgr.session_count(), 0);
    }

    #[test]
    fn test_multipoint_joiners_share_one_session() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::multipoint(), Arc::new(AcceptAll)).unwrap();
        let gate = mgr.accept_gate(7).unwrap();

        let (id1, existing1) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":a.1", SessionOpts::multipoint())
            .unwrap();
        assert!(existing1.is_empty());

        let (id2, existing2) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":b.1", SessionOpts::multipoint())
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(existing2, vec![":a.1".to_string()]);

        let info = mgr.lookup(id1).unwrap();
        assert_eq!(info.members, vec![":a.1".to_string(), ":b.1".to_string()]);
    }

    #[test]
    fn test_point_to_point_gets_fresh_sessions() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::default(), Arc::new(AcceptAll)).unwrap();
        let gate = mgr.accept_gate(7).unwrap();

        let (id1, _) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":a.1", SessionOpts::default())
            .unwrap();
        let (id2, _) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":b.1", SessionOpts::default())
            .unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_remove_session_is_exactly_once() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::default(), Arc::new(AcceptAll)).unwrap();
        let gate = mgr.accept_gate(7).unwrap();
        let (id, _) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":a.1", SessionOpts::default())
            .unwrap();

        assert!(mgr.remove_session(id).is_some());
        // The second trigger, whatever it was, must fire no callbacks.
        assert!(mgr.remove_session(id).is_none());
    }

    #[test]
    fn test_check_remove_member() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::multipoint(), Arc::new(AcceptAll)).unwrap();
        let gate = mgr.accept_gate(7).unwrap();
        let (id, _) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":a.1", SessionOpts::multipoint())
            .unwrap();

        mgr.check_remove_member(id, ":a.1").unwrap();
        assert_eq!(
            mgr.check_remove_member(id, ":nobody.1").unwrap_err().code,
            ErrorCode::RemoveSessionMemberNotFound
        );

        // A joined (non-host) session refuses member removal.
        mgr.insert_joined(99, 7, ":h.2", SessionOpts::multipoint(), vec![], None)
            .unwrap();
        assert_eq!(
            mgr.check_remove_member(99, ":a.1").unwrap_err().code,
            ErrorCode::RemoveSessionMemberNotBinder
        );
    }

    #[test]
    fn test_remove_member_updates_roster() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::multipoint(), Arc::new(AcceptAll)).unwrap();
        let gate = mgr.accept_gate(7).unwrap();
        let (id, _) = mgr
            .establish_hosted(7, gate.epoch, ":h.1", ":a.1", SessionOpts::multipoint())
            .unwrap();
        mgr.establish_hosted(7, gate.epoch, ":h.1", ":b.1", SessionOpts::multipoint())
            .unwrap();

        let info = mgr.remove_member(id, ":a.1").unwrap();
        assert_eq!(info.members, vec![":b.1".to_string()]);

        let err = mgr.remove_member(id, ":a.1").unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoveSessionMemberNotFound);
    }

    #[test]
    fn test_sessions_with_peer() {
        let mgr = SessionManager::new();
        mgr.insert_joined(10, 7, ":h.1", SessionOpts::default(), vec![], None)
            .unwrap();
        mgr.insert_joined(11, 7, ":h.2", SessionOpts::default(), vec![], None)
            .unwrap();

        assert_eq!(mgr.sessions_with_peer(":h.1"), vec![10]);
        assert!(mgr.sessions_with_peer(":x.9").is_empty());
    }

    #[test]
    fn test_clear_drains_everything() {
        let mgr = SessionManager::new();
        mgr.bind(7, SessionOpts::default(), Arc::new(AcceptAll)).unwrap();
        mgr.insert_joined(10, 7, ":h.1", SessionOpts::default(), vec![], None)
            .unwrap();

        let drained = mgr.clear();
        assert_eq!(drained.len(), 1);
        assert_eq!(mgr.session_count(), 0);
        assert!(!mgr.is_bound(7));
    }

    #[test]
    fn test_link_timeout_requires_session() {
        let mgr = SessionManager::new();
        assert_eq!(
            mgr.set_link_timeout(5, 30).unwrap_err().code,
            ErrorCode::BusNoSession
        );
        mgr.insert_joined(5, 7, ":h.1", SessionOpts::default(), vec![], None)
            .unwrap();
        mgr.set_link_timeout(5, 30).unwrap();
        assert_eq!(mgr.lookup(5).unwrap().link_timeout_secs, Some(30));
    }
}
