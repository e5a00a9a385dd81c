//! The bus attachment: one addressable peer on the object bus.
//!
//! A `BusAttachment` composes the object registry, signal router, method
//! dispatcher, session manager, authentication engine, and key store behind
//! a single facade. One receive task per attachment serializes all inbound
//! wire messages; handler invocation runs on per-session lanes off the
//! critical receive path, so a stalled handler cannot block unrelated
//! traffic, while handlers for the same session never run concurrently.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use obus_crypto::Guid;
use obus_msg::codec::{decode_all, encode_all, Value};
use obus_msg::message::flags as msg_flags;
use obus_msg::signature::TypeNode;
use obus_msg::{Message, MessageType, MsgArg};
use obus_transport::hub::well_known as hub_names;
use obus_transport::{BusEndpoint, Transport};

use crate::about::{
    well_known as about_names, AboutData, AboutInterests, AboutListener, ObjectDescription,
};
use crate::auth::{AuthAbort, AuthEngine, AuthListener, InitiatorStep, MAX_ATTEMPTS};
use crate::dispatch::{MethodDispatcher, DEFAULT_CALL_TIMEOUT_MS};
use crate::errors::{BusError, ErrorCode};
use crate::interface::builtin;
use crate::introspect;
use crate::keystore::{InMemoryKeyStore, KeyStore, KeyStoreEntry};
use crate::object::{BusObject, MethodContext, ObjectRegistry};
use crate::sessions::{
    SessionId, SessionListener, SessionLostReason, SessionManager, SessionOpts, SessionPort,
    SessionPortListener, TrafficType,
};
use crate::signals::{SignalHandler, SignalRouter};

/// Members of the reserved bus control interface.
mod control {
    pub const JOIN_SESSION: &str = "JoinSession";
    pub const LEAVE_SESSION: &str = "LeaveSession";
    pub const PROBE: &str = "Probe";
    pub const EXCHANGE_GUIDS: &str = "ExchangeGuids";
    pub const AUTH_SKIP: &str = "AuthSkip";
    pub const AUTH_BEGIN: &str = "AuthBegin";
    pub const AUTH_EXCHANGE: &str = "AuthExchange";
    pub const AUTH_FINISH: &str = "AuthFinish";

    pub const MEMBER_ADDED: &str = "MemberAdded";
    pub const MEMBER_REMOVED: &str = "MemberRemoved";
    pub const SESSION_CLOSED: &str = "SessionClosed";
}

type LaneTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// ============================================================================
// Listener
// ============================================================================

/// Bus-level events: discovery results and connection loss.
#[async_trait]
pub trait BusListener: Send + Sync {
    async fn found_advertised_name(&self, _name: &str, _transport: u16, _prefix: &str) {}

    async fn lost_advertised_name(&self, _name: &str, _transport: u16, _prefix: &str) {}

    async fn bus_disconnected(&self) {}
}

// ============================================================================
// Lifecycle
// ============================================================================

#[derive(Clone)]
struct Connection {
    endpoint: Arc<dyn BusEndpoint>,
    unique_name: String,
    torn_down: Arc<AtomicBool>,
}

enum LifeState {
    Created,
    Connected(Connection),
    Disconnected,
    Destroyed,
}

/// Options for one outgoing method call.
#[derive(Debug, Clone, Copy)]
pub struct CallOpts {
    pub timeout: Duration,
    pub flags: u8,
}

impl Default for CallOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            flags: 0,
        }
    }
}

/// Options for one signal emission.
#[derive(Debug, Clone, Default)]
pub struct SignalOpts {
    /// 0 = sessionless/broadcast
    pub session_id: u32,
    /// Address a single peer instead of broadcasting
    pub destination: Option<String>,
    pub flags: u8,
}

// ============================================================================
// BusAttachment
// ============================================================================

pub(crate) struct BusInner {
    guid: Guid,
    state: RwLock<LifeState>,
    registry: ObjectRegistry,
    router: SignalRouter,
    dispatcher: MethodDispatcher,
    sessions: SessionManager,
    auth: AuthEngine,
    keystore: Arc<dyn KeyStore>,
    bus_listeners: RwLock<Vec<Arc<dyn BusListener>>>,
    about_interests: AboutInterests,
    announcement: Mutex<Option<(SessionPort, AboutData)>>,
    lanes: Mutex<HashMap<u32, mpsc::UnboundedSender<LaneTask>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let LifeState::Connected(conn) = &*self.state.get_mut() {
            let endpoint = Arc::clone(&conn.endpoint);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { endpoint.close().await });
            }
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// A peer's handle onto the distributed object bus. Cheap to clone.
#[derive(Clone)]
pub struct BusAttachment {
    inner: Arc<BusInner>,
}

impl BusAttachment {
    /// Create an attachment with a fresh GUID and an in-memory key store.
    pub fn new() -> Result<Self, BusError> {
        Self::with_keystore(Arc::new(InMemoryKeyStore::new()))
    }

    /// Create an attachment backed by the given key store.
    pub fn with_keystore(keystore: Arc<dyn KeyStore>) -> Result<Self, BusError> {
        let guid = Guid::generate()
            .map_err(|e| BusError::with_message(ErrorCode::Fail, e.to_string()))?;
        Ok(Self {
            inner: Arc::new(BusInner {
                auth: AuthEngine::new(guid.to_string()),
                guid,
                state: RwLock::new(LifeState::Created),
                registry: ObjectRegistry::new(),
                router: SignalRouter::new(),
                dispatcher: MethodDispatcher::new(),
                sessions: SessionManager::new(),
                keystore,
                bus_listeners: RwLock::new(Vec::new()),
                about_interests: AboutInterests::new(),
                announcement: Mutex::new(None),
                lanes: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn guid(&self) -> &Guid {
        &self.inner.guid
    }

    pub fn keystore(&self) -> Arc<dyn KeyStore> {
        Arc::clone(&self.inner.keystore)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Attach to the bus through `transport` and start the receive task.
    pub async fn connect(&self, transport: &dyn Transport) -> Result<(), BusError> {
        {
            let state = self.inner.state.read();
            match &*state {
                LifeState::Created | LifeState::Disconnected => {}
                LifeState::Connected(_) => {
                    return Err(BusError::new(ErrorCode::BusAlreadyConnected))
                }
                LifeState::Destroyed => return Err(BusError::new(ErrorCode::BusDestroyed)),
            }
        }

        let endpoint = transport.connect(&self.inner.guid.short()).await?;
        let conn = Connection {
            unique_name: endpoint.unique_name().to_string(),
            endpoint,
            torn_down: Arc::new(AtomicBool::new(false)),
        };

        let raced = {
            let mut state = self.inner.state.write();
            match &*state {
                LifeState::Created | LifeState::Disconnected => {
                    *state = LifeState::Connected(conn.clone());
                    None
                }
                LifeState::Connected(_) => Some(ErrorCode::BusAlreadyConnected),
                LifeState::Destroyed => Some(ErrorCode::BusDestroyed),
            }
        };
        if let Some(code) = raced {
            conn.endpoint.close().await;
            return Err(BusError::new(code));
        }

        let inner = Arc::clone(&self.inner);
        let rx_conn = conn.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx_conn.endpoint.recv().await {
                    Ok(msg) => handle_inbound(&inner, msg),
                    Err(_) => break,
                }
            }
            // Remote-initiated loss converges on the same teardown path.
            // Only this task's own connection may flip the state: a late
            // finish must not clobber a newer connection.
            {
                let mut state = inner.state.write();
                if let LifeState::Connected(current) = &*state {
                    if Arc::ptr_eq(&current.torn_down, &rx_conn.torn_down) {
                        *state = LifeState::Disconnected;
                    }
                }
            }
            teardown(&inner, &rx_conn).await;
        });
        self.inner.tasks.lock().push(task);

        debug!(unique = %conn.unique_name, "bus attachment connected");
        Ok(())
    }

    /// Detach from the bus, flushing pending calls and tearing down
    /// sessions deterministically.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let conn = {
            let mut state = self.inner.state.write();
            match &*state {
                LifeState::Connected(conn) => {
                    let conn = conn.clone();
                    *state = LifeState::Disconnected;
                    conn
                }
                LifeState::Destroyed => return Err(BusError::new(ErrorCode::BusDestroyed)),
                _ => return Err(BusError::new(ErrorCode::BusNotConnected)),
            }
        };
        conn.endpoint.close().await;
        teardown(&self.inner, &conn).await;
        Ok(())
    }

    /// Disconnect and release every registration. Post-destroy calls fail
    /// fast with a state error rather than touching freed state.
    pub async fn destroy(&self) {
        let _ = self.disconnect().await;
        self.inner.registry.clear();
        self.inner.router.unregister_all();
        self.inner.about_interests.unregister_all();
        self.inner.bus_listeners.write().clear();
        *self.inner.state.write() = LifeState::Destroyed;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.state.read(), LifeState::Connected(_))
    }

    /// The router-assigned unique name.
    pub fn unique_name(&self) -> Result<String, BusError> {
        Ok(self.connection()?.unique_name)
    }

    fn connection(&self) -> Result<Connection, BusError> {
        match &*self.inner.state.read() {
            LifeState::Connected(conn) => Ok(conn.clone()),
            LifeState::Destroyed => Err(BusError::new(ErrorCode::BusDestroyed)),
            _ => Err(BusError::new(ErrorCode::BusNotConnected)),
        }
    }

    // -------------------------------------------------------------------------
    // Names and discovery
    // -------------------------------------------------------------------------

    /// Claim a well-known name. Ok(false) when another peer owns it.
    pub async fn request_name(&self, name: &str) -> Result<bool, BusError> {
        obus_msg::validation::validate_bus_name(name)?;
        Ok(self.connection()?.endpoint.request_name(name).await?)
    }

    pub async fn release_name(&self, name: &str) -> Result<(), BusError> {
        Ok(self.connection()?.endpoint.release_name(name).await?)
    }

    pub async fn advertise_name(&self, name: &str) -> Result<(), BusError> {
        Ok(self.connection()?.endpoint.advertise_name(name).await?)
    }

    pub async fn cancel_advertise_name(&self, name: &str) -> Result<(), BusError> {
        Ok(self
            .connection()?
            .endpoint
            .cancel_advertise_name(name)
            .await?)
    }

    /// Register interest in advertised names with this prefix; results
    /// arrive via `BusListener::found_advertised_name`.
    pub async fn find_advertised_name(&self, prefix: &str) -> Result<(), BusError> {
        Ok(self
            .connection()?
            .endpoint
            .find_advertised_name(prefix)
            .await?)
    }

    pub async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), BusError> {
        Ok(self
            .connection()?
            .endpoint
            .cancel_find_advertised_name(prefix)
            .await?)
    }

    pub fn register_bus_listener(&self, listener: Arc<dyn BusListener>) {
        self.inner.bus_listeners.write().push(listener);
    }

    pub fn unregister_bus_listener(&self, listener: &Arc<dyn BusListener>) {
        self.inner
            .bus_listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    // -------------------------------------------------------------------------
    // Objects and signals
    // -------------------------------------------------------------------------

    /// Expose an object. Fails on a duplicate or malformed path.
    pub fn register_object(&self, object: BusObject) -> Result<(), BusError> {
        self.fail_if_destroyed()?;
        self.inner.registry.register(object).map(|_| ())
    }

    /// Withdraw an object, detaching its handlers. Idempotent.
    pub fn unregister_object(&self, path: &str) {
        self.inner.registry.unregister(path);
    }

    pub fn register_signal_handler(
        &self,
        handler: Arc<dyn SignalHandler>,
        signal_name: &str,
        source_path: Option<&str>,
    ) -> Result<(), BusError> {
        self.fail_if_destroyed()?;
        self.inner.router.register(handler, signal_name, source_path)
    }

    pub fn unregister_signal_handler(
        &self,
        handler: &Arc<dyn SignalHandler>,
        signal_name: &str,
        source_path: Option<&str>,
    ) {
        self.inner.router.unregister(handler, signal_name, source_path);
    }

    /// Emit a signal from a registered object. Encodes per the declared
    /// signature, stamps session id and flags, and hands off to the
    /// transport without blocking on delivery.
    pub async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: &[Value],
        opts: SignalOpts,
    ) -> Result<(), BusError> {
        let object = self.inner.registry.lookup(path).ok_or_else(|| {
            BusError::with_message(ErrorCode::BusNoSuchObject, format!("no object at '{}'", path))
        })?;
        let iface = object
            .interface(interface)
            .ok_or_else(|| BusError::new(ErrorCode::BusUnknownInterface))?;
        let signal = iface
            .signal(member)
            .ok_or_else(|| BusError::new(ErrorCode::BusObjectNoSuchMember))?;

        let body = encode_all(args, &signal.sig)?;
        let conn = self.connection()?;

        let targets: Vec<Option<String>> = match (&opts.destination, opts.session_id) {
            (Some(dest), _) => vec![Some(dest.clone())],
            (None, 0) => vec![None],
            (None, session_id) => {
                // Session-scoped: directed copies to each participant.
                let info = self
                    .inner
                    .sessions
                    .lookup(session_id)
                    .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
                let mut targets: Vec<Option<String>> =
                    info.members.iter().cloned().map(Some).collect();
                if !info.is_host {
                    targets.push(Some(info.host.clone()));
                }
                targets
            }
        };

        for target in targets {
            let mut msg = Message::signal(path, interface, member, body.clone())
                .with_session(opts.session_id)
                .with_flags(opts.flags);
            if let Some(dest) = target {
                msg = msg.with_destination(dest);
            }
            msg.header.serial = self.inner.dispatcher.next_serial();
            conn.endpoint.send(msg).await?;
        }
        Ok(())
    }

    /// A handle for calling methods on a remote object.
    pub fn proxy(&self, destination: &str, path: &str) -> crate::proxy::ProxyObject {
        crate::proxy::ProxyObject::new(self.clone(), destination, path, 0)
    }

    /// A proxy whose calls ride an established session.
    pub fn proxy_on_session(
        &self,
        destination: &str,
        path: &str,
        session_id: SessionId,
    ) -> crate::proxy::ProxyObject {
        crate::proxy::ProxyObject::new(self.clone(), destination, path, session_id)
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Bind a session port; the listener gates joiners.
    pub fn bind_session_port(
        &self,
        port: SessionPort,
        opts: SessionOpts,
        listener: Arc<dyn SessionPortListener>,
    ) -> Result<SessionPort, BusError> {
        self.fail_if_destroyed()?;
        self.inner.sessions.bind(port, opts, listener)
    }

    /// Unbind a port. An accept in flight is cancelled safely and fires no
    /// stale callbacks.
    pub fn unbind_session_port(&self, port: SessionPort) -> Result<(), BusError> {
        self.inner.sessions.unbind(port)
    }

    /// Join a session bound at `host:port`. Returns the bus-assigned id and
    /// the negotiated options (never broader than either side requested).
    pub async fn join_session(
        &self,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(SessionId, SessionOpts), BusError> {
        let body = vec![
            MsgArg::Uint16(port),
            MsgArg::Byte(opts.traffic as u8),
            MsgArg::Bool(opts.multipoint),
            MsgArg::Byte(opts.proximity),
            MsgArg::Uint16(opts.transports),
        ];
        let reply = self.control_call(host, control::JOIN_SESSION, body).await?;

        let status = arg_u32(&reply.body, 0)?;
        if status != 0 {
            return Err(BusError::new(ErrorCode::from_status(status)));
        }
        let id = arg_u32(&reply.body, 1)?;
        let traffic = TrafficType::from_wire(arg_u8(&reply.body, 2)?)
            .ok_or_else(|| BusError::new(ErrorCode::BusUnexpectedDisposition))?;
        let negotiated = SessionOpts {
            traffic,
            multipoint: arg_bool(&reply.body, 3)?,
            proximity: arg_u8(&reply.body, 4)?,
            transports: arg_u16(&reply.body, 5)?,
        };
        let members = arg_str_array(&reply.body, 6)?;

        self.inner
            .sessions
            .insert_joined(id, port, host, negotiated, members, listener)?;
        debug!(id, host, port, "session joined");
        Ok((id, negotiated))
    }

    /// Leave a session. The binder leaving closes the session for every
    /// member; a joiner leaving notifies the binder.
    pub async fn leave_session(&self, id: SessionId) -> Result<(), BusError> {
        let info = self
            .inner
            .sessions
            .lookup(id)
            .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;

        if info.is_host {
            let info = match self.inner.sessions.remove_session(id) {
                Some(info) => info,
                None => return Ok(()), // concurrently torn down
            };
            for member in &info.members {
                self.send_control_signal(
                    member,
                    control::SESSION_CLOSED,
                    vec![
                        MsgArg::Uint32(id),
                        MsgArg::Uint32(SessionLostReason::BinderLeft as u32),
                    ],
                )
                .await
                .ok();
            }
        } else {
            if self.inner.sessions.remove_session(id).is_none() {
                return Ok(());
            }
            // Best effort: the host may already be gone.
            self.control_call(&info.host, control::LEAVE_SESSION, vec![MsgArg::Uint32(id)])
                .await
                .ok();
        }
        Ok(())
    }

    /// Remove one member from a hosted multipoint session (binder only).
    pub async fn remove_session_member(
        &self,
        id: SessionId,
        member: &str,
    ) -> Result<(), BusError> {
        self.inner.sessions.check_remove_member(id, member)?;
        let info = self.inner.sessions.remove_member(id, member)?;

        // The removed member converges on session_lost(REMOVED_BY_BINDER).
        self.send_control_signal(
            member,
            control::SESSION_CLOSED,
            vec![
                MsgArg::Uint32(id),
                MsgArg::Uint32(SessionLostReason::RemovedByBinder as u32),
            ],
        )
        .await
        .ok();

        // Everyone else sees a membership change.
        for other in &info.members {
            self.send_control_signal(
                other,
                control::MEMBER_REMOVED,
                vec![MsgArg::Uint32(id), MsgArg::Str(member.to_string())],
            )
            .await
            .ok();
        }
        if let Some(listener) = info.listener {
            listener.session_member_removed(id, member).await;
        }
        Ok(())
    }

    /// Install the observer for an established session.
    pub fn set_session_listener(
        &self,
        id: SessionId,
        listener: Arc<dyn SessionListener>,
    ) -> Result<(), BusError> {
        self.inner.sessions.set_session_listener(id, listener)
    }

    /// Arm keep-alive probes; a probe round that exceeds the window
    /// converges into `session_lost(LINK_TIMEOUT)`.
    pub fn set_link_timeout(&self, id: SessionId, secs: u32) -> Result<(), BusError> {
        self.inner.sessions.set_link_timeout(id, secs)?;
        let inner = Arc::clone(&self.inner);
        let interval = Duration::from_secs((secs / 2).max(1) as u64);
        let probe_timeout = Duration::from_secs(secs.max(1) as u64);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let info = match inner.sessions.lookup(id) {
                    Some(info) => info,
                    None => break,
                };
                let targets: Vec<String> = if info.is_host {
                    info.members.clone()
                } else {
                    vec![info.host.clone()]
                };
                for target in targets {
                    let alive = probe_peer(&inner, &target, id, probe_timeout).await;
                    if alive {
                        continue;
                    }
                    if info.is_host && info.opts.multipoint {
                        // One member fell off a multipoint session.
                        if inner.sessions.remove_member(id, &target).is_ok() {
                            notify_member_loss(&inner, id, &target).await;
                        }
                    } else {
                        teardown_session_local(&inner, id, SessionLostReason::LinkTimeout).await;
                        return;
                    }
                }
            }
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    pub fn session_info(&self, id: SessionId) -> Option<crate::sessions::SessionInfo> {
        self.inner.sessions.lookup(id)
    }

    // -------------------------------------------------------------------------
    // Security
    // -------------------------------------------------------------------------

    /// Arm peer security. Inert until a peer interaction first requires it.
    pub fn enable_peer_security(
        &self,
        mechanisms: &[&str],
        listener: Arc<dyn AuthListener>,
    ) -> Result<(), BusError> {
        self.fail_if_destroyed()?;
        self.inner
            .auth
            .enable(mechanisms.iter().map(|m| m.to_string()).collect(), listener);
        Ok(())
    }

    /// Run (or skip, via the key store) the handshake with `peer`.
    ///
    /// Resolves immediately when the peer is already authenticated on this
    /// connection. Otherwise exchanges GUIDs, reuses a valid unexpired key
    /// store entry without re-prompting, or runs the mechanism rounds.
    pub async fn ensure_authenticated(&self, peer: &str) -> Result<(), BusError> {
        ensure_authenticated(&self.inner, self, peer).await
    }

    /// Drop one peer's persisted key.
    pub async fn clear_keys(&self, guid: &str) -> Result<(), BusError> {
        self.inner
            .keystore
            .clear_key(guid)
            .await
            .map_err(|e| BusError::with_message(ErrorCode::Fail, e.to_string()))
    }

    // -------------------------------------------------------------------------
    // About
    // -------------------------------------------------------------------------

    /// Broadcast the About announcement for this attachment.
    ///
    /// Validation failures (a missing required field) are raised here,
    /// before anything reaches the wire.
    pub async fn announce(&self, port: SessionPort, data: &AboutData) -> Result<(), BusError> {
        let data_arg = data.to_arg()?;

        let mut objects: Vec<MsgArg> = Vec::new();
        for path in self.inner.registry.paths() {
            if let Some(object) = self.inner.registry.lookup(&path) {
                let interfaces: Vec<MsgArg> = object
                    .interfaces()
                    .iter()
                    .map(|i| MsgArg::Str(i.name.clone()))
                    .collect();
                objects.push(MsgArg::Struct(vec![
                    MsgArg::ObjectPath(path.clone()),
                    MsgArg::Array {
                        elem: TypeNode::Str,
                        items: interfaces,
                    },
                ]));
            }
        }

        let body = vec![
            MsgArg::Uint16(about_names::ABOUT_VERSION),
            MsgArg::Uint16(port),
            MsgArg::Array {
                elem: TypeNode::Struct(vec![
                    TypeNode::ObjectPath,
                    TypeNode::Array(Box::new(TypeNode::Str)),
                ]),
                items: objects,
            },
            data_arg,
        ];

        let mut msg = Message::signal(
            about_names::ABOUT_PATH,
            about_names::ABOUT_INTERFACE,
            about_names::ANNOUNCE,
            body,
        )
        .with_flags(msg_flags::GLOBAL_BROADCAST);
        msg.header.serial = self.inner.dispatcher.next_serial();

        let conn = self.connection()?;
        conn.endpoint.send(msg).await?;
        *self.inner.announcement.lock() = Some((port, data.clone()));
        Ok(())
    }

    /// Retract the current announcement.
    pub fn cancel_announcement(&self) {
        *self.inner.announcement.lock() = None;
    }

    /// The announcement currently in effect, if any.
    pub fn current_announcement(&self) -> Option<(SessionPort, AboutData)> {
        self.inner.announcement.lock().clone()
    }

    /// Register interest in announcements implementing all `interfaces`.
    pub fn who_implements(
        &self,
        interfaces: &[&str],
        listener: Arc<dyn AboutListener>,
    ) -> Result<(), BusError> {
        self.fail_if_destroyed()?;
        self.inner.about_interests.register(listener, interfaces);
        Ok(())
    }

    pub fn unregister_about_listener(&self, listener: &Arc<dyn AboutListener>) {
        self.inner.about_interests.unregister(listener);
    }

    /// Bulk teardown: leaves zero residual About registrations.
    pub fn unregister_all_about_listeners(&self) {
        self.inner.about_interests.unregister_all();
    }

    // -------------------------------------------------------------------------
    // Internals shared with ProxyObject
    // -------------------------------------------------------------------------

    pub(crate) async fn call_raw(
        &self,
        mut msg: Message,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let conn = self.connection()?;
        let serial = self.inner.dispatcher.next_serial();
        msg.header.serial = serial;

        if msg.no_reply_expected() {
            conn.endpoint.send(msg).await?;
            // The caller gets nothing further, by declaration.
            return Ok(Message::signal("/", "org.obus.Bus", "NoReply", vec![]));
        }

        let mut rx = self.inner.dispatcher.register(serial);
        if let Err(e) = conn.endpoint.send(msg).await {
            self.inner.dispatcher.abandon(serial);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::new(ErrorCode::BusNotConnected)),
            Err(_) => {
                if self.inner.dispatcher.fail_timeout(serial) {
                    Err(BusError::new(ErrorCode::Timeout))
                } else {
                    // The reply raced in between the deadline and now.
                    match rx.try_recv() {
                        Ok(result) => result,
                        Err(_) => Err(BusError::new(ErrorCode::Timeout)),
                    }
                }
            }
        }
    }

    pub(crate) async fn control_call(
        &self,
        destination: &str,
        member: &str,
        body: Vec<MsgArg>,
    ) -> Result<Message, BusError> {
        let msg = Message::method_call(
            destination,
            hub_names::BUS_PATH,
            hub_names::BUS_INTERFACE,
            member,
            body,
        );
        self.call_raw(msg, Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS))
            .await
    }

    async fn send_control_signal(
        &self,
        destination: &str,
        member: &str,
        body: Vec<MsgArg>,
    ) -> Result<(), BusError> {
        let conn = self.connection()?;
        let mut msg = Message::signal(
            hub_names::BUS_PATH,
            hub_names::BUS_INTERFACE,
            member,
            body,
        )
        .with_destination(destination);
        msg.header.serial = self.inner.dispatcher.next_serial();
        conn.endpoint.send(msg).await?;
        Ok(())
    }

    fn fail_if_destroyed(&self) -> Result<(), BusError> {
        if matches!(&*self.inner.state.read(), LifeState::Destroyed) {
            return Err(BusError::new(ErrorCode::BusDestroyed));
        }
        Ok(())
    }
}

// ============================================================================
// Inbound Pipeline
// ============================================================================

fn lane_sender(inner: &Arc<BusInner>, lane: u32) -> mpsc::UnboundedSender<LaneTask> {
    let mut lanes = inner.lanes.lock();
    if let Some(tx) = lanes.get(&lane) {
        if !tx.is_closed() {
            return tx.clone();
        }
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneTask>();
    let worker = tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            task.await;
        }
    });
    inner.tasks.lock().push(worker);
    lanes.insert(lane, tx.clone());
    tx
}

fn on_lane(
    inner: &Arc<BusInner>,
    lane: u32,
    task: impl Future<Output = ()> + Send + 'static,
) {
    let _ = lane_sender(inner, lane).send(Box::pin(task));
}

/// Classify one inbound message. Runs on the receive task: stays quick, and
/// pushes handler invocation onto lanes or free tasks.
fn handle_inbound(inner: &Arc<BusInner>, msg: Message) {
    match msg.header.msg_type {
        MessageType::MethodReturn | MessageType::Error => {
            inner.dispatcher.resolve_reply(msg);
        }
        MessageType::MethodCall => {
            let iface = msg.header.interface.as_deref().unwrap_or("");
            if iface == hub_names::BUS_INTERFACE {
                let member = msg.header.member.as_deref().unwrap_or("");
                match member {
                    // Joins and auth rounds block on host callbacks; they
                    // get free tasks so unrelated control traffic flows.
                    control::JOIN_SESSION
                    | control::EXCHANGE_GUIDS
                    | control::AUTH_SKIP
                    | control::AUTH_BEGIN
                    | control::AUTH_EXCHANGE
                    | control::AUTH_FINISH => {
                        let inner2 = Arc::clone(inner);
                        tokio::spawn(async move { handle_control_call(&inner2, msg).await });
                    }
                    _ => {
                        let inner2 = Arc::clone(inner);
                        on_lane(inner, 0, async move {
                            handle_control_call(&inner2, msg).await;
                        });
                    }
                }
            } else {
                let lane = msg.header.session_id;
                let inner2 = Arc::clone(inner);
                on_lane(inner, lane, async move {
                    handle_object_call(&inner2, msg).await;
                });
            }
        }
        MessageType::Signal => {
            let iface = msg.header.interface.as_deref().unwrap_or("");
            if iface == hub_names::BUS_INTERFACE {
                let inner2 = Arc::clone(inner);
                on_lane(inner, 0, async move {
                    handle_control_signal(&inner2, msg).await;
                });
            } else if iface == about_names::ABOUT_INTERFACE
                && msg.header.member.as_deref() == Some(about_names::ANNOUNCE)
            {
                let inner2 = Arc::clone(inner);
                on_lane(inner, 0, async move {
                    handle_announcement(&inner2, msg).await;
                });
            } else {
                let lane = msg.header.session_id;
                let inner2 = Arc::clone(inner);
                on_lane(inner, lane, async move {
                    let handlers = inner2.router.matching(&msg);
                    let ctx = SignalRouter::context_for(&msg);
                    for handler in handlers {
                        handler.on_signal(ctx.clone()).await;
                    }
                });
            }
        }
    }
}

async fn send_on(inner: &Arc<BusInner>, msg: Message) {
    let endpoint = match &*inner.state.read() {
        LifeState::Connected(conn) => Arc::clone(&conn.endpoint),
        _ => return,
    };
    if let Err(e) = endpoint.send(msg).await {
        debug!("send failed: {}", e);
    }
}

async fn reply_ok(inner: &Arc<BusInner>, call: &Message, body: Vec<MsgArg>) {
    if call.no_reply_expected() {
        return;
    }
    let mut reply = Message::method_return(call, body);
    reply.header.serial = inner.dispatcher.next_serial();
    send_on(inner, reply).await;
}

async fn reply_err(inner: &Arc<BusInner>, call: &Message, err: &BusError) {
    if call.no_reply_expected() {
        return;
    }
    let mut reply = Message::error_reply(call, err.name.clone(), Some(err.message.clone()));
    reply.header.serial = inner.dispatcher.next_serial();
    send_on(inner, reply).await;
}

// ============================================================================
// Object Call Handling
// ============================================================================

async fn handle_object_call(inner: &Arc<BusInner>, msg: Message) {
    let result = dispatch_object_call(inner, &msg).await;
    match result {
        Ok(Some(body)) => reply_ok(inner, &msg, body).await,
        Ok(None) => {} // declared NoReply
        Err(err) => reply_err(inner, &msg, &err).await,
    }
}

async fn dispatch_object_call(
    inner: &Arc<BusInner>,
    msg: &Message,
) -> Result<Option<Vec<MsgArg>>, BusError> {
    let path = msg
        .header
        .path
        .as_deref()
        .ok_or_else(|| BusError::with_message(ErrorCode::BusBadSignature, "missing path"))?;
    let iface_name = msg.header.interface.as_deref().ok_or_else(|| {
        BusError::with_message(ErrorCode::BusUnknownInterface, "missing interface")
    })?;
    let member = msg
        .header
        .member
        .as_deref()
        .ok_or_else(|| BusError::with_message(ErrorCode::BusBadSignature, "missing member"))?;
    let sender = msg.header.sender.clone().unwrap_or_default();

    // Generated built-ins first.
    match iface_name {
        builtin::INTROSPECTABLE if member == builtin::INTROSPECT => {
            let children = inner.registry.children_of(path);
            let xml = match inner.registry.lookup(path) {
                Some(object) => introspect::introspect(&object, &children),
                None if !children.is_empty() => introspect::introspect_stub(path, &children),
                None => return Err(BusError::new(ErrorCode::BusNoSuchObject)),
            };
            return Ok(Some(vec![MsgArg::Str(xml)]));
        }
        builtin::PEER => {
            return match member {
                builtin::PING => Ok(Some(vec![])),
                builtin::GET_MACHINE_ID => {
                    Ok(Some(vec![MsgArg::Str(inner.guid.to_string())]))
                }
                _ => Err(BusError::new(ErrorCode::BusObjectNoSuchMember)),
            };
        }
        builtin::PROPERTIES => {
            let object = inner
                .registry
                .lookup(path)
                .ok_or_else(|| BusError::new(ErrorCode::BusNoSuchObject))?;
            return handle_properties(&object, member, msg).await.map(Some);
        }
        _ => {}
    }

    let resolved = inner.registry.resolve(path, iface_name, member)?;

    // Secured interfaces refuse unauthenticated peers.
    if resolved.interface.secure && !inner.auth.peer_authenticated(&sender) {
        return Err(BusError::with_message(
            ErrorCode::AuthFail,
            format!("interface '{}' requires authentication", iface_name),
        ));
    }

    // Decode per the declared input signature; mismatches never reach the
    // handler.
    if msg.header.signature != resolved.method.in_sig {
        return Err(BusError::with_message(
            ErrorCode::BusBadSignature,
            format!(
                "expected '{}', got '{}'",
                resolved.method.in_sig.text(),
                msg.header.signature.text()
            ),
        ));
    }
    let args = decode_all(&msg.body);

    let ctx = MethodContext {
        sender,
        session_id: msg.header.session_id,
        path: path.to_string(),
        interface: iface_name.to_string(),
        member: member.to_string(),
        args,
    };

    let result = resolved.handler.handle(ctx).await;
    if resolved.method.no_reply {
        return Ok(None);
    }
    match result {
        Ok(values) => {
            let body = encode_all(&values, &resolved.method.out_sig).map_err(|e| {
                // The handler broke its own declared output signature.
                warn!("handler output mismatch on {}.{}: {}", iface_name, member, e);
                BusError::with_message(ErrorCode::BusBadSignature, e.to_string())
            })?;
            Ok(Some(body))
        }
        Err(err) => Err(err),
    }
}

async fn handle_properties(
    object: &Arc<BusObject>,
    member: &str,
    msg: &Message,
) -> Result<Vec<MsgArg>, BusError> {
    let handler = object
        .property_handler()
        .ok_or_else(|| BusError::new(ErrorCode::BusNoSuchProperty))?;
    let args = decode_all(&msg.body);

    let iface_name = match args.first() {
        Some(Value::Str(s)) => s.clone(),
        _ => return Err(BusError::new(ErrorCode::BadArgCount)),
    };
    let iface = object
        .interface(&iface_name)
        .ok_or_else(|| BusError::new(ErrorCode::BusUnknownInterface))?;

    match member {
        builtin::GET => {
            let prop_name = match args.get(1) {
                Some(Value::Str(s)) => s.clone(),
                _ => return Err(BusError::new(ErrorCode::BadArgCount)),
            };
            let prop = iface
                .property(&prop_name)
                .ok_or_else(|| BusError::new(ErrorCode::BusNoSuchProperty))?;
            if !prop.access.readable() {
                return Err(BusError::new(ErrorCode::BusPropertyAccessDenied));
            }
            let value = handler.get(&iface_name, &prop_name).await?;
            let arg = obus_msg::codec::encode(
                &Value::Variant {
                    node: prop.sig.clone(),
                    value: Box::new(value),
                },
                &TypeNode::Variant,
            )?;
            Ok(vec![arg])
        }
        builtin::SET => {
            let prop_name = match args.get(1) {
                Some(Value::Str(s)) => s.clone(),
                _ => return Err(BusError::new(ErrorCode::BadArgCount)),
            };
            let prop = iface
                .property(&prop_name)
                .ok_or_else(|| BusError::new(ErrorCode::BusNoSuchProperty))?;
            if !prop.access.writable() {
                return Err(BusError::new(ErrorCode::BusPropertyAccessDenied));
            }
            let (node, value) = match args.get(2) {
                Some(Value::Variant { node, value }) => (node.clone(), (**value).clone()),
                _ => return Err(BusError::new(ErrorCode::BadArgCount)),
            };
            if node != prop.sig {
                return Err(BusError::with_message(
                    ErrorCode::BusBadSignature,
                    format!(
                        "property '{}' expects '{}', got '{}'",
                        prop_name,
                        prop.sig.signature_string(),
                        node.signature_string()
                    ),
                ));
            }
            handler.set(&iface_name, &prop_name, value).await?;
            Ok(vec![])
        }
        builtin::GET_ALL => {
            let mut entries: Vec<(MsgArg, MsgArg)> = Vec::new();
            for prop in &iface.properties {
                if !prop.access.readable() {
                    continue;
                }
                let value = handler.get(&iface_name, &prop.name).await?;
                let variant = obus_msg::codec::encode(
                    &Value::Variant {
                        node: prop.sig.clone(),
                        value: Box::new(value),
                    },
                    &TypeNode::Variant,
                )?;
                entries.push((MsgArg::Str(prop.name.clone()), variant));
            }
            Ok(vec![MsgArg::Dict {
                key: TypeNode::Str,
                value: TypeNode::Variant,
                entries,
            }])
        }
        _ => Err(BusError::new(ErrorCode::BusObjectNoSuchMember)),
    }
}

// ============================================================================
// Control Plane
// ============================================================================

async fn handle_control_call(inner: &Arc<BusInner>, msg: Message) {
    let member = msg.header.member.clone().unwrap_or_default();
    let result = match member.as_str() {
        control::JOIN_SESSION => handle_join_session(inner, &msg).await,
        control::LEAVE_SESSION => handle_leave_session(inner, &msg).await,
        control::PROBE => handle_probe(inner, &msg),
        control::EXCHANGE_GUIDS => handle_exchange_guids(inner, &msg),
        control::AUTH_SKIP => handle_auth_skip(inner, &msg).await,
        control::AUTH_BEGIN => handle_auth_begin(inner, &msg).await,
        control::AUTH_EXCHANGE => handle_auth_exchange(inner, &msg).await,
        control::AUTH_FINISH => handle_auth_finish(inner, &msg).await,
        _ => Err(BusError::new(ErrorCode::BusObjectNoSuchMember)),
    };
    match result {
        Ok(body) => reply_ok(inner, &msg, body).await,
        Err(err) => reply_err(inner, &msg, &err).await,
    }
}

fn my_unique_name(inner: &Arc<BusInner>) -> String {
    match &*inner.state.read() {
        LifeState::Connected(conn) => conn.unique_name.clone(),
        _ => String::new(),
    }
}

async fn handle_join_session(
    inner: &Arc<BusInner>,
    msg: &Message,
) -> Result<Vec<MsgArg>, BusError> {
    let joiner = msg.header.sender.clone().unwrap_or_default();
    let port = arg_u16(&msg.body, 0)?;
    let requested = SessionOpts {
        traffic: TrafficType::from_wire(arg_u8(&msg.body, 1)?)
            .ok_or_else(|| BusError::new(ErrorCode::JoinSessionReplyBadSessionOpts))?,
        multipoint: arg_bool(&msg.body, 2)?,
        proximity: arg_u8(&msg.body, 3)?,
        transports: arg_u16(&msg.body, 4)?,
    };

    let status_reply = |status: ErrorCode| {
        vec![
            MsgArg::Uint32(status as u32),
            MsgArg::Uint32(0),
            MsgArg::Byte(requested.traffic as u8),
            MsgArg::Bool(requested.multipoint),
            MsgArg::Byte(0),
            MsgArg::Uint16(0),
            str_array_arg::<&str>(&[]),
        ]
    };

    let gate = match inner.sessions.accept_gate(port) {
        Some(gate) => gate,
        None => return Ok(status_reply(ErrorCode::JoinSessionReplyNoSession)),
    };

    let negotiated = match SessionOpts::negotiate(&gate.opts, &requested) {
        Some(negotiated) => negotiated,
        None => return Ok(status_reply(ErrorCode::JoinSessionReplyBadSessionOpts)),
    };

    // The acceptance predicate runs off the table locks.
    let accepted = gate
        .listener
        .accept_session_joiner(port, &joiner, &negotiated)
        .await;
    if !accepted {
        debug!(port, joiner = %joiner, "session join rejected by listener");
        return Ok(status_reply(ErrorCode::JoinSessionReplyRejected));
    }

    let host = my_unique_name(inner);
    let (id, existing) =
        match inner
            .sessions
            .establish_hosted(port, gate.epoch, &host, &joiner, negotiated)
        {
            Ok(result) => result,
            Err(err) => return Ok(status_reply(err.code)),
        };

    gate.listener.session_joined(port, id, &joiner).await;

    if negotiated.multipoint {
        if let Some(info) = inner.sessions.lookup(id) {
            if let Some(listener) = info.listener {
                listener.session_member_added(id, &joiner).await;
            }
        }
        for member in &existing {
            let mut sig = Message::signal(
                hub_names::BUS_PATH,
                hub_names::BUS_INTERFACE,
                control::MEMBER_ADDED,
                vec![MsgArg::Uint32(id), MsgArg::Str(joiner.clone())],
            )
            .with_destination(member.clone());
            sig.header.serial = inner.dispatcher.next_serial();
            send_on(inner, sig).await;
        }
    }

    debug!(id, port, joiner = %joiner, "session established");
    Ok(vec![
        MsgArg::Uint32(0),
        MsgArg::Uint32(id),
        MsgArg::Byte(negotiated.traffic as u8),
        MsgArg::Bool(negotiated.multipoint),
        MsgArg::Byte(negotiated.proximity),
        MsgArg::Uint16(negotiated.transports),
        str_array_arg(&existing),
    ])
}

async fn handle_leave_session(
    inner: &Arc<BusInner>,
    msg: &Message,
) -> Result<Vec<MsgArg>, BusError> {
    let leaver = msg.header.sender.clone().unwrap_or_default();
    let id = arg_u32(&msg.body, 0)?;

    let info = inner
        .sessions
        .lookup(id)
        .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
    if !info.is_host || !info.members.iter().any(|m| m == &leaver) {
        return Err(BusError::new(ErrorCode::BusNoSession));
    }

    if info.opts.multipoint {
        if inner.sessions.remove_member(id, &leaver).is_ok() {
            notify_member_loss(inner, id, &leaver).await;
        }
    } else {
        teardown_session_local(inner, id, SessionLostReason::RemoteEndLeft).await;
    }
    Ok(vec![])
}

fn handle_probe(inner: &Arc<BusInner>, msg: &Message) -> Result<Vec<MsgArg>, BusError> {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let id = arg_u32(&msg.body, 0)?;
    let info = inner
        .sessions
        .lookup(id)
        .ok_or_else(|| BusError::new(ErrorCode::BusNoSession))?;
    let involved = info.host == sender || info.members.iter().any(|m| m == &sender);
    if !involved {
        return Err(BusError::new(ErrorCode::BusNoSession));
    }
    Ok(vec![])
}

fn handle_exchange_guids(inner: &Arc<BusInner>, msg: &Message) -> Result<Vec<MsgArg>, BusError> {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let peer_guid = arg_str(&msg.body, 0)?;
    inner.auth.record_peer_guid(&sender, &peer_guid);
    Ok(vec![MsgArg::Str(inner.auth.local_guid().to_string())])
}

async fn handle_auth_skip(inner: &Arc<BusInner>, msg: &Message) -> Result<Vec<MsgArg>, BusError> {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let guid = inner
        .auth
        .peer_guid(&sender)
        .ok_or_else(|| BusError::new(ErrorCode::AuthFail))?;
    let entry = inner
        .keystore
        .load_key(&guid)
        .await
        .map_err(|e| BusError::with_message(ErrorCode::Fail, e.to_string()))?;
    match entry {
        Some(_) => {
            // Both sides hold the established secret; skip the handshake.
            inner.auth.mark_authenticated(&sender);
            Ok(vec![])
        }
        None => Err(BusError::new(ErrorCode::AuthFail)),
    }
}

async fn handle_auth_begin(inner: &Arc<BusInner>, msg: &Message) -> Result<Vec<MsgArg>, BusError> {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let offered = arg_str_array(&msg.body, 0)?;
    let chosen = inner.auth.common_mechanisms(&offered);
    if chosen.is_empty() {
        // No mechanism agreed: this handshake is over before it began.
        if let Some(listener) = inner.auth.listener() {
            listener.authentication_complete("", &sender, false).await;
        }
    }
    Ok(vec![str_array_arg(&chosen)])
}

async fn handle_auth_exchange(
    inner: &Arc<BusInner>,
    msg: &Message,
) -> Result<Vec<MsgArg>, BusError> {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let mechanism = arg_str(&msg.body, 0)?;
    let attempt = arg_u16(&msg.body, 1)?;
    let round = arg_u8(&msg.body, 2)?;
    let payload = arg_bytes(&msg.body, 3)?;

    let (disposition, reply) = inner
        .auth
        .responder_round(&sender, &mechanism, attempt, round, &payload)
        .await;
    Ok(vec![MsgArg::Byte(disposition), bytes_arg(&reply)])
}

async fn handle_auth_finish(
    inner: &Arc<BusInner>,
    msg: &Message,
) -> Result<Vec<MsgArg>, BusError> {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let mechanism = arg_str(&msg.body, 0)?;
    let success = arg_bool(&msg.body, 1)?;
    let listener = inner
        .auth
        .listener()
        .ok_or_else(|| BusError::new(ErrorCode::AuthFail))?;

    if success {
        match inner.auth.responder_take_secret(&sender) {
            Some((secret, expiration)) => {
                inner.auth.mark_authenticated(&sender);
                if let Some(guid) = inner.auth.peer_guid(&sender) {
                    let entry = KeyStoreEntry::new(
                        guid,
                        secret.as_bytes().to_vec(),
                        expiration.map(|secs| now_secs() + secs as u64),
                    );
                    if let Err(e) = inner.keystore.store_key(entry).await {
                        warn!("key store update failed: {}", e);
                    }
                }
                listener
                    .authentication_complete(&mechanism, &sender, true)
                    .await;
            }
            None => {
                listener
                    .authentication_complete(&mechanism, &sender, false)
                    .await;
            }
        }
    } else {
        inner.auth.responder_abandon(&sender);
        listener
            .authentication_complete(&mechanism, &sender, false)
            .await;
    }
    Ok(vec![])
}

async fn handle_control_signal(inner: &Arc<BusInner>, msg: Message) {
    let member = msg.header.member.as_deref().unwrap_or("");
    match member {
        hub_names::FOUND_ADVERTISED_NAME | hub_names::LOST_ADVERTISED_NAME => {
            let (Ok(name), Ok(transport), Ok(prefix)) = (
                arg_str(&msg.body, 0),
                arg_u16(&msg.body, 1),
                arg_str(&msg.body, 2),
            ) else {
                return;
            };
            let listeners: Vec<Arc<dyn BusListener>> =
                inner.bus_listeners.read().iter().cloned().collect();
            for listener in listeners {
                if member == hub_names::FOUND_ADVERTISED_NAME {
                    listener
                        .found_advertised_name(&name, transport, &prefix)
                        .await;
                } else {
                    listener
                        .lost_advertised_name(&name, transport, &prefix)
                        .await;
                }
            }
        }
        hub_names::PEER_VANISHED => {
            if let Ok(peer) = arg_str(&msg.body, 0) {
                handle_peer_vanished(inner, &peer).await;
            }
        }
        control::MEMBER_ADDED => {
            let (Ok(id), Ok(new_member)) = (arg_u32(&msg.body, 0), arg_str(&msg.body, 1)) else {
                return;
            };
            if let Some(info) = inner.sessions.add_member(id, &new_member) {
                if let Some(listener) = info.listener {
                    listener.session_member_added(id, &new_member).await;
                }
            }
        }
        control::MEMBER_REMOVED => {
            let (Ok(id), Ok(gone)) = (arg_u32(&msg.body, 0), arg_str(&msg.body, 1)) else {
                return;
            };
            if inner.sessions.remove_member(id, &gone).is_ok() {
                if let Some(info) = inner.sessions.lookup(id) {
                    if let Some(listener) = info.listener {
                        listener.session_member_removed(id, &gone).await;
                    }
                }
            }
        }
        control::SESSION_CLOSED => {
            let (Ok(id), Ok(reason)) = (arg_u32(&msg.body, 0), arg_u32(&msg.body, 1)) else {
                return;
            };
            let reason = SessionLostReason::from_wire(reason)
                .unwrap_or(SessionLostReason::RemoteEndLeft);
            teardown_session_local(inner, id, reason).await;
        }
        _ => {}
    }
}

async fn handle_peer_vanished(inner: &Arc<BusInner>, peer: &str) {
    for id in inner.sessions.sessions_with_peer(peer) {
        let info = match inner.sessions.lookup(id) {
            Some(info) => info,
            None => continue,
        };
        if info.is_host {
            if info.opts.multipoint {
                if inner.sessions.remove_member(id, peer).is_ok() {
                    notify_member_loss(inner, id, peer).await;
                }
            } else {
                teardown_session_local(inner, id, SessionLostReason::RemoteEndLeft).await;
            }
        } else if info.host == peer {
            teardown_session_local(inner, id, SessionLostReason::RemoteEndLeft).await;
        }
        // A fellow joiner vanishing is reported by the host.
    }
}

/// Exactly-once local teardown: whichever trigger gets the entry fires the
/// single `session_lost`.
async fn teardown_session_local(inner: &Arc<BusInner>, id: SessionId, reason: SessionLostReason) {
    if let Some(info) = inner.sessions.remove_session(id) {
        debug!(id, ?reason, "session lost");
        if let Some(listener) = info.listener {
            listener.session_lost(id, reason).await;
        }
    }
}

/// Host-side fallout of a member disappearing from a multipoint session.
async fn notify_member_loss(inner: &Arc<BusInner>, id: SessionId, member: &str) {
    if let Some(info) = inner.sessions.lookup(id) {
        if let Some(listener) = info.listener.clone() {
            listener.session_member_removed(id, member).await;
        }
        for other in &info.members {
            let mut sig = Message::signal(
                hub_names::BUS_PATH,
                hub_names::BUS_INTERFACE,
                control::MEMBER_REMOVED,
                vec![MsgArg::Uint32(id), MsgArg::Str(member.to_string())],
            )
            .with_destination(other.clone());
            sig.header.serial = inner.dispatcher.next_serial();
            send_on(inner, sig).await;
        }
    }
}

async fn probe_peer(
    inner: &Arc<BusInner>,
    target: &str,
    id: SessionId,
    timeout: Duration,
) -> bool {
    let endpoint = match &*inner.state.read() {
        LifeState::Connected(conn) => Arc::clone(&conn.endpoint),
        _ => return false,
    };
    let serial = inner.dispatcher.next_serial();
    let mut msg = Message::method_call(
        target,
        hub_names::BUS_PATH,
        hub_names::BUS_INTERFACE,
        control::PROBE,
        vec![MsgArg::Uint32(id)],
    );
    msg.header.serial = serial;
    let mut rx = inner.dispatcher.register(serial);
    if endpoint.send(msg).await.is_err() {
        inner.dispatcher.abandon(serial);
        return false;
    }
    match tokio::time::timeout(timeout, &mut rx).await {
        Ok(Ok(Ok(_reply))) => true,
        Ok(_) => false,
        Err(_) => {
            inner.dispatcher.fail_timeout(serial);
            false
        }
    }
}

// ============================================================================
// About Handling
// ============================================================================

async fn handle_announcement(inner: &Arc<BusInner>, msg: Message) {
    let sender = msg.header.sender.clone().unwrap_or_default();
    let (Ok(version), Ok(port)) = (arg_u16(&msg.body, 0), arg_u16(&msg.body, 1)) else {
        return;
    };

    let objects: ObjectDescription = match msg.body.get(2) {
        Some(MsgArg::Array { items, .. }) => items
            .iter()
            .filter_map(|item| match item {
                MsgArg::Struct(fields) => {
                    let path = match fields.first() {
                        Some(MsgArg::ObjectPath(p)) => p.clone(),
                        _ => return None,
                    };
                    let interfaces = match fields.get(1) {
                        Some(MsgArg::Array { items, .. }) => items
                            .iter()
                            .filter_map(|i| match i {
                                MsgArg::Str(s) => Some(s.clone()),
                                _ => None,
                            })
                            .collect(),
                        _ => Vec::new(),
                    };
                    Some((path, interfaces))
                }
                _ => None,
            })
            .collect(),
        _ => return,
    };

    let data = match msg.body.get(3).and_then(AboutData::from_arg) {
        Some(data) => data,
        None => return,
    };

    for listener in inner.about_interests.matching(&objects) {
        listener
            .announced(&sender, version, port, &objects, &data)
            .await;
    }
}

// ============================================================================
// Authentication Driving (initiator)
// ============================================================================

async fn ensure_authenticated(
    inner: &Arc<BusInner>,
    bus: &BusAttachment,
    peer: &str,
) -> Result<(), BusError> {
    if inner.auth.peer_authenticated(peer) {
        return Ok(());
    }
    if !inner.auth.is_enabled() {
        return Err(BusError::with_message(
            ErrorCode::AuthFail,
            "peer security is not enabled",
        ));
    }

    // 1. Exchange GUIDs.
    let reply = bus
        .control_call(
            peer,
            control::EXCHANGE_GUIDS,
            vec![MsgArg::Str(inner.auth.local_guid().to_string())],
        )
        .await?;
    let peer_guid = arg_str(&reply.body, 0)?;
    inner.auth.record_peer_guid(peer, &peer_guid);

    // 2. A valid unexpired key store entry skips the handshake entirely:
    // no credential prompts on reconnection.
    let cached = inner
        .keystore
        .load_key(&peer_guid)
        .await
        .map_err(|e| BusError::with_message(ErrorCode::Fail, e.to_string()))?;
    if cached.is_some()
        && bus
            .control_call(peer, control::AUTH_SKIP, vec![])
            .await
            .is_ok()
    {
        inner.auth.mark_authenticated(peer);
        return Ok(());
    }

    let listener = inner
        .auth
        .listener()
        .ok_or_else(|| BusError::new(ErrorCode::AuthFail))?;

    // 3. Negotiate mechanisms.
    let offered = inner.auth.mechanisms();
    let reply = bus
        .control_call(peer, control::AUTH_BEGIN, vec![str_array_arg(&offered)])
        .await?;
    let peer_list = arg_str_array(&reply.body, 0)?;
    let agreed = inner.auth.common_mechanisms(&peer_list);
    if agreed.is_empty() {
        listener.authentication_complete("", peer, false).await;
        return Err(BusError::with_message(
            ErrorCode::AuthFail,
            "no authentication mechanism agreed",
        ));
    }

    // 4. Attempt-indexed rounds, falling through mechanisms.
    let mut last_mechanism = "";
    for mechanism in &agreed {
        last_mechanism = mechanism.as_str();
        for attempt in 1..=MAX_ATTEMPTS {
            match run_attempt(inner, bus, peer, mechanism, attempt).await {
                Ok(()) => {
                    let (secret, expiration) = inner
                        .auth
                        .initiator_take_secret(peer)
                        .ok_or_else(|| BusError::new(ErrorCode::BusUnexpectedDisposition))?;
                    let entry = KeyStoreEntry::new(
                        peer_guid.clone(),
                        secret.as_bytes().to_vec(),
                        expiration.map(|secs| now_secs() + secs as u64),
                    );
                    if let Err(e) = inner.keystore.store_key(entry).await {
                        warn!("key store update failed: {}", e);
                    }
                    inner.auth.mark_authenticated(peer);
                    bus.control_call(
                        peer,
                        control::AUTH_FINISH,
                        vec![MsgArg::Str(mechanism.clone()), MsgArg::Bool(true)],
                    )
                    .await
                    .ok();
                    listener.authentication_complete(mechanism, peer, true).await;
                    return Ok(());
                }
                Err(AuthAbort::Violation(code, message)) => {
                    // Policy violations are reported before completion.
                    listener.security_violation(code, &message).await;
                    inner.auth.initiator_abandon(peer);
                    debug!(peer, mechanism = %mechanism, attempt, "auth attempt failed");
                }
                Err(AuthAbort::CredentialsDenied) | Err(AuthAbort::Protocol(_)) => {
                    inner.auth.initiator_abandon(peer);
                    break;
                }
            }
        }
    }

    bus.control_call(
        peer,
        control::AUTH_FINISH,
        vec![MsgArg::Str(last_mechanism.to_string()), MsgArg::Bool(false)],
    )
    .await
    .ok();
    listener
        .authentication_complete(last_mechanism, peer, false)
        .await;
    Err(BusError::new(ErrorCode::AuthFail))
}

async fn run_attempt(
    inner: &Arc<BusInner>,
    bus: &BusAttachment,
    peer: &str,
    mechanism: &str,
    attempt: u16,
) -> Result<(), AuthAbort> {
    let mut payload = inner.auth.initiator_start(peer, mechanism, attempt).await?;
    let mut round = 0u8;
    loop {
        let reply = bus
            .control_call(
                peer,
                control::AUTH_EXCHANGE,
                vec![
                    MsgArg::Str(mechanism.to_string()),
                    MsgArg::Uint16(attempt),
                    MsgArg::Byte(round),
                    bytes_arg(&payload),
                ],
            )
            .await
            .map_err(|e| AuthAbort::Protocol(e.to_string()))?;
        let disposition = arg_u8(&reply.body, 0).map_err(|e| AuthAbort::Protocol(e.to_string()))?;
        let data = arg_bytes(&reply.body, 1).map_err(|e| AuthAbort::Protocol(e.to_string()))?;

        match inner.auth.initiator_step(peer, disposition, &data)? {
            InitiatorStep::Finished => return Ok(()),
            InitiatorStep::Send(next) => {
                payload = next;
                round += 1;
            }
        }
    }
}

// ============================================================================
// Teardown
// ============================================================================

async fn teardown(inner: &Arc<BusInner>, conn: &Connection) {
    if conn.torn_down.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!(unique = %conn.unique_name, "bus attachment teardown");

    inner
        .dispatcher
        .flush_all(&BusError::new(ErrorCode::BusNotConnected));

    let drained = inner.sessions.clear();
    for info in drained {
        if let Some(listener) = info.listener {
            listener
                .session_lost(info.id, SessionLostReason::LocalDisconnect)
                .await;
        }
    }

    inner.auth.reset_peers();
    inner.lanes.lock().clear();

    let listeners: Vec<Arc<dyn BusListener>> =
        inner.bus_listeners.read().iter().cloned().collect();
    for listener in listeners {
        listener.bus_disconnected().await;
    }
}

// ============================================================================
// Argument Helpers
// ============================================================================

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn missing(index: usize) -> BusError {
    BusError::with_message(
        ErrorCode::BadArgCount,
        format!("missing or mistyped argument {}", index),
    )
}

fn arg_str(args: &[MsgArg], index: usize) -> Result<String, BusError> {
    match args.get(index) {
        Some(MsgArg::Str(s)) => Ok(s.clone()),
        _ => Err(missing(index)),
    }
}

fn arg_u32(args: &[MsgArg], index: usize) -> Result<u32, BusError> {
    match args.get(index) {
        Some(MsgArg::Uint32(v)) => Ok(*v),
        _ => Err(missing(index)),
    }
}

fn arg_u16(args: &[MsgArg], index: usize) -> Result<u16, BusError> {
    match args.get(index) {
        Some(MsgArg::Uint16(v)) => Ok(*v),
        _ => Err(missing(index)),
    }
}

fn arg_u8(args: &[MsgArg], index: usize) -> Result<u8, BusError> {
    match args.get(index) {
        Some(MsgArg::Byte(v)) => Ok(*v),
        _ => Err(missing(index)),
    }
}

fn arg_bool(args: &[MsgArg], index: usize) -> Result<bool, BusError> {
    match args.get(index) {
        Some(MsgArg::Bool(v)) => Ok(*v),
        _ => Err(missing(index)),
    }
}

fn arg_bytes(args: &[MsgArg], index: usize) -> Result<Vec<u8>, BusError> {
    match args.get(index) {
        Some(MsgArg::Array { items, .. }) => items
            .iter()
            .map(|i| match i {
                MsgArg::Byte(b) => Ok(*b),
                _ => Err(missing(index)),
            })
            .collect(),
        _ => Err(missing(index)),
    }
}

fn arg_str_array(args: &[MsgArg], index: usize) -> Result<Vec<String>, BusError> {
    match args.get(index) {
        Some(MsgArg::Array { items, .. }) => items
            .iter()
            .map(|i| match i {
                MsgArg::Str(s) => Ok(s.clone()),
                _ => Err(missing(index)),
            })
            .collect(),
        _ => Err(missing(index)),
    }
}

fn bytes_arg(bytes: &[u8]) -> MsgArg {
    MsgArg::Array {
        elem: TypeNode::Byte,
        items: bytes.iter().map(|b| MsgArg::Byte(*b)).collect(),
    }
}

fn str_array_arg<S: AsRef<str>>(strings: &[S]) -> MsgArg {
    MsgArg::Array {
        elem: TypeNode::Str,
        items: strings
            .iter()
            .map(|s| MsgArg::Str(s.as_ref().to_string()))
            .collect(),
    }
}
