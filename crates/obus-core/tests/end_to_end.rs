//! End-to-end scenarios: two or more attachments wired through the
//! in-process hub.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use obus_core::auth::{self, AuthListener, CredentialMask, Credentials};
use obus_core::about::{AboutData, AboutListener, ObjectDescription};
use obus_core::{
    method_handler, BusAttachment, BusError, BusObject, CallOpts, ErrorCode, InterfaceBuilder,
    MethodContext, PropAccess, PropertyHandler, SessionListener, SessionLostReason, SessionOpts,
    SessionPort, SessionPortListener, SignalOpts,
};
use obus_msg::codec::Value;
use obus_transport::MemoryHub;

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Joined { port: u16, id: u32, joiner: String },
    Lost { id: u32, reason: SessionLostReason },
    MemberAdded { id: u32, member: String },
    MemberRemoved { id: u32, member: String },
    AuthComplete { mechanism: String, success: bool },
    Announced { app: String, device: String, manufacturer: String },
}

type EventRx = mpsc::UnboundedReceiver<Event>;
type EventTx = mpsc::UnboundedSender<Event>;

fn channel() -> (EventTx, EventRx) {
    mpsc::unbounded_channel()
}

async fn recv_event(rx: &mut EventRx) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Gate that accepts joins only on the expected port.
struct PortGate {
    expected_port: u16,
    events: EventTx,
}

#[async_trait]
impl SessionPortListener for PortGate {
    async fn accept_session_joiner(
        &self,
        port: SessionPort,
        _joiner: &str,
        _opts: &SessionOpts,
    ) -> bool {
        port == self.expected_port
    }

    async fn session_joined(&self, port: SessionPort, id: u32, joiner: &str) {
        let _ = self.events.send(Event::Joined {
            port,
            id,
            joiner: joiner.to_string(),
        });
    }
}

struct SessionEvents {
    events: EventTx,
}

#[async_trait]
impl SessionListener for SessionEvents {
    async fn session_lost(&self, id: u32, reason: SessionLostReason) {
        let _ = self.events.send(Event::Lost { id, reason });
    }

    async fn session_member_added(&self, id: u32, member: &str) {
        let _ = self.events.send(Event::MemberAdded {
            id,
            member: member.to_string(),
        });
    }

    async fn session_member_removed(&self, id: u32, member: &str) {
        let _ = self.events.send(Event::MemberRemoved {
            id,
            member: member.to_string(),
        });
    }
}

struct PasswordListener {
    password: Option<String>,
    prompts: AtomicU32,
    events: EventTx,
}

impl PasswordListener {
    fn new(password: Option<&str>, events: EventTx) -> Arc<Self> {
        Arc::new(Self {
            password: password.map(str::to_string),
            prompts: AtomicU32::new(0),
            events,
        })
    }
}

#[async_trait]
impl AuthListener for PasswordListener {
    async fn request_credentials(
        &self,
        _mechanism: &str,
        _peer: &str,
        _auth_count: u16,
        _user_name: &str,
        requested: CredentialMask,
    ) -> Option<Credentials> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let mut creds = Credentials::default();
        if requested & auth::credential_bits::PASSWORD != 0 {
            if let Some(p) = &self.password {
                creds.set_password(p.clone());
            }
        }
        creds.set_expiration(3600);
        Some(creds)
    }

    async fn authentication_complete(&self, mechanism: &str, _peer: &str, success: bool) {
        let _ = self.events.send(Event::AuthComplete {
            mechanism: mechanism.to_string(),
            success,
        });
    }
}

fn echo_interface() -> Arc<obus_core::InterfaceDescription> {
    InterfaceBuilder::new("org.example.Echo")
        .unwrap()
        .add_method("Ping", "s", "s", &["question", "answer"])
        .unwrap()
        .add_signal("Pinged", "s", &["question"])
        .unwrap()
        .build()
}

fn echo_object(path: &str) -> BusObject {
    BusObject::builder(path)
        .unwrap()
        .add_interface(echo_interface())
        .with_method_handler(
            "org.example.Echo",
            "Ping",
            method_handler(|ctx: MethodContext| async move { Ok(ctx.args) }),
        )
        .build()
        .unwrap()
}

async fn connected(hub: &MemoryHub) -> BusAttachment {
    let bus = BusAttachment::new().unwrap();
    bus.connect(hub).await.unwrap();
    bus
}

// ============================================================================
// Method Calls
// ============================================================================

#[tokio::test]
async fn test_ping_round_trip() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    server.register_object(echo_object("/test/echo")).unwrap();

    let proxy = client.proxy(&server.unique_name().unwrap(), "/test/echo");
    proxy.add_interface(echo_interface());

    let reply = proxy
        .method_call(
            "org.example.Echo",
            "Ping",
            &[Value::Str("hello".into())],
            CallOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, vec![Value::Str("hello".into())]);
}

#[tokio::test]
async fn test_wrong_arg_shape_fails_at_call_site() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    server.register_object(echo_object("/test/echo")).unwrap();

    let proxy = client.proxy(&server.unique_name().unwrap(), "/test/echo");
    proxy.add_interface(echo_interface());

    // Wrong primitive kind: rejected synchronously, never sent.
    let err = proxy
        .method_call(
            "org.example.Echo",
            "Ping",
            &[Value::Uint32(7)],
            CallOpts::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BusBadSignature);

    // Wrong arity.
    let err = proxy
        .method_call("org.example.Echo", "Ping", &[], CallOpts::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadArgCount);
}

#[tokio::test]
async fn test_routing_error_taxonomy() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    server.register_object(echo_object("/test/echo")).unwrap();
    let dest = server.unique_name().unwrap();

    // Interface the remote object does not implement.
    let other_iface = InterfaceBuilder::new("org.example.Other")
        .unwrap()
        .add_method("Nope", "", "", &[])
        .unwrap()
        .build();
    let proxy = client.proxy(&dest, "/test/echo");
    proxy.add_interface(other_iface);
    let err = proxy
        .method_call("org.example.Other", "Nope", &[], CallOpts::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BusUnknownInterface);

    // Unknown path.
    let proxy = client.proxy(&dest, "/missing");
    proxy.add_interface(echo_interface());
    let err = proxy
        .method_call(
            "org.example.Echo",
            "Ping",
            &[Value::Str("x".into())],
            CallOpts::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BusNoSuchObject);
}

#[tokio::test]
async fn test_application_error_travels_verbatim() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    let iface = InterfaceBuilder::new("org.example.Grumpy")
        .unwrap()
        .add_method("Refuse", "", "", &[])
        .unwrap()
        .build();
    let object = BusObject::builder("/grumpy")
        .unwrap()
        .add_interface(iface.clone())
        .with_method_handler(
            "org.example.Grumpy",
            "Refuse",
            method_handler(|_ctx: MethodContext| async move {
                Err(BusError::app("com.example.Error.NoThanks", "not today"))
            }),
        )
        .build()
        .unwrap();
    server.register_object(object).unwrap();

    let proxy = client.proxy(&server.unique_name().unwrap(), "/grumpy");
    proxy.add_interface(iface);

    let err = proxy
        .method_call("org.example.Grumpy", "Refuse", &[], CallOpts::default())
        .await
        .unwrap_err();
    assert_eq!(err.name, "com.example.Error.NoThanks");
    assert_eq!(err.message, "not today");
    assert!(err.is_app_error());
}

#[tokio::test]
async fn test_call_timeout() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    let iface = InterfaceBuilder::new("org.example.Slow")
        .unwrap()
        .add_method("Stall", "", "", &[])
        .unwrap()
        .build();
    let object = BusObject::builder("/slow")
        .unwrap()
        .add_interface(iface.clone())
        .with_method_handler(
            "org.example.Slow",
            "Stall",
            method_handler(|_ctx: MethodContext| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![])
            }),
        )
        .build()
        .unwrap();
    server.register_object(object).unwrap();

    let proxy = client.proxy(&server.unique_name().unwrap(), "/slow");
    proxy.add_interface(iface);

    let err = proxy
        .method_call(
            "org.example.Slow",
            "Stall",
            &[],
            CallOpts {
                timeout: Duration::from_millis(100),
                flags: 0,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);
}

#[tokio::test]
async fn test_call_after_disconnect_fails_fast() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    let dest = server.unique_name().unwrap();
    client.disconnect().await.unwrap();

    let proxy = client.proxy(&dest, "/test/echo");
    proxy.add_interface(echo_interface());
    let err = proxy
        .method_call(
            "org.example.Echo",
            "Ping",
            &[Value::Str("x".into())],
            CallOpts::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BusNotConnected);
}

// ============================================================================
// Properties and Introspection
// ============================================================================

struct CounterProps {
    count: AtomicU32,
}

#[async_trait]
impl PropertyHandler for CounterProps {
    async fn get(&self, _interface: &str, property: &str) -> Result<Value, BusError> {
        match property {
            "Count" => Ok(Value::Uint32(self.count.load(Ordering::SeqCst))),
            "Label" => Ok(Value::Str("counter".into())),
            _ => Err(BusError::new(ErrorCode::BusNoSuchProperty)),
        }
    }

    async fn set(&self, _interface: &str, property: &str, value: Value) -> Result<(), BusError> {
        match (property, value) {
            ("Count", Value::Uint32(v)) => {
                self.count.store(v, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(BusError::new(ErrorCode::BusNoSuchProperty)),
        }
    }
}

fn counter_interface() -> Arc<obus_core::InterfaceDescription> {
    InterfaceBuilder::new("org.example.Counter")
        .unwrap()
        .add_method("Bump", "", "", &[])
        .unwrap()
        .add_property("Count", "u", PropAccess::ReadWrite)
        .unwrap()
        .add_property("Label", "s", PropAccess::Read)
        .unwrap()
        .build()
}

async fn counter_server(hub: &MemoryHub) -> (BusAttachment, Arc<CounterProps>) {
    let server = connected(hub).await;
    let props = Arc::new(CounterProps {
        count: AtomicU32::new(3),
    });
    let object = BusObject::builder("/counter")
        .unwrap()
        .add_interface(counter_interface())
        .with_method_handler(
            "org.example.Counter",
            "Bump",
            method_handler(|_ctx: MethodContext| async move { Ok(vec![]) }),
        )
        .with_property_handler(props.clone())
        .build()
        .unwrap();
    server.register_object(object).unwrap();
    (server, props)
}

#[tokio::test]
async fn test_properties_protocol() {
    let hub = MemoryHub::new();
    let (server, props) = counter_server(&hub).await;
    let client = connected(&hub).await;

    let proxy = client.proxy(&server.unique_name().unwrap(), "/counter");

    let value = proxy.get_property("org.example.Counter", "Count").await.unwrap();
    assert_eq!(value, Value::Uint32(3));

    proxy
        .set_property(
            "org.example.Counter",
            "Count",
            obus_msg::signature::TypeNode::Uint32,
            Value::Uint32(9),
        )
        .await
        .unwrap();
    assert_eq!(props.count.load(Ordering::SeqCst), 9);

    let all = proxy.get_all_properties("org.example.Counter").await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&("Count".to_string(), Value::Uint32(9))));
    assert!(all.contains(&("Label".to_string(), Value::Str("counter".into()))));

    // A read-only property refuses writes.
    let err = proxy
        .set_property(
            "org.example.Counter",
            "Label",
            obus_msg::signature::TypeNode::Str,
            Value::Str("nope".into()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BusPropertyAccessDenied);
}

#[tokio::test]
async fn test_introspection_over_the_wire() {
    let hub = MemoryHub::new();
    let (server, _props) = counter_server(&hub).await;
    let client = connected(&hub).await;

    let proxy = client.proxy(&server.unique_name().unwrap(), "/counter");
    let xml = proxy.introspect().await.unwrap();

    assert!(xml.starts_with("<!DOCTYPE node"));
    assert!(xml.contains("org.example.Counter"));
    assert!(xml.contains("org.freedesktop.DBus.Introspectable"));
    assert!(xml.contains("org.freedesktop.DBus.Properties"));
    assert!(xml.contains("org.freedesktop.DBus.Peer"));
    assert!(xml.contains("<property name=\"Count\" type=\"u\" access=\"readwrite\"/>"));
}

// ============================================================================
// Signals
// ============================================================================

#[tokio::test]
async fn test_signal_broadcast_delivery() {
    let hub = MemoryHub::new();
    let emitter = connected(&hub).await;
    let receiver = connected(&hub).await;

    emitter.register_object(echo_object("/test/echo")).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handler = obus_core::signal_handler(move |ctx: obus_core::SignalContext| {
        let tx = tx.clone();
        async move {
            if let Some(Value::Str(s)) = ctx.args.first() {
                let _ = tx.send(s.clone());
            }
        }
    });
    receiver
        .register_signal_handler(handler, "org.example.Echo.Pinged", None)
        .unwrap();

    emitter
        .emit_signal(
            "/test/echo",
            "org.example.Echo",
            "Pinged",
            &[Value::Str("ding".into())],
            SignalOpts::default(),
        )
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, "ding");
}

#[tokio::test]
async fn test_undeclared_signal_rejected_at_emit() {
    let hub = MemoryHub::new();
    let emitter = connected(&hub).await;

    emitter.register_object(echo_object("/test/echo")).unwrap();
    let err = emitter
        .emit_signal(
            "/test/echo",
            "org.example.Echo",
            "NotDeclared",
            &[],
            SignalOpts::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BusObjectNoSuchMember);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_accept_false_creates_no_session() {
    let hub = MemoryHub::new();
    let host = connected(&hub).await;
    let joiner = connected(&hub).await;

    let (tx, mut rx) = channel();
    host.bind_session_port(
        7,
        SessionOpts::default(),
        Arc::new(PortGate {
            expected_port: 99, // never matches the bound port
            events: tx,
        }),
    )
    .unwrap();

    let err = joiner
        .join_session(
            &host.unique_name().unwrap(),
            7,
            SessionOpts::default(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::JoinSessionReplyRejected);

    // No session_joined ever fires.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_join_unbound_port() {
    let hub = MemoryHub::new();
    let host = connected(&hub).await;
    let joiner = connected(&hub).await;

    let err = joiner
        .join_session(
            &host.unique_name().unwrap(),
            42,
            SessionOpts::default(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::JoinSessionReplyNoSession);
}

#[tokio::test]
async fn test_negotiated_opts_are_never_broader() {
    let hub = MemoryHub::new();
    let host = connected(&hub).await;
    let joiner = connected(&hub).await;

    let (tx, mut rx) = channel();
    host.bind_session_port(
        7,
        SessionOpts {
            transports: 0x0003,
            proximity: 0x0f,
            ..SessionOpts::default()
        },
        Arc::new(PortGate {
            expected_port: 7,
            events: tx,
        }),
    )
    .unwrap();

    let (id, negotiated) = joiner
        .join_session(
            &host.unique_name().unwrap(),
            7,
            SessionOpts {
                transports: 0x0001,
                proximity: 0xff,
                ..SessionOpts::default()
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(negotiated.transports, 0x0001);
    assert_eq!(negotiated.proximity, 0x0f);

    let joined = recv_event(&mut rx).await;
    assert_eq!(
        joined,
        Event::Joined {
            port: 7,
            id,
            joiner: joiner.unique_name().unwrap(),
        }
    );
}

#[tokio::test]
async fn test_joiner_leave_reaches_host() {
    let hub = MemoryHub::new();
    let host = connected(&hub).await;
    let joiner = connected(&hub).await;

    let (port_tx, mut port_rx) = channel();
    host.bind_session_port(
        7,
        SessionOpts::default(),
        Arc::new(PortGate {
            expected_port: 7,
            events: port_tx,
        }),
    )
    .unwrap();

    let (id, _) = joiner
        .join_session(
            &host.unique_name().unwrap(),
            7,
            SessionOpts::default(),
            None,
        )
        .await
        .unwrap();

    let Event::Joined { id: host_id, .. } = recv_event(&mut port_rx).await else {
        panic!("expected Joined");
    };
    assert_eq!(host_id, id);

    let (sess_tx, mut sess_rx) = channel();
    host.set_session_listener(id, Arc::new(SessionEvents { events: sess_tx }))
        .unwrap();

    joiner.leave_session(id).await.unwrap();

    let lost = recv_event(&mut sess_rx).await;
    assert_eq!(
        lost,
        Event::Lost {
            id,
            reason: SessionLostReason::RemoteEndLeft,
        }
    );
    assert!(host.session_info(id).is_none());
    assert!(joiner.session_info(id).is_none());
}

#[tokio::test]
async fn test_multipoint_membership_and_binder_removal() {
    let hub = MemoryHub::new();
    let host = connected(&hub).await;
    let j1 = connected(&hub).await;
    let j2 = connected(&hub).await;
    let j3 = connected(&hub).await;

    let (port_tx, mut port_rx) = channel();
    host.bind_session_port(
        7,
        SessionOpts::multipoint(),
        Arc::new(PortGate {
            expected_port: 7,
            events: port_tx,
        }),
    )
    .unwrap();
    let host_name = host.unique_name().unwrap();

    let (j1_tx, mut j1_rx) = channel();
    let (id, _) = j1
        .join_session(
            &host_name,
            7,
            SessionOpts::multipoint(),
            Some(Arc::new(SessionEvents { events: j1_tx })),
        )
        .await
        .unwrap();

    let _ = recv_event(&mut port_rx).await; // j1 joined
    host.set_session_listener(
        id,
        Arc::new(SessionEvents {
            events: channel().0,
        }),
    )
    .unwrap();

    let (j2_tx, mut j2_rx) = channel();
    let (id2, _) = j2
        .join_session(
            &host_name,
            7,
            SessionOpts::multipoint(),
            Some(Arc::new(SessionEvents { events: j2_tx })),
        )
        .await
        .unwrap();
    assert_eq!(id, id2, "multipoint joiners share one session");

    // j1 sees j2 arrive.
    assert_eq!(
        recv_event(&mut j1_rx).await,
        Event::MemberAdded {
            id,
            member: j2.unique_name().unwrap(),
        }
    );

    // A third joiner: both existing joiners see the membership change.
    let (_j3_tx, _j3_rx) = channel();
    let (id3, _) = j3
        .join_session(&host_name, 7, SessionOpts::multipoint(), None)
        .await
        .unwrap();
    assert_eq!(id, id3);
    let j3_name = j3.unique_name().unwrap();
    assert_eq!(
        recv_event(&mut j1_rx).await,
        Event::MemberAdded {
            id,
            member: j3_name.clone(),
        }
    );
    assert_eq!(
        recv_event(&mut j2_rx).await,
        Event::MemberAdded {
            id,
            member: j3_name,
        }
    );

    // The binder removes j2: j2 converges on REMOVED_BY_BINDER, the others
    // see a membership change.
    let j2_name = j2.unique_name().unwrap();
    host.remove_session_member(id, &j2_name).await.unwrap();

    assert_eq!(
        recv_event(&mut j2_rx).await,
        Event::Lost {
            id,
            reason: SessionLostReason::RemovedByBinder,
        }
    );
    assert_eq!(
        recv_event(&mut j1_rx).await,
        Event::MemberRemoved {
            id,
            member: j2_name,
        }
    );
    assert!(j2.session_info(id).is_none());
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_advertise_and_find() {
    let hub = MemoryHub::new();
    let advertiser = connected(&hub).await;
    let finder = connected(&hub).await;

    struct Finder {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl obus_core::BusListener for Finder {
        async fn found_advertised_name(&self, name: &str, _transport: u16, _prefix: &str) {
            let _ = self.tx.send(name.to_string());
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    finder.register_bus_listener(Arc::new(Finder { tx }));
    finder.find_advertised_name("org.example").await.unwrap();

    advertiser.advertise_name("org.example.service").await.unwrap();

    let found = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, "org.example.service");
}

// ============================================================================
// About
// ============================================================================

fn about_interface() -> Arc<obus_core::InterfaceDescription> {
    InterfaceBuilder::new("org.example.Demo")
        .unwrap()
        .add_method("GetStatus", "", "s", &["status"])
        .unwrap()
        .add_method("Reset", "", "", &[])
        .unwrap()
        .build()
}

fn about_object() -> BusObject {
    BusObject::builder("/test/aboutObj")
        .unwrap()
        .add_interface(about_interface())
        .with_method_handler(
            "org.example.Demo",
            "GetStatus",
            method_handler(|_ctx: MethodContext| async move {
                Ok(vec![Value::Str("ok".into())])
            }),
        )
        .with_method_handler(
            "org.example.Demo",
            "Reset",
            method_handler(|_ctx: MethodContext| async move { Ok(vec![]) }),
        )
        .build()
        .unwrap()
}

fn filled_about_data() -> AboutData {
    let mut data = AboutData::new();
    data.set_app_id(&[0xab; 16])
        .set_app_name("DemoApp")
        .set_default_language("en")
        .set_device_id("device-0001")
        .set_device_name("kitchen-hub")
        .set_description("demo announcement")
        .set_manufacturer("Acme Systems")
        .set_model_number("md-2")
        .set_supported_languages(&["en", "de"]);
    data
}

struct AnnouncementSink {
    events: EventTx,
}

#[async_trait]
impl AboutListener for AnnouncementSink {
    async fn announced(
        &self,
        _bus_name: &str,
        _version: u16,
        _port: u16,
        _objects: &ObjectDescription,
        data: &AboutData,
    ) {
        let _ = self.events.send(Event::Announced {
            app: data.get_str("AppName").unwrap_or_default().to_string(),
            device: data.get_str("DeviceName").unwrap_or_default().to_string(),
            manufacturer: data.get_str("Manufacturer").unwrap_or_default().to_string(),
        });
    }
}

#[tokio::test]
async fn test_announce_requires_all_nine_fields() {
    let hub = MemoryHub::new();
    let announcer = connected(&hub).await;
    let observer = connected(&hub).await;

    announcer.register_object(about_object()).unwrap();

    let (tx, mut rx) = channel();
    observer
        .who_implements(&["org.example.Demo"], Arc::new(AnnouncementSink { events: tx }))
        .unwrap();

    // SoftwareVersion missing: typed failure, nothing hits the wire.
    let incomplete = filled_about_data();
    let err = announcer.announce(25, &incomplete).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::BusBadSignature);
    assert!(err.message.contains("SoftwareVersion"));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );

    // All nine required fields present: the announcement round-trips.
    let mut complete = filled_about_data();
    complete.set_software_version("2.1.0");
    announcer.announce(25, &complete).await.unwrap();

    assert_eq!(
        recv_event(&mut rx).await,
        Event::Announced {
            app: "DemoApp".into(),
            device: "kitchen-hub".into(),
            manufacturer: "Acme Systems".into(),
        }
    );

    // Bulk listener teardown leaves zero registrations.
    observer.unregister_all_about_listeners();
    announcer.announce(25, &complete).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err()
    );
}

// ============================================================================
// Authentication
// ============================================================================

fn secret_interface() -> Arc<obus_core::InterfaceDescription> {
    InterfaceBuilder::new("org.example.Secret")
        .unwrap()
        .add_method("Whisper", "s", "s", &["in", "out"])
        .unwrap()
        .secure()
        .build()
}

fn secret_object() -> BusObject {
    BusObject::builder("/secret")
        .unwrap()
        .add_interface(secret_interface())
        .with_method_handler(
            "org.example.Secret",
            "Whisper",
            method_handler(|ctx: MethodContext| async move { Ok(ctx.args) }),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_srp_auth_and_secured_call() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    server.register_object(secret_object()).unwrap();

    let (server_tx, mut server_rx) = channel();
    let (client_tx, mut client_rx) = channel();
    let server_listener = PasswordListener::new(Some("123456"), server_tx);
    let client_listener = PasswordListener::new(Some("123456"), client_tx);

    server
        .enable_peer_security(&[auth::MECH_SRP_KEYX], server_listener.clone())
        .unwrap();
    client
        .enable_peer_security(&[auth::MECH_SRP_KEYX], client_listener.clone())
        .unwrap();

    let server_name = server.unique_name().unwrap();
    let proxy = client.proxy(&server_name, "/secret");
    proxy.add_interface(secret_interface());

    let reply = proxy
        .method_call(
            "org.example.Secret",
            "Whisper",
            &[Value::Str("hello".into())],
            CallOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, vec![Value::Str("hello".into())]);

    // Exactly one successful completion on each side.
    assert_eq!(
        recv_event(&mut client_rx).await,
        Event::AuthComplete {
            mechanism: auth::MECH_SRP_KEYX.into(),
            success: true,
        }
    );
    assert_eq!(
        recv_event(&mut server_rx).await,
        Event::AuthComplete {
            mechanism: auth::MECH_SRP_KEYX.into(),
            success: true,
        }
    );

    // Both key stores hold the peer's secret now.
    assert_eq!(client.keystore().list_guids().await.unwrap().len(), 1);
    assert_eq!(server.keystore().list_guids().await.unwrap().len(), 1);

    let prompts_before = client_listener.prompts.load(Ordering::SeqCst);

    // Reconnection before expiration: the stored key skips the handshake
    // and nobody is re-prompted.
    client.disconnect().await.unwrap();
    client.connect(&hub).await.unwrap();

    let proxy = client.proxy(&server_name, "/secret");
    proxy.add_interface(secret_interface());
    let reply = proxy
        .method_call(
            "org.example.Secret",
            "Whisper",
            &[Value::Str("again".into())],
            CallOpts::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply, vec![Value::Str("again".into())]);
    assert_eq!(client_listener.prompts.load(Ordering::SeqCst), prompts_before);
}

#[tokio::test]
async fn test_withheld_credentials_fail_without_keystore_update() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    server.register_object(secret_object()).unwrap();

    let (server_tx, _server_rx) = channel();
    let (client_tx, mut client_rx) = channel();
    server
        .enable_peer_security(
            &[auth::MECH_SRP_KEYX],
            PasswordListener::new(Some("123456"), server_tx),
        )
        .unwrap();
    // The client listener never supplies the required PASSWORD bit.
    client
        .enable_peer_security(
            &[auth::MECH_SRP_KEYX],
            PasswordListener::new(None, client_tx),
        )
        .unwrap();

    let proxy = client.proxy(&server.unique_name().unwrap(), "/secret");
    proxy.add_interface(secret_interface());

    let err = proxy
        .method_call(
            "org.example.Secret",
            "Whisper",
            &[Value::Str("hello".into())],
            CallOpts::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthFail);

    assert_eq!(
        recv_event(&mut client_rx).await,
        Event::AuthComplete {
            mechanism: auth::MECH_SRP_KEYX.into(),
            success: false,
        }
    );
    assert!(client.keystore().list_guids().await.unwrap().is_empty());
    assert!(server.keystore().list_guids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unauthenticated_call_to_secured_interface_refused() {
    let hub = MemoryHub::new();
    let server = connected(&hub).await;
    let client = connected(&hub).await;

    server.register_object(secret_object()).unwrap();
    let (server_tx, _server_rx) = channel();
    server
        .enable_peer_security(
            &[auth::MECH_SRP_KEYX],
            PasswordListener::new(Some("123456"), server_tx),
        )
        .unwrap();

    // The client never enables security; its side refuses to even try.
    let proxy = client.proxy(&server.unique_name().unwrap(), "/secret");
    proxy.add_interface(secret_interface());
    let err = proxy
        .method_call(
            "org.example.Secret",
            "Whisper",
            &[Value::Str("hi".into())],
            CallOpts::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthFail);
}
