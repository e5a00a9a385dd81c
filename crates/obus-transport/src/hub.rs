//! In-process router hub.
//!
//! The hub plays the bus-router role for attachments in the same process:
//! it assigns unique names, routes addressed messages, broadcasts signals,
//! and runs the advertise/find name service. Tests and demos wire two or
//! more attachments through one hub; physical transports replace it without
//! the core noticing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use obus_msg::{Message, MessageType, MsgArg};

use crate::traits::{BusEndpoint, Transport, TransportError};

/// Reserved names for router-originated traffic and bus control.
pub mod well_known {
    /// Object path for bus control traffic
    pub const BUS_PATH: &str = "/org/obus/Bus";
    /// Interface for bus control traffic
    pub const BUS_INTERFACE: &str = "org.obus.Bus";
    /// The router's own bus name
    pub const BUS_NAME: &str = "org.obus.Bus";

    /// Signal: an advertised name matching a registered find appeared
    pub const FOUND_ADVERTISED_NAME: &str = "FoundAdvertisedName";
    /// Signal: a previously found advertised name went away
    pub const LOST_ADVERTISED_NAME: &str = "LostAdvertisedName";
    /// Signal: a peer detached from the router
    pub const PEER_VANISHED: &str = "PeerVanished";
}

/// Transport mask advertised by the hub (all transports).
const TRANSPORT_ANY: u16 = 0xffff;

// ============================================================================
// Hub State
// ============================================================================

struct HubState {
    /// Unique name -> inbound queue
    peers: HashMap<String, mpsc::UnboundedSender<Message>>,
    /// Well-known name -> owning unique name
    owned_names: HashMap<String, String>,
    /// (advertised name, owner unique name)
    advertised: Vec<(String, String)>,
    /// (finder unique name, prefix)
    finders: Vec<(String, String)>,
    next_conn: u32,
    next_serial: u32,
}

impl HubState {
    fn resolve(&self, dest: &str) -> Option<&mpsc::UnboundedSender<Message>> {
        if dest.starts_with(':') {
            self.peers.get(dest)
        } else {
            self.owned_names
                .get(dest)
                .and_then(|unique| self.peers.get(unique))
        }
    }

    fn hub_signal(&mut self, dest: &str, member: &str, body: Vec<MsgArg>) {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        let mut msg = Message::signal(well_known::BUS_PATH, well_known::BUS_INTERFACE, member, body)
            .with_destination(dest);
        msg.header.serial = serial;
        msg.header.sender = Some(well_known::BUS_NAME.to_string());
        if let Some(tx) = self.resolve(dest) {
            let _ = tx.send(msg);
        }
    }
}

struct HubInner {
    state: Mutex<HubState>,
}

/// The in-process router. Cheap to clone; all clones share one router.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    peers: HashMap::new(),
                    owned_names: HashMap::new(),
                    advertised: Vec::new(),
                    finders: Vec::new(),
                    next_conn: 1,
                    next_serial: 1,
                }),
            }),
        }
    }

    /// Number of currently attached peers.
    pub fn peer_count(&self) -> usize {
        self.inner.state.lock().peers.len()
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn connect(&self, guid_prefix: &str) -> Result<Arc<dyn BusEndpoint>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let unique = {
            let mut state = self.inner.state.lock();
            let n = state.next_conn;
            state.next_conn += 1;
            let unique = format!(":{}.{}", guid_prefix, n);
            state.peers.insert(unique.clone(), tx);
            unique
        };
        debug!(unique = %unique, "peer attached to hub");
        Ok(Arc::new(MemoryEndpoint {
            hub: Arc::clone(&self.inner),
            unique,
            rx: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        }))
    }
}

// ============================================================================
// Endpoint
// ============================================================================

struct MemoryEndpoint {
    hub: Arc<HubInner>,
    unique: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    connected: AtomicBool,
}

impl MemoryEndpoint {
    fn check_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait]
impl BusEndpoint for MemoryEndpoint {
    fn unique_name(&self) -> &str {
        &self.unique
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn send(&self, mut msg: Message) -> Result<(), TransportError> {
        self.check_connected()?;

        // The router is the authority on sender identity.
        msg.header.sender = Some(self.unique.clone());

        let state = self.hub.state.lock();
        match &msg.header.destination {
            Some(dest) => {
                let tx = state
                    .resolve(dest)
                    .ok_or_else(|| TransportError::UnknownDestination(dest.clone()))?;
                tx.send(msg)
                    .map_err(|_| TransportError::Disconnected)?;
                Ok(())
            }
            None => {
                // Broadcast: signals only, delivered to every other peer.
                if msg.header.msg_type != MessageType::Signal {
                    return Err(TransportError::Other(
                        "only signals may omit a destination".into(),
                    ));
                }
                for (unique, tx) in &state.peers {
                    if unique != &self.unique {
                        let _ = tx.send(msg.clone());
                    }
                }
                Ok(())
            }
        }
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(msg) => Ok(msg),
            None => {
                self.connected.store(false, Ordering::Release);
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn request_name(&self, name: &str) -> Result<bool, TransportError> {
        self.check_connected()?;
        let mut state = self.hub.state.lock();
        match state.owned_names.get(name) {
            Some(owner) if owner != &self.unique => Ok(false),
            _ => {
                state.owned_names.insert(name.to_string(), self.unique.clone());
                Ok(true)
            }
        }
    }

    async fn release_name(&self, name: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        let mut state = self.hub.state.lock();
        if state.owned_names.get(name) == Some(&self.unique) {
            state.owned_names.remove(name);
        }
        Ok(())
    }

    async fn advertise_name(&self, name: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        let mut state = self.hub.state.lock();
        let entry = (name.to_string(), self.unique.clone());
        if !state.advertised.contains(&entry) {
            state.advertised.push(entry);
        }
        // Report to every finder whose prefix matches.
        let interested: Vec<(String, String)> = state
            .finders
            .iter()
            .filter(|(_, prefix)| name.starts_with(prefix.as_str()))
            .cloned()
            .collect();
        for (finder, prefix) in interested {
            state.hub_signal(
                &finder,
                well_known::FOUND_ADVERTISED_NAME,
                vec![
                    MsgArg::Str(name.to_string()),
                    MsgArg::Uint16(TRANSPORT_ANY),
                    MsgArg::Str(prefix),
                ],
            );
        }
        Ok(())
    }

    async fn cancel_advertise_name(&self, name: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        let mut state = self.hub.state.lock();
        let before = state.advertised.len();
        state
            .advertised
            .retain(|(n, owner)| !(n == name && owner == &self.unique));
        if state.advertised.len() != before {
            let interested: Vec<(String, String)> = state
                .finders
                .iter()
                .filter(|(_, prefix)| name.starts_with(prefix.as_str()))
                .cloned()
                .collect();
            for (finder, prefix) in interested {
                state.hub_signal(
                    &finder,
                    well_known::LOST_ADVERTISED_NAME,
                    vec![
                        MsgArg::Str(name.to_string()),
                        MsgArg::Uint16(TRANSPORT_ANY),
                        MsgArg::Str(prefix),
                    ],
                );
            }
        }
        Ok(())
    }

    async fn find_advertised_name(&self, prefix: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        let mut state = self.hub.state.lock();
        let entry = (self.unique.clone(), prefix.to_string());
        if !state.finders.contains(&entry) {
            state.finders.push(entry);
        }
        // Report names that are already advertised.
        let matches: Vec<String> = state
            .advertised
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect();
        for name in matches {
            state.hub_signal(
                &self.unique.clone(),
                well_known::FOUND_ADVERTISED_NAME,
                vec![
                    MsgArg::Str(name),
                    MsgArg::Uint16(TRANSPORT_ANY),
                    MsgArg::Str(prefix.to_string()),
                ],
            );
        }
        Ok(())
    }

    async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), TransportError> {
        self.check_connected()?;
        let mut state = self.hub.state.lock();
        state
            .finders
            .retain(|(owner, p)| !(owner == &self.unique && p == prefix));
        Ok(())
    }

    async fn close(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = self.hub.state.lock();
        state.peers.remove(&self.unique);
        state.owned_names.retain(|_, owner| owner != &self.unique);
        state.finders.retain(|(owner, _)| owner != &self.unique);

        // Retract this peer's advertisements.
        let gone: Vec<String> = state
            .advertised
            .iter()
            .filter(|(_, owner)| owner == &self.unique)
            .map(|(name, _)| name.clone())
            .collect();
        state.advertised.retain(|(_, owner)| owner != &self.unique);
        for name in gone {
            let interested: Vec<(String, String)> = state
                .finders
                .iter()
                .filter(|(_, prefix)| name.starts_with(prefix.as_str()))
                .cloned()
                .collect();
            for (finder, prefix) in interested {
                state.hub_signal(
                    &finder,
                    well_known::LOST_ADVERTISED_NAME,
                    vec![
                        MsgArg::Str(name.clone()),
                        MsgArg::Uint16(TRANSPORT_ANY),
                        MsgArg::Str(prefix),
                    ],
                );
            }
        }

        // Tell everyone else this peer is gone so session teardown converges.
        let remaining: Vec<String> = state.peers.keys().cloned().collect();
        for peer in remaining {
            state.hub_signal(
                &peer,
                well_known::PEER_VANISHED,
                vec![MsgArg::Str(self.unique.clone())],
            );
        }
        debug!(unique = %self.unique, "peer detached from hub");
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn call(dest: &str, member: &str) -> Message {
        let mut msg = Message::method_call(dest, "/obj", "org.example.Iface", member, vec![]);
        msg.header.serial = 1;
        msg
    }

    #[tokio::test]
    async fn test_routes_by_unique_name() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        a.send(call(b.unique_name(), "Ping")).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.header.member.as_deref(), Some("Ping"));
        // The router stamps the true sender.
        assert_eq!(got.header.sender.as_deref(), Some(a.unique_name()));
    }

    #[tokio::test]
    async fn test_routes_by_well_known_name() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        assert!(b.request_name("org.example.app").await.unwrap());
        a.send(call("org.example.app", "Ping")).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.header.member.as_deref(), Some("Ping"));
    }

    #[tokio::test]
    async fn test_name_collision_refused() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        assert!(a.request_name("org.example.app").await.unwrap());
        assert!(!b.request_name("org.example.app").await.unwrap());
        // Re-requesting an owned name succeeds.
        assert!(a.request_name("org.example.app").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();

        let err = a.send(call(":nobody.1", "Ping")).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownDestination(_)));
    }

    #[tokio::test]
    async fn test_broadcast_signal_reaches_all_but_sender() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();
        let c = hub.connect("cccc").await.unwrap();

        let mut sig = Message::signal("/obj", "org.example.Iface", "Changed", vec![]);
        sig.header.serial = 1;
        a.send(sig).await.unwrap();

        assert_eq!(b.recv().await.unwrap().header.member.as_deref(), Some("Changed"));
        assert_eq!(c.recv().await.unwrap().header.member.as_deref(), Some("Changed"));
    }

    #[tokio::test]
    async fn test_advertise_then_find() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        a.advertise_name("org.example.app").await.unwrap();
        b.find_advertised_name("org.example").await.unwrap();

        let found = b.recv().await.unwrap();
        assert_eq!(
            found.header.member.as_deref(),
            Some(well_known::FOUND_ADVERTISED_NAME)
        );
        assert_eq!(found.body[0], MsgArg::Str("org.example.app".into()));
    }

    #[tokio::test]
    async fn test_find_then_advertise() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        b.find_advertised_name("org.example").await.unwrap();
        a.advertise_name("org.example.app").await.unwrap();

        let found = b.recv().await.unwrap();
        assert_eq!(
            found.header.member.as_deref(),
            Some(well_known::FOUND_ADVERTISED_NAME)
        );
    }

    #[tokio::test]
    async fn test_cancel_advertise_reports_lost() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        b.find_advertised_name("org.example").await.unwrap();
        a.advertise_name("org.example.app").await.unwrap();
        let _found = b.recv().await.unwrap();

        a.cancel_advertise_name("org.example.app").await.unwrap();
        let lost = b.recv().await.unwrap();
        assert_eq!(
            lost.header.member.as_deref(),
            Some(well_known::LOST_ADVERTISED_NAME)
        );
    }

    #[tokio::test]
    async fn test_close_emits_peer_vanished() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        let a_name = a.unique_name().to_string();
        a.close().await;

        let gone = b.recv().await.unwrap();
        assert_eq!(
            gone.header.member.as_deref(),
            Some(well_known::PEER_VANISHED)
        );
        assert_eq!(gone.body[0], MsgArg::Str(a_name));
        assert_eq!(hub.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let hub = MemoryHub::new();
        let a = hub.connect("aaaa").await.unwrap();
        let b = hub.connect("bbbb").await.unwrap();

        a.close().await;
        let err = a.send(call(b.unique_name(), "Ping")).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }
}
