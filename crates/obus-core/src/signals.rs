//! Signal routing: registered handlers matched against inbound signals.
//!
//! Handlers are keyed by `(handler identity, signal name, source path)`.
//! Re-registering the same handler for the same signal name and source path
//! replaces the prior registration in place, so a refreshed subscription
//! never delivers twice. Re-registering the same handler with a *different*
//! source-path filter is deliberately a new, independent registration: a
//! different filter is a different subscription, and both deliver.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use obus_msg::codec::{decode_all, Value};
use obus_msg::validation::validate_object_path;
use obus_msg::Message;

use crate::errors::BusError;

// ============================================================================
// Handler Trait
// ============================================================================

/// Decoded context for one delivered signal.
#[derive(Debug, Clone)]
pub struct SignalContext {
    /// Unique name of the emitter
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    /// Session the signal arrived on (0 = sessionless)
    pub session_id: u32,
    pub args: Vec<Value>,
}

/// Inbound signal handler.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_signal(&self, ctx: SignalContext);
}

struct FnSignalHandler<F>(F);

#[async_trait]
impl<F, Fut> SignalHandler for FnSignalHandler<F>
where
    F: Fn(SignalContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn on_signal(&self, ctx: SignalContext) {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a signal handler.
pub fn signal_handler<F, Fut>(f: F) -> Arc<dyn SignalHandler>
where
    F: Fn(SignalContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(FnSignalHandler(f))
}

// ============================================================================
// SignalRouter
// ============================================================================

struct Registration {
    handler: Arc<dyn SignalHandler>,
    /// Bare member name, or qualified "interface.Member" when dotted
    signal_name: String,
    source_path: Option<String>,
}

impl Registration {
    fn matches(&self, msg: &Message) -> bool {
        let member = msg.header.member.as_deref().unwrap_or("");
        let name_matches = match self.signal_name.rsplit_once('.') {
            // Qualified name: match interface and member exactly.
            Some((iface, signal)) => {
                msg.header.interface.as_deref() == Some(iface) && member == signal
            }
            None => member == self.signal_name,
        };
        if !name_matches {
            return false;
        }
        match &self.source_path {
            Some(path) => msg.header.path.as_deref() == Some(path.as_str()),
            None => true,
        }
    }

    fn same_key(&self, handler: &Arc<dyn SignalHandler>, signal_name: &str, source_path: Option<&str>) -> bool {
        Arc::ptr_eq(&self.handler, handler)
            && self.signal_name == signal_name
            && self.source_path.as_deref() == source_path
    }
}

/// The per-attachment signal registration table.
#[derive(Default)]
pub struct SignalRouter {
    registrations: RwLock<Vec<Registration>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for a signal name, optionally filtered by source
    /// path.
    ///
    /// `signal_name` is either a bare member name ("Changed") or a
    /// qualified "org.example.Iface.Changed". Re-registering the same
    /// handler for the same `(signal_name, source_path)` replaces the prior
    /// registration without changing its delivery position.
    pub fn register(
        &self,
        handler: Arc<dyn SignalHandler>,
        signal_name: &str,
        source_path: Option<&str>,
    ) -> Result<(), BusError> {
        if let Some(path) = source_path {
            validate_object_path(path)?;
        }

        let mut regs = self.registrations.write();
        if let Some(existing) = regs
            .iter_mut()
            .find(|r| r.same_key(&handler, signal_name, source_path))
        {
            // Same handler, same key: refresh in place.
            existing.handler = handler;
            debug!(signal = signal_name, "signal handler refreshed");
            return Ok(());
        }
        regs.push(Registration {
            handler,
            signal_name: signal_name.to_string(),
            source_path: source_path.map(str::to_string),
        });
        debug!(signal = signal_name, "signal handler registered");
        Ok(())
    }

    /// Remove one registration. Safe to call when nothing matches.
    pub fn unregister(
        &self,
        handler: &Arc<dyn SignalHandler>,
        signal_name: &str,
        source_path: Option<&str>,
    ) {
        self.registrations
            .write()
            .retain(|r| !r.same_key(handler, signal_name, source_path));
    }

    /// Drop every registration.
    pub fn unregister_all(&self) {
        self.registrations.write().clear();
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }

    /// Handlers matching an inbound signal, in registration order.
    ///
    /// Each matching handler appears once: delivery is at-most-once per
    /// handler per physical signal message.
    pub fn matching(&self, msg: &Message) -> Vec<Arc<dyn SignalHandler>> {
        let regs = self.registrations.read();
        let mut out: Vec<Arc<dyn SignalHandler>> = Vec::new();
        for reg in regs.iter() {
            if reg.matches(msg)
                && !out.iter().any(|h| Arc::ptr_eq(h, &reg.handler))
            {
                out.push(Arc::clone(&reg.handler));
            }
        }
        out
    }

    /// Decode a signal message into its handler context.
    pub fn context_for(msg: &Message) -> SignalContext {
        SignalContext {
            sender: msg.header.sender.clone().unwrap_or_default(),
            path: msg.header.path.clone().unwrap_or_default(),
            interface: msg.header.interface.clone().unwrap_or_default(),
            member: msg.header.member.clone().unwrap_or_default(),
            session_id: msg.header.session_id,
            args: decode_all(&msg.body),
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        count: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SignalHandler for Counting {
        async fn on_signal(&self, _ctx: SignalContext) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn signal(path: &str, iface: &str, member: &str) -> Message {
        let mut msg = Message::signal(path, iface, member, vec![]);
        msg.header.serial = 1;
        msg.header.sender = Some(":x.1".into());
        msg
    }

    async fn deliver(router: &SignalRouter, msg: &Message) {
        for handler in router.matching(msg) {
            handler.on_signal(SignalRouter::context_for(msg)).await;
        }
    }

    #[tokio::test]
    async fn test_multiple_independent_handlers() {
        let router = SignalRouter::new();
        let a = Counting::new();
        let b = Counting::new();

        router
            .register(a.clone() as Arc<dyn SignalHandler>, "Changed", None)
            .unwrap();
        router
            .register(b.clone() as Arc<dyn SignalHandler>, "Changed", None)
            .unwrap();

        deliver(&router, &signal("/obj", "org.example.Iface", "Changed")).await;

        assert_eq!(a.count.load(Ordering::SeqCst), 1);
        assert_eq!(b.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_not_duplicates() {
        let router = SignalRouter::new();
        let a = Counting::new();
        let handler = a.clone() as Arc<dyn SignalHandler>;

        router.register(handler.clone(), "Changed", None).unwrap();
        // Refreshing the same subscription must not double delivery.
        router.register(handler, "Changed", None).unwrap();
        assert_eq!(router.len(), 1);

        deliver(&router, &signal("/obj", "org.example.Iface", "Changed")).await;
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_source_path_is_new_registration() {
        let router = SignalRouter::new();
        let a = Counting::new();
        let handler = a.clone() as Arc<dyn SignalHandler>;

        router.register(handler.clone(), "Changed", None).unwrap();
        router
            .register(handler, "Changed", Some("/specific"))
            .unwrap();
        assert_eq!(router.len(), 2);

        // One physical signal still delivers at most once to this handler.
        deliver(&router, &signal("/specific", "org.example.Iface", "Changed")).await;
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_path_filter() {
        let router = SignalRouter::new();
        let a = Counting::new();
        router
            .register(a.clone() as Arc<dyn SignalHandler>, "Changed", Some("/wanted"))
            .unwrap();

        deliver(&router, &signal("/other", "org.example.Iface", "Changed")).await;
        assert_eq!(a.count.load(Ordering::SeqCst), 0);

        deliver(&router, &signal("/wanted", "org.example.Iface", "Changed")).await;
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_qualified_name_matches_interface() {
        let router = SignalRouter::new();
        let a = Counting::new();
        router
            .register(
                a.clone() as Arc<dyn SignalHandler>,
                "org.example.Iface.Changed",
                None,
            )
            .unwrap();

        deliver(&router, &signal("/obj", "org.example.Other", "Changed")).await;
        assert_eq!(a.count.load(Ordering::SeqCst), 0);

        deliver(&router, &signal("/obj", "org.example.Iface", "Changed")).await;
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registration_order_preserved() {
        let router = SignalRouter::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct Ordered {
            id: usize,
            order: Arc<parking_lot::Mutex<Vec<usize>>>,
        }

        #[async_trait]
        impl SignalHandler for Ordered {
            async fn on_signal(&self, _ctx: SignalContext) {
                self.order.lock().push(self.id);
            }
        }

        for id in 0..3 {
            router
                .register(
                    Arc::new(Ordered {
                        id,
                        order: order.clone(),
                    }),
                    "Changed",
                    None,
                )
                .unwrap();
        }

        deliver(&router, &signal("/obj", "org.example.Iface", "Changed")).await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_double_unregister_is_safe() {
        let router = SignalRouter::new();
        let a = Counting::new();
        let handler = a as Arc<dyn SignalHandler>;

        router.register(handler.clone(), "Changed", None).unwrap();
        router.unregister(&handler, "Changed", None);
        router.unregister(&handler, "Changed", None);
        assert!(router.is_empty());
    }

    #[test]
    fn test_unregister_all() {
        let router = SignalRouter::new();
        for _ in 0..4 {
            router
                .register(Counting::new() as Arc<dyn SignalHandler>, "Changed", None)
                .unwrap();
        }
        router.unregister_all();
        assert!(router.is_empty());
    }

    #[test]
    fn test_bad_source_path_rejected() {
        let router = SignalRouter::new();
        let err = router
            .register(Counting::new() as Arc<dyn SignalHandler>, "Changed", Some("bad/path"))
            .unwrap_err();
        assert!(!err.message.is_empty());
    }
}
