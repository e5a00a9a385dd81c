//! Outbound method-call bookkeeping: serials, pending calls, timeouts.
//!
//! Every outgoing call allocates a serial and registers a `PendingCall`.
//! A pending call resolves exactly once: by the matching reply, the
//! matching error, a timeout, or teardown. The entry is removed from the
//! table before resolving; resolving the same `PendingCall` twice is a
//! programming-contract violation in this layer and panics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use obus_msg::{Message, MessageType};

use crate::errors::{BusError, ErrorCode};

/// Default method call timeout.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 25_000;

// ============================================================================
// Dispatch Statistics
// ============================================================================

/// Counters for outbound call dispatch.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Calls sent with a registered pending entry
    pub calls_sent: AtomicU64,
    /// Replies matched to a pending call
    pub replies_matched: AtomicU64,
    /// Error messages matched to a pending call
    pub errors_matched: AtomicU64,
    /// Replies that arrived after their call had already resolved
    pub late_replies: AtomicU64,
    /// Calls resolved by timeout
    pub timeouts: AtomicU64,
    /// Calls flushed by disconnect/teardown
    pub flushed: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            replies_matched: self.replies_matched.load(Ordering::Relaxed),
            errors_matched: self.errors_matched.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchStatsSnapshot {
    pub calls_sent: u64,
    pub replies_matched: u64,
    pub errors_matched: u64,
    pub late_replies: u64,
    pub timeouts: u64,
    pub flushed: u64,
}

// ============================================================================
// PendingCall
// ============================================================================

/// The reply continuation for one outstanding call serial.
pub struct PendingCall {
    serial: u32,
    tx: Option<oneshot::Sender<Result<Message, BusError>>>,
}

impl PendingCall {
    fn new(serial: u32, tx: oneshot::Sender<Result<Message, BusError>>) -> Self {
        Self {
            serial,
            tx: Some(tx),
        }
    }

    /// Resolve with a reply or error. Panics on a second resolution: that is
    /// a bug in this layer, never a user-facing condition.
    fn resolve(&mut self, result: Result<Message, BusError>) {
        match self.tx.take() {
            Some(tx) => {
                // The caller may have stopped waiting; that is fine.
                let _ = tx.send(result);
            }
            None => panic!(
                "pending call serial {} resolved twice",
                self.serial
            ),
        }
    }
}

// ============================================================================
// MethodDispatcher
// ============================================================================

/// Serial allocation plus the pending-call table.
pub struct MethodDispatcher {
    next_serial: AtomicU32,
    pending: DashMap<u32, PendingCall>,
    stats: Arc<DispatchStats>,
}

impl Default for MethodDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodDispatcher {
    pub fn new() -> Self {
        Self {
            next_serial: AtomicU32::new(1),
            pending: DashMap::new(),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Allocate the next serial. Wraps, but never returns 0.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Register a pending call for `serial` and return its receiver.
    pub fn register(&self, serial: u32) -> oneshot::Receiver<Result<Message, BusError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(serial, PendingCall::new(serial, tx));
        self.stats.calls_sent.fetch_add(1, Ordering::Relaxed);
        rx
    }

    /// Route an inbound `MethodReturn` or `Error` to its pending call.
    ///
    /// Replies with no pending entry (already timed out, already resolved)
    /// are dropped and counted.
    pub fn resolve_reply(&self, msg: Message) {
        let serial = match msg.header.reply_serial {
            Some(s) => s,
            None => {
                warn!("reply message without reply_serial dropped");
                return;
            }
        };

        match self.pending.remove(&serial) {
            Some((_, mut pending)) => match msg.header.msg_type {
                MessageType::Error => {
                    self.stats.errors_matched.fetch_add(1, Ordering::Relaxed);
                    let name = msg
                        .header
                        .error_name
                        .clone()
                        .unwrap_or_else(|| ErrorCode::Fail.error_name().to_string());
                    let text = msg.body.first().and_then(|arg| match arg {
                        obus_msg::MsgArg::Str(s) => Some(s.clone()),
                        _ => None,
                    });
                    pending.resolve(Err(BusError::from_wire(&name, text)));
                }
                _ => {
                    self.stats.replies_matched.fetch_add(1, Ordering::Relaxed);
                    pending.resolve(Ok(msg));
                }
            },
            None => {
                debug!(serial, "late reply dropped");
                self.stats.late_replies.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Resolve `serial` with a timeout error.
    ///
    /// Returns false if the call had already resolved; the caller should
    /// then prefer the raced-in result.
    pub fn fail_timeout(&self, serial: u32) -> bool {
        match self.pending.remove(&serial) {
            Some((_, mut pending)) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                pending.resolve(Err(BusError::new(ErrorCode::Timeout)));
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without resolving it (send failed before the
    /// call was ever in flight).
    pub fn abandon(&self, serial: u32) {
        self.pending.remove(&serial);
    }

    /// Resolve every outstanding call with `err`. Teardown path: disconnect
    /// and destruction release pending calls deterministically.
    pub fn flush_all(&self, err: &BusError) {
        let serials: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for serial in serials {
            if let Some((_, mut pending)) = self.pending.remove(&serial) {
                self.stats.flushed.fetch_add(1, Ordering::Relaxed);
                pending.resolve(Err(err.clone()));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
