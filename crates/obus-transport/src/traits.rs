//! Endpoint and transport traits for the bus core.

use async_trait::async_trait;

use obus_msg::Message;

/// Common transport error type.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,

    #[error("no peer owns the name '{0}'")]
    UnknownDestination(String),

    #[error("name '{0}' is already owned")]
    NameTaken(String),

    #[error("operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] crate::framing::FramingError),

    #[error("other error: {0}")]
    Other(String),
}

/// A connected endpoint onto the bus.
///
/// The router assigns the unique name at connect time. Messages sent with a
/// destination are routed to that peer (unique or well-known name); signals
/// without a destination are broadcast. Name-service operations (advertise /
/// find) report asynchronously through `recv` as signals on the reserved
/// `org.obus.Bus` interface.
#[async_trait]
pub trait BusEndpoint: Send + Sync {
    /// The unique name assigned at connect time (`:prefix.N`).
    fn unique_name(&self) -> &str;

    /// Whether the endpoint is still attached to the router.
    fn is_connected(&self) -> bool;

    /// Hand a message to the router. Never blocks on remote delivery.
    async fn send(&self, msg: Message) -> Result<(), TransportError>;

    /// Receive the next inbound message, in router order.
    async fn recv(&self) -> Result<Message, TransportError>;

    /// Claim a well-known name. Returns false if another peer owns it.
    async fn request_name(&self, name: &str) -> Result<bool, TransportError>;

    /// Release a well-known name. No-op if not owned.
    async fn release_name(&self, name: &str) -> Result<(), TransportError>;

    /// Advertise a name for discovery.
    async fn advertise_name(&self, name: &str) -> Result<(), TransportError>;

    /// Stop advertising a name.
    async fn cancel_advertise_name(&self, name: &str) -> Result<(), TransportError>;

    /// Register interest in advertised names with the given prefix.
    /// Matches (current and future) arrive as `FoundAdvertisedName` signals.
    async fn find_advertised_name(&self, prefix: &str) -> Result<(), TransportError>;

    /// Withdraw a previously registered find.
    async fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), TransportError>;

    /// Detach from the router. Idempotent.
    async fn close(&self);
}

/// Factory for endpoints: one `connect` per bus attachment.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attach to the bus. `guid_prefix` seeds the unique name.
    async fn connect(
        &self,
        guid_prefix: &str,
    ) -> Result<std::sync::Arc<dyn BusEndpoint>, TransportError>;
}
