//! Transport contract between the session and a concrete byte-stream
//! transport.
//!
//! The reference discipline is deliberate: a transport holds a strong
//! reference to its handler only between `attach` and `detach`, and the
//! session holds a strong reference to the transport only between `start`
//! and `stop`. Teardown paths must break the cycle explicitly; neither side
//! outlives the other by construction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::Message;

/// Callback invoked when the peer signals congestion (or recovery).
pub type FlowHandler = Box<dyn Fn() + Send + Sync>;

/// A message-oriented transport the session can run on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection, including any transport-level handshake.
    /// On success the attached handler has received `on_attach`.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Idempotent; the attached handler receives
    /// `on_detach(true, ..)` the first time.
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Associate the single message handler. The transport keeps a strong
    /// reference until `detach` is called.
    fn attach(&self, handler: Arc<dyn TransportHandler>);

    /// Drop the handler reference. Does not close the connection.
    fn detach(&self);

    fn has_handler(&self) -> bool;

    /// Queue one fully-encoded message for transmission. Messages are
    /// written whole and in submission order.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Stop delivering inbound messages to the handler. Bytes may still be
    /// buffered while paused.
    fn pause(&self);

    /// Resume delivery; buffered messages are dispatched in arrival order.
    fn resume(&self);

    /// Register a callback fired when the peer cannot keep up with our
    /// sends and outbound throttling is advisable.
    fn set_pause_handler(&self, handler: FlowHandler);

    /// Register the matching recovery callback.
    fn set_resume_handler(&self, handler: FlowHandler);
}

/// The single handler a transport delivers messages to.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// The transport finished connecting; the handler may now send.
    async fn on_attach(&self, transport: Arc<dyn Transport>);

    /// One decoded inbound message. An error return tells the transport the
    /// handler considers the stream unusable.
    async fn on_message(&self, message: Message) -> Result<(), crate::error::WampError>;

    /// The transport went away. `was_clean` is false for read/write errors
    /// and peer hangups, true for locally requested disconnects.
    async fn on_detach(&self, was_clean: bool, reason: &str);
}
