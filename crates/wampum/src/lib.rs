//! wampum: a WAMP (Web Application Messaging Protocol) client.
//!
//! Remote procedure calls and publish/subscribe over a RawSocket (TCP or
//! Unix-domain) transport:
//!
//! ```ignore
//! use wampum::{connect_tcp, Dict, ValueList};
//!
//! let session = connect_tcp("127.0.0.1:8080").await?;
//! session.join("realm1").await?;
//!
//! let result = session
//!     .call("com.example.add", ValueList::new().push(2).push(3).build(), Dict::new())
//!     .await?;
//! println!("sum: {:?}", result.first());
//!
//! session.leave().await?;
//! session.stop().await?;
//! ```

pub use wampum_core::*;
pub use wampum_transport_rawsocket::{
    Connector, RawSocketTransport, TcpConnector, DEFAULT_MAX_LENGTH_EXPONENT, MAGIC,
    SERIALIZER_MSGPACK,
};
#[cfg(unix)]
pub use wampum_transport_rawsocket::UnixConnector;

use std::sync::Arc;

/// Start a session over a RawSocket TCP transport.
///
/// The returned session is `Attached` and ready to `join`.
pub async fn connect_tcp(addr: impl Into<String>) -> Result<Arc<Session>, WampError> {
    let transport = RawSocketTransport::new(TcpConnector::new(addr));
    let session = Session::new();
    session.start(Arc::new(transport)).await?;
    Ok(session)
}

/// Start a session over a RawSocket Unix-domain-socket transport.
#[cfg(unix)]
pub async fn connect_unix(
    path: impl Into<std::path::PathBuf>,
) -> Result<Arc<Session>, WampError> {
    let transport = RawSocketTransport::new(UnixConnector::new(path));
    let session = Session::new();
    session.start(Arc::new(transport)).await?;
    Ok(session)
}
