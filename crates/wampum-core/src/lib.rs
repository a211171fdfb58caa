//! wampum-core: client-side WAMP protocol engine.
//!
//! This crate defines:
//! - Payload values ([`Value`], [`Dict`], [`ValueList`])
//! - Wire messages ([`Message`], [`MsgCode`])
//! - The transport contract ([`Transport`], [`TransportHandler`])
//! - The session state machine ([`Session`])
//! - Challenge/response authentication ([`Challenge`], [`ChallengeResponse`])
//! - The error taxonomy ([`WampError`] and friends)
//!
//! Concrete transports live in their own crates; see
//! `wampum-transport-rawsocket` for the TCP/Unix-socket framing transport.

#![forbid(unsafe_code)]

mod auth;
mod error;
mod message;
mod session;
mod transport;
mod value;

pub use auth::*;
pub use error::*;
pub use message::*;
pub use session::*;
pub use transport::*;
pub use value::*;
