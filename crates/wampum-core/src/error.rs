//! Error taxonomy for the session and transport layers.
//!
//! Local validation failures are returned synchronously; everything remote
//! (router replies, transport loss) propagates through the pending
//! operation's result handle.

use core::fmt;

use crate::message::MsgCode;
use crate::value::{ConversionError, Dict, Value, ValueKind};

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The underlying byte stream could not be established.
    ConnectFailed(std::io::Error),
    /// The transport is not connected (or was closed under us).
    Closed,
    /// A read or write on the established stream failed.
    Io(std::io::Error),
    /// The peer rejected or mangled the RawSocket handshake.
    Handshake(HandshakeError),
    Encode(EncodeError),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Handshake(e) => write!(f, "handshake error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConnectFailed(e) | Self::Io(e) => Some(e),
            Self::Handshake(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<HandshakeError> for TransportError {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e)
    }
}

impl From<EncodeError> for TransportError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// RawSocket handshake failures, detected before any message frame moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The reply did not start with the 0x7F magic octet.
    BadMagic(u8),
    /// The reply's reserved octets were non-zero.
    NonZeroReserved,
    /// The peer echoed a serializer we did not request.
    SerializerMismatch { requested: u8, offered: u8 },
    /// The peer refused the connection outright (serializer nibble zero).
    Rejected(HandshakeReject),
    /// The stream ended before a full 4-octet reply arrived.
    Truncated,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic(octet) => write!(f, "bad magic octet 0x{octet:02x}"),
            Self::NonZeroReserved => write!(f, "reserved octets must be zero"),
            Self::SerializerMismatch { requested, offered } => {
                write!(f, "serializer mismatch: requested {requested}, offered {offered}")
            }
            Self::Rejected(reason) => write!(f, "peer rejected handshake: {reason}"),
            Self::Truncated => write!(f, "handshake reply truncated"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Error codes a peer may report in a handshake rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeReject {
    SerializerUnsupported,
    MaxLengthUnacceptable,
    ReservedBitsInUse,
    ConnectionLimit,
    Unknown(u8),
}

impl HandshakeReject {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::SerializerUnsupported,
            2 => Self::MaxLengthUnacceptable,
            3 => Self::ReservedBitsInUse,
            4 => Self::ConnectionLimit,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for HandshakeReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializerUnsupported => write!(f, "serializer unsupported"),
            Self::MaxLengthUnacceptable => write!(f, "maximum message length unacceptable"),
            Self::ReservedBitsInUse => write!(f, "reserved bits in use"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
            Self::Unknown(code) => write!(f, "unknown error code {code}"),
        }
    }
}

/// Serialization failures at the codec boundary.
#[derive(Debug)]
pub enum EncodeError {
    Failed(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Deserialization failures at the codec boundary.
///
/// Truncated input is kept distinct from well-framed but ill-typed input;
/// the former points at a framing bug, the latter at a bad peer.
#[derive(Debug)]
pub enum DecodeError {
    Truncated,
    TypeMismatch(String),
    Invalid(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "unexpected end of input"),
            Self::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            Self::Invalid(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A malformed or out-of-place message from the peer. Fatal to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    UnknownMessageCode(u64),
    MissingField { index: usize, expected: &'static str },
    UnexpectedFieldType {
        index: usize,
        expected: &'static str,
        found: ValueKind,
    },
    ExtraFields { max: usize, got: usize },
    UnexpectedMessage { code: MsgCode, state: &'static str },
    UnknownRegistration(u64),
    UnknownRequest { code: MsgCode, request_id: u64 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownMessageCode(code) => write!(f, "unknown message code {code}"),
            Self::MissingField { index, expected } => {
                write!(f, "missing field {index} ({expected})")
            }
            Self::UnexpectedFieldType {
                index,
                expected,
                found,
            } => {
                write!(f, "field {index}: expected {expected}, found {found}")
            }
            Self::ExtraFields { max, got } => {
                write!(f, "too many fields: {got} > {max}")
            }
            Self::UnexpectedMessage { code, state } => {
                write!(f, "unexpected {code:?} while {state}")
            }
            Self::UnknownRegistration(id) => write!(f, "unknown registration {id}"),
            Self::UnknownRequest { code, request_id } => {
                write!(f, "{code:?} references unknown request {request_id}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// An ERROR reply from the peer, scoped to one pending operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationError {
    pub uri: String,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

impl ApplicationError {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            args: Vec::new(),
            kwargs: Dict::new(),
        }
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)?;
        if !self.args.is_empty() {
            write!(f, " args={:?}", self.args)?;
        }
        if !self.kwargs.is_empty() {
            write!(f, " kwargs={:?}", self.kwargs)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApplicationError {}

/// Top-level error type surfaced by every session operation.
#[derive(Debug)]
pub enum WampError {
    Transport(TransportError),
    Protocol(ProtocolError),
    Application(ApplicationError),
    /// The operation requires a joined session.
    NoSession,
    /// A call's local timeout elapsed before the router replied.
    Timeout,
    /// The operation is not legal in the session's current state.
    InvalidState(&'static str),
    /// The session was torn down while the operation was outstanding.
    Aborted { reason: String },
    Conversion(ConversionError),
}

impl fmt::Display for WampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Application(e) => write!(f, "application error: {e}"),
            Self::NoSession => write!(f, "no session joined"),
            Self::Timeout => write!(f, "call timed out"),
            Self::InvalidState(what) => write!(f, "invalid state: {what}"),
            Self::Aborted { reason } => write!(f, "session aborted: {reason}"),
            Self::Conversion(e) => write!(f, "conversion error: {e}"),
        }
    }
}

impl std::error::Error for WampError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Application(e) => Some(e),
            Self::Conversion(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for WampError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for WampError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<ApplicationError> for WampError {
    fn from(e: ApplicationError) -> Self {
        Self::Application(e)
    }
}

impl From<ConversionError> for WampError {
    fn from(e: ConversionError) -> Self {
        Self::Conversion(e)
    }
}
