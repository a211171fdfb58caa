//! Wire messages: an ordered field list whose first field is the code.
//!
//! A message is nothing more than `[code, field, field, ...]`. Not every
//! field list is a valid WAMP message; the checked accessors here are what
//! the session uses to validate inbound traffic, and the constructors cover
//! every message this client sends.

use crate::error::{DecodeError, EncodeError, ProtocolError};
use crate::value::{Dict, Value};

/// WAMP message codes, wire-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MsgCode {
    Hello = 1,
    Welcome = 2,
    Abort = 3,
    Challenge = 4,
    Authenticate = 5,
    Goodbye = 6,
    Error = 8,
    Publish = 16,
    Published = 17,
    Subscribe = 32,
    Subscribed = 33,
    Unsubscribe = 34,
    Unsubscribed = 35,
    Event = 36,
    Call = 48,
    Cancel = 49,
    Result = 50,
    Register = 64,
    Registered = 65,
    Unregister = 66,
    Unregistered = 67,
    Invocation = 68,
    Interrupt = 69,
    Yield = 70,
}

impl MsgCode {
    pub fn from_u64(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Hello),
            2 => Some(Self::Welcome),
            3 => Some(Self::Abort),
            4 => Some(Self::Challenge),
            5 => Some(Self::Authenticate),
            6 => Some(Self::Goodbye),
            8 => Some(Self::Error),
            16 => Some(Self::Publish),
            17 => Some(Self::Published),
            32 => Some(Self::Subscribe),
            33 => Some(Self::Subscribed),
            34 => Some(Self::Unsubscribe),
            35 => Some(Self::Unsubscribed),
            36 => Some(Self::Event),
            48 => Some(Self::Call),
            49 => Some(Self::Cancel),
            50 => Some(Self::Result),
            64 => Some(Self::Register),
            65 => Some(Self::Registered),
            66 => Some(Self::Unregister),
            67 => Some(Self::Unregistered),
            68 => Some(Self::Invocation),
            69 => Some(Self::Interrupt),
            70 => Some(Self::Yield),
            _ => None,
        }
    }
}

/// One WAMP message, decoded or under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    fields: Vec<Value>,
}

impl Message {
    pub fn from_fields(fields: Vec<Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Value> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The message code from field 0.
    pub fn code(&self) -> Result<MsgCode, ProtocolError> {
        let raw = self.id_at(0)?;
        MsgCode::from_u64(raw).ok_or(ProtocolError::UnknownMessageCode(raw))
    }

    /// Rejects messages carrying more fields than the type allows.
    pub fn check_max_len(&self, max: usize) -> Result<(), ProtocolError> {
        if self.fields.len() > max {
            return Err(ProtocolError::ExtraFields {
                max,
                got: self.fields.len(),
            });
        }
        Ok(())
    }

    fn field(&self, index: usize, expected: &'static str) -> Result<&Value, ProtocolError> {
        self.fields
            .get(index)
            .ok_or(ProtocolError::MissingField { index, expected })
    }

    /// A non-negative integer field (all WAMP ids).
    pub fn id_at(&self, index: usize) -> Result<u64, ProtocolError> {
        let field = self.field(index, "id")?;
        field.as_u64().map_err(|_| ProtocolError::UnexpectedFieldType {
            index,
            expected: "id",
            found: field.kind(),
        })
    }

    pub fn str_at(&self, index: usize) -> Result<&str, ProtocolError> {
        let field = self.field(index, "string")?;
        field.as_str().map_err(|_| ProtocolError::UnexpectedFieldType {
            index,
            expected: "string",
            found: field.kind(),
        })
    }

    pub fn dict_at(&self, index: usize) -> Result<&Dict, ProtocolError> {
        let field = self.field(index, "dict")?;
        field.as_map().map_err(|_| ProtocolError::UnexpectedFieldType {
            index,
            expected: "dict",
            found: field.kind(),
        })
    }

    pub fn list_at(&self, index: usize) -> Result<&[Value], ProtocolError> {
        let field = self.field(index, "list")?;
        field.as_array().map_err(|_| ProtocolError::UnexpectedFieldType {
            index,
            expected: "list",
            found: field.kind(),
        })
    }

    /// Optional trailing positional payload; absent means empty.
    pub fn args_at(&self, index: usize) -> Result<Vec<Value>, ProtocolError> {
        match self.fields.get(index) {
            None => Ok(Vec::new()),
            Some(_) => Ok(self.list_at(index)?.to_vec()),
        }
    }

    /// Optional trailing keyword payload; absent means empty.
    pub fn kwargs_at(&self, index: usize) -> Result<Dict, ProtocolError> {
        match self.fields.get(index) {
            None => Ok(Dict::new()),
            Some(_) => Ok(self.dict_at(index)?.clone()),
        }
    }

    /// Encode through the codec collaborator.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        rmp_serde::to_vec(&self.fields).map_err(|e| EncodeError::Failed(e.to_string()))
    }

    /// Decode through the codec collaborator. Truncated input and ill-typed
    /// input surface as distinct errors.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let fields: Vec<Value> = rmp_serde::from_slice(bytes).map_err(map_decode_error)?;
        Ok(Self { fields })
    }

    // ------------------------------------------------------------------
    // Outbound constructors (everything this client ever sends)
    // ------------------------------------------------------------------

    pub fn hello(realm: &str, details: Dict) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Hello as i64),
            Value::String(realm.to_owned()),
            Value::Map(details),
        ])
    }

    pub fn authenticate(signature: &str, extra: Dict) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Authenticate as i64),
            Value::String(signature.to_owned()),
            Value::Map(extra),
        ])
    }

    pub fn goodbye(details: Dict, reason: &str) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Goodbye as i64),
            Value::Map(details),
            Value::String(reason.to_owned()),
        ])
    }

    pub fn publish(
        request_id: u64,
        options: Dict,
        topic: &str,
        args: Vec<Value>,
        kwargs: Dict,
    ) -> Self {
        let mut fields = vec![
            Value::Integer(MsgCode::Publish as i64),
            Value::Integer(request_id as i64),
            Value::Map(options),
            Value::String(topic.to_owned()),
        ];
        push_payloads(&mut fields, args, kwargs);
        Self::from_fields(fields)
    }

    pub fn subscribe(request_id: u64, options: Dict, topic: &str) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Subscribe as i64),
            Value::Integer(request_id as i64),
            Value::Map(options),
            Value::String(topic.to_owned()),
        ])
    }

    pub fn unsubscribe(request_id: u64, subscription_id: u64) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Unsubscribe as i64),
            Value::Integer(request_id as i64),
            Value::Integer(subscription_id as i64),
        ])
    }

    pub fn call(
        request_id: u64,
        options: Dict,
        procedure: &str,
        args: Vec<Value>,
        kwargs: Dict,
    ) -> Self {
        let mut fields = vec![
            Value::Integer(MsgCode::Call as i64),
            Value::Integer(request_id as i64),
            Value::Map(options),
            Value::String(procedure.to_owned()),
        ];
        push_payloads(&mut fields, args, kwargs);
        Self::from_fields(fields)
    }

    pub fn register(request_id: u64, options: Dict, procedure: &str) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Register as i64),
            Value::Integer(request_id as i64),
            Value::Map(options),
            Value::String(procedure.to_owned()),
        ])
    }

    pub fn unregister(request_id: u64, registration_id: u64) -> Self {
        Self::from_fields(vec![
            Value::Integer(MsgCode::Unregister as i64),
            Value::Integer(request_id as i64),
            Value::Integer(registration_id as i64),
        ])
    }

    /// A callee's successful reply to an invocation.
    pub fn yield_(request_id: u64, options: Dict, args: Vec<Value>, kwargs: Dict) -> Self {
        let mut fields = vec![
            Value::Integer(MsgCode::Yield as i64),
            Value::Integer(request_id as i64),
            Value::Map(options),
        ];
        push_payloads(&mut fields, args, kwargs);
        Self::from_fields(fields)
    }

    /// A callee's error reply to an invocation.
    pub fn invocation_error(
        request_id: u64,
        details: Dict,
        error_uri: &str,
        args: Vec<Value>,
        kwargs: Dict,
    ) -> Self {
        let mut fields = vec![
            Value::Integer(MsgCode::Error as i64),
            Value::Integer(MsgCode::Invocation as i64),
            Value::Integer(request_id as i64),
            Value::Map(details),
            Value::String(error_uri.to_owned()),
        ];
        push_payloads(&mut fields, args, kwargs);
        Self::from_fields(fields)
    }
}

/// Appends the optional positional/keyword payload fields, never leaving an
/// empty trailing field on the wire.
fn push_payloads(fields: &mut Vec<Value>, args: Vec<Value>, kwargs: Dict) {
    if !kwargs.is_empty() {
        fields.push(Value::Array(args));
        fields.push(Value::Map(kwargs));
    } else if !args.is_empty() {
        fields.push(Value::Array(args));
    }
}

fn map_decode_error(err: rmp_serde::decode::Error) -> DecodeError {
    use rmp_serde::decode::Error as E;
    match err {
        E::InvalidMarkerRead(ref io) | E::InvalidDataRead(ref io)
            if io.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            DecodeError::Truncated
        }
        E::TypeMismatch(marker) => DecodeError::TypeMismatch(format!("{marker:?}")),
        other => DecodeError::Invalid(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueList;

    #[test]
    fn code_round_trip() {
        for code in [
            MsgCode::Hello,
            MsgCode::Welcome,
            MsgCode::Error,
            MsgCode::Publish,
            MsgCode::Event,
            MsgCode::Call,
            MsgCode::Result,
            MsgCode::Invocation,
            MsgCode::Yield,
        ] {
            assert_eq!(MsgCode::from_u64(code as u64), Some(code));
        }
        assert_eq!(MsgCode::from_u64(7), None);
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = Message::call(
            9,
            Dict::new(),
            "com.example.add",
            ValueList::new().push(2).push(3).build(),
            Dict::new(),
        );
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.code().unwrap(), MsgCode::Call);
        assert_eq!(decoded.id_at(1).unwrap(), 9);
        assert_eq!(decoded.str_at(3).unwrap(), "com.example.add");
        assert_eq!(decoded.args_at(4).unwrap().len(), 2);
    }

    #[test]
    fn empty_payloads_are_trimmed() {
        let msg = Message::publish(1, Dict::new(), "t", Vec::new(), Dict::new());
        assert_eq!(msg.len(), 4);

        let mut kwargs = Dict::new();
        kwargs.insert("k".into(), Value::Integer(1));
        let msg = Message::publish(1, Dict::new(), "t", Vec::new(), kwargs);
        // kwargs present forces the (empty) args list onto the wire too
        assert_eq!(msg.len(), 6);
        assert!(msg.args_at(4).unwrap().is_empty());
        assert_eq!(msg.kwargs_at(5).unwrap().len(), 1);
    }

    #[test]
    fn truncated_input_is_distinct_from_type_mismatch() {
        let bytes = Message::hello("realm", Dict::new()).encode().unwrap();
        match Message::decode(&bytes[..bytes.len() - 1]) {
            Err(DecodeError::Truncated) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }

        // a msgpack map is not a message (must be an array of fields)
        let map_bytes = rmp_serde::to_vec(&Value::Map(Dict::new())).unwrap();
        match Message::decode(&map_bytes) {
            Err(DecodeError::TypeMismatch(_)) => {}
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn field_validation_reports_position_and_kind() {
        let msg = Message::from_fields(vec![Value::Integer(48), Value::String("nope".into())]);
        match msg.id_at(1) {
            Err(ProtocolError::UnexpectedFieldType { index: 1, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        match msg.dict_at(2) {
            Err(ProtocolError::MissingField { index: 2, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
