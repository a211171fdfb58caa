//! The WAMP client session state machine.
//!
//! A `Session` owns the request-id counter and all correlation tables, and
//! is the single [`TransportHandler`] attached to a transport. The key
//! invariant is that only the transport's receive loop feeds
//! `on_message()` - every inbound message is routed exactly once, either to
//! the pending operation that requested it or to a subscribed/registered
//! handler.
//!
//! ```text
//!                      ┌───────────────────────────────────┐
//!                      │              Session              │
//!                      ├───────────────────────────────────┤
//!                      │  calls:      request id → oneshot │
//!                      │  sub/unsub:  request id → oneshot │
//!                      │  reg/unreg:  request id → oneshot │
//!                      │  handlers:   subscription id → [] │
//!                      │  endpoints:  registration id → fn │
//!                      └───────────────┬───────────────────┘
//!                                      │
//!                                 on_message
//!                                      │
//!        ┌─────────────────────────────┼─────────────────────────────┐
//!        │                             │                             │
//!  reply? (pending)           EVENT (handlers)            INVOCATION (endpoint)
//!        │                             │                             │
//!  ┌─────▼──────┐             ┌────────▼────────┐        ┌───────────▼──────────┐
//!  │ resolve    │             │ fan out to each │        │ spawn endpoint, send │
//!  │ the waiter │             │ event handler   │        │ YIELD / ERROR back   │
//!  └────────────┘             └─────────────────┘        └──────────────────────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::auth::{Challenge, ChallengeHandler, ChallengeResponse, JoinOptions};
use crate::error::{ApplicationError, ProtocolError, TransportError, WampError};
use crate::message::{Message, MsgCode};
use crate::transport::{Transport, TransportHandler};
use crate::value::{Dict, Value};

/// Default GOODBYE reason when leaving a realm.
pub const CLOSE_REALM: &str = "wamp.error.close_realm";

const GOODBYE_AND_OUT: &str = "wamp.error.goodbye_and_out";
const PROTOCOL_VIOLATION: &str = "wamp.error.protocol_violation";
const RUNTIME_ERROR: &str = "wamp.error.runtime_error";

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Attached,
    Joining,
    Joined,
    Leaving,
    Detached,
}

/// A live topic subscription. Each subscribe() gets its own handle, even
/// when the router reuses one subscription id for several local handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    token: u64,
}

impl Subscription {
    /// The router-assigned subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A live procedure registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    id: u64,
}

impl Registration {
    /// The router-assigned registration id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One published event delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct Event {
    pub subscription_id: u64,
    pub publication_id: u64,
    pub details: Dict,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

/// One inbound activation of a registered procedure.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: u64,
    pub registration_id: u64,
    pub details: Dict,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

/// What an endpoint yields back to the caller.
///
/// Endpoints returning a bare value, a list, a map, or both collapse into
/// this one variant; narrower call sites project out what they need.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Empty,
    Args(Vec<Value>),
    Kwargs(Dict),
    Both(Vec<Value>, Dict),
}

impl InvocationResult {
    /// A single positional result value.
    pub fn single(value: impl Into<Value>) -> Self {
        Self::Args(vec![value.into()])
    }

    fn into_payloads(self) -> (Vec<Value>, Dict) {
        match self {
            Self::Empty => (Vec::new(), Dict::new()),
            Self::Args(args) => (args, Dict::new()),
            Self::Kwargs(kwargs) => (Vec::new(), kwargs),
            Self::Both(args, kwargs) => (args, kwargs),
        }
    }
}

/// An error reply from an endpoint, forwarded to the caller verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationError {
    pub uri: String,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

impl InvocationError {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            args: Vec::new(),
            kwargs: Dict::new(),
        }
    }
}

/// The result of a completed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub details: Dict,
    pub args: Vec<Value>,
    pub kwargs: Dict,
}

impl CallResult {
    /// The first positional result, if any.
    pub fn first(&self) -> Option<&Value> {
        self.args.first()
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Local deadline. When it elapses the pending call is dropped and a
    /// late RESULT/ERROR for it is ignored.
    pub timeout: Option<Duration>,
}

/// Handler invoked for every event delivered under a subscription.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

pub type EndpointFuture =
    Pin<Box<dyn Future<Output = Result<InvocationResult, InvocationError>> + Send>>;

/// A registered procedure: callable with an invocation, producing an
/// asynchronous result.
pub type Endpoint = Arc<dyn Fn(Invocation) -> EndpointFuture + Send + Sync>;

struct PendingCall {
    reply: oneshot::Sender<Result<CallResult, WampError>>,
}

struct PendingSubscribe {
    reply: oneshot::Sender<Result<Subscription, WampError>>,
    handler: EventHandler,
}

struct PendingUnsubscribe {
    reply: oneshot::Sender<Result<(), WampError>>,
    subscription: Subscription,
}

struct PendingRegister {
    reply: oneshot::Sender<Result<Registration, WampError>>,
    endpoint: Endpoint,
}

struct PendingUnregister {
    reply: oneshot::Sender<Result<(), WampError>>,
    registration_id: u64,
}

/// A WAMP client session.
///
/// Construct with [`Session::new`], attach a transport with `start`, then
/// `join` a realm. All operations return through their asynchronous result
/// handle; local validation failures return immediately.
pub struct Session {
    me: Weak<Session>,
    state: Mutex<SessionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,

    /// Monotonic, never reused while an entry is outstanding.
    next_request_id: AtomicU64,
    next_handler_token: AtomicU64,

    session_id: Mutex<Option<u64>>,
    join_reply: Mutex<Option<oneshot::Sender<Result<u64, WampError>>>>,
    leave_reply: Mutex<Option<oneshot::Sender<Result<String, WampError>>>>,

    calls: Mutex<HashMap<u64, PendingCall>>,
    subscribe_requests: Mutex<HashMap<u64, PendingSubscribe>>,
    unsubscribe_requests: Mutex<HashMap<u64, PendingUnsubscribe>>,
    register_requests: Mutex<HashMap<u64, PendingRegister>>,
    unregister_requests: Mutex<HashMap<u64, PendingUnregister>>,

    /// subscription id → attached handlers (multi-handler fan-out).
    subscriptions: Mutex<HashMap<u64, Vec<(u64, EventHandler)>>>,
    /// registration id → endpoint (exactly one per registration).
    procedures: Mutex<HashMap<u64, Endpoint>>,

    challenge_handler: Mutex<Option<ChallengeHandler>>,

    closed_tx: watch::Sender<Option<String>>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(None);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(SessionState::Unattached),
            transport: Mutex::new(None),
            next_request_id: AtomicU64::new(0),
            next_handler_token: AtomicU64::new(0),
            session_id: Mutex::new(None),
            join_reply: Mutex::new(None),
            leave_reply: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
            subscribe_requests: Mutex::new(HashMap::new()),
            unsubscribe_requests: Mutex::new(HashMap::new()),
            register_requests: Mutex::new(HashMap::new()),
            unregister_requests: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            procedures: Mutex::new(HashMap::new()),
            challenge_handler: Mutex::new(None),
            closed_tx,
            closed_rx,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The router-assigned session id while joined.
    pub fn session_id(&self) -> Option<u64> {
        *self.session_id.lock()
    }

    /// Register the hook invoked when the router issues a CHALLENGE.
    pub fn set_challenge_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Challenge) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ChallengeResponse, WampError>> + Send + 'static,
    {
        *self.challenge_handler.lock() =
            Some(Box::new(move |challenge| Box::pin(handler(challenge))));
    }

    /// Attach this session to a transport and connect it.
    ///
    /// Resolves once the transport reports attached; the session is then
    /// `Attached` and ready to `join`.
    pub async fn start(&self, transport: Arc<dyn Transport>) -> Result<(), WampError> {
        {
            let state = self.state.lock();
            if *state != SessionState::Unattached {
                return Err(WampError::InvalidState("session already started"));
            }
        }
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return Err(WampError::InvalidState("session dropped")),
        };
        transport.attach(me as Arc<dyn TransportHandler>);
        if let Err(e) = transport.connect().await {
            transport.detach();
            return Err(e.into());
        }
        Ok(())
    }

    /// Detach from the transport and release every table.
    pub async fn stop(&self) -> Result<(), WampError> {
        let transport = self.transport.lock().take();
        *self.state.lock() = SessionState::Detached;
        *self.session_id.lock() = None;
        self.fail_all_pending(|| WampError::Transport(TransportError::Closed));
        self.clear_tables();
        self.signal_closed("wamp.transport.disconnect");
        if let Some(transport) = transport {
            // Detach first so the disconnect does not loop back into
            // on_detach; the teardown above already ran.
            transport.detach();
            let _ = transport.disconnect().await;
        }
        Ok(())
    }

    /// Join a realm. Resolves with the router-assigned session id.
    pub async fn join(&self, realm: &str) -> Result<u64, WampError> {
        self.join_with(realm, JoinOptions::default()).await
    }

    /// Join a realm, announcing authentication methods.
    pub async fn join_with(&self, realm: &str, options: JoinOptions) -> Result<u64, WampError> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Attached => *state = SessionState::Joining,
                SessionState::Joining | SessionState::Joined => {
                    return Err(WampError::InvalidState("join already in progress"));
                }
                SessionState::Leaving => {
                    return Err(WampError::InvalidState("session is leaving"));
                }
                SessionState::Unattached | SessionState::Detached => {
                    return Err(WampError::InvalidState("no transport attached"));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        *self.join_reply.lock() = Some(tx);

        let mut details = Dict::new();
        details.insert("roles".into(), client_roles());
        options.apply_to(&mut details);

        tracing::debug!(realm, "sending HELLO");
        if let Err(e) = self.send_message(Message::hello(realm, details)).await {
            self.fail_join_state();
            *self.join_reply.lock() = None;
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WampError::Transport(TransportError::Closed)),
        }
    }

    /// Leave the realm with the standard close reason.
    pub async fn leave(&self) -> Result<String, WampError> {
        self.leave_with_reason(CLOSE_REALM).await
    }

    /// Leave the realm. Resolves with the reason the peer acknowledged.
    pub async fn leave_with_reason(&self, reason: &str) -> Result<String, WampError> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Joined {
                return Err(WampError::NoSession);
            }
            *state = SessionState::Leaving;
        }

        let (tx, rx) = oneshot::channel();
        *self.leave_reply.lock() = Some(tx);

        tracing::debug!(reason, "sending GOODBYE");
        if let Err(e) = self.send_message(Message::goodbye(Dict::new(), reason)).await {
            *self.leave_reply.lock() = None;
            let mut state = self.state.lock();
            if *state == SessionState::Leaving {
                *state = SessionState::Joined;
            }
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WampError::Transport(TransportError::Closed)),
        }
    }

    /// Publish an event, fire-and-forget. Resolves when the send completes,
    /// not when the event is delivered.
    pub async fn publish(
        &self,
        topic: &str,
        args: Vec<Value>,
        kwargs: Dict,
    ) -> Result<(), WampError> {
        self.require_joined()?;
        let request_id = self.next_request_id();
        self.send_message(Message::publish(request_id, Dict::new(), topic, args, kwargs))
            .await
    }

    /// Subscribe a handler to a topic.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<Subscription, WampError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.require_joined()?;
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.subscribe_requests.lock().insert(
            request_id,
            PendingSubscribe {
                reply: tx,
                handler: Arc::new(handler),
            },
        );

        tracing::debug!(request_id, topic, "sending SUBSCRIBE");
        if let Err(e) = self
            .send_message(Message::subscribe(request_id, Dict::new(), topic))
            .await
        {
            self.subscribe_requests.lock().remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WampError::Transport(TransportError::Closed)),
        }
    }

    /// Unsubscribe one handler. Other handlers attached to the same
    /// subscription id remain in place.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), WampError> {
        self.require_joined()?;
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.unsubscribe_requests.lock().insert(
            request_id,
            PendingUnsubscribe {
                reply: tx,
                subscription,
            },
        );

        tracing::debug!(request_id, subscription_id = subscription.id, "sending UNSUBSCRIBE");
        if let Err(e) = self
            .send_message(Message::unsubscribe(request_id, subscription.id))
            .await
        {
            self.unsubscribe_requests.lock().remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WampError::Transport(TransportError::Closed)),
        }
    }

    /// Call a remote procedure.
    pub async fn call(
        &self,
        procedure: &str,
        args: Vec<Value>,
        kwargs: Dict,
    ) -> Result<CallResult, WampError> {
        self.call_with(procedure, args, kwargs, CallOptions::default())
            .await
    }

    /// Call a remote procedure with options.
    pub async fn call_with(
        &self,
        procedure: &str,
        args: Vec<Value>,
        kwargs: Dict,
        options: CallOptions,
    ) -> Result<CallResult, WampError> {
        self.require_joined()?;
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(request_id, PendingCall { reply: tx });

        // Removes the pending entry if this future is dropped or times out,
        // so a late reply finds nothing to resolve.
        struct PendingGuard<'a> {
            session: &'a Session,
            request_id: u64,
            active: bool,
        }

        impl PendingGuard<'_> {
            fn disarm(&mut self) {
                self.active = false;
            }
        }

        impl Drop for PendingGuard<'_> {
            fn drop(&mut self) {
                if !self.active {
                    return;
                }
                if self.session.calls.lock().remove(&self.request_id).is_some() {
                    tracing::debug!(
                        request_id = self.request_id,
                        "call abandoned: removed pending entry"
                    );
                }
            }
        }

        let mut guard = PendingGuard {
            session: self,
            request_id,
            active: true,
        };

        let mut wire_options = Dict::new();
        if let Some(timeout) = options.timeout {
            wire_options.insert("timeout".into(), Value::Integer(timeout.as_millis() as i64));
        }

        tracing::debug!(request_id, procedure, "sending CALL");
        self.send_message(Message::call(request_id, wire_options, procedure, args, kwargs))
            .await?;

        let result = match options.timeout {
            None => match rx.await {
                Ok(result) => result,
                Err(_) => Err(WampError::Transport(TransportError::Closed)),
            },
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(WampError::Transport(TransportError::Closed)),
                Err(_) => {
                    tracing::debug!(request_id, timeout_ms = timeout.as_millis() as u64, "call timed out");
                    return Err(WampError::Timeout);
                }
            },
        };

        guard.disarm();
        result
    }

    /// Register a procedure. The endpoint becomes active once the router
    /// confirms with REGISTERED.
    pub async fn provide<F, Fut>(&self, procedure: &str, endpoint: F) -> Result<Registration, WampError>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InvocationResult, InvocationError>> + Send + 'static,
    {
        self.provide_with(procedure, Dict::new(), endpoint).await
    }

    /// Register a procedure with REGISTER options.
    pub async fn provide_with<F, Fut>(
        &self,
        procedure: &str,
        options: Dict,
        endpoint: F,
    ) -> Result<Registration, WampError>
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InvocationResult, InvocationError>> + Send + 'static,
    {
        self.require_joined()?;
        let request_id = self.next_request_id();
        let endpoint: Endpoint = Arc::new(move |invocation| Box::pin(endpoint(invocation)));
        let (tx, rx) = oneshot::channel();
        self.register_requests.lock().insert(
            request_id,
            PendingRegister {
                reply: tx,
                endpoint,
            },
        );

        tracing::debug!(request_id, procedure, "sending REGISTER");
        if let Err(e) = self
            .send_message(Message::register(request_id, options, procedure))
            .await
        {
            self.register_requests.lock().remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WampError::Transport(TransportError::Closed)),
        }
    }

    /// Withdraw a registration.
    pub async fn unregister(&self, registration: Registration) -> Result<(), WampError> {
        self.require_joined()?;
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.unregister_requests.lock().insert(
            request_id,
            PendingUnregister {
                reply: tx,
                registration_id: registration.id,
            },
        );

        tracing::debug!(request_id, registration_id = registration.id, "sending UNREGISTER");
        if let Err(e) = self
            .send_message(Message::unregister(request_id, registration.id))
            .await
        {
            self.unregister_requests.lock().remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WampError::Transport(TransportError::Closed)),
        }
    }

    /// Resolves when the session is closed, by either peer, a protocol
    /// violation, or transport loss. Returns the close reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "session dropped".into();
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound processing
    // ------------------------------------------------------------------

    async fn dispatch(&self, message: Message) -> Result<(), WampError> {
        let code = message.code()?;
        tracing::trace!(?code, fields = message.len(), "inbound message");
        match code {
            MsgCode::Welcome => self.process_welcome(message),
            MsgCode::Abort => self.process_abort(message),
            MsgCode::Challenge => self.process_challenge(message),
            MsgCode::Goodbye => self.process_goodbye(message).await,
            MsgCode::Error => self.process_error(message),
            MsgCode::Result => self.process_call_result(message),
            MsgCode::Subscribed => self.process_subscribed(message),
            MsgCode::Unsubscribed => self.process_unsubscribed(message),
            MsgCode::Event => self.process_event(message),
            MsgCode::Registered => self.process_registered(message),
            MsgCode::Unregistered => self.process_unregistered(message),
            MsgCode::Invocation => self.process_invocation(message),
            other => Err(ProtocolError::UnexpectedMessage {
                code: other,
                state: "client session",
            }
            .into()),
        }
    }

    fn process_welcome(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(3)?;
        let session_id = message.id_at(1)?;
        let _details = message.dict_at(2)?;

        {
            let mut state = self.state.lock();
            if *state != SessionState::Joining {
                return Err(ProtocolError::UnexpectedMessage {
                    code: MsgCode::Welcome,
                    state: "not joining",
                }
                .into());
            }
            *state = SessionState::Joined;
        }
        *self.session_id.lock() = Some(session_id);
        if let Some(reply) = self.join_reply.lock().take() {
            let _ = reply.send(Ok(session_id));
        }
        tracing::debug!(session_id, "joined realm");
        Ok(())
    }

    fn process_abort(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(3)?;
        let _details = message.dict_at(1)?;
        let reason = message.str_at(2)?.to_owned();

        {
            let mut state = self.state.lock();
            if *state != SessionState::Joining {
                return Err(ProtocolError::UnexpectedMessage {
                    code: MsgCode::Abort,
                    state: "not joining",
                }
                .into());
            }
            *state = SessionState::Attached;
        }
        tracing::debug!(reason = %reason, "join aborted by router");
        if let Some(reply) = self.join_reply.lock().take() {
            let _ = reply.send(Err(ApplicationError::new(reason).into()));
        }
        Ok(())
    }

    fn process_challenge(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(3)?;
        let method = message.str_at(1)?.to_owned();
        let extra = message.dict_at(2)?;
        if *self.state.lock() != SessionState::Joining {
            return Err(ProtocolError::UnexpectedMessage {
                code: MsgCode::Challenge,
                state: "not joining",
            }
            .into());
        }
        let challenge = Challenge::from_extra(&method, extra);

        let future = match self.challenge_handler.lock().as_ref() {
            Some(handler) => handler(challenge),
            None => {
                // The router is now waiting for an AUTHENTICATE we cannot
                // produce; give up on the whole connection.
                tracing::error!(%method, "CHALLENGE received but no challenge handler is set");
                self.fail_join_state();
                if let Some(reply) = self.join_reply.lock().take() {
                    let _ = reply.send(Err(WampError::InvalidState("no challenge handler set")));
                }
                let session = self.me.upgrade();
                tokio::spawn(async move {
                    if let Some(session) = session {
                        session.abort("wamp.error.cannot_authenticate").await;
                    }
                });
                return Ok(());
            }
        };

        let Some(session) = self.me.upgrade() else {
            return Ok(());
        };
        tracing::debug!(%method, "answering CHALLENGE");
        tokio::spawn(async move {
            match future.await {
                Ok(response) => {
                    let msg = Message::authenticate(&response.signature, response.extra);
                    if let Err(e) = session.send_message(msg).await {
                        tracing::warn!(error = %e, "failed to send AUTHENTICATE");
                        session.fail_join_state();
                        if let Some(reply) = session.join_reply.lock().take() {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "challenge handler failed");
                    session.fail_join_state();
                    if let Some(reply) = session.join_reply.lock().take() {
                        let _ = reply.send(Err(e));
                    }
                    session.abort("wamp.error.cannot_authenticate").await;
                }
            }
        });
        Ok(())
    }

    async fn process_goodbye(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(3)?;
        let _details = message.dict_at(1)?;
        let reason = message.str_at(2)?.to_owned();

        let was_leaving = {
            let mut state = self.state.lock();
            match *state {
                SessionState::Leaving => {
                    *state = SessionState::Attached;
                    true
                }
                SessionState::Joined => {
                    *state = SessionState::Attached;
                    false
                }
                _ => {
                    return Err(ProtocolError::UnexpectedMessage {
                        code: MsgCode::Goodbye,
                        state: "not joined",
                    }
                    .into());
                }
            }
        };
        *self.session_id.lock() = None;

        if was_leaving {
            tracing::debug!(reason = %reason, "leave acknowledged");
            if let Some(reply) = self.leave_reply.lock().take() {
                let _ = reply.send(Ok(reason));
            }
            return Ok(());
        }

        // Peer-initiated close: acknowledge, fail whatever is in flight.
        tracing::debug!(reason = %reason, "peer closed the session");
        self.fail_all_pending(|| WampError::Aborted {
            reason: reason.clone(),
        });
        self.clear_tables();
        self.signal_closed(&reason);
        self.send_message(Message::goodbye(Dict::new(), GOODBYE_AND_OUT))
            .await
    }

    fn process_error(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(7)?;
        let request_type = message.id_at(1)?;
        let request_id = message.id_at(2)?;
        let _details = message.dict_at(3)?;
        let error = ApplicationError {
            uri: message.str_at(4)?.to_owned(),
            args: message.args_at(5)?,
            kwargs: message.kwargs_at(6)?,
        };

        match MsgCode::from_u64(request_type) {
            Some(MsgCode::Call) => {
                // Late errors for abandoned calls drop like late results.
                if let Some(pending) = self.calls.lock().remove(&request_id) {
                    let _ = pending.reply.send(Err(error.into()));
                } else {
                    tracing::debug!(request_id, "ERROR for unknown call, dropping");
                }
                Ok(())
            }
            Some(MsgCode::Subscribe) => {
                let pending = self
                    .subscribe_requests
                    .lock()
                    .remove(&request_id)
                    .ok_or(ProtocolError::UnknownRequest {
                        code: MsgCode::Error,
                        request_id,
                    })?;
                let _ = pending.reply.send(Err(error.into()));
                Ok(())
            }
            Some(MsgCode::Unsubscribe) => {
                let pending = self
                    .unsubscribe_requests
                    .lock()
                    .remove(&request_id)
                    .ok_or(ProtocolError::UnknownRequest {
                        code: MsgCode::Error,
                        request_id,
                    })?;
                let _ = pending.reply.send(Err(error.into()));
                Ok(())
            }
            Some(MsgCode::Register) => {
                let pending = self
                    .register_requests
                    .lock()
                    .remove(&request_id)
                    .ok_or(ProtocolError::UnknownRequest {
                        code: MsgCode::Error,
                        request_id,
                    })?;
                let _ = pending.reply.send(Err(error.into()));
                Ok(())
            }
            Some(MsgCode::Unregister) => {
                let pending = self
                    .unregister_requests
                    .lock()
                    .remove(&request_id)
                    .ok_or(ProtocolError::UnknownRequest {
                        code: MsgCode::Error,
                        request_id,
                    })?;
                let _ = pending.reply.send(Err(error.into()));
                Ok(())
            }
            _ => Err(ProtocolError::UnknownMessageCode(request_type).into()),
        }
    }

    fn process_call_result(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(5)?;
        let request_id = message.id_at(1)?;
        let details = message.dict_at(2)?.clone();
        let args = message.args_at(3)?;
        let kwargs = message.kwargs_at(4)?;

        if let Some(pending) = self.calls.lock().remove(&request_id) {
            let _ = pending.reply.send(Ok(CallResult {
                details,
                args,
                kwargs,
            }));
        } else {
            tracing::debug!(request_id, "RESULT for unknown call, dropping");
        }
        Ok(())
    }

    fn process_subscribed(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(3)?;
        let request_id = message.id_at(1)?;
        let subscription_id = message.id_at(2)?;

        let pending = self
            .subscribe_requests
            .lock()
            .remove(&request_id)
            .ok_or(ProtocolError::UnknownRequest {
                code: MsgCode::Subscribed,
                request_id,
            })?;

        let token = self.next_handler_token.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .entry(subscription_id)
            .or_default()
            .push((token, pending.handler));

        tracing::debug!(request_id, subscription_id, "subscribed");
        let _ = pending.reply.send(Ok(Subscription {
            id: subscription_id,
            token,
        }));
        Ok(())
    }

    fn process_unsubscribed(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(2)?;
        let request_id = message.id_at(1)?;

        let pending = self
            .unsubscribe_requests
            .lock()
            .remove(&request_id)
            .ok_or(ProtocolError::UnknownRequest {
                code: MsgCode::Unsubscribed,
                request_id,
            })?;

        {
            let mut subscriptions = self.subscriptions.lock();
            if let Some(handlers) = subscriptions.get_mut(&pending.subscription.id) {
                handlers.retain(|(token, _)| *token != pending.subscription.token);
                if handlers.is_empty() {
                    subscriptions.remove(&pending.subscription.id);
                }
            }
        }

        tracing::debug!(request_id, subscription_id = pending.subscription.id, "unsubscribed");
        let _ = pending.reply.send(Ok(()));
        Ok(())
    }

    fn process_event(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(6)?;
        let subscription_id = message.id_at(1)?;
        let publication_id = message.id_at(2)?;
        let details = message.dict_at(3)?.clone();
        let args = message.args_at(4)?;
        let kwargs = message.kwargs_at(5)?;

        let handlers: Vec<EventHandler> = self
            .subscriptions
            .lock()
            .get(&subscription_id)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(subscription_id, "EVENT for unknown subscription, dropping");
            return Ok(());
        }

        let event = Event {
            subscription_id,
            publication_id,
            details,
            args,
            kwargs,
        };
        for handler in handlers {
            handler(&event);
        }
        Ok(())
    }

    fn process_registered(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(3)?;
        let request_id = message.id_at(1)?;
        let registration_id = message.id_at(2)?;

        let pending = self
            .register_requests
            .lock()
            .remove(&request_id)
            .ok_or(ProtocolError::UnknownRequest {
                code: MsgCode::Registered,
                request_id,
            })?;

        self.procedures.lock().insert(registration_id, pending.endpoint);
        tracing::debug!(request_id, registration_id, "registered");
        let _ = pending.reply.send(Ok(Registration {
            id: registration_id,
        }));
        Ok(())
    }

    fn process_unregistered(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(2)?;
        let request_id = message.id_at(1)?;

        let pending = self
            .unregister_requests
            .lock()
            .remove(&request_id)
            .ok_or(ProtocolError::UnknownRequest {
                code: MsgCode::Unregistered,
                request_id,
            })?;

        self.procedures.lock().remove(&pending.registration_id);
        tracing::debug!(request_id, registration_id = pending.registration_id, "unregistered");
        let _ = pending.reply.send(Ok(()));
        Ok(())
    }

    fn process_invocation(&self, message: Message) -> Result<(), WampError> {
        message.check_max_len(6)?;
        let request_id = message.id_at(1)?;
        let registration_id = message.id_at(2)?;
        let details = message.dict_at(3)?.clone();
        let args = message.args_at(4)?;
        let kwargs = message.kwargs_at(5)?;

        let endpoint = self
            .procedures
            .lock()
            .get(&registration_id)
            .cloned()
            .ok_or(ProtocolError::UnknownRegistration(registration_id))?;

        let Some(session) = self.me.upgrade() else {
            return Ok(());
        };
        let invocation = Invocation {
            request_id,
            registration_id,
            details,
            args,
            kwargs,
        };

        tracing::debug!(request_id, registration_id, "dispatching invocation");
        tokio::spawn(async move {
            // A panicking endpoint must not leave the caller hanging.
            let outcome = AssertUnwindSafe(endpoint(invocation)).catch_unwind().await;
            let reply = match outcome {
                Ok(Ok(result)) => {
                    let (args, kwargs) = result.into_payloads();
                    Message::yield_(request_id, Dict::new(), args, kwargs)
                }
                Ok(Err(error)) => Message::invocation_error(
                    request_id,
                    Dict::new(),
                    &error.uri,
                    error.args,
                    error.kwargs,
                ),
                Err(panic) => Message::invocation_error(
                    request_id,
                    Dict::new(),
                    RUNTIME_ERROR,
                    vec![Value::String(panic_message(&panic))],
                    Dict::new(),
                ),
            };
            if let Err(e) = session.send_message(reply).await {
                tracing::warn!(request_id, error = %e, "failed to send invocation reply");
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn require_joined(&self) -> Result<(), WampError> {
        if *self.state.lock() == SessionState::Joined {
            Ok(())
        } else {
            Err(WampError::NoSession)
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), WampError> {
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or(WampError::InvalidState("no transport attached"))?;
        transport.send(message).await.map_err(WampError::from)
    }

    /// Fatal teardown: fail everything outstanding and drop the transport.
    async fn abort(&self, reason: &str) {
        self.fail_all_pending(|| WampError::Aborted {
            reason: reason.to_owned(),
        });
        self.clear_tables();
        *self.session_id.lock() = None;
        self.signal_closed(reason);
        let transport = self.transport.lock().clone();
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                tracing::debug!(error = %e, "disconnect after abort failed");
            }
        }
    }

    fn fail_join_state(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Joining {
            *state = SessionState::Attached;
        }
    }

    fn fail_all_pending(&self, make_error: impl Fn() -> WampError) {
        if let Some(reply) = self.join_reply.lock().take() {
            let _ = reply.send(Err(make_error()));
        }
        if let Some(reply) = self.leave_reply.lock().take() {
            let _ = reply.send(Err(make_error()));
        }
        for (_, pending) in self.calls.lock().drain() {
            let _ = pending.reply.send(Err(make_error()));
        }
        for (_, pending) in self.subscribe_requests.lock().drain() {
            let _ = pending.reply.send(Err(make_error()));
        }
        for (_, pending) in self.unsubscribe_requests.lock().drain() {
            let _ = pending.reply.send(Err(make_error()));
        }
        for (_, pending) in self.register_requests.lock().drain() {
            let _ = pending.reply.send(Err(make_error()));
        }
        for (_, pending) in self.unregister_requests.lock().drain() {
            let _ = pending.reply.send(Err(make_error()));
        }
    }

    fn clear_tables(&self) {
        self.subscriptions.lock().clear();
        self.procedures.lock().clear();
    }

    fn signal_closed(&self, reason: &str) {
        self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_owned());
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl TransportHandler for Session {
    async fn on_attach(&self, transport: Arc<dyn Transport>) {
        tracing::debug!("transport attached");
        *self.transport.lock() = Some(transport);
        let mut state = self.state.lock();
        if *state == SessionState::Unattached {
            *state = SessionState::Attached;
        }
    }

    async fn on_message(&self, message: Message) -> Result<(), WampError> {
        match self.dispatch(message).await {
            Ok(()) => Ok(()),
            Err(WampError::Protocol(violation)) => {
                tracing::error!(%violation, "protocol violation, aborting session");
                self.abort(PROTOCOL_VIOLATION).await;
                Err(WampError::Protocol(violation))
            }
            Err(other) => Err(other),
        }
    }

    async fn on_detach(&self, was_clean: bool, reason: &str) {
        tracing::debug!(was_clean, reason, "transport detached");
        {
            let mut state = self.state.lock();
            if *state == SessionState::Detached {
                return;
            }
            *state = SessionState::Detached;
        }
        *self.transport.lock() = None;
        *self.session_id.lock() = None;
        self.fail_all_pending(|| WampError::Transport(TransportError::Closed));
        self.clear_tables();
        self.signal_closed(reason);
    }
}

/// The roles (and no features) this client announces in HELLO.
fn client_roles() -> Value {
    let mut roles = Dict::new();
    for role in ["caller", "callee", "publisher", "subscriber"] {
        roles.insert(role.into(), Value::Map(Dict::new()));
    }
    Value::Map(roles)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("endpoint panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("endpoint panicked: {s}")
    } else {
        "endpoint panicked".to_string()
    }
}
