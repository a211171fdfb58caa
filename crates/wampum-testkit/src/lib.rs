//! wampum-testkit: deterministic in-memory plumbing for session tests.
//!
//! [`MemTransport`] implements the full transport contract over a pair of
//! channels; the other end is a [`RouterPeer`] that tests drive explicitly,
//! playing the router's half of the protocol one message at a time.
//!
//! ```ignore
//! let (session, mut peer) = joined_session().await;
//! let call = tokio::spawn({
//!     let session = session.clone();
//!     async move { session.call("com.example.add", args, Dict::new()).await }
//! });
//! let call_msg = peer.expect(MsgCode::Call).await;
//! peer.send(vec![/* RESULT ... */]);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use wampum_core::{
    Dict, FlowHandler, Message, MsgCode, Session, Transport, TransportError, TransportHandler,
    Value, WampError,
};

/// In-memory transport; the peer end is a [`RouterPeer`].
pub struct MemTransport {
    inner: Arc<MemInner>,
}

impl Clone for MemTransport {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct MemInner {
    to_peer: mpsc::UnboundedSender<Message>,
    from_peer: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    paused: AtomicBool,
    resume_notify: Notify,
    pause_handler: Mutex<Option<FlowHandler>>,
    resume_handler: Mutex<Option<FlowHandler>>,
}

impl MemTransport {
    /// A connected transport/peer pair.
    pub fn pair() -> (Self, RouterPeer) {
        let (to_peer, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, from_peer) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(MemInner {
                to_peer,
                from_peer: Mutex::new(Some(from_peer)),
                handler: Mutex::new(None),
                pump: Mutex::new(None),
                connected: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                resume_notify: Notify::new(),
                pause_handler: Mutex::new(None),
                resume_handler: Mutex::new(None),
            }),
        };
        (
            transport,
            RouterPeer {
                tx: Some(peer_tx),
                rx: peer_rx,
            },
        )
    }
}

impl MemInner {
    async fn teardown(&self, was_clean: bool, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_detach(was_clean, reason).await;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn run_pump(inner: Arc<MemInner>, mut rx: mpsc::UnboundedReceiver<Message>) {
    loop {
        let Some(message) = rx.recv().await else {
            inner.teardown(false, "peer closed").await;
            return;
        };

        loop {
            let resumed = inner.resume_notify.notified();
            if !inner.paused.load(Ordering::Acquire) {
                break;
            }
            resumed.await;
        }

        let Some(handler) = inner.handler.lock().clone() else {
            return;
        };
        if let Err(e) = handler.on_message(message).await {
            inner.teardown(false, &format!("handler error: {e}")).await;
            return;
        }
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let rx = self
            .inner
            .from_peer
            .lock()
            .take()
            .ok_or(TransportError::Closed)?;
        self.inner.connected.store(true, Ordering::Release);
        *self.inner.pump.lock() = Some(tokio::spawn(run_pump(self.inner.clone(), rx)));

        let handler = self.inner.handler.lock().clone();
        if let Some(handler) = handler {
            handler
                .on_attach(Arc::new(self.clone()) as Arc<dyn Transport>)
                .await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.teardown(true, "wamp.transport.disconnect").await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn attach(&self, handler: Arc<dyn TransportHandler>) {
        *self.inner.handler.lock() = Some(handler);
    }

    fn detach(&self) {
        *self.inner.handler.lock() = None;
    }

    fn has_handler(&self) -> bool {
        self.inner.handler.lock().is_some()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.inner
            .to_peer
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.resume_notify.notify_waiters();
    }

    fn set_pause_handler(&self, handler: FlowHandler) {
        *self.inner.pause_handler.lock() = Some(handler);
    }

    fn set_resume_handler(&self, handler: FlowHandler) {
        *self.inner.resume_handler.lock() = Some(handler);
    }
}

/// The router's end of a [`MemTransport::pair`]. Tests script it directly.
pub struct RouterPeer {
    tx: Option<mpsc::UnboundedSender<Message>>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl RouterPeer {
    /// The next message the client sent, if the transport is still up.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// The next message, asserting its code.
    ///
    /// # Panics
    ///
    /// Panics when the client hung up or sent a different message type.
    pub async fn expect(&mut self, code: MsgCode) -> Message {
        let message = self.rx.recv().await.expect("client closed the transport");
        let got = message.code().expect("client sent an invalid message");
        assert_eq!(got, code, "expected {code:?}, got {got:?}: {message:?}");
        message
    }

    /// Inject one router message into the client.
    pub fn send(&self, fields: Vec<Value>) {
        self.tx
            .as_ref()
            .expect("peer already hung up")
            .send(Message::from_fields(fields))
            .expect("client transport is gone");
    }

    /// Drop the connection, as a router crash would.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

/// A started session attached to a fresh [`MemTransport`] pair.
pub async fn started_session() -> (Arc<Session>, RouterPeer) {
    let (transport, peer) = MemTransport::pair();
    let session = Session::new();
    session
        .start(Arc::new(transport))
        .await
        .expect("mem transport connect cannot fail");
    (session, peer)
}

/// A session already joined to `realm1` with session id 1, with the
/// HELLO/WELCOME exchange replayed.
pub async fn joined_session() -> (Arc<Session>, RouterPeer) {
    let (session, mut peer) = started_session().await;
    let join = tokio::spawn({
        let session = session.clone();
        async move { session.join("realm1").await }
    });
    peer.expect(MsgCode::Hello).await;
    peer.send(vec![
        Value::Integer(MsgCode::Welcome as i64),
        Value::Integer(1),
        Value::Map(Dict::new()),
    ]);
    let session_id = join.await.expect("join task panicked").expect("join failed");
    assert_eq!(session_id, 1);
    (session, peer)
}

/// Convenience guard: asserts `err` is the `WampError` variant produced by
/// a torn-down session, to keep teardown tests readable.
pub fn is_teardown_error(err: &WampError) -> bool {
    matches!(
        err,
        WampError::Transport(TransportError::Closed) | WampError::Aborted { .. }
    )
}

/// Install a subscriber honoring `RUST_LOG` for a test run. Safe to call
/// from every test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
