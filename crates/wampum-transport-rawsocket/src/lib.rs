//! wampum-transport-rawsocket: length-prefixed framing over TCP or Unix
//! sockets.
//!
//! # Wire format
//!
//! One client-initiated handshake round trip precedes all traffic:
//!
//! - client: `[0x7F, (max_len_exponent << 4) | serializer, 0x00, 0x00]`
//! - server: a structurally identical frame echoing the serializer
//!
//! After that, each message is sent as:
//! - `u32 BE`: encoded message length
//! - `[u8; len]`: the encoded message
//!
//! # Characteristics
//!
//! - Strict two-phase read loop: header, then exactly `len` body bytes, with
//!   at most one outstanding read at a time
//! - A single writer task drains an internal queue, so messages are written
//!   whole and in submission order
//! - `pause`/`resume` gate handler dispatch without dropping buffered frames

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use wampum_core::{
    EncodeError, FlowHandler, HandshakeError, HandshakeReject, Message, Transport,
    TransportError, TransportHandler,
};

/// First octet of every handshake frame.
pub const MAGIC: u8 = 0x7f;

/// Serializer id carried in the handshake's low nibble.
pub const SERIALIZER_MSGPACK: u8 = 2;

/// Largest frame we accept by default: 2^(9+15) = 16 MiB.
pub const DEFAULT_MAX_LENGTH_EXPONENT: u8 = 15;

/// Outbound queue depth at which the peer-congestion pause handler fires.
const SEND_QUEUE_CAPACITY: usize = 64;

fn frame_limit(exponent: u8) -> usize {
    1usize << (9 + u32::from(exponent & 0x0f))
}

/// Dials the underlying byte stream. TCP and Unix-socket connectors are
/// provided; tests substitute in-memory streams.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> std::io::Result<Self::Stream>;
}

/// Connects a TCP stream to a `host:port` address.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    async fn connect(&self) -> std::io::Result<Self::Stream> {
        let stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Connects a Unix-domain stream socket.
#[cfg(unix)]
pub struct UnixConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    type Stream = tokio::net::UnixStream;

    async fn connect(&self) -> std::io::Result<Self::Stream> {
        tokio::net::UnixStream::connect(&self.path).await
    }
}

/// The RawSocket transport. Cheap to clone; all clones share one
/// connection.
pub struct RawSocketTransport<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for RawSocketTransport<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Conn {
    send_tx: mpsc::Sender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

struct Inner<C: Connector> {
    connector: C,
    max_len_exponent: u8,

    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    conn: Mutex<Option<Conn>>,
    connected: AtomicBool,

    /// Largest frame the peer told us it accepts.
    peer_frame_limit: AtomicUsize,

    paused: AtomicBool,
    resume_notify: Notify,

    pause_handler: Mutex<Option<FlowHandler>>,
    resume_handler: Mutex<Option<FlowHandler>>,
    congested: AtomicBool,
    queue_depth: AtomicUsize,
}

impl<C: Connector> RawSocketTransport<C> {
    pub fn new(connector: C) -> Self {
        Self::with_max_length_exponent(connector, DEFAULT_MAX_LENGTH_EXPONENT)
    }

    pub fn with_max_length_exponent(connector: C, max_len_exponent: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                max_len_exponent: max_len_exponent & 0x0f,
                handler: Mutex::new(None),
                conn: Mutex::new(None),
                connected: AtomicBool::new(false),
                peer_frame_limit: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                resume_notify: Notify::new(),
                pause_handler: Mutex::new(None),
                resume_handler: Mutex::new(None),
                congested: AtomicBool::new(false),
                queue_depth: AtomicUsize::new(0),
            }),
        }
    }
}

impl<C: Connector> Inner<C> {
    /// Close the connection exactly once and notify the handler.
    async fn teardown(&self, was_clean: bool, reason: &str) {
        let Some(conn) = self.conn.lock().take() else {
            return;
        };
        self.connected.store(false, Ordering::Release);
        tracing::debug!(was_clean, reason, "rawsocket teardown");
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_detach(was_clean, reason).await;
        }
        // Aborting the tasks drops the stream halves, which closes the
        // socket; `conn` was taken above so this runs at most once.
        conn.writer_task.abort();
        conn.reader_task.abort();
    }
}

async fn run_writer<C: Connector>(
    inner: Arc<Inner<C>>,
    mut writer: WriteHalf<C::Stream>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(frame) = rx.recv().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        inner.queue_depth.fetch_sub(1, Ordering::AcqRel);

        if let Err(e) = result {
            inner.teardown(false, &format!("write failed: {e}")).await;
            return;
        }

        if inner.queue_depth.load(Ordering::Acquire) == 0
            && inner.congested.swap(false, Ordering::AcqRel)
        {
            if let Some(resume) = inner.resume_handler.lock().as_ref() {
                resume();
            }
        }
    }
}

async fn run_reader<C: Connector>(
    inner: Arc<Inner<C>>,
    mut reader: ReadHalf<C::Stream>,
    frame_limit: usize,
) {
    let reason = loop {
        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "peer closed the connection".to_string();
            }
            Err(e) => break format!("read failed: {e}"),
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            break "zero-length frame".to_string();
        }
        if len > frame_limit {
            break format!("frame of {len} bytes exceeds limit of {frame_limit}");
        }

        let mut body = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut body).await {
            break format!("read failed: {e}");
        }

        let message = match Message::decode(&body) {
            Ok(message) => message,
            Err(e) => break format!("decode failed: {e}"),
        };

        // Receiver-side backpressure: hold dispatch (not the bytes already
        // buffered by the kernel) until resumed.
        loop {
            let resumed = inner.resume_notify.notified();
            if !inner.paused.load(Ordering::Acquire) {
                break;
            }
            resumed.await;
        }

        let Some(handler) = inner.handler.lock().clone() else {
            break "handler detached".to_string();
        };
        if let Err(e) = handler.on_message(message).await {
            break format!("handler error: {e}");
        }
    };
    inner.teardown(false, &reason).await;
}

#[async_trait]
impl<C: Connector> Transport for RawSocketTransport<C> {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.inner.connected.load(Ordering::Acquire) {
            return Err(TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "transport already connected",
            )));
        }

        let mut stream = self
            .inner
            .connector
            .connect()
            .await
            .map_err(TransportError::ConnectFailed)?;

        let request = [
            MAGIC,
            (self.inner.max_len_exponent << 4) | SERIALIZER_MSGPACK,
            0,
            0,
        ];
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        match stream.read_exact(&mut reply).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(HandshakeError::Truncated.into());
            }
            Err(e) => return Err(e.into()),
        }

        if reply[0] != MAGIC {
            return Err(HandshakeError::BadMagic(reply[0]).into());
        }
        if reply[2] != 0 || reply[3] != 0 {
            return Err(HandshakeError::NonZeroReserved.into());
        }
        let serializer = reply[1] & 0x0f;
        if serializer == 0 {
            let reject = HandshakeReject::from_code(reply[1] >> 4);
            return Err(HandshakeError::Rejected(reject).into());
        }
        if serializer != SERIALIZER_MSGPACK {
            return Err(HandshakeError::SerializerMismatch {
                requested: SERIALIZER_MSGPACK,
                offered: serializer,
            }
            .into());
        }

        self.inner
            .peer_frame_limit
            .store(frame_limit(reply[1] >> 4), Ordering::Release);

        let (read_half, write_half) = tokio::io::split(stream);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);

        let writer_task = tokio::spawn(run_writer(self.inner.clone(), write_half, send_rx));
        let reader_task = tokio::spawn(run_reader(
            self.inner.clone(),
            read_half,
            frame_limit(self.inner.max_len_exponent),
        ));

        *self.inner.conn.lock() = Some(Conn {
            send_tx,
            reader_task,
            writer_task,
        });
        self.inner.connected.store(true, Ordering::Release);
        tracing::debug!("rawsocket connected");

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

        let bytes = message.encode().map_err(TransportError::Encode)?;
        let limit = self.inner.peer_frame_limit.load(Ordering::Acquire);
        if bytes.len() > limit {
            return Err(TransportError::Encode(EncodeError::Failed(format!(
                "message of {} bytes exceeds peer limit of {limit}",
                bytes.len()
            ))));
        }

        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&bytes);

        let send_tx = self
            .inner
            .conn
            .lock()
            .as_ref()
            .map(|conn| conn.send_tx.clone())
            .ok_or(TransportError::Closed)?;

        let depth = self.inner.queue_depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth >= SEND_QUEUE_CAPACITY && !self.inner.congested.swap(true, Ordering::AcqRel) {
            tracing::debug!(depth, "outbound queue congested");
            if let Some(pause) = self.inner.pause_handler.lock().as_ref() {
                pause();
            }
        }

        if send_tx.send(frame).await.is_err() {
            self.inner.queue_depth.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Closed);
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use wampum_core::{Dict, WampError};

    /// Hands out a pre-built in-memory stream.
    struct DuplexConnector {
        stream: Mutex<Option<DuplexStream>>,
    }

    impl DuplexConnector {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream: Mutex::new(Some(stream)),
            }
        }
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> std::io::Result<Self::Stream> {
            self.stream.lock().take().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "stream already taken")
            })
        }
    }

    /// Collects dispatched messages and detach notifications.
    struct RecordingHandler {
        messages: mpsc::UnboundedSender<Message>,
        detached: mpsc::UnboundedSender<(bool, String)>,
    }

    impl RecordingHandler {
        fn new() -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<Message>,
            mpsc::UnboundedReceiver<(bool, String)>,
        ) {
            let (messages, messages_rx) = mpsc::unbounded_channel();
            let (detached, detached_rx) = mpsc::unbounded_channel();
            (Arc::new(Self { messages, detached }), messages_rx, detached_rx)
        }
    }

    #[async_trait]
    impl TransportHandler for RecordingHandler {
        async fn on_attach(&self, _transport: Arc<dyn Transport>) {}

        async fn on_message(&self, message: Message) -> Result<(), WampError> {
            let _ = self.messages.send(message);
            Ok(())
        }

        async fn on_detach(&self, was_clean: bool, reason: &str) {
            let _ = self.detached.send((was_clean, reason.to_owned()));
        }
    }

    /// Server side of the handshake: reads the request, echoes the reply.
    async fn accept_handshake(server: &mut DuplexStream, reply_second_octet: Option<u8>) -> [u8; 4] {
        let mut request = [0u8; 4];
        server.read_exact(&mut request).await.unwrap();
        let second = reply_second_octet.unwrap_or(request[1]);
        server.write_all(&[MAGIC, second, 0, 0]).await.unwrap();
        request
    }

    async fn read_frame(server: &mut DuplexStream) -> Message {
        let mut header = [0u8; 4];
        server.read_exact(&mut header).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
        server.read_exact(&mut body).await.unwrap();
        Message::decode(&body).unwrap()
    }

    async fn write_frame(server: &mut DuplexStream, message: &Message) {
        let bytes = message.encode().unwrap();
        server
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await
            .unwrap();
        server.write_all(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_and_frame_round_trip() {
        let (client, mut server) = tokio::io::duplex(65536);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));
        let (handler, mut messages, _detached) = RecordingHandler::new();
        transport.attach(handler);

        let server_task = tokio::spawn(async move {
            let request = accept_handshake(&mut server, None).await;
            assert_eq!(request[0], MAGIC);
            assert_eq!(request[1] & 0x0f, SERIALIZER_MSGPACK);
            assert_eq!(&request[2..], &[0, 0]);

            let hello = read_frame(&mut server).await;
            assert_eq!(hello.str_at(1).unwrap(), "realm1");

            write_frame(
                &mut server,
                &Message::from_fields(vec![2.into(), 123.into(), Dict::new().into()]),
            )
            .await;
            server
        });

        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport
            .send(Message::hello("realm1", Dict::new()))
            .await
            .unwrap();

        let welcome = messages.recv().await.unwrap();
        assert_eq!(welcome.id_at(1).unwrap(), 123);

        let _server = server_task.await.unwrap();
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn handshake_serializer_mismatch_fails_connect() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));

        let server_task = tokio::spawn(async move {
            // offer JSON (1) although msgpack (2) was requested
            accept_handshake(&mut server, Some((DEFAULT_MAX_LENGTH_EXPONENT << 4) | 1)).await;
            server
        });

        match transport.connect().await {
            Err(TransportError::Handshake(HandshakeError::SerializerMismatch {
                requested,
                offered,
            })) => {
                assert_eq!(requested, SERIALIZER_MSGPACK);
                assert_eq!(offered, 1);
            }
            other => panic!("expected serializer mismatch, got {other:?}"),
        }
        assert!(!transport.is_connected());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejection_carries_error_code() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));

        let server_task = tokio::spawn(async move {
            // serializer nibble zero: rejection, code 1 in the high nibble
            accept_handshake(&mut server, Some(0x10)).await;
            server
        });

        match transport.connect().await {
            Err(TransportError::Handshake(HandshakeError::Rejected(
                HandshakeReject::SerializerUnsupported,
            ))) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_bad_magic_fails_connect() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));

        let server_task = tokio::spawn(async move {
            let mut request = [0u8; 4];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(&[0x00, request[1], 0, 0]).await.unwrap();
            server
        });

        match transport.connect().await {
            Err(TransportError::Handshake(HandshakeError::BadMagic(0x00))) => {}
            other => panic!("expected bad magic, got {other:?}"),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_detaches_uncleanly() {
        let (client, mut server) = tokio::io::duplex(65536);
        // accept at most 2^9 = 512 bytes
        let transport =
            RawSocketTransport::with_max_length_exponent(DuplexConnector::new(client), 0);
        let (handler, _messages, mut detached) = RecordingHandler::new();
        transport.attach(handler);

        let server_task = tokio::spawn(async move {
            accept_handshake(&mut server, None).await;
            server.write_all(&1024u32.to_be_bytes()).await.unwrap();
            server.write_all(&[0u8; 1024]).await.unwrap();
            server
        });

        transport.connect().await.unwrap();
        let (was_clean, reason) = detached.recv().await.unwrap();
        assert!(!was_clean);
        assert!(reason.contains("exceeds limit"), "reason: {reason}");
        assert!(!transport.is_connected());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_detaches_uncleanly() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));
        let (handler, _messages, mut detached) = RecordingHandler::new();
        transport.attach(handler);

        let server_task = tokio::spawn(async move {
            accept_handshake(&mut server, None).await;
            drop(server);
        });

        transport.connect().await.unwrap();
        let (was_clean, _reason) = detached.recv().await.unwrap();
        assert!(!was_clean);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn pause_holds_dispatch_and_resume_preserves_order() {
        let (client, mut server) = tokio::io::duplex(65536);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));
        let (handler, mut messages, _detached) = RecordingHandler::new();
        transport.attach(handler);

        let server_task = tokio::spawn(async move {
            accept_handshake(&mut server, None).await;
            for i in 0..5i64 {
                write_frame(
                    &mut server,
                    &Message::from_fields(vec![36.into(), i.into()]),
                )
                .await;
            }
            server
        });

        transport.pause();
        transport.connect().await.unwrap();

        // frames arrive but must not be dispatched while paused
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(messages.try_recv().is_err());

        transport.resume();
        for expected in 0..5 {
            let message = messages.recv().await.unwrap();
            assert_eq!(message.id_at(1).unwrap(), expected);
        }

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn send_after_disconnect_is_closed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let transport = RawSocketTransport::new(DuplexConnector::new(client));

        let server_task = tokio::spawn(async move {
            accept_handshake(&mut server, None).await;
            server
        });

        transport.connect().await.unwrap();
        server_task.await.unwrap();
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap(); // idempotent

        match transport.send(Message::hello("realm", Dict::new())).await {
            Err(TransportError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
