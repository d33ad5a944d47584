//! One framed TCP session with a background reader and writer.
//!
//! ```text
//!            ┌──────────── Connection ─────────────┐
//!  send() ──►│ mpsc ──► writer task ──► socket     │
//!            │                                     │
//!  try_pop ◄─│ inbox ◄── reader task ◄── socket    │──► Waiter::notify
//!            └─────────────────────────────────────┘
//! ```
//!
//! The reader task is the only writer to the inbox; the owning control
//! task only pops. A terminal read or write error never crosses into
//! the caller's control flow: it becomes a [`ConnectionState::Closed`]
//! transition that later calls observe.
//!
//! A clean end of stream from the peer is a half-close. The state moves
//! to `Closed(PeerClosed)` so the control task knows nothing more will
//! arrive, but the writer keeps running and sends still go out until
//! [`Connection::close`] or a write error.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::EnvelopeCodec;
use crate::envelope::Envelope;
use crate::error::FramelinkError;
use crate::waiter::Waiter;

// ── Public types ─────────────────────────────────────────────────

/// How [`Connection::send`] hands the envelope to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    /// Resolve once the bytes are flushed to the socket.
    Blocking,
    /// Queue for the writer task and return immediately. Ordering
    /// with other sends on the same connection is kept.
    #[default]
    NonBlocking,
}

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outbound,
    Inbound,
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its write side cleanly. Sends still work until
    /// the peer resets the socket or the session is closed locally.
    PeerClosed,
    /// The peer sent malformed wire data.
    Framing(String),
    /// A socket read or write failed.
    Io(String),
    /// [`Connection::close`] was called or the connection was dropped.
    Local,
}

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed(CloseReason::PeerClosed) => write!(f, "closed by peer"),
            ConnectionState::Closed(CloseReason::Framing(e)) => write!(f, "closed: {e}"),
            ConnectionState::Closed(CloseReason::Io(e)) => write!(f, "closed: {e}"),
            ConnectionState::Closed(CloseReason::Local) => write!(f, "closed locally"),
        }
    }
}

/// Remote endpoint of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    ip: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for ConnectionInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

// ── Shared state ─────────────────────────────────────────────────

/// State touched by both the I/O tasks and the owning control task.
/// Locks are held only for a push, a pop or a state swap.
#[derive(Debug)]
struct Shared {
    inbox: Mutex<VecDeque<Envelope>>,
    state: Mutex<ConnectionState>,
    /// Cleared when the write side stops accepting envelopes.
    writable: AtomicBool,
    /// Wakes the writer task when the write side must stop.
    stop_writer: Notify,
    waiter: Option<Waiter>,
}

impl Shared {
    fn new(waiter: Option<Waiter>) -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            state: Mutex::new(ConnectionState::Open),
            writable: AtomicBool::new(true),
            stop_writer: Notify::new(),
            waiter,
        }
    }

    fn push(&self, envelope: Envelope) {
        lock(&self.inbox).push_back(envelope);
        self.wake();
    }

    fn pop(&self) -> Option<Envelope> {
        lock(&self.inbox).pop_front()
    }

    fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    fn is_closed(&self) -> bool {
        !lock(&self.state).is_open()
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Move to `Closed(reason)`. Only the first transition sticks, but
    /// any reason other than `PeerClosed` also stops the writer, even
    /// when the state was already closed by the peer.
    fn close(&self, reason: CloseReason) -> bool {
        let half_close = reason == CloseReason::PeerClosed;
        let changed = {
            let mut state = lock(&self.state);
            if state.is_open() {
                *state = ConnectionState::Closed(reason);
                true
            } else {
                false
            }
        };
        if !half_close && self.writable.swap(false, Ordering::AcqRel) {
            self.stop_writer.notify_one();
        }
        if changed {
            self.wake();
        }
        changed
    }

    fn wake(&self) {
        if let Some(waiter) = &self.waiter {
            waiter.notify();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic mid-update, so a poisoned lock
    // still holds consistent data.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outbound queue item; `done` is set for blocking sends.
struct Outbound {
    envelope: Envelope,
    done: Option<oneshot::Sender<Result<(), FramelinkError>>>,
}

/// Handles of the two I/O tasks, aborted when the connection goes away.
#[derive(Debug)]
struct IoTasks {
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl IoTasks {
    fn abort(&self) {
        self.reader.abort();
        if let Some(writer) = &self.writer {
            writer.abort();
        }
    }
}

impl Drop for IoTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

// ── Connection ───────────────────────────────────────────────────

/// A framed TCP session to one peer.
///
/// `X` is a caller-owned extension slot for per-peer state (ACK
/// tracking, timing statistics, ...), attached with
/// [`with_extension`](Self::with_extension).
#[derive(Debug)]
pub struct Connection<X = ()> {
    info: ConnectionInfo,
    role: Role,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Outbound>,
    tasks: IoTasks,
    ext: X,
}

impl Connection<()> {
    /// Open an outbound session (producer side).
    pub async fn connect(
        info: &ConnectionInfo,
        waiter: Option<Waiter>,
    ) -> Result<Self, FramelinkError> {
        let addr = info.to_string();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| FramelinkError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!("connected to {addr}");
        Self::from_stream(stream, Role::Outbound, waiter)
    }

    /// Bind `addr` and accept exactly one inbound session.
    pub async fn accept(addr: SocketAddr, waiter: Option<Waiter>) -> Result<Self, FramelinkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| FramelinkError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        info!("listening on {addr}");
        Self::accept_from(&listener, waiter).await
    }

    /// Accept the next inbound session on an existing listener.
    pub async fn accept_from(
        listener: &TcpListener,
        waiter: Option<Waiter>,
    ) -> Result<Self, FramelinkError> {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|source| FramelinkError::Connect {
                addr: listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "listener".into()),
                source,
            })?;
        info!("accepted connection from {peer}");
        Self::from_stream(stream, Role::Inbound, waiter)
    }

    /// Wrap an established stream and start its I/O tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream(
        stream: TcpStream,
        role: Role,
        waiter: Option<Waiter>,
    ) -> Result<Self, FramelinkError> {
        let peer = stream
            .peer_addr()
            .map_err(|source| FramelinkError::Connect {
                addr: "peer".into(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::new(waiter));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, EnvelopeCodec),
            Arc::clone(&shared),
            peer,
        ));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, EnvelopeCodec),
            rx,
            Arc::clone(&shared),
            peer,
        ));

        Ok(Self {
            info: ConnectionInfo::from(peer),
            role,
            shared,
            tx,
            tasks: IoTasks {
                reader,
                writer: Some(writer),
            },
            ext: (),
        })
    }
}

impl<X> Connection<X> {
    /// Attach per-peer state, replacing the current extension.
    pub fn with_extension<Y>(self, ext: Y) -> Connection<Y> {
        let Connection {
            info,
            role,
            shared,
            tx,
            tasks,
            ext: _,
        } = self;
        Connection {
            info,
            role,
            shared,
            tx,
            tasks,
            ext,
        }
    }

    pub fn ext(&self) -> &X {
        &self.ext
    }

    pub fn ext_mut(&mut self) -> &mut X {
        &mut self.ext
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// `true` once nothing more will be received.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// `true` while sends can still reach the socket. Stays `true`
    /// after a half-close by the peer.
    pub fn can_send(&self) -> bool {
        self.shared.is_writable()
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Send an envelope, consuming it.
    ///
    /// With [`SendMode::Blocking`] this resolves once the bytes are
    /// flushed; with [`SendMode::NonBlocking`] it returns as soon as the
    /// envelope is queued. Neither confirms delivery: that is what ACK
    /// envelopes are for.
    pub async fn send(&self, envelope: Envelope, mode: SendMode) -> Result<(), FramelinkError> {
        envelope.check_limits()?;
        if !self.shared.is_writable() {
            return Err(FramelinkError::ConnectionClosed);
        }
        match mode {
            SendMode::NonBlocking => {
                self.tx.send(Outbound {
                    envelope,
                    done: None,
                })?;
                Ok(())
            }
            SendMode::Blocking => {
                let (done_tx, done_rx) = oneshot::channel();
                self.tx.send(Outbound {
                    envelope,
                    done: Some(done_tx),
                })?;
                done_rx.await?
            }
        }
    }

    pub async fn send_image(
        &self,
        name: impl Into<String>,
        payload: impl Into<Bytes>,
        mode: SendMode,
    ) -> Result<(), FramelinkError> {
        self.send(Envelope::image(name, payload), mode).await
    }

    pub async fn send_ack(&self, name: impl Into<String>) -> Result<(), FramelinkError> {
        self.send(Envelope::ack(name), SendMode::NonBlocking).await
    }

    pub async fn send_display_now(&self, name: impl Into<String>) -> Result<(), FramelinkError> {
        self.send(Envelope::display_now(name), SendMode::NonBlocking)
            .await
    }

    pub async fn send_start_timer(&self) -> Result<(), FramelinkError> {
        self.send(Envelope::start_timer(), SendMode::NonBlocking)
            .await
    }

    // ── Receiving ────────────────────────────────────────────────

    /// Pop the oldest received envelope without waiting.
    pub fn try_pop_received(&self) -> Option<Envelope> {
        self.shared.pop()
    }

    /// Pop everything currently in the inbox, oldest first.
    pub fn drain_received(&self) -> Vec<Envelope> {
        lock(&self.shared.inbox).drain(..).collect()
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Close immediately. Queued and in-flight sends fail with
    /// [`FramelinkError::ConnectionClosed`].
    pub fn close(&self) {
        if self.shared.close(CloseReason::Local) {
            info!("closing connection to {}", self.info);
        }
        self.tasks.abort();
    }

    /// Flush every queued send, then close the write side.
    ///
    /// The reader keeps running so late ACKs still reach the inbox
    /// until the peer hangs up.
    pub async fn shutdown(&mut self) {
        let (tx, _) = mpsc::unbounded_channel();
        // Dropping the last sender lets the writer drain and exit.
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(writer) = self.tasks.writer.take() {
            let _ = writer.await;
        }
    }
}

// ── I/O tasks ────────────────────────────────────────────────────

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
    shared: Arc<Shared>,
    peer: SocketAddr,
) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(envelope)) => {
                debug!(%peer, kind = %envelope.kind(), name = envelope.name(), "received");
                shared.push(envelope);
            }
            Some(Err(e)) if e.is_framing() => {
                warn!(%peer, "malformed data, closing session: {e}");
                break CloseReason::Framing(e.to_string());
            }
            Some(Err(e)) => {
                warn!(%peer, "read error: {e}");
                break CloseReason::Io(e.to_string());
            }
            None => {
                info!(%peer, "peer closed the connection");
                break CloseReason::PeerClosed;
            }
        }
    };
    shared.close(reason);
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
    peer: SocketAddr,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = shared.stop_writer.notified() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        match writer.send(outbound.envelope).await {
            Ok(()) => {
                if let Some(done) = outbound.done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(%peer, "write error: {e}");
                let reason = CloseReason::Io(e.to_string());
                if let Some(done) = outbound.done {
                    let _ = done.send(Err(e));
                }
                shared.close(reason);
                break;
            }
        }
    }

    shared.writable.store(false, Ordering::Release);
    // Pending blocking senders observe the dropped `done` channels.
    rx.close();
    if let Err(e) = writer.close().await {
        debug!(%peer, "closing write half: {e}");
    }
}

// ── Tests ────────────────────────────────────────────────────────
