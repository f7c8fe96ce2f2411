//! The connection core: handle registry, public operations, and the tick &
//! callback engine.
//!
//! Locking discipline: the module-wide `RwLock` over the registry is always
//! taken before any per-connection mutex, and every callback is delivered
//! after both are released. The discipline is what makes the API re-entrant:
//! a handler may call straight back into the [`Core`] it was invoked from.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpStream;
use mio::unix::UnixReady;
use mio::{Poll, Ready, Token};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use uuid::Uuid;

use crate::broker_prot;
use crate::error::{Error, Result};
use crate::message::{
    ClientConnect, ConnHandle, ConnectFailedInfo, ConnectedInfo, DisconnectEvent,
    DisconnectReason, DisconnectedInfo, RdmnetMessage,
};
use crate::poll as poll_thread;

mod connection;

use self::connection::{Connection, Event, State};
pub use self::connection::{HEARTBEAT_SEND_INTERVAL, HEARTBEAT_TIMEOUT};

/// Default receive scratch buffer size, sized to the expected path MTU.
pub const DEFAULT_RECV_BUF_SIZE: usize = 1220;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const TICK_SLEEP_STEP: Duration = Duration::from_millis(100);

/// Receiver of the asynchronous connection callbacks.
///
/// All methods have empty default bodies, so an implementation only provides
/// the ones it cares about. Callbacks are invoked from the core's internal
/// threads with no core lock held; implementations may call back into the
/// [`Core`] freely.
pub trait ConnectionHandler: Send + Sync {
    /// The RDMnet handshake completed and the connection entered the
    /// heartbeat stage.
    fn on_connected(&self, handle: ConnHandle, info: ConnectedInfo) {
        let _ = (handle, info);
    }

    /// A connection attempt failed at the socket, TCP or RDMnet level. The
    /// core backs off and the caller may connect again.
    fn on_connect_failed(&self, handle: ConnHandle, info: ConnectFailedInfo) {
        let _ = (handle, info);
    }

    /// An established connection was lost.
    fn on_disconnected(&self, handle: ConnHandle, info: DisconnectedInfo) {
        let _ = (handle, info);
    }

    /// A non-protocol message arrived. Messages are delivered in wire order
    /// per connection, and never before `on_connected` for the same attempt.
    fn on_message(&self, handle: ConnHandle, message: RdmnetMessage) {
        let _ = (handle, message);
    }
}

/// Configuration captured when a connection handle is created.
pub struct ConnectionConfig {
    /// Component identifier of the local endpoint, sent in every root-layer
    /// PDU.
    pub local_cid: Uuid,
    pub handler: Arc<dyn ConnectionHandler>,
}

/// Construction-time configuration for a [`Core`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Upper bound on simultaneously live connections. `None` leaves the
    /// bound to the allocator; `Some(n)` makes `connection_create` return
    /// [`Error::NoMem`] at capacity.
    pub max_connections: Option<usize>,
    /// Size of the socket receive scratch buffer.
    pub recv_buf_size: usize,
    /// Run the internal ~1 s tick thread. When disabled the host must call
    /// [`Core::tick`] periodically itself.
    pub tick_thread: bool,
    /// Permit [`Core::attach_existing_socket`].
    pub allow_external_sockets: bool,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            max_connections: None,
            recv_buf_size: DEFAULT_RECV_BUF_SIZE,
            tick_thread: true,
            allow_external_sockets: true,
        }
    }
}

/// The RDMnet connection core.
///
/// Owns every client↔broker connection, the readiness poller and the
/// periodic tick. All module state lives inside; creating two `Core`s gives
/// two fully independent connection modules.
pub struct Core {
    inner: Arc<Inner>,
    poll_handle: Option<JoinHandle<()>>,
    tick_handle: Option<JoinHandle<()>>,
}

impl Core {
    pub fn new(config: CoreConfig) -> Result<Core> {
        let poll = Poll::new()?;
        let inner = Arc::new(Inner {
            registry: RwLock::new(Registry {
                conns: BTreeMap::new(),
                next: 0,
            }),
            poll,
            config,
            running: AtomicBool::new(true),
        });

        let poll_handle = poll_thread::spawn(inner.clone())?;
        let tick_handle = if inner.config.tick_thread {
            match spawn_tick_thread(inner.clone()) {
                Ok(handle) => Some(handle),
                Err(error) => {
                    inner.running.store(false, Ordering::Release);
                    let _ = poll_handle.join();
                    return Err(error.into());
                }
            }
        } else {
            None
        };

        Ok(Core {
            inner,
            poll_handle: Some(poll_handle),
            tick_handle,
        })
    }

    /// Allocates a new connection handle. Use [`Core::connect`] to start the
    /// connection process.
    pub fn connection_create(&self, config: ConnectionConfig) -> Result<ConnHandle> {
        self.inner.connection_create(config)
    }

    /// Connects to a broker. Stores the remote address and the ClientConnect
    /// payload and begins a non-blocking connection attempt driven by the
    /// tick; progress is reported through the connection's handler. If a
    /// previous attempt was rejected at the RDMnet level, the attempt first
    /// waits out the standard backoff.
    pub fn connect(
        &self,
        handle: ConnHandle,
        remote_addr: SocketAddr,
        connect_data: ClientConnect,
    ) -> Result<()> {
        if connect_data.scope.len() >= broker_prot::SCOPE_PADDED_LENGTH
            || connect_data.search_domain.len() >= broker_prot::DOMAIN_PADDED_LENGTH
        {
            return Err(Error::Invalid);
        }
        self.inner.with_conn(handle, |conn| {
            if conn.state != State::NotStarted {
                return Err(Error::IsConn);
            }
            conn.remote_addr = Some(remote_addr);
            conn.conn_data = Some(connect_data);
            conn.state = State::ConnectPending;
            Ok(())
        })
    }

    /// Sets whether [`Core::send`] may block waiting for socket buffer
    /// space. Refused while a connection attempt is in progress.
    pub fn set_blocking(&self, handle: ConnHandle, blocking: bool) -> Result<()> {
        self.inner.with_conn(handle, |conn| match conn.state {
            State::NotStarted | State::Heartbeat => {
                conn.is_blocking = blocking;
                Ok(())
            }
            _ => Err(Error::Busy),
        })
    }

    /// ADVANCED: adopts an already-connected stream socket, jumping straight
    /// to the heartbeat stage. Used by brokers for accepted sockets; the
    /// caller keeps ownership of the descriptor, which is left open when the
    /// connection resets or is destroyed.
    pub fn attach_existing_socket(
        &self,
        handle: ConnHandle,
        stream: std::net::TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        if !self.inner.config.allow_external_sockets {
            return Err(Error::NotImpl);
        }
        self.inner.with_conn(handle, move |conn| {
            if conn.state != State::NotStarted {
                return Err(Error::IsConn);
            }
            stream.set_nonblocking(true)?;
            let stream = TcpStream::from_stream(stream)?;
            conn.attach(&self.inner.poll, stream, remote_addr)
        })
    }

    /// Sends data on a connected handle. Returns the number of bytes
    /// written.
    pub fn send(&self, handle: ConnHandle, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::Invalid);
        }
        self.inner.with_conn(handle, |conn| conn.send(data))
    }

    /// Starts an atomic multi-part send. The returned writer holds the
    /// connection's mutex, so no other thread (the heartbeat sender
    /// included) can interleave bytes into the framed message until the
    /// writer is dropped.
    pub fn start_message(&self, handle: ConnHandle) -> Result<MessageWriter> {
        self.inner.start_message(handle)
    }

    /// Marks a connection for destruction; the next tick reaps it. If the
    /// connection is healthy and a reason is given, an RDMnet Disconnect
    /// message is sent first. Destruction is terminal: the handle is never
    /// reused, and at most one already-collected callback may still be
    /// delivered for it.
    pub fn destroy(&self, handle: ConnHandle, disconnect_reason: Option<DisconnectReason>) -> Result<()> {
        self.inner.with_conn(handle, |conn| {
            if conn.state == State::Heartbeat {
                if let Some(reason) = disconnect_reason {
                    if let Err(error) = conn.send_disconnect(reason) {
                        debug!("{:?}: disconnect send failed: {}", conn, error);
                    }
                }
            }
            conn.state = State::MarkedForDestruction;
            Ok(())
        })
    }

    /// Runs one pass of periodic processing: reaps destroyed connections,
    /// advances timers and delivers the resulting callbacks. Called
    /// automatically when the tick thread is enabled.
    pub fn tick(&self) {
        self.inner.tick()
    }

    /// Stops the internal threads and tears down every connection. No
    /// callbacks are delivered; afterwards all operations return
    /// [`Error::NotInit`].
    pub fn shutdown(&mut self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tick_handle.take() {
            let _ = handle.join();
        }

        let mut registry = self.inner.registry.write();
        let conns = std::mem::take(&mut registry.conns);
        for (_, conn) in conns {
            conn.lock().release_socket(&self.inner.poll);
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Guard for an atomic multi-part send, created by [`Core::start_message`].
///
/// Dropping the writer ends the atomic section.
pub struct MessageWriter {
    handle: ConnHandle,
    guard: ArcMutexGuard<RawMutex, Connection>,
}

impl MessageWriter {
    /// Sends one piece of the framed message.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::Invalid);
        }
        self.guard.send(data)
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }
}

pub(crate) struct Registry {
    conns: BTreeMap<ConnHandle, Arc<Mutex<Connection>>>,
    next: i32,
}

impl Registry {
    /// Issues the next handle: monotonic, wrapping past `i32::MAX` to zero
    /// and linearly probing past any handle still live.
    fn issue_handle(&mut self) -> Option<ConnHandle> {
        for _ in 0..=self.conns.len() {
            let candidate = ConnHandle(self.next);
            self.next = if self.next == i32::MAX { 0 } else { self.next + 1 };
            if !self.conns.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

pub(crate) struct Inner {
    pub(crate) registry: RwLock<Registry>,
    pub(crate) poll: Poll,
    pub(crate) config: CoreConfig,
    pub(crate) running: AtomicBool,
}

impl Inner {
    fn check_running(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotInit)
        }
    }

    fn connection_create(&self, config: ConnectionConfig) -> Result<ConnHandle> {
        self.check_running()?;
        let mut registry = self.registry.write();
        if let Some(max) = self.config.max_connections {
            if registry.conns.len() >= max {
                return Err(Error::NoMem);
            }
        }
        let handle = registry.issue_handle().ok_or(Error::NoMem)?;
        let conn = Connection::new(handle, config);
        registry.conns.insert(handle, Arc::new(Mutex::new(conn)));
        debug!("created connection handle {}", handle);
        Ok(handle)
    }

    /// Looks up a connection and runs `f` with the module read lock and the
    /// connection mutex held. Handles marked for destruction read as absent.
    fn with_conn<F, R>(&self, handle: ConnHandle, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        self.check_running()?;
        let registry = self.registry.read();
        let conn = registry.conns.get(&handle).cloned().ok_or(Error::NotFound)?;
        let mut conn = conn.lock();
        if conn.state == State::MarkedForDestruction {
            return Err(Error::NotFound);
        }
        f(&mut conn)
    }

    fn start_message(&self, handle: ConnHandle) -> Result<MessageWriter> {
        self.check_running()?;
        let conn = {
            let registry = self.registry.read();
            registry.conns.get(&handle).cloned().ok_or(Error::NotFound)?
        };
        let guard = conn.lock_arc();
        match guard.state {
            State::Heartbeat => Ok(MessageWriter { handle, guard }),
            State::MarkedForDestruction => Err(Error::NotFound),
            _ => Err(Error::NotConn),
        }
    }

    /// One pass of the tick engine.
    pub(crate) fn tick(&self) {
        if self.running.load(Ordering::Acquire) {
            self.destroy_marked_connections();
            for (handle, handler, event) in self.process_all_connections() {
                deliver_event(handle, &*handler, event);
            }
        }
    }

    /// Sweeps the registry under the write lock and tears down every
    /// connection marked for destruction.
    fn destroy_marked_connections(&self) {
        let mut registry = self.registry.write();

        // Collected first; removing during iteration would invalidate it.
        let mut marked = Vec::new();
        for (handle, conn) in registry.conns.iter() {
            if conn.lock().state == State::MarkedForDestruction {
                marked.push(*handle);
            }
        }

        for handle in marked {
            if let Some(conn) = registry.conns.remove(&handle) {
                conn.lock().release_socket(&self.poll);
                debug!("destroyed connection handle {}", handle);
            }
        }
    }

    /// Walks every connection under the read lock, advancing timer-driven
    /// state. Heartbeat timeouts are limited to one callback per tick; they
    /// are not anticipated to come in bursts, and the rest simply wait for
    /// the next pass.
    fn process_all_connections(&self) -> Vec<(ConnHandle, Arc<dyn ConnectionHandler>, Event)> {
        let registry = self.registry.read();
        let mut callbacks = Vec::new();
        let mut hb_allowed = true;

        for (handle, conn) in registry.conns.iter() {
            let mut conn = conn.lock();
            if let Some(event) = conn.process_tick(&self.poll, hb_allowed) {
                if let Event::Disconnected(ref info) = event {
                    if info.event == DisconnectEvent::NoHeartbeat {
                        hb_allowed = false;
                    }
                }
                callbacks.push((*handle, conn.handler.clone(), event));
            }
        }
        callbacks
    }

    /// Entry point for the poll dispatcher: classifies one readiness event
    /// for the owning connection.
    pub(crate) fn socket_activity(&self, token: Token, readiness: Ready, scratch: &mut [u8]) {
        let handle = ConnHandle(token.0 as i32);
        let unix = UnixReady::from(readiness);

        if unix.is_error() {
            let error = self
                .with_conn(handle, |conn| Ok(conn.take_socket_error()))
                .unwrap_or_else(|_| io::Error::new(ErrorKind::Other, "socket error"));
            self.socket_error(handle, error);
        } else if readiness.is_readable() || unix.is_hup() {
            self.socket_readable(handle, scratch);
        } else if readiness.is_writable() {
            self.tcp_connection_established(handle);
        }
    }

    fn tcp_connection_established(&self, handle: ConnHandle) {
        let _ = self.with_conn(handle, |conn| {
            if conn.state == State::TcpConnPending {
                debug!("{:?}: TCP connection established", conn);
                conn.start_rdmnet_connection(&self.poll);
            }
            Ok(())
        });
    }

    fn socket_error(&self, handle: ConnHandle, error: io::Error) {
        let callback = self
            .with_conn(handle, |conn| {
                Ok(conn
                    .handle_socket_error(&self.poll, error)
                    .map(|event| (conn.handler.clone(), event)))
            })
            .ok()
            .flatten();
        if let Some((handler, event)) = callback {
            deliver_event(handle, &*handler, event);
        }
    }

    fn socket_readable(&self, handle: ConnHandle, scratch: &mut [u8]) {
        let read = self.with_conn(handle, |conn| conn.read_into(scratch));
        match read {
            Ok(0) => self.socket_error(
                handle,
                io::Error::new(ErrorKind::ConnectionReset, "connection closed by remote"),
            ),
            Ok(n) => self.socket_data_received(handle, &scratch[..n]),
            Err(Error::WouldBlock) => {}
            Err(Error::Io(error)) => self.socket_error(handle, error),
            Err(_) => {}
        }
    }

    /// Feeds freshly received bytes to the owning connection's frame buffer
    /// and drains whole messages out of it, delivering each resulting
    /// callback outside the locks before parsing the next message.
    fn socket_data_received(&self, handle: ConnHandle, data: &[u8]) {
        // The first pass hands over the fresh bytes; subsequent passes drain
        // what the frame buffer already holds.
        let mut fresh = Some(data);
        loop {
            let step = self.do_recv(handle, fresh.take().unwrap_or(&[]));
            match step {
                Ok(RecvOutcome::Message(callback)) => {
                    if let Some((handler, event)) = callback {
                        deliver_event(handle, &*handler, event);
                    }
                }
                Ok(RecvOutcome::NeedMore) => break,
                Err(Error::Protocol(reason)) => {
                    warn!("connection {}: framing error: {}", handle, reason);
                    self.socket_error(handle, io::Error::new(ErrorKind::InvalidData, reason));
                    break;
                }
                Err(_) => break,
            }
        }
    }

    fn do_recv(&self, handle: ConnHandle, data: &[u8]) -> Result<RecvOutcome> {
        self.with_conn(handle, |conn| match conn.state {
            State::RdmnetConnPending | State::Heartbeat => {
                conn.feed(data);
                match conn.drain()? {
                    Some(msg) => {
                        let event = if conn.state == State::RdmnetConnPending {
                            conn.handle_connect_result(&self.poll, msg)
                        } else {
                            conn.handle_message(&self.poll, msg)
                        };
                        Ok(RecvOutcome::Message(
                            event.map(|event| (conn.handler.clone(), event)),
                        ))
                    }
                    None => Ok(RecvOutcome::NeedMore),
                }
            }
            // Readable before the TCP connect completes should not happen;
            // tolerate it by buffering the bytes unparsed.
            State::TcpConnPending => {
                conn.feed(data);
                Ok(RecvOutcome::NeedMore)
            }
            _ => Err(Error::Invalid),
        })
    }
}

enum RecvOutcome {
    Message(Option<(Arc<dyn ConnectionHandler>, Event)>),
    NeedMore,
}

fn deliver_event(handle: ConnHandle, handler: &dyn ConnectionHandler, event: Event) {
    match event {
        Event::Connected(info) => handler.on_connected(handle, info),
        Event::ConnectFailed(info) => handler.on_connect_failed(handle, info),
        Event::Disconnected(info) => handler.on_disconnected(handle, info),
        Event::MessageReceived(message) => handler.on_message(handle, message),
    }
}

fn spawn_tick_thread(inner: Arc<Inner>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rdmnet-tick".to_owned())
        .spawn(move || {
            while inner.running.load(Ordering::Acquire) {
                inner.tick();
                // Sleep in short steps so shutdown stays prompt.
                let mut slept = Duration::ZERO;
                while slept < TICK_INTERVAL && inner.running.load(Ordering::Acquire) {
                    thread::sleep(TICK_SLEEP_STEP);
                    slept += TICK_SLEEP_STEP;
                }
            }
        })
}
