use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::IntoRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Poll, PollOpt, Ready, Token};
use net2::TcpBuilder;
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::broker_prot;
use crate::conn::{ConnectionConfig, ConnectionHandler};
use crate::error::{Error, Result};
use crate::message::{
    BrokerMessage, ClientConnect, ConnHandle, ConnectFailEvent, ConnectFailedInfo, ConnectedInfo,
    ConnectStatus, DisconnectEvent, DisconnectReason, DisconnectedInfo, MessageContents,
    RdmnetMessage,
};
use crate::msg_buf::MsgBuf;
use crate::util::{duration_to_ms, Timer};

/// Interval between Null heartbeats sent to the broker (E1.33).
pub const HEARTBEAT_SEND_INTERVAL: Duration = Duration::from_secs(5);
/// Time without any received PDU after which the connection is dead (E1.33).
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

// Wait applied between attempts when a blocking send hits a full buffer.
const BLOCKING_SEND_WAIT: Duration = Duration::from_millis(10);
// Internal protocol messages are tiny; retry briefly on a full buffer, then
// give up and let the heartbeat timeout catch a truly wedged socket.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(1);
const SEND_RETRY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    NotStarted,
    ConnectPending,
    Backoff,
    TcpConnPending,
    RdmnetConnPending,
    Heartbeat,
    MarkedForDestruction,
}

/// A callback queued by a state transition, delivered after all core locks
/// are released. At most one exists per connection at any instant.
pub(crate) enum Event {
    Connected(ConnectedInfo),
    ConnectFailed(ConnectFailedInfo),
    Disconnected(DisconnectedInfo),
    MessageReceived(RdmnetMessage),
}

/// State for a single client↔broker connection.
///
/// All fields are guarded by the owning `Arc<Mutex<..>>` in the registry;
/// methods taking `&mut self` are therefore only reachable with the
/// connection mutex held.
pub(crate) struct Connection {
    pub(crate) handle: ConnHandle,
    pub(crate) local_cid: Uuid,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) stream: Option<TcpStream>,
    registered: bool,
    pub(crate) external_socket: bool,
    pub(crate) is_blocking: bool,
    pub(crate) state: State,
    backoff: Backoff,
    backoff_timer: Timer,
    hb_timer: Timer,
    send_timer: Timer,
    recv_buf: MsgBuf,
    pub(crate) conn_data: Option<ClientConnect>,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
    rdmnet_conn_failed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Connection {{ handle: {}, state: {:?}, addr: {:?} }}",
            self.handle, self.state, self.remote_addr
        )
    }
}

impl Connection {
    pub(crate) fn new(handle: ConnHandle, config: ConnectionConfig) -> Connection {
        Connection {
            handle,
            local_cid: config.local_cid,
            remote_addr: None,
            stream: None,
            registered: false,
            external_socket: false,
            is_blocking: true,
            state: State::NotStarted,
            backoff: Backoff::new(),
            backoff_timer: Timer::new(Duration::ZERO),
            hb_timer: Timer::new(HEARTBEAT_TIMEOUT),
            send_timer: Timer::new(HEARTBEAT_SEND_INTERVAL),
            recv_buf: MsgBuf::new(),
            conn_data: None,
            handler: config.handler,
            rdmnet_conn_failed: false,
        }
    }

    fn token(&self) -> Token {
        Token(self.handle.raw() as usize)
    }

    /// Registers or re-registers the socket with the given interest.
    fn set_interest(&mut self, poll: &Poll, interest: Ready) -> io::Result<()> {
        let stream = match self.stream {
            Some(ref stream) => stream,
            None => return Ok(()),
        };
        if self.registered {
            poll.reregister(stream, self.token(), interest, PollOpt::level())
        } else {
            poll.register(stream, self.token(), interest, PollOpt::level())?;
            self.registered = true;
            Ok(())
        }
    }

    /// Opens a socket and starts a non-blocking connect to the stored remote
    /// address. Failure is reported through a ConnectFailed event, matching
    /// the asynchronous path.
    pub(crate) fn start_tcp_connection(&mut self, poll: &Poll) -> Option<Event> {
        self.rdmnet_conn_failed = false;
        let addr = match self.remote_addr {
            Some(addr) => addr,
            None => return None,
        };
        match self.open_stream(poll, &addr) {
            Ok(()) => None,
            Err(error) => {
                warn!("{:?}: failed to start TCP connection to {}: {}", self, addr, error);
                let info = ConnectFailedInfo {
                    event: ConnectFailEvent::SocketFailure,
                    socket_err: Some(error),
                    rdmnet_reason: None,
                };
                self.reset(poll);
                Some(Event::ConnectFailed(info))
            }
        }
    }

    fn open_stream(&mut self, poll: &Poll, addr: &SocketAddr) -> io::Result<()> {
        let builder = match *addr {
            SocketAddr::V4(..) => TcpBuilder::new_v4()?,
            SocketAddr::V6(..) => TcpBuilder::new_v6()?,
        };
        let stream = TcpStream::connect_stream(builder.to_tcp_stream()?, addr)?;
        let connected = stream.peer_addr().is_ok();
        self.stream = Some(stream);
        if connected {
            // Fast connect: already established, skip the pending state.
            self.start_rdmnet_connection(poll);
        } else {
            self.set_interest(poll, Ready::writable())?;
            self.state = State::TcpConnPending;
        }
        Ok(())
    }

    /// Begins the RDMnet handshake on an established TCP connection: send
    /// ClientConnect and arm both heartbeat timers.
    pub(crate) fn start_rdmnet_connection(&mut self, poll: &Poll) {
        trace!("{:?}: starting RDMnet handshake", self);
        self.state = State::RdmnetConnPending;
        if let Err(error) = self.set_interest(poll, Ready::readable()) {
            warn!("{:?}: failed to update poll registration: {}", self, error);
        }
        let msg = match self.conn_data {
            Some(ref conn_data) => Some(broker_prot::pack_client_connect(&self.local_cid, conn_data)),
            None => {
                warn!("{:?}: no ClientConnect payload stored", self);
                None
            }
        };
        if let Some(msg) = msg {
            if let Err(error) = self.send_all(&msg) {
                warn!("{:?}: failed to send ClientConnect: {}", self, error);
            }
        }
        self.hb_timer.start(HEARTBEAT_TIMEOUT);
        self.send_timer.start(HEARTBEAT_SEND_INTERVAL);
    }

    /// Adopts an already-connected socket owned by the caller and jumps
    /// straight to the Heartbeat state.
    pub(crate) fn attach(
        &mut self,
        poll: &Poll,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        poll.register(&stream, self.token(), Ready::readable(), PollOpt::level())?;
        self.stream = Some(stream);
        self.registered = true;
        self.remote_addr = Some(remote_addr);
        self.external_socket = true;
        self.state = State::Heartbeat;
        self.hb_timer.start(HEARTBEAT_TIMEOUT);
        self.send_timer.start(HEARTBEAT_SEND_INTERVAL);
        Ok(())
    }

    /// Advances timer-driven transitions from the periodic tick.
    ///
    /// `hb_allowed` caps heartbeat-timeout callbacks at one per tick; when
    /// false an expired heartbeat is left for a later tick.
    pub(crate) fn process_tick(&mut self, poll: &Poll, hb_allowed: bool) -> Option<Event> {
        match self.state {
            State::ConnectPending => {
                if self.rdmnet_conn_failed || !self.backoff_timer.interval().is_zero() {
                    if self.rdmnet_conn_failed {
                        let backoff = self.backoff.next_backoff();
                        debug!(
                            "{:?}: waiting {} ms before the next connection attempt",
                            self,
                            duration_to_ms(&backoff)
                        );
                        self.backoff_timer.start(backoff);
                    }
                    self.state = State::Backoff;
                    None
                } else {
                    self.start_tcp_connection(poll)
                }
            }
            State::Backoff => {
                if self.backoff_timer.is_expired() {
                    self.start_tcp_connection(poll)
                } else {
                    None
                }
            }
            State::Heartbeat => {
                if self.hb_timer.is_expired() {
                    if hb_allowed {
                        debug!("{:?}: heartbeat timeout", self);
                        let info = DisconnectedInfo {
                            event: DisconnectEvent::NoHeartbeat,
                            socket_err: None,
                            rdmnet_reason: None,
                        };
                        self.reset(poll);
                        Some(Event::Disconnected(info))
                    } else {
                        None
                    }
                } else if self.send_timer.is_expired() {
                    if let Err(error) = self.send_null() {
                        debug!("{:?}: heartbeat send failed: {}", self, error);
                    }
                    self.send_timer.reset();
                    None
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Handles a message received while the RDMnet handshake is pending.
    pub(crate) fn handle_connect_result(&mut self, poll: &Poll, msg: RdmnetMessage) -> Option<Event> {
        let bmsg = match msg.contents {
            MessageContents::Broker(bmsg) => bmsg,
            // Non-broker traffic before the handshake completes is dropped.
            _ => return None,
        };
        match bmsg {
            BrokerMessage::ConnectReply(reply) => {
                if reply.status == ConnectStatus::Ok {
                    debug!("{:?}: RDMnet connection established", self);
                    self.state = State::Heartbeat;
                    self.backoff.reset();
                    self.backoff_timer.start(Duration::ZERO);
                    self.remote_addr.map(|connected_addr| {
                        Event::Connected(ConnectedInfo {
                            broker_uid: reply.broker_uid,
                            client_uid: reply.client_uid,
                            connected_addr,
                        })
                    })
                } else {
                    debug!("{:?}: broker rejected connection: {:?}", self, reply.status);
                    let info = ConnectFailedInfo {
                        event: ConnectFailEvent::Rejected,
                        socket_err: None,
                        rdmnet_reason: Some(reply.status),
                    };
                    self.reset(poll);
                    self.rdmnet_conn_failed = true;
                    Some(Event::ConnectFailed(info))
                }
            }
            BrokerMessage::Redirect(new_addr) => {
                debug!("{:?}: redirected to {}", self, new_addr);
                self.remote_addr = Some(new_addr);
                self.retry(poll);
                None
            }
            _ => None,
        }
    }

    /// Handles a message received in the Heartbeat state. Every received PDU,
    /// NULL included, proves broker liveness.
    pub(crate) fn handle_message(&mut self, poll: &Poll, msg: RdmnetMessage) -> Option<Event> {
        self.hb_timer.reset();

        let RdmnetMessage { sender_cid, contents } = msg;
        match contents {
            MessageContents::Broker(BrokerMessage::Null)
            | MessageContents::Broker(BrokerMessage::ConnectReply(..)) => None,
            MessageContents::Broker(BrokerMessage::Disconnect(reason)) => {
                debug!("{:?}: broker disconnected: {:?}", self, reason);
                let info = DisconnectedInfo {
                    event: DisconnectEvent::GracefulRemoteInitiated,
                    socket_err: None,
                    rdmnet_reason: Some(reason),
                };
                self.reset(poll);
                Some(Event::Disconnected(info))
            }
            contents => Some(Event::MessageReceived(RdmnetMessage { sender_cid, contents })),
        }
    }

    /// Classifies a socket error according to the current state.
    pub(crate) fn handle_socket_error(&mut self, poll: &Poll, error: io::Error) -> Option<Event> {
        match self.state {
            State::ConnectPending | State::TcpConnPending | State::RdmnetConnPending => {
                warn!("{:?}: socket error during connect: {}", self, error);
                if self.state == State::RdmnetConnPending {
                    self.rdmnet_conn_failed = true;
                }
                let info = ConnectFailedInfo {
                    event: ConnectFailEvent::TcpLevel,
                    socket_err: Some(error),
                    rdmnet_reason: None,
                };
                self.reset(poll);
                Some(Event::ConnectFailed(info))
            }
            State::Heartbeat => {
                warn!("{:?}: socket error: {}", self, error);
                let info = DisconnectedInfo {
                    event: DisconnectEvent::AbruptClose,
                    socket_err: Some(error),
                    rdmnet_reason: None,
                };
                self.reset(poll);
                Some(Event::Disconnected(info))
            }
            _ => None,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.recv_buf.feed(data)
    }

    pub(crate) fn drain(&mut self) -> Result<Option<RdmnetMessage>> {
        self.recv_buf.drain()
    }

    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConn)?;
        stream.read(buf).map_err(Error::from)
    }

    pub(crate) fn take_socket_error(&mut self) -> io::Error {
        if let Some(ref stream) = self.stream {
            if let Ok(Some(error)) = stream.take_error() {
                return error;
            }
        }
        io::Error::new(ErrorKind::Other, "socket error")
    }

    /// Application-data send. Blocking connections wait for buffer space;
    /// non-blocking connections surface WouldBlock immediately.
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.state != State::Heartbeat {
            return Err(Error::NotConn);
        }
        let blocking = self.is_blocking;
        let stream = self.stream.as_mut().ok_or(Error::Sys)?;
        if blocking {
            let mut written = 0;
            while written < data.len() {
                match stream.write(&data[written..]) {
                    Ok(0) => {
                        return Err(Error::Io(io::Error::new(ErrorKind::WriteZero, "socket closed")))
                    }
                    Ok(n) => written += n,
                    Err(ref error) if error.kind() == ErrorKind::Interrupted => {}
                    Err(ref error) if error.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(BLOCKING_SEND_WAIT)
                    }
                    Err(error) => return Err(Error::from(error)),
                }
            }
            Ok(written)
        } else {
            stream.write(data).map_err(Error::from)
        }
    }

    // Whole-message send for internal protocol traffic.
    fn send_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "no socket"))?;
        let mut written = 0;
        let mut retries = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket closed")),
                Ok(n) => written += n,
                Err(ref error) if error.kind() == ErrorKind::Interrupted => {}
                Err(ref error) if error.kind() == ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > SEND_RETRY_LIMIT {
                        return Err(io::Error::new(ErrorKind::WouldBlock, "send buffer full"));
                    }
                    thread::sleep(SEND_RETRY_INTERVAL);
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    pub(crate) fn send_null(&mut self) -> io::Result<()> {
        trace!("{:?}: sending heartbeat", self);
        let msg = broker_prot::pack_null(&self.local_cid);
        self.send_all(&msg)
    }

    pub(crate) fn send_disconnect(&mut self, reason: DisconnectReason) -> io::Result<()> {
        debug!("{:?}: sending disconnect: {:?}", self, reason);
        let msg = broker_prot::pack_disconnect(&self.local_cid, reason);
        self.send_all(&msg)
    }

    /// Returns the connection to NotStarted, releasing the socket. An
    /// externally-attached socket is handed back unclosed and stays in the
    /// poll set; its owner is responsible for it.
    pub(crate) fn reset(&mut self, poll: &Poll) {
        if let Some(stream) = self.stream.take() {
            if self.external_socket {
                let _ = stream.into_raw_fd();
            } else {
                let _ = poll.deregister(&stream);
            }
        }
        self.registered = false;
        self.external_socket = false;
        self.recv_buf.clear();
        self.state = State::NotStarted;
    }

    /// Closes the socket and re-enters ConnectPending; used when following a
    /// ClientRedirect, so the stored connect payload is kept.
    pub(crate) fn retry(&mut self, poll: &Poll) {
        if let Some(stream) = self.stream.take() {
            let _ = poll.deregister(&stream);
        }
        self.registered = false;
        self.recv_buf.clear();
        self.state = State::ConnectPending;
    }

    /// Final socket teardown during the destruction sweep.
    pub(crate) fn release_socket(&mut self, poll: &Poll) {
        if let Some(stream) = self.stream.take() {
            if self.external_socket {
                let _ = stream.into_raw_fd();
            } else {
                let _ = poll.deregister(&stream);
            }
        }
        self.registered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_prot::E133_VERSION;
    use crate::message::{ClientEntry, ConnectReply, RptClientType, Uid};

    struct Noop;
    impl ConnectionHandler for Noop {}

    fn test_conn() -> (Connection, Poll) {
        let config = ConnectionConfig {
            local_cid: Uuid::new_v4(),
            handler: Arc::new(Noop),
        };
        (Connection::new(ConnHandle(7), config), Poll::new().unwrap())
    }

    fn connect_data() -> ClientConnect {
        ClientConnect::new(
            "default",
            ClientEntry::Rpt {
                cid: Uuid::new_v4(),
                uid: Uid::new(0x6574, 1),
                client_type: RptClientType::Controller,
                binding_cid: Uuid::nil(),
            },
        )
    }

    fn broker_msg(bmsg: BrokerMessage) -> RdmnetMessage {
        RdmnetMessage {
            sender_cid: Uuid::new_v4(),
            contents: MessageContents::Broker(bmsg),
        }
    }

    #[test]
    fn rejection_forces_backoff_before_the_next_attempt() {
        let (mut conn, poll) = test_conn();
        conn.remote_addr = Some("127.0.0.1:5569".parse().unwrap());
        conn.conn_data = Some(connect_data());
        conn.state = State::RdmnetConnPending;

        let reply = ConnectReply {
            status: ConnectStatus::CapacityExceeded,
            e133_version: E133_VERSION,
            broker_uid: Uid::default(),
            client_uid: Uid::default(),
        };
        let event = conn.handle_connect_result(&poll, broker_msg(BrokerMessage::ConnectReply(reply)));
        match event {
            Some(Event::ConnectFailed(info)) => {
                assert_eq!(info.event, ConnectFailEvent::Rejected);
                assert_eq!(info.rdmnet_reason, Some(ConnectStatus::CapacityExceeded));
            }
            _ => panic!("expected a ConnectFailed event"),
        }
        assert_eq!(conn.state, State::NotStarted);
        assert!(conn.stream.is_none());

        // The next attempt must sit out the backoff instead of dialing.
        conn.state = State::ConnectPending;
        assert!(conn.process_tick(&poll, true).is_none());
        assert_eq!(conn.state, State::Backoff);
        assert!(conn.process_tick(&poll, true).is_none());
        assert_eq!(conn.state, State::Backoff);
    }

    #[test]
    fn redirect_reenters_connect_pending_with_the_new_address() {
        let (mut conn, poll) = test_conn();
        conn.remote_addr = Some("127.0.0.1:5569".parse().unwrap());
        conn.conn_data = Some(connect_data());
        conn.state = State::RdmnetConnPending;

        let new_addr: SocketAddr = "127.0.0.2:8888".parse().unwrap();
        let event = conn.handle_connect_result(&poll, broker_msg(BrokerMessage::Redirect(new_addr)));
        assert!(event.is_none());
        assert_eq!(conn.state, State::ConnectPending);
        assert_eq!(conn.remote_addr, Some(new_addr));
        assert!(conn.conn_data.is_some());
    }

    #[test]
    fn heartbeat_messages_are_swallowed_and_reset_the_timer() {
        let (mut conn, poll) = test_conn();
        conn.state = State::Heartbeat;
        conn.hb_timer.start(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(60));
        assert!(conn.hb_timer.is_expired());

        assert!(conn.handle_message(&poll, broker_msg(BrokerMessage::Null)).is_none());
        assert!(!conn.hb_timer.is_expired());
        assert_eq!(conn.state, State::Heartbeat);

        let event = conn.handle_message(
            &poll,
            RdmnetMessage {
                sender_cid: Uuid::new_v4(),
                contents: MessageContents::Rpt(vec![1, 2, 3]),
            },
        );
        match event {
            Some(Event::MessageReceived(msg)) => {
                assert_eq!(msg.contents, MessageContents::Rpt(vec![1, 2, 3]))
            }
            _ => panic!("expected a MessageReceived event"),
        }
    }

    #[test]
    fn remote_disconnect_resets_the_connection() {
        let (mut conn, poll) = test_conn();
        conn.state = State::Heartbeat;

        let event =
            conn.handle_message(&poll, broker_msg(BrokerMessage::Disconnect(DisconnectReason::Shutdown)));
        match event {
            Some(Event::Disconnected(info)) => {
                assert_eq!(info.event, DisconnectEvent::GracefulRemoteInitiated);
                assert_eq!(info.rdmnet_reason, Some(DisconnectReason::Shutdown));
            }
            _ => panic!("expected a Disconnected event"),
        }
        assert_eq!(conn.state, State::NotStarted);
    }

    #[test]
    fn socket_errors_are_classified_by_state() {
        let (mut conn, poll) = test_conn();

        conn.state = State::RdmnetConnPending;
        let error = io::Error::new(ErrorKind::ConnectionReset, "reset");
        match conn.handle_socket_error(&poll, error) {
            Some(Event::ConnectFailed(info)) => assert_eq!(info.event, ConnectFailEvent::TcpLevel),
            _ => panic!("expected a ConnectFailed event"),
        }
        assert!(conn.rdmnet_conn_failed);
        assert_eq!(conn.state, State::NotStarted);

        conn.state = State::Heartbeat;
        let error = io::Error::new(ErrorKind::ConnectionReset, "reset");
        match conn.handle_socket_error(&poll, error) {
            Some(Event::Disconnected(info)) => {
                assert_eq!(info.event, DisconnectEvent::AbruptClose);
                assert!(info.socket_err.is_some());
            }
            _ => panic!("expected a Disconnected event"),
        }

        // Errors in idle states are ignored.
        conn.state = State::NotStarted;
        let error = io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert!(conn.handle_socket_error(&poll, error).is_none());
    }

    #[test]
    fn heartbeat_timeout_honors_the_per_tick_cap() {
        let (mut conn, poll) = test_conn();
        conn.state = State::Heartbeat;
        conn.hb_timer.start(Duration::ZERO);

        assert!(conn.process_tick(&poll, false).is_none());
        assert_eq!(conn.state, State::Heartbeat);

        match conn.process_tick(&poll, true) {
            Some(Event::Disconnected(info)) => assert_eq!(info.event, DisconnectEvent::NoHeartbeat),
            _ => panic!("expected a Disconnected event"),
        }
        assert_eq!(conn.state, State::NotStarted);
    }
}
