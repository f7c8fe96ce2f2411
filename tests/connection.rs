//! End-to-end scenarios against loopback broker stubs.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use net2::TcpStreamExt;
use uuid::Uuid;

use rdmnet::broker_prot;
use rdmnet::msg_buf::MsgBuf;
use rdmnet::{
    BrokerMessage, ClientConnect, ClientEntry, ConnHandle, ConnectFailEvent, ConnectFailedInfo,
    ConnectReply, ConnectStatus, ConnectedInfo, ConnectionConfig, ConnectionHandler, Core,
    CoreConfig, DisconnectEvent, DisconnectReason, DisconnectedInfo, MessageContents,
    RdmnetMessage, RptClientType, Uid,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn broker_uid() -> Uid {
    Uid::new(0x1234, 0x5678)
}

fn client_uid() -> Uid {
    Uid::new(0x6574, 0x2)
}

fn client_connect(cid: Uuid) -> ClientConnect {
    ClientConnect::new(
        "default",
        ClientEntry::Rpt {
            cid,
            uid: client_uid(),
            client_type: RptClientType::Controller,
            binding_cid: Uuid::nil(),
        },
    )
}

// -------------------------------------------------------------------------
// Callback recording

#[derive(Debug)]
enum CbEvent {
    Connected(ConnHandle, ConnectedInfo),
    ConnectFailed(ConnHandle, ConnectFailedInfo),
    Disconnected(ConnHandle, DisconnectedInfo),
    Message(ConnHandle, RdmnetMessage),
}

struct Recorder {
    tx: Mutex<Sender<CbEvent>>,
}

impl Recorder {
    fn new() -> (Arc<Recorder>, Receiver<CbEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Recorder { tx: Mutex::new(tx) }), rx)
    }

    fn record(&self, event: CbEvent) {
        let _ = self.tx.lock().unwrap().send(event);
    }
}

impl ConnectionHandler for Recorder {
    fn on_connected(&self, handle: ConnHandle, info: ConnectedInfo) {
        self.record(CbEvent::Connected(handle, info));
    }

    fn on_connect_failed(&self, handle: ConnHandle, info: ConnectFailedInfo) {
        self.record(CbEvent::ConnectFailed(handle, info));
    }

    fn on_disconnected(&self, handle: ConnHandle, info: DisconnectedInfo) {
        self.record(CbEvent::Disconnected(handle, info));
    }

    fn on_message(&self, handle: ConnHandle, message: RdmnetMessage) {
        self.record(CbEvent::Message(handle, message));
    }
}

fn expect_event(rx: &Receiver<CbEvent>, timeout: Duration) -> CbEvent {
    rx.recv_timeout(timeout).expect("timed out waiting for a callback")
}

fn assert_no_event(rx: &Receiver<CbEvent>, window: Duration) {
    match rx.recv_timeout(window) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(event) => panic!("unexpected callback: {:?}", event),
        Err(error) => panic!("callback channel broke: {}", error),
    }
}

// -------------------------------------------------------------------------
// Broker stub plumbing

fn read_message(stream: &mut TcpStream, buf: &mut MsgBuf) -> Option<RdmnetMessage> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some(msg) = buf.drain().expect("stub: bad frame from client") {
            return Some(msg);
        }
        match stream.read(&mut chunk) {
            Ok(0) => return None,
            Ok(n) => buf.feed(&chunk[..n]),
            Err(_) => return None,
        }
    }
}

fn expect_client_connect(stream: &mut TcpStream, buf: &mut MsgBuf) {
    let msg = read_message(stream, buf).expect("stub: client closed before ClientConnect");
    match msg.contents {
        MessageContents::Broker(BrokerMessage::Other { vector, .. }) => {
            assert_eq!(vector, broker_prot::VECTOR_BROKER_CONNECT);
        }
        other => panic!("stub: unexpected message: {:?}", other),
    }
}

fn ok_reply(broker_cid: &Uuid) -> Vec<u8> {
    broker_prot::pack_connect_reply(
        broker_cid,
        &ConnectReply {
            status: ConnectStatus::Ok,
            e133_version: broker_prot::E133_VERSION,
            broker_uid: broker_uid(),
            client_uid: client_uid(),
        },
    )
}

fn reject_reply(broker_cid: &Uuid, status: ConnectStatus) -> Vec<u8> {
    broker_prot::pack_connect_reply(
        broker_cid,
        &ConnectReply {
            status,
            e133_version: broker_prot::E133_VERSION,
            broker_uid: Uid::default(),
            client_uid: Uid::default(),
        },
    )
}

fn bound_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn default_core_with_recorder() -> (Core, ConnHandle, Receiver<CbEvent>, Uuid) {
    let cid = Uuid::new_v4();
    let (recorder, rx) = Recorder::new();
    let core = Core::new(CoreConfig::default()).unwrap();
    let handle = core
        .connection_create(ConnectionConfig {
            local_cid: cid,
            handler: recorder,
        })
        .unwrap();
    (core, handle, rx, cid)
}

// -------------------------------------------------------------------------
// Scenarios

#[test]
fn happy_connect() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();

    let stub: JoinHandle<()> = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream.write_all(&ok_reply(&broker_cid)).unwrap();
        // Stay quiet but connected while the client settles.
        thread::sleep(Duration::from_secs(4));
    });

    let (core, handle, rx, cid) = default_core_with_recorder();
    core.connect(handle, addr, client_connect(cid)).unwrap();

    match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::Connected(h, info) => {
            assert_eq!(h, handle);
            assert_eq!(info.broker_uid, broker_uid());
            assert_eq!(info.client_uid, client_uid());
            assert_eq!(info.connected_addr, addr);
        }
        other => panic!("expected Connected, got {:?}", other),
    }
    assert_no_event(&rx, Duration::from_secs(2));

    drop(core);
    stub.join().unwrap();
}

#[test]
fn rejection_then_backoff() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();
    let (accept_tx, accept_rx) = mpsc::channel();

    let stub = thread::spawn(move || {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().unwrap();
            accept_tx.send(Instant::now()).unwrap();
            let mut buf = MsgBuf::new();
            expect_client_connect(&mut stream, &mut buf);
            stream
                .write_all(&reject_reply(&broker_cid, ConnectStatus::CapacityExceeded))
                .unwrap();
            // Let the client read the rejection before the socket drops.
            thread::sleep(Duration::from_millis(200));
        }
    });

    let (core, handle, rx, cid) = default_core_with_recorder();
    core.connect(handle, addr, client_connect(cid)).unwrap();
    accept_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::ConnectFailed(h, info) => {
            assert_eq!(h, handle);
            assert_eq!(info.event, ConnectFailEvent::Rejected);
            assert_eq!(info.rdmnet_reason, Some(ConnectStatus::CapacityExceeded));
        }
        other => panic!("expected ConnectFailed, got {:?}", other),
    }

    // Reconnect immediately; the standard backoff must hold the TCP attempt
    // back for at least a second.
    let reconnect_at = Instant::now();
    core.connect(handle, addr, client_connect(cid)).unwrap();
    let second_accept = accept_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(second_accept.duration_since(reconnect_at) >= Duration::from_secs(1));

    // Let the second rejection run its course before tearing down.
    match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::ConnectFailed(_, info) => assert_eq!(info.event, ConnectFailEvent::Rejected),
        other => panic!("expected ConnectFailed, got {:?}", other),
    }

    drop(core);
    stub.join().unwrap();
}

#[test]
fn redirect_to_another_broker() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener_a, addr_a) = bound_listener();
    let (listener_b, addr_b) = bound_listener();

    let stub_a = thread::spawn(move || {
        let (mut stream, _) = listener_a.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream
            .write_all(&broker_prot::pack_client_redirect(&broker_cid, &addr_b))
            .unwrap();
        thread::sleep(Duration::from_millis(200));
    });
    let stub_b = thread::spawn(move || {
        let (mut stream, _) = listener_b.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream.write_all(&ok_reply(&broker_cid)).unwrap();
        thread::sleep(Duration::from_secs(3));
    });

    let (core, handle, rx, cid) = default_core_with_recorder();
    core.connect(handle, addr_a, client_connect(cid)).unwrap();

    match expect_event(&rx, Duration::from_secs(8)) {
        CbEvent::Connected(h, info) => {
            assert_eq!(h, handle);
            assert_eq!(info.connected_addr, addr_b);
        }
        other => panic!("expected Connected, got {:?}", other),
    }

    drop(core);
    stub_a.join().unwrap();
    stub_b.join().unwrap();
}

#[test]
fn abrupt_close() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();

    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream.write_all(&ok_reply(&broker_cid)).unwrap();
        // Give the client time to process the reply, then RST the socket.
        thread::sleep(Duration::from_millis(500));
        stream.set_linger(Some(Duration::ZERO)).unwrap();
    });

    let (core, handle, rx, cid) = default_core_with_recorder();
    core.connect(handle, addr, client_connect(cid)).unwrap();

    match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::Connected(..) => {}
        other => panic!("expected Connected, got {:?}", other),
    }
    match expect_event(&rx, Duration::from_secs(3)) {
        CbEvent::Disconnected(h, info) => {
            assert_eq!(h, handle);
            assert_eq!(info.event, DisconnectEvent::AbruptClose);
            assert!(info.socket_err.is_some());
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }

    drop(core);
    stub.join().unwrap();
}

#[test]
fn destroy_during_connect_produces_no_callbacks() {
    init_logging();
    // The listener never accepts and never replies, so the connection sits
    // in the handshake-pending state.
    let (listener, addr) = bound_listener();

    let cid = Uuid::new_v4();
    let (recorder, rx) = Recorder::new();
    let core = Core::new(CoreConfig {
        tick_thread: false,
        ..CoreConfig::default()
    })
    .unwrap();
    let handle = core
        .connection_create(ConnectionConfig {
            local_cid: cid,
            handler: recorder,
        })
        .unwrap();

    core.connect(handle, addr, client_connect(cid)).unwrap();
    core.tick(); // starts the TCP attempt
    thread::sleep(Duration::from_millis(200));

    core.destroy(handle, None).unwrap();
    core.tick(); // reaps the connection
    assert_no_event(&rx, Duration::from_secs(2));

    drop(core);
    drop(listener);
}

#[test]
fn attach_existing_socket_enters_heartbeat() {
    init_logging();
    let peer_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();

    let (core, handle, rx, cid) = default_core_with_recorder();

    let mut peer = TcpStream::connect(addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let (accepted, peer_addr) = listener.accept().unwrap();
    core.attach_existing_socket(handle, accepted, peer_addr).unwrap();

    // The attached connection is already in the heartbeat stage: an atomic
    // multi-part send goes through immediately and arrives as one frame.
    let null_msg = broker_prot::pack_null(&cid);
    let (head, tail) = null_msg.split_at(null_msg.len() / 2);
    {
        let mut writer = core.start_message(handle).unwrap();
        writer.send(head).unwrap();
        writer.send(tail).unwrap();
    }
    let mut buf = MsgBuf::new();
    match read_message(&mut peer, &mut buf) {
        Some(msg) => assert_eq!(msg.contents, MessageContents::Broker(BrokerMessage::Null)),
        None => panic!("peer did not receive the heartbeat"),
    }

    // An RDMnet-level goodbye from the peer surfaces as a graceful
    // disconnect.
    peer.write_all(&broker_prot::pack_disconnect(&peer_cid, DisconnectReason::Shutdown))
        .unwrap();
    match expect_event(&rx, Duration::from_secs(3)) {
        CbEvent::Disconnected(h, info) => {
            assert_eq!(h, handle);
            assert_eq!(info.event, DisconnectEvent::GracefulRemoteInitiated);
            assert_eq!(info.rdmnet_reason, Some(DisconnectReason::Shutdown));
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }

    drop(core);
}

#[test]
fn messages_are_delivered_in_wire_order() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();

    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream.write_all(&ok_reply(&broker_cid)).unwrap();

        // A burst of opaque RPT messages in one write, partially coalesced
        // with a heartbeat.
        let mut burst = Vec::new();
        for i in 0..5u8 {
            burst.extend_from_slice(&broker_prot::pack_broker_message(
                &broker_cid,
                0x0042,
                &[i; 8],
            ));
        }
        burst.extend_from_slice(&broker_prot::pack_null(&broker_cid));
        stream.write_all(&burst).unwrap();
        thread::sleep(Duration::from_secs(2));
    });

    let (core, handle, rx, cid) = default_core_with_recorder();
    core.connect(handle, addr, client_connect(cid)).unwrap();

    match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::Connected(..) => {}
        other => panic!("expected Connected, got {:?}", other),
    }
    for i in 0..5u8 {
        match expect_event(&rx, Duration::from_secs(2)) {
            CbEvent::Message(h, msg) => {
                assert_eq!(h, handle);
                assert_eq!(
                    msg.contents,
                    MessageContents::Broker(BrokerMessage::Other {
                        vector: 0x0042,
                        data: vec![i; 8],
                    })
                );
            }
            other => panic!("expected Message, got {:?}", other),
        }
    }

    drop(core);
    stub.join().unwrap();
}

struct Reentrant {
    core: OnceLock<Weak<Core>>,
    reentry_ok: AtomicBool,
    tx: Mutex<Sender<CbEvent>>,
}

impl ConnectionHandler for Reentrant {
    fn on_connected(&self, handle: ConnHandle, info: ConnectedInfo) {
        // Call straight back into the core from inside the callback; a held
        // core lock would deadlock the whole test here.
        if let Some(core) = self.core.get().and_then(Weak::upgrade) {
            let ok = core.set_blocking(handle, false).is_ok()
                && core.send(handle, &[0u8; 4]).is_ok();
            self.reentry_ok.store(ok, Ordering::Release);
        }
        let _ = self.tx.lock().unwrap().send(CbEvent::Connected(handle, info));
    }
}

#[test]
fn callbacks_can_reenter_the_core() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();

    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream.write_all(&ok_reply(&broker_cid)).unwrap();
        // Swallow whatever the re-entrant callback sends.
        let mut sink = [0u8; 64];
        let _ = stream.set_read_timeout(Some(Duration::from_secs(3)));
        let _ = stream.read(&mut sink);
    });

    let cid = Uuid::new_v4();
    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Reentrant {
        core: OnceLock::new(),
        reentry_ok: AtomicBool::new(false),
        tx: Mutex::new(tx),
    });

    let core = Arc::new(Core::new(CoreConfig::default()).unwrap());
    handler.core.set(Arc::downgrade(&core)).ok().unwrap();

    let handle = core
        .connection_create(ConnectionConfig {
            local_cid: cid,
            handler: handler.clone(),
        })
        .unwrap();
    core.connect(handle, addr, client_connect(cid)).unwrap();

    match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::Connected(h, _) => assert_eq!(h, handle),
        other => panic!("expected Connected, got {:?}", other),
    }
    assert!(handler.reentry_ok.load(Ordering::Acquire));

    drop(core);
    stub.join().unwrap();
}

#[test]
#[ignore] // ~17 s: exercises the real E1.33 heartbeat intervals
fn heartbeat_timeout_after_broker_goes_silent() {
    init_logging();
    let broker_cid = Uuid::new_v4();
    let (listener, addr) = bound_listener();
    let (null_tx, null_rx) = mpsc::channel();

    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = MsgBuf::new();
        expect_client_connect(&mut stream, &mut buf);
        stream.write_all(&ok_reply(&broker_cid)).unwrap();

        // Go silent, but keep reading so the client's heartbeats are
        // observable.
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(16);
        let mut chunk = [0u8; 512];
        while Instant::now() < deadline {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.feed(&chunk[..n]);
                    while let Ok(Some(msg)) = buf.drain() {
                        if msg.contents == MessageContents::Broker(BrokerMessage::Null) {
                            null_tx.send(Instant::now()).unwrap();
                        }
                    }
                }
                Err(_) => {}
            }
        }
    });

    let (core, handle, rx, cid) = default_core_with_recorder();
    core.connect(handle, addr, client_connect(cid)).unwrap();

    let connected_at = match expect_event(&rx, Duration::from_secs(5)) {
        CbEvent::Connected(..) => Instant::now(),
        other => panic!("expected Connected, got {:?}", other),
    };

    // The client proves its own liveness every 5 s.
    null_rx.recv_timeout(Duration::from_secs(7)).unwrap();

    match expect_event(&rx, Duration::from_secs(20)) {
        CbEvent::Disconnected(h, info) => {
            assert_eq!(h, handle);
            assert_eq!(info.event, DisconnectEvent::NoHeartbeat);
            assert!(info.socket_err.is_none());
            let elapsed = connected_at.elapsed();
            assert!(elapsed >= Duration::from_secs(15), "disconnected early: {:?}", elapsed);
            assert!(elapsed <= Duration::from_secs(18), "disconnected late: {:?}", elapsed);
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }

    drop(core);
    stub.join().unwrap();
}
