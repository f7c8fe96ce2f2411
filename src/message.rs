use std::fmt;
use std::io;
use std::net::SocketAddr;

use uuid::Uuid;

/// Opaque identifier for a connection within a [`Core`](crate::Core).
///
/// Handles are issued monotonically and are never reissued to a different
/// caller before the connection has been destroyed and reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnHandle(pub(crate) i32);

impl ConnHandle {
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 48-bit RDM unique identifier: 16-bit manufacturer ID plus 32-bit device ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Uid {
    pub manu: u16,
    pub id: u32,
}

impl Uid {
    pub fn new(manu: u16, id: u32) -> Uid {
        Uid { manu, id }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}:{:08x}", self.manu, self.id)
    }
}

/// Status code carried in a broker ConnectReply message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Ok,
    ScopeMismatch,
    CapacityExceeded,
    DuplicateUid,
    InvalidClientEntry,
    InvalidUid,
    /// A status code this library does not know about.
    Other(u16),
}

impl ConnectStatus {
    pub fn from_raw(raw: u16) -> ConnectStatus {
        match raw {
            0 => ConnectStatus::Ok,
            1 => ConnectStatus::ScopeMismatch,
            2 => ConnectStatus::CapacityExceeded,
            3 => ConnectStatus::DuplicateUid,
            4 => ConnectStatus::InvalidClientEntry,
            5 => ConnectStatus::InvalidUid,
            other => ConnectStatus::Other(other),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ConnectStatus::Ok => 0,
            ConnectStatus::ScopeMismatch => 1,
            ConnectStatus::CapacityExceeded => 2,
            ConnectStatus::DuplicateUid => 3,
            ConnectStatus::InvalidClientEntry => 4,
            ConnectStatus::InvalidUid => 5,
            ConnectStatus::Other(raw) => raw,
        }
    }
}

/// Reason code carried in a broker Disconnect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Shutdown,
    CapacityExhausted,
    HardwareFault,
    SoftwareFault,
    SoftwareReset,
    IncorrectScope,
    RptReconfigure,
    LlrpReconfigure,
    UserReconfigure,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_raw(raw: u16) -> DisconnectReason {
        match raw {
            0 => DisconnectReason::Shutdown,
            1 => DisconnectReason::CapacityExhausted,
            2 => DisconnectReason::HardwareFault,
            3 => DisconnectReason::SoftwareFault,
            4 => DisconnectReason::SoftwareReset,
            5 => DisconnectReason::IncorrectScope,
            6 => DisconnectReason::RptReconfigure,
            7 => DisconnectReason::LlrpReconfigure,
            8 => DisconnectReason::UserReconfigure,
            other => DisconnectReason::Other(other),
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            DisconnectReason::Shutdown => 0,
            DisconnectReason::CapacityExhausted => 1,
            DisconnectReason::HardwareFault => 2,
            DisconnectReason::SoftwareFault => 3,
            DisconnectReason::SoftwareReset => 4,
            DisconnectReason::IncorrectScope => 5,
            DisconnectReason::RptReconfigure => 6,
            DisconnectReason::LlrpReconfigure => 7,
            DisconnectReason::UserReconfigure => 8,
            DisconnectReason::Other(raw) => raw,
        }
    }
}

/// RPT client role advertised in a client entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RptClientType {
    Device,
    Controller,
}

/// Client entry advertised to the broker during the connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEntry {
    Rpt {
        cid: Uuid,
        uid: Uid,
        client_type: RptClientType,
        binding_cid: Uuid,
    },
    /// EPT entries carry a raw sub-protocol list which this library does not
    /// interpret.
    Ept { cid: Uuid, protocols: Vec<u8> },
}

/// The ClientConnect payload sent to a broker on every connection attempt.
///
/// The payload is captured by [`Core::connect`](crate::Core::connect) and
/// reused verbatim when following a ClientRedirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnect {
    pub scope: String,
    pub e133_version: u16,
    pub search_domain: String,
    pub connect_flags: u8,
    pub client_entry: ClientEntry,
}

impl ClientConnect {
    /// Creates a payload for the given scope with the default E1.33 version
    /// and search domain.
    pub fn new<S: Into<String>>(scope: S, client_entry: ClientEntry) -> ClientConnect {
        ClientConnect {
            scope: scope.into(),
            e133_version: crate::broker_prot::E133_VERSION,
            search_domain: crate::broker_prot::E133_DEFAULT_DOMAIN.to_owned(),
            connect_flags: 0,
            client_entry,
        }
    }
}

/// The broker's reply to a ClientConnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub status: ConnectStatus,
    pub e133_version: u16,
    pub broker_uid: Uid,
    pub client_uid: Uid,
}

/// A message of the Broker sub-protocol.
///
/// Only the vectors the connection core acts on are parsed into structured
/// form; everything else is surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    ConnectReply(ConnectReply),
    Redirect(SocketAddr),
    Disconnect(DisconnectReason),
    Null,
    Other { vector: u16, data: Vec<u8> },
}

/// Payload of one root-layer PDU received on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContents {
    Broker(BrokerMessage),
    /// An RPT PDU, not interpreted by the connection core.
    Rpt(Vec<u8>),
    /// An EPT PDU, not interpreted by the connection core.
    Ept(Vec<u8>),
}

/// One whole message received on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmnetMessage {
    pub sender_cid: Uuid,
    pub contents: MessageContents,
}

/// Information delivered with a Connected callback.
#[derive(Debug)]
pub struct ConnectedInfo {
    pub broker_uid: Uid,
    pub client_uid: Uid,
    /// The address the connection ended up at, after any redirects.
    pub connected_addr: SocketAddr,
}

/// Classification of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailEvent {
    /// A socket could not be created or configured.
    SocketFailure,
    /// The TCP connection failed or broke before the handshake finished.
    TcpLevel,
    /// The broker rejected the ClientConnect.
    Rejected,
}

/// Information delivered with a ConnectFailed callback.
#[derive(Debug)]
pub struct ConnectFailedInfo {
    pub event: ConnectFailEvent,
    pub socket_err: Option<io::Error>,
    pub rdmnet_reason: Option<ConnectStatus>,
}

/// Classification of a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectEvent {
    /// The socket closed or errored without an RDMnet-level goodbye.
    AbruptClose,
    /// Nothing was received from the broker within the heartbeat timeout.
    NoHeartbeat,
    /// The broker sent a Disconnect message.
    GracefulRemoteInitiated,
}

/// Information delivered with a Disconnected callback.
#[derive(Debug)]
pub struct DisconnectedInfo {
    pub event: DisconnectEvent,
    pub socket_err: Option<io::Error>,
    pub rdmnet_reason: Option<DisconnectReason>,
}
