//! Connection core for the draft ANSI E1.33 (RDMnet) protocol.
//!
//! RDMnet transports RDM (Remote Device Management) over TCP in entertainment
//! lighting networks. Every controller and device keeps one health-checked
//! TCP connection per broker; this crate owns the full lifecycle of those
//! connections: the connect/backoff/handshake state machine, heartbeat send
//! and receive deadlines, framing of the ACN PDU stream, and delivery of the
//! four asynchronous callbacks (connected, connect failed, disconnected,
//! message received).
//!
//! A [`Core`] owns all module state. Connections are identified by opaque
//! [`ConnHandle`]s and report progress through a [`ConnectionHandler`]
//! implementation supplied at creation:
//!
//! ```no_run
//! use std::sync::Arc;
//! use uuid::Uuid;
//! use rdmnet::{
//!     ClientConnect, ClientEntry, ConnectionConfig, Core, CoreConfig, RptClientType, Uid,
//! };
//!
//! struct Handler;
//! impl rdmnet::ConnectionHandler for Handler {}
//!
//! # fn main() -> rdmnet::Result<()> {
//! let cid = Uuid::new_v4();
//! let core = Core::new(CoreConfig::default())?;
//! let handle = core.connection_create(ConnectionConfig {
//!     local_cid: cid,
//!     handler: Arc::new(Handler),
//! })?;
//! core.connect(
//!     handle,
//!     "192.168.1.1:5569".parse().unwrap(),
//!     ClientConnect::new("default", ClientEntry::Rpt {
//!         cid,
//!         uid: Uid::new(0x6574, 1),
//!         client_type: RptClientType::Controller,
//!         binding_cid: Uuid::nil(),
//!     }),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! This library implements a draft standard (BSR E1.33 rev. 63); protocol
//! values and behavior will change before ratification.

#[macro_use]
extern crate log;

pub mod broker_prot;
pub mod msg_buf;

mod backoff;
mod conn;
mod error;
mod message;
mod poll;
mod util;

pub use crate::conn::{
    ConnectionConfig, ConnectionHandler, Core, CoreConfig, MessageWriter, DEFAULT_RECV_BUF_SIZE,
    HEARTBEAT_SEND_INTERVAL, HEARTBEAT_TIMEOUT,
};
pub use crate::error::{Error, Result};
pub use crate::message::{
    BrokerMessage, ClientConnect, ClientEntry, ConnHandle, ConnectFailEvent, ConnectFailedInfo,
    ConnectReply, ConnectStatus, ConnectedInfo, DisconnectEvent, DisconnectReason,
    DisconnectedInfo, MessageContents, RdmnetMessage, RptClientType, Uid,
};
