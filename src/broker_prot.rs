//! Wire codec for the Broker sub-protocol of draft E1.33.
//!
//! Every TCP message is a 16-byte stream preamble followed by one ACN
//! root-layer PDU, which in turn contains one sub-PDU. All multi-byte
//! integers are big-endian. The connection core interprets only the Broker
//! vectors it needs for the handshake and health checking; everything else
//! passes through as opaque payload.

use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{
    BrokerMessage, ClientConnect, ClientEntry, ConnectReply, ConnectStatus, DisconnectReason,
    MessageContents, RdmnetMessage, RptClientType, Uid,
};

/// ACN packet identifier opening every TCP message.
pub const ACN_PACKET_IDENT: [u8; 12] = *b"ASC-E1.17\x00\x00\x00";
/// Packet identifier plus the 4-byte length of the root-layer PDU block.
pub const TCP_PREAMBLE_SIZE: usize = 16;

/// Upper bound on a single message; larger lengths are a framing error.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

pub const VECTOR_ROOT_BROKER: u32 = 0x0000_0009;
pub const VECTOR_ROOT_RPT: u32 = 0x0000_0005;
pub const VECTOR_ROOT_EPT: u32 = 0x0000_000B;

pub const VECTOR_BROKER_CONNECT: u16 = 0x0001;
pub const VECTOR_BROKER_CONNECT_REPLY: u16 = 0x0002;
pub const VECTOR_BROKER_CLIENT_ENTRY_UPDATE: u16 = 0x0003;
pub const VECTOR_BROKER_REDIRECT_V4: u16 = 0x0004;
pub const VECTOR_BROKER_REDIRECT_V6: u16 = 0x0005;
pub const VECTOR_BROKER_DISCONNECT: u16 = 0x000D;
pub const VECTOR_BROKER_NULL: u16 = 0x000E;

pub const CLIENT_PROTOCOL_RPT: u32 = VECTOR_ROOT_RPT;
pub const CLIENT_PROTOCOL_EPT: u32 = VECTOR_ROOT_EPT;

pub const RPT_CLIENT_TYPE_DEVICE: u8 = 0x00;
pub const RPT_CLIENT_TYPE_CONTROLLER: u8 = 0x01;

/// Request incremental client list updates in `ClientConnect::connect_flags`.
pub const CONNECTFLAG_INCREMENTAL_UPDATES: u8 = 0x01;

pub const E133_VERSION: u16 = 1;
pub const E133_DEFAULT_SCOPE: &str = "default";
pub const E133_DEFAULT_DOMAIN: &str = "local.";

/// On-wire size of the scope field, terminator included.
pub const SCOPE_PADDED_LENGTH: usize = 63;
/// On-wire size of the search domain field, terminator included.
pub const DOMAIN_PADDED_LENGTH: usize = 231;

/// Flags/length header plus vector plus sender CID.
const RLP_HEADER_SIZE: usize = 23;
/// Flags/length header plus 16-bit vector.
const BROKER_PDU_HEADER_SIZE: usize = 5;
/// Flags/length header plus client protocol vector plus client CID.
const CLIENT_ENTRY_HEADER_SIZE: usize = 23;

const UID_SIZE: usize = 6;

// PDU flags/length headers put 0xF in the high nibble and a 20-bit length,
// which covers the header itself, in the remaining bits.
fn push_pdu_header(buf: &mut Vec<u8>, len: usize) {
    buf.push(0xF0 | ((len >> 16) & 0x0F) as u8);
    buf.push((len >> 8) as u8);
    buf.push(len as u8);
}

fn read_pdu_len(header: &[u8]) -> Result<usize> {
    if header[0] & 0xF0 != 0xF0 {
        return Err(Error::Protocol("bad PDU flags"));
    }
    Ok(((header[0] as usize & 0x0F) << 16) | ((header[1] as usize) << 8) | header[2] as usize)
}

fn push_padded_str(buf: &mut Vec<u8>, s: &str, padded_len: usize) {
    let bytes = s.as_bytes();
    // Leave at least one byte of terminating padding.
    let copy = usize::min(bytes.len(), padded_len - 1);
    buf.extend_from_slice(&bytes[..copy]);
    buf.resize(buf.len() + padded_len - copy, 0);
}

fn push_uid(buf: &mut Vec<u8>, uid: &Uid) {
    buf.extend_from_slice(&uid.manu.to_be_bytes());
    buf.extend_from_slice(&uid.id.to_be_bytes());
}

fn read_uid(data: &[u8]) -> Uid {
    Uid {
        manu: BigEndian::read_u16(&data[0..2]),
        id: BigEndian::read_u32(&data[2..6]),
    }
}

/// Wraps a Broker sub-PDU into a complete on-wire message: stream preamble,
/// root-layer PDU, Broker PDU.
pub fn pack_broker_message(sender_cid: &Uuid, vector: u16, data: &[u8]) -> Vec<u8> {
    let broker_len = BROKER_PDU_HEADER_SIZE + data.len();
    let rlp_len = RLP_HEADER_SIZE + broker_len;

    let mut buf = Vec::with_capacity(TCP_PREAMBLE_SIZE + rlp_len);
    buf.extend_from_slice(&ACN_PACKET_IDENT);
    buf.extend_from_slice(&(rlp_len as u32).to_be_bytes());

    push_pdu_header(&mut buf, rlp_len);
    buf.extend_from_slice(&VECTOR_ROOT_BROKER.to_be_bytes());
    buf.extend_from_slice(sender_cid.as_bytes());

    push_pdu_header(&mut buf, broker_len);
    buf.extend_from_slice(&vector.to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

fn pack_client_entry(entry: &ClientEntry) -> Vec<u8> {
    let (protocol, cid, data) = match *entry {
        ClientEntry::Rpt {
            ref cid,
            ref uid,
            client_type,
            ref binding_cid,
        } => {
            let mut data = Vec::with_capacity(UID_SIZE + 1 + 16);
            push_uid(&mut data, uid);
            data.push(match client_type {
                RptClientType::Device => RPT_CLIENT_TYPE_DEVICE,
                RptClientType::Controller => RPT_CLIENT_TYPE_CONTROLLER,
            });
            data.extend_from_slice(binding_cid.as_bytes());
            (CLIENT_PROTOCOL_RPT, cid, data)
        }
        ClientEntry::Ept { ref cid, ref protocols } => (CLIENT_PROTOCOL_EPT, cid, protocols.clone()),
    };

    let len = CLIENT_ENTRY_HEADER_SIZE + data.len();
    let mut buf = Vec::with_capacity(len);
    push_pdu_header(&mut buf, len);
    buf.extend_from_slice(&protocol.to_be_bytes());
    buf.extend_from_slice(cid.as_bytes());
    buf.extend_from_slice(&data);
    buf
}

/// Builds the ClientConnect message opening the RDMnet handshake.
pub fn pack_client_connect(sender_cid: &Uuid, msg: &ClientConnect) -> Vec<u8> {
    let entry = pack_client_entry(&msg.client_entry);
    let mut data = Vec::with_capacity(SCOPE_PADDED_LENGTH + 2 + DOMAIN_PADDED_LENGTH + 1 + entry.len());
    push_padded_str(&mut data, &msg.scope, SCOPE_PADDED_LENGTH);
    data.extend_from_slice(&msg.e133_version.to_be_bytes());
    push_padded_str(&mut data, &msg.search_domain, DOMAIN_PADDED_LENGTH);
    data.push(msg.connect_flags);
    data.extend_from_slice(&entry);
    pack_broker_message(sender_cid, VECTOR_BROKER_CONNECT, &data)
}

/// Builds a ConnectReply message (broker direction).
pub fn pack_connect_reply(sender_cid: &Uuid, reply: &ConnectReply) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 2 * UID_SIZE);
    data.extend_from_slice(&reply.status.to_raw().to_be_bytes());
    data.extend_from_slice(&reply.e133_version.to_be_bytes());
    push_uid(&mut data, &reply.broker_uid);
    push_uid(&mut data, &reply.client_uid);
    pack_broker_message(sender_cid, VECTOR_BROKER_CONNECT_REPLY, &data)
}

/// Builds a ClientRedirect message (broker direction); the vector is chosen
/// by the address family.
pub fn pack_client_redirect(sender_cid: &Uuid, new_addr: &SocketAddr) -> Vec<u8> {
    match new_addr.ip() {
        IpAddr::V4(ip) => {
            let mut data = Vec::with_capacity(6);
            data.extend_from_slice(&ip.octets());
            data.extend_from_slice(&new_addr.port().to_be_bytes());
            pack_broker_message(sender_cid, VECTOR_BROKER_REDIRECT_V4, &data)
        }
        IpAddr::V6(ip) => {
            let mut data = Vec::with_capacity(18);
            data.extend_from_slice(&ip.octets());
            data.extend_from_slice(&new_addr.port().to_be_bytes());
            pack_broker_message(sender_cid, VECTOR_BROKER_REDIRECT_V6, &data)
        }
    }
}

/// Builds a Disconnect message.
pub fn pack_disconnect(sender_cid: &Uuid, reason: DisconnectReason) -> Vec<u8> {
    pack_broker_message(sender_cid, VECTOR_BROKER_DISCONNECT, &reason.to_raw().to_be_bytes())
}

/// Builds a Null heartbeat message.
pub fn pack_null(sender_cid: &Uuid) -> Vec<u8> {
    pack_broker_message(sender_cid, VECTOR_BROKER_NULL, &[])
}

/// Parses one whole root-layer PDU block (everything after the preamble).
pub(crate) fn parse_message(block: &[u8]) -> Result<RdmnetMessage> {
    if block.len() < RLP_HEADER_SIZE {
        return Err(Error::Protocol("root PDU truncated"));
    }
    let rlp_len = read_pdu_len(&block[0..3])?;
    if rlp_len != block.len() {
        return Err(Error::Protocol("root PDU length mismatch"));
    }

    let vector = BigEndian::read_u32(&block[3..7]);
    let sender_cid =
        Uuid::from_slice(&block[7..23]).map_err(|_| Error::Protocol("bad sender CID"))?;
    let body = &block[RLP_HEADER_SIZE..];

    let contents = match vector {
        VECTOR_ROOT_BROKER => MessageContents::Broker(parse_broker_pdu(body)?),
        VECTOR_ROOT_RPT => MessageContents::Rpt(body.to_vec()),
        VECTOR_ROOT_EPT => MessageContents::Ept(body.to_vec()),
        _ => return Err(Error::Protocol("unknown root layer vector")),
    };

    Ok(RdmnetMessage { sender_cid, contents })
}

fn parse_broker_pdu(body: &[u8]) -> Result<BrokerMessage> {
    if body.len() < BROKER_PDU_HEADER_SIZE {
        return Err(Error::Protocol("broker PDU truncated"));
    }
    let len = read_pdu_len(&body[0..3])?;
    if len != body.len() {
        return Err(Error::Protocol("broker PDU length mismatch"));
    }

    let vector = BigEndian::read_u16(&body[3..5]);
    let data = &body[BROKER_PDU_HEADER_SIZE..];

    let msg = match vector {
        VECTOR_BROKER_CONNECT_REPLY => {
            if data.len() < 4 + 2 * UID_SIZE {
                return Err(Error::Protocol("ConnectReply truncated"));
            }
            BrokerMessage::ConnectReply(ConnectReply {
                status: ConnectStatus::from_raw(BigEndian::read_u16(&data[0..2])),
                e133_version: BigEndian::read_u16(&data[2..4]),
                broker_uid: read_uid(&data[4..10]),
                client_uid: read_uid(&data[10..16]),
            })
        }
        VECTOR_BROKER_REDIRECT_V4 => {
            if data.len() < 6 {
                return Err(Error::Protocol("ClientRedirect truncated"));
            }
            let ip: [u8; 4] = [data[0], data[1], data[2], data[3]];
            let port = BigEndian::read_u16(&data[4..6]);
            BrokerMessage::Redirect(SocketAddr::from((ip, port)))
        }
        VECTOR_BROKER_REDIRECT_V6 => {
            if data.len() < 18 {
                return Err(Error::Protocol("ClientRedirect truncated"));
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[0..16]);
            let port = BigEndian::read_u16(&data[16..18]);
            BrokerMessage::Redirect(SocketAddr::from((ip, port)))
        }
        VECTOR_BROKER_DISCONNECT => {
            if data.len() < 2 {
                return Err(Error::Protocol("Disconnect truncated"));
            }
            BrokerMessage::Disconnect(DisconnectReason::from_raw(BigEndian::read_u16(&data[0..2])))
        }
        VECTOR_BROKER_NULL => BrokerMessage::Null,
        _ => BrokerMessage::Other {
            vector,
            data: data.to_vec(),
        },
    };
    Ok(msg)
}
