//! Incremental framing of the RDMnet TCP stream.
//!
//! Socket reads arrive in arbitrary chunks; `MsgBuf` accumulates them and
//! hands back whole messages, one per [`drain`](MsgBuf::drain) call, so a
//! logical PDU is never split across two deliveries.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use netbuf::Buf;

use crate::broker_prot::{self, ACN_PACKET_IDENT, MAX_MESSAGE_SIZE, TCP_PREAMBLE_SIZE};
use crate::error::Result;
use crate::message::RdmnetMessage;

// A root layer PDU block smaller than its own header cannot be valid.
const MIN_BLOCK_SIZE: usize = 23;

/// Per-connection receive buffer with partial-read state.
pub struct MsgBuf {
    buf: Buf,
}

impl fmt::Debug for MsgBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MsgBuf {{ buffered: {} }}", self.buf.len())
    }
}

impl MsgBuf {
    pub fn new() -> MsgBuf {
        MsgBuf { buf: Buf::new() }
    }

    /// Appends freshly received bytes. An empty slice is allowed and leaves
    /// the buffer unchanged; callers use it to re-enter [`drain`](MsgBuf::drain)
    /// on already-buffered data.
    pub fn feed(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.buf.extend(data);
        }
    }

    /// Parses at most one whole message out of the buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A framing error is
    /// unrecoverable for the stream; the owning connection treats it like a
    /// socket error.
    pub fn drain(&mut self) -> Result<Option<RdmnetMessage>> {
        if self.buf.len() < TCP_PREAMBLE_SIZE {
            return Ok(None);
        }
        if self.buf[..12] != ACN_PACKET_IDENT {
            return Err(crate::Error::Protocol("bad ACN packet identifier"));
        }
        let block_len = BigEndian::read_u32(&self.buf[12..16]) as usize;
        if block_len < MIN_BLOCK_SIZE || block_len > MAX_MESSAGE_SIZE {
            return Err(crate::Error::Protocol("bad message length"));
        }

        let total = TCP_PREAMBLE_SIZE + block_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let msg = broker_prot::parse_message(&self.buf[TCP_PREAMBLE_SIZE..total]);
        self.buf.consume(total);
        msg.map(Some)
    }

    /// Discards all buffered bytes. Used when a connection resets so a
    /// reconnect never sees a stale partial frame.
    pub fn clear(&mut self) {
        let len = self.buf.len();
        self.buf.consume(len);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for MsgBuf {
    fn default() -> MsgBuf {
        MsgBuf::new()
    }
}
