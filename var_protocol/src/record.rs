//! Fixed request and response records.
//!
//! Both directions use a 32-byte little-endian header followed by an
//! optional payload of `payload_len` bytes. A connection that delivers a
//! bad magic or version is torn down by the server; everything else is
//! answered with a response record.
//!
//! Request header layout:
//!
//! ```text
//! magic:u32  version:u16  client_id:u16  kind:u16  pad:u16
//! arg1:u64   arg2:u32     txn_id:u32     payload_len:u32
//! ```
//!
//! Response header layout:
//!
//! ```text
//! magic:u32  version:u16  pad:u16        code:u32
//! result1:u64  result2:u32  txn_id:u32   payload_len:u32
//! ```

use crate::err::{VarErr, WireError};
use crate::kinds::RequestKind;

/// `"VARS"` in big-endian byte order.
pub const MAGIC: u32 = 0x5641_5253;

pub const PROTOCOL_VERSION: u16 = 1;

pub const REQUEST_HEADER_LEN: usize = 32;
pub const RESPONSE_HEADER_LEN: usize = 32;

/// Success code on the wire.
pub const EOK: u32 = 0;

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(w)
}

/// One framed request as read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub client_id: u16,
    pub kind: RequestKind,
    pub arg1: u64,
    pub arg2: u32,
    pub txn_id: u32,
    pub payload: Vec<u8>,
}

impl RequestRecord {
    /// Header plus payload, ready to write to a socket.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        out.extend_from_slice(&self.client_id.to_le_bytes());
        out.extend_from_slice(&self.kind.code().to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.arg1.to_le_bytes());
        out.extend_from_slice(&self.arg2.to_le_bytes());
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode the fixed header. The payload is read separately once its
    /// length is known; attach it with the returned `payload_len`.
    pub fn decode_header(buf: &[u8]) -> Result<(RequestRecord, usize), WireError> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let magic = get_u32(buf, 0);
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = get_u16(buf, 4);
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }
        // An out-of-table kind code is not a framing violation: it decodes
        // to Invalid and the dispatcher answers it with a response record.
        let kind = RequestKind::from_code(get_u16(buf, 8)).unwrap_or(RequestKind::Invalid);
        let record = RequestRecord {
            client_id: get_u16(buf, 6),
            kind,
            arg1: get_u64(buf, 12),
            arg2: get_u32(buf, 20),
            txn_id: get_u32(buf, 24),
            payload: Vec::new(),
        };
        let payload_len = get_u32(buf, 28) as usize;
        Ok((record, payload_len))
    }
}

/// One framed response. Also the frame for notification events on the
/// NOTIFY channel (see [`crate::notice::NotifyMessage`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub code: u32,
    pub result1: u64,
    pub result2: u32,
    pub txn_id: u32,
    pub payload: Vec<u8>,
}

impl ResponseRecord {
    /// A bare success response.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: EOK,
            result1: 0,
            result2: 0,
            txn_id: 0,
            payload: Vec::new(),
        }
    }

    /// A failure response.
    #[must_use]
    pub fn err(err: VarErr) -> Self {
        Self {
            code: err.code(),
            result1: 0,
            result2: 0,
            txn_id: 0,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_result1(mut self, v: u64) -> Self {
        self.result1 = v;
        self
    }

    #[must_use]
    pub fn with_result2(mut self, v: u32) -> Self {
        self.result2 = v;
        self
    }

    #[must_use]
    pub fn with_txn(mut self, txn_id: u32) -> Self {
        self.txn_id = txn_id;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Success, or the decoded failure code. An unknown nonzero code is
    /// reported as `EINVAL` rather than silently treated as success.
    pub fn status(&self) -> Result<(), VarErr> {
        if self.code == EOK {
            return Ok(());
        }
        Err(VarErr::from_code(self.code).unwrap_or(VarErr::Inval))
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.result1.to_le_bytes());
        out.extend_from_slice(&self.result2.to_le_bytes());
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode_header(buf: &[u8]) -> Result<(ResponseRecord, usize), WireError> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let magic = get_u32(buf, 0);
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = get_u16(buf, 4);
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let record = ResponseRecord {
            code: get_u32(buf, 8),
            result1: get_u64(buf, 12),
            result2: get_u32(buf, 20),
            txn_id: get_u32(buf, 24),
            payload: Vec::new(),
        };
        let payload_len = get_u32(buf, 28) as usize;
        Ok((record, payload_len))
    }
}
