//! Typed requests and their record mapping.
//!
//! A [`Request`] is the parsed form of a [`RequestRecord`]: handles and
//! small scalars ride in the fixed header arguments, structured data
//! (variable info, values, search queries) rides in the payload. The
//! client library encodes with [`Request::to_record`], the dispatcher
//! parses with [`Request::from_record`]; both sides share the payload
//! codecs below.

use crate::err::WireError;
use crate::handle::VarHandle;
use crate::kinds::{NotifyKind, RequestKind};
use crate::record::RequestRecord;
use crate::value::VarValue;
use crate::{MAX_NAME_LEN, MAX_TAGS_LEN};

/// Everything needed to create a variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    pub name: String,
    pub instance_id: u32,
    pub value: VarValue,
    /// Raw flags word; the server interprets the bits.
    pub flags: u32,
    /// printf-like format specifier used by PRINT, or `None` for the
    /// type default.
    pub format: Option<String>,
    pub tags: Vec<String>,
    /// UIDs allowed to read. Empty means anyone.
    pub read_acl: Vec<u32>,
    /// UIDs allowed to write. Empty means anyone.
    pub write_acl: Vec<u32>,
}

impl VarInfo {
    /// A plain public variable with default flags.
    #[must_use]
    pub fn new(name: impl Into<String>, value: VarValue) -> Self {
        Self {
            name: name.into(),
            instance_id: 0,
            value,
            flags: 0,
            format: None,
            tags: Vec::new(),
            read_acl: Vec::new(),
            write_acl: Vec::new(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_str_u8(out, &self.name);
        out.extend_from_slice(&self.instance_id.to_le_bytes());
        self.value.encode(out);
        out.extend_from_slice(&self.flags.to_le_bytes());
        put_str_u8(out, self.format.as_deref().unwrap_or(""));
        out.push(self.tags.len() as u8);
        for tag in &self.tags {
            put_str_u8(out, tag);
        }
        put_uid_list(out, &self.read_acl);
        put_uid_list(out, &self.write_acl);
    }

    pub fn decode(buf: &[u8]) -> Result<VarInfo, WireError> {
        let mut cur = Cursor::new(buf);
        let info = Self::decode_from(&mut cur)?;
        cur.finish()?;
        Ok(info)
    }

    fn decode_from(cur: &mut Cursor<'_>) -> Result<VarInfo, WireError> {
        let name = cur.str_u8()?;
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(WireError::BadPayload("variable name length"));
        }
        let instance_id = cur.u32()?;
        let value = cur.value()?;
        let flags = cur.u32()?;
        let format = cur.str_u8()?;
        let tag_count = cur.u8()? as usize;
        if tag_count > MAX_TAGS_LEN {
            return Err(WireError::BadPayload("too many tags"));
        }
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(cur.str_u8()?);
        }
        let read_acl = cur.uid_list()?;
        let write_acl = cur.uid_list()?;
        Ok(VarInfo {
            name,
            instance_id,
            value,
            flags,
            format: if format.is_empty() { None } else { Some(format) },
            tags,
            read_acl,
            write_acl,
        })
    }
}

/// Selectors for GET_FIRST. Every populated selector must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Substring of the variable name.
    pub name_match: Option<String>,
    pub instance_id: Option<u32>,
    /// Flag bits that must all be present. Zero matches everything.
    pub flags: u32,
    pub tags: Vec<String>,
}

impl SearchQuery {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_str_u8(out, self.name_match.as_deref().unwrap_or(""));
        match self.instance_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_le_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.push(self.tags.len() as u8);
        for tag in &self.tags {
            put_str_u8(out, tag);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<SearchQuery, WireError> {
        let mut cur = Cursor::new(buf);
        let name_match = cur.str_u8()?;
        let instance_id = if cur.u8()? != 0 { Some(cur.u32()?) } else { None };
        let flags = cur.u32()?;
        let tag_count = cur.u8()? as usize;
        if tag_count > MAX_TAGS_LEN {
            return Err(WireError::BadPayload("too many tags"));
        }
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(cur.str_u8()?);
        }
        cur.finish()?;
        Ok(SearchQuery {
            name_match: if name_match.is_empty() { None } else { Some(name_match) },
            instance_id,
            flags,
            tags,
        })
    }
}

/// A parsed request, one variant per dispatchable kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Open { workbuf_size: u32, uid: u32 },
    Close,
    Echo { token: u32 },
    New { info: VarInfo },
    Alias { handle: VarHandle, name: String },
    GetAliases { handle: VarHandle },
    Find { name: String },
    Get { handle: VarHandle },
    Print { handle: VarHandle },
    Set { handle: VarHandle, value: VarValue },
    Type { handle: VarHandle },
    Name { handle: VarHandle },
    Length { handle: VarHandle },
    Flags { handle: VarHandle },
    Info { handle: VarHandle },
    Notify { handle: VarHandle, kind: NotifyKind },
    NotifyCancel { handle: VarHandle, kind: NotifyKind },
    GetValidationRequest { txn_id: u32 },
    SendValidationResponse { txn_id: u32, code: u32 },
    OpenPrintSession { txn_id: u32 },
    ClosePrintSession { txn_id: u32 },
    GetFirst { query: SearchQuery },
    GetNext { context: u32 },
    SetFlags { handle: VarHandle, mask: u32 },
    ClearFlags { handle: VarHandle, mask: u32 },
}

impl Request {
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Open { .. } => RequestKind::Open,
            Self::Close => RequestKind::Close,
            Self::Echo { .. } => RequestKind::Echo,
            Self::New { .. } => RequestKind::New,
            Self::Alias { .. } => RequestKind::Alias,
            Self::GetAliases { .. } => RequestKind::GetAliases,
            Self::Find { .. } => RequestKind::Find,
            Self::Get { .. } => RequestKind::Get,
            Self::Print { .. } => RequestKind::Print,
            Self::Set { .. } => RequestKind::Set,
            Self::Type { .. } => RequestKind::Type,
            Self::Name { .. } => RequestKind::Name,
            Self::Length { .. } => RequestKind::Length,
            Self::Flags { .. } => RequestKind::Flags,
            Self::Info { .. } => RequestKind::Info,
            Self::Notify { .. } => RequestKind::Notify,
            Self::NotifyCancel { .. } => RequestKind::NotifyCancel,
            Self::GetValidationRequest { .. } => RequestKind::GetValidationRequest,
            Self::SendValidationResponse { .. } => RequestKind::SendValidationResponse,
            Self::OpenPrintSession { .. } => RequestKind::OpenPrintSession,
            Self::ClosePrintSession { .. } => RequestKind::ClosePrintSession,
            Self::GetFirst { .. } => RequestKind::GetFirst,
            Self::GetNext { .. } => RequestKind::GetNext,
            Self::SetFlags { .. } => RequestKind::SetFlags,
            Self::ClearFlags { .. } => RequestKind::ClearFlags,
        }
    }

    /// Encode for sending with the given client id in the header.
    #[must_use]
    pub fn to_record(&self, client_id: u16) -> RequestRecord {
        let mut record = RequestRecord {
            client_id,
            kind: self.kind(),
            arg1: 0,
            arg2: 0,
            txn_id: 0,
            payload: Vec::new(),
        };
        match self {
            Self::Open { workbuf_size, uid } => {
                record.arg1 = u64::from(*workbuf_size);
                record.arg2 = *uid;
            }
            Self::Close => {}
            Self::Echo { token } => record.arg1 = u64::from(*token),
            Self::New { info } => info.encode(&mut record.payload),
            Self::Alias { handle, name } => {
                record.arg1 = u64::from(handle.id());
                record.payload.extend_from_slice(name.as_bytes());
            }
            Self::GetAliases { handle }
            | Self::Get { handle }
            | Self::Print { handle }
            | Self::Type { handle }
            | Self::Name { handle }
            | Self::Length { handle }
            | Self::Flags { handle }
            | Self::Info { handle } => record.arg1 = u64::from(handle.id()),
            Self::Find { name } => record.payload.extend_from_slice(name.as_bytes()),
            Self::Set { handle, value } => {
                record.arg1 = u64::from(handle.id());
                value.encode(&mut record.payload);
            }
            Self::Notify { handle, kind } | Self::NotifyCancel { handle, kind } => {
                record.arg1 = u64::from(handle.id());
                record.arg2 = kind.code();
            }
            Self::GetValidationRequest { txn_id }
            | Self::OpenPrintSession { txn_id }
            | Self::ClosePrintSession { txn_id } => record.txn_id = *txn_id,
            Self::SendValidationResponse { txn_id, code } => {
                record.txn_id = *txn_id;
                record.arg2 = *code;
            }
            Self::GetFirst { query } => query.encode(&mut record.payload),
            Self::GetNext { context } => record.arg2 = *context,
            Self::SetFlags { handle, mask } | Self::ClearFlags { handle, mask } => {
                record.arg1 = u64::from(handle.id());
                record.arg2 = *mask;
            }
        }
        record
    }

    /// Parse a record into a typed request.
    pub fn from_record(record: &RequestRecord) -> Result<Request, WireError> {
        let handle = || VarHandle::new(record.arg1 as u32);
        let name_payload = || -> Result<String, WireError> {
            let name =
                std::str::from_utf8(&record.payload).map_err(|_| WireError::BadUtf8)?;
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(WireError::BadPayload("variable name length"));
            }
            Ok(name.to_string())
        };
        let notify_kind = || -> Result<NotifyKind, WireError> {
            match NotifyKind::from_code(record.arg2) {
                Some(NotifyKind::None) | None => {
                    Err(WireError::BadPayload("notification kind"))
                }
                Some(kind) => Ok(kind),
            }
        };
        Ok(match record.kind {
            RequestKind::Invalid => return Err(WireError::BadKind(0)),
            RequestKind::Open => Request::Open {
                workbuf_size: record.arg1 as u32,
                uid: record.arg2,
            },
            RequestKind::Close => Request::Close,
            RequestKind::Echo => Request::Echo {
                token: record.arg1 as u32,
            },
            RequestKind::New => Request::New {
                info: VarInfo::decode(&record.payload)?,
            },
            RequestKind::Alias => Request::Alias {
                handle: handle(),
                name: name_payload()?,
            },
            RequestKind::GetAliases => Request::GetAliases { handle: handle() },
            RequestKind::Find => Request::Find { name: name_payload()? },
            RequestKind::Get => Request::Get { handle: handle() },
            RequestKind::Print => Request::Print { handle: handle() },
            RequestKind::Set => {
                let (value, consumed) = VarValue::decode(&record.payload)?;
                if consumed != record.payload.len() {
                    return Err(WireError::BadPayload("trailing bytes after value"));
                }
                Request::Set {
                    handle: handle(),
                    value,
                }
            }
            RequestKind::Type => Request::Type { handle: handle() },
            RequestKind::Name => Request::Name { handle: handle() },
            RequestKind::Length => Request::Length { handle: handle() },
            RequestKind::Flags => Request::Flags { handle: handle() },
            RequestKind::Info => Request::Info { handle: handle() },
            RequestKind::Notify => Request::Notify {
                handle: handle(),
                kind: notify_kind()?,
            },
            RequestKind::NotifyCancel => Request::NotifyCancel {
                handle: handle(),
                kind: notify_kind()?,
            },
            RequestKind::GetValidationRequest => Request::GetValidationRequest {
                txn_id: record.txn_id,
            },
            RequestKind::SendValidationResponse => Request::SendValidationResponse {
                txn_id: record.txn_id,
                code: record.arg2,
            },
            RequestKind::OpenPrintSession => Request::OpenPrintSession {
                txn_id: record.txn_id,
            },
            RequestKind::ClosePrintSession => Request::ClosePrintSession {
                txn_id: record.txn_id,
            },
            RequestKind::GetFirst => Request::GetFirst {
                query: SearchQuery::decode(&record.payload)?,
            },
            RequestKind::GetNext => Request::GetNext {
                context: record.arg2,
            },
            RequestKind::SetFlags => Request::SetFlags {
                handle: handle(),
                mask: record.arg2,
            },
            RequestKind::ClearFlags => Request::ClearFlags {
                handle: handle(),
                mask: record.arg2,
            },
        })
    }
}

fn put_str_u8(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
}

fn put_uid_list(out: &mut Vec<u8>, uids: &[u32]) {
    out.push(uids.len() as u8);
    for uid in uids {
        out.extend_from_slice(&uid.to_le_bytes());
    }
}

/// Byte-wise payload reader.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(WireError::Truncated)?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str_u8(&mut self) -> Result<String, WireError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(ToString::to_string)
            .map_err(|_| WireError::BadUtf8)
    }

    fn uid_list(&mut self) -> Result<Vec<u32>, WireError> {
        let count = self.u8()? as usize;
        let mut uids = Vec::with_capacity(count);
        for _ in 0..count {
            uids.push(self.u32()?);
        }
        Ok(uids)
    }

    fn value(&mut self) -> Result<VarValue, WireError> {
        let (value, consumed) = VarValue::decode(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(WireError::BadPayload("trailing bytes"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(req: Request) {
        let record = req.to_record(5);
        assert_eq!(record.client_id, 5);
        let parsed = Request::from_record(&record).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn simple_requests_round_trip() {
        round_trip(Request::Open {
            workbuf_size: 4096,
            uid: 1000,
        });
        round_trip(Request::Close);
        round_trip(Request::Echo { token: 99 });
        round_trip(Request::Find {
            name: "/sys/test".to_string(),
        });
        round_trip(Request::Get {
            handle: VarHandle::new(12),
        });
        round_trip(Request::Set {
            handle: VarHandle::new(12),
            value: VarValue::Int32(-5),
        });
        round_trip(Request::Notify {
            handle: VarHandle::new(3),
            kind: NotifyKind::Calc,
        });
        round_trip(Request::SendValidationResponse {
            txn_id: 17,
            code: 22,
        });
        round_trip(Request::SetFlags {
            handle: VarHandle::new(4),
            mask: 0b101,
        });
    }

    #[test]
    fn var_info_round_trips() {
        let mut info = VarInfo::new("/a/b", VarValue::Str("v".to_string()));
        info.instance_id = 2;
        info.flags = 0x11;
        info.format = Some("%05d".to_string());
        info.tags = vec!["net".to_string(), "debug".to_string()];
        info.read_acl = vec![0, 1000];
        info.write_acl = vec![0];
        round_trip(Request::New { info });
    }

    #[test]
    fn search_query_round_trips() {
        round_trip(Request::GetFirst {
            query: SearchQuery {
                name_match: Some("/sys".to_string()),
                instance_id: Some(7),
                flags: 0x3,
                tags: vec!["hw".to_string()],
            },
        });
        round_trip(Request::GetFirst {
            query: SearchQuery::default(),
        });
    }

    #[test]
    fn registering_the_tombstone_kind_is_rejected() {
        let mut record = Request::Notify {
            handle: VarHandle::new(3),
            kind: NotifyKind::Modified,
        }
        .to_record(1);
        record.arg2 = NotifyKind::None.code();
        assert!(Request::from_record(&record).is_err());
    }

    #[test]
    fn oversize_name_is_rejected() {
        let record = RequestRecord {
            client_id: 1,
            kind: RequestKind::Find,
            arg1: 0,
            arg2: 0,
            txn_id: 0,
            payload: vec![b'x'; MAX_NAME_LEN + 1],
        };
        assert!(Request::from_record(&record).is_err());
    }

    #[test]
    fn invalid_kind_is_rejected() {
        let record = RequestRecord {
            client_id: 1,
            kind: RequestKind::Invalid,
            arg1: 0,
            arg2: 0,
            txn_id: 0,
            payload: Vec::new(),
        };
        assert!(Request::from_record(&record).is_err());
    }
}
