//! Errno-style result codes and wire decoding errors.

use std::fmt;

/// Failure code carried in a response record.
///
/// The numeric values are the Linux errno numbers, so a response code can
/// be handed straight to tooling that already speaks errno. Code `0`
/// (`EOK`) is success and is not represented here; see
/// [`ResponseRecord::status`](crate::record::ResponseRecord::status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VarErr {
    /// EINVAL - malformed request
    Inval = 22,
    /// ENOENT - unknown name, handle or transaction
    NoEnt = 2,
    /// EEXIST - name already registered
    Exist = 17,
    /// ENOTSUP - policy refusal (duplicate calc/validate/print, type clash)
    NotSup = 95,
    /// ENOMEM - out of capacity
    NoMem = 12,
    /// EACCES - permission denied
    Access = 13,
    /// E2BIG - result does not fit the client's working buffer
    TooBig = 7,
    /// ERANGE - value conversion would overflow
    Range = 34,
    /// EBADF - descriptor or channel unusable
    BadFd = 9,
    /// ESRCH - peer process is gone
    Srch = 3,
    /// EINPROGRESS - request deferred to a peer; not a failure
    InProgress = 115,
    /// ESTRPIPE - print delegation stream broke mid-transfer
    StrPipe = 86,
}

impl VarErr {
    /// The errno number as sent on the wire.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire code. `0` and unknown numbers yield `None`.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            22 => Some(Self::Inval),
            2 => Some(Self::NoEnt),
            17 => Some(Self::Exist),
            95 => Some(Self::NotSup),
            12 => Some(Self::NoMem),
            13 => Some(Self::Access),
            7 => Some(Self::TooBig),
            34 => Some(Self::Range),
            9 => Some(Self::BadFd),
            3 => Some(Self::Srch),
            115 => Some(Self::InProgress),
            86 => Some(Self::StrPipe),
            _ => None,
        }
    }

    /// The symbolic errno name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Inval => "EINVAL",
            Self::NoEnt => "ENOENT",
            Self::Exist => "EEXIST",
            Self::NotSup => "ENOTSUP",
            Self::NoMem => "ENOMEM",
            Self::Access => "EACCES",
            Self::TooBig => "E2BIG",
            Self::Range => "ERANGE",
            Self::BadFd => "EBADF",
            Self::Srch => "ESRCH",
            Self::InProgress => "EINPROGRESS",
            Self::StrPipe => "ESTRPIPE",
        }
    }
}

impl fmt::Display for VarErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::Inval => "invalid request",
            Self::NoEnt => "not found",
            Self::Exist => "already exists",
            Self::NotSup => "not supported",
            Self::NoMem => "out of capacity",
            Self::Access => "permission denied",
            Self::TooBig => "result too big for working buffer",
            Self::Range => "value out of range",
            Self::BadFd => "bad descriptor",
            Self::Srch => "peer is gone",
            Self::InProgress => "deferred to a peer",
            Self::StrPipe => "print stream broken",
        };
        write!(f, "{} ({what})", self.name())
    }
}

impl std::error::Error for VarErr {}

/// Errors raised while decoding bytes from a connection.
///
/// These never travel on the wire themselves: a server that fails to
/// decode a record drops the connection (framing violation), and a client
/// surfaces the error to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the structure did
    Truncated,
    /// First word of a record was not the protocol magic
    BadMagic(u32),
    /// Record carried an unsupported protocol version
    BadVersion(u16),
    /// Request kind code outside the dispatch table
    BadKind(u16),
    /// Value tag code outside the codec table
    BadTag(u8),
    /// STR payload was not valid UTF-8
    BadUtf8,
    /// Structurally invalid payload for the request kind
    BadPayload(&'static str),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "record truncated"),
            Self::BadMagic(m) => write!(f, "bad magic {m:#010x}"),
            Self::BadVersion(v) => write!(f, "unsupported protocol version {v}"),
            Self::BadKind(k) => write!(f, "unknown request kind {k}"),
            Self::BadTag(t) => write!(f, "unknown value tag {t}"),
            Self::BadUtf8 => write!(f, "string payload is not UTF-8"),
            Self::BadPayload(what) => write!(f, "bad payload: {what}"),
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for err in [
            VarErr::Inval,
            VarErr::NoEnt,
            VarErr::Exist,
            VarErr::NotSup,
            VarErr::NoMem,
            VarErr::Access,
            VarErr::TooBig,
            VarErr::Range,
            VarErr::BadFd,
            VarErr::Srch,
            VarErr::InProgress,
            VarErr::StrPipe,
        ] {
            assert_eq!(VarErr::from_code(err.code()), Some(err));
        }
    }

    #[test]
    fn zero_is_not_an_error() {
        assert_eq!(VarErr::from_code(0), None);
    }
}
