//! Client-side error type.

use std::fmt;
use std::io;

use var_protocol::{VarErr, WireError};

/// Everything a client call can fail with.
#[derive(Debug)]
pub enum ClientError {
    /// Transport failure
    Io(io::Error),
    /// The bytes on the wire made no sense
    Wire(WireError),
    /// The server answered with an errno-style code
    Server(VarErr),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Wire(err) => write!(f, "protocol error: {err}"),
            Self::Server(err) => write!(f, "server refused: {err}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Wire(err) => Some(err),
            Self::Server(err) => Some(err),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        Self::Wire(err)
    }
}

impl From<VarErr> for ClientError {
    fn from(err: VarErr) -> Self {
        Self::Server(err)
    }
}

impl ClientError {
    /// The server's errno code, when that is what failed.
    #[must_use]
    pub fn server_code(&self) -> Option<VarErr> {
        match self {
            Self::Server(err) => Some(*err),
            _ => None,
        }
    }
}
