//! Wire-level types shared between the variable server and its clients.
//!
//! Everything that crosses a connection lives here: the fixed request and
//! response records, the request-kind and notification-kind code tables,
//! the tagged value variant with its binary codec, and the errno-style
//! result codes. The server and the client library both build on this
//! crate so the two sides cannot drift apart.

pub mod err;
pub mod handle;
pub mod kinds;
pub mod notice;
pub mod payload;
pub mod record;
pub mod request;
pub mod value;

// Re-export the protocol surface for convenience
pub use err::{VarErr, WireError};
pub use handle::{ClientId, VarHandle};
pub use kinds::{NotifyKind, RequestKind};
pub use notice::{ChangeRecord, NotifyMessage};
pub use record::{
    RequestRecord, ResponseRecord, EOK, MAGIC, PROTOCOL_VERSION, REQUEST_HEADER_LEN,
    RESPONSE_HEADER_LEN,
};
pub use request::{Request, SearchQuery, VarInfo};
pub use value::{VarType, VarValue};

/// Longest accepted variable or alias name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

/// Most tags a single variable can carry.
pub const MAX_TAGS_LEN: usize = 8;
