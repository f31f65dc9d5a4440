//! The variable server engine.
//!
//! A single engine task owns every piece of mutable state: the variable
//! store and its name index, the notification registry, the transaction
//! table, the blocked-client queue and the client registry. Connection
//! tasks only frame bytes; they talk to the engine over a channel and
//! relay whatever the engine decides back to their socket. A client that
//! triggered a cross-client transaction simply receives no response until
//! a peer completes it.

pub mod blocked;
pub mod clients;
pub mod config;
pub mod engine;
pub mod handle;
pub mod name_index;
pub mod notify;
pub mod render;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod tags;
pub mod txn;

// Re-export the operational surface
pub use config::Config;
pub use engine::Engine;
pub use server::{EngineMsg, Server};
pub use store::VarFlags;

/// Most live variables and aliases a server instance will hold.
pub const MAX_VARIABLES: usize = 65_536;

/// Highest client id; id 0 is the server's own internal client.
pub const MAX_CLIENTS: u16 = 255;

/// Default TCP listener port.
pub const DEFAULT_PORT: u16 = 22099;
