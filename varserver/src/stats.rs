//! Statistics published as ordinary variables.
//!
//! The dispatcher bumps plain counters on every request; a one-second
//! timer tick writes them into `/varserver/stats/*` variables through the
//! normal commit path, so they are readable, printable and watchable like
//! anything else. The client table is rendered to JSON under
//! `/varserver/client/info` whenever a client connects or disconnects.

use serde::Serialize;

use var_protocol::kinds::REQUEST_KIND_COUNT;
use var_protocol::VarHandle;

/// Raw dispatch counters, owned by the engine task.
#[derive(Debug, Default)]
pub struct StatCounters {
    /// All requests ever dispatched
    pub total: u64,
    /// Requests in the current one-second window
    pub window: u64,
    /// Requests in the last completed window
    pub rps: u32,
    /// Indexed by request kind code
    pub per_op: [u64; REQUEST_KIND_COUNT],
}

impl StatCounters {
    /// Close the current window; returns the new requests-per-second.
    pub fn roll_window(&mut self) -> u32 {
        self.rps = u32::try_from(self.window).unwrap_or(u32::MAX);
        self.window = 0;
        self.rps
    }
}

/// Handles of the published statistics variables.
#[derive(Debug)]
pub struct StatVars {
    pub total_requests: VarHandle,
    pub rps: VarHandle,
    pub blocked_clients: VarHandle,
    pub per_op: [VarHandle; REQUEST_KIND_COUNT],
    pub client_info: VarHandle,
}

/// One row of the rendered client table.
#[derive(Debug, Serialize)]
pub struct ClientInfoEntry {
    pub id: u16,
    pub transport: &'static str,
    pub uid: u32,
    pub blocked: bool,
    pub requests: u64,
}
