//! Blocked-client queue.
//!
//! A client lands here whenever its request cannot complete without a
//! peer: a pending validation, a pending calc, a pending print, or a
//! multi-part render still streaming out. The entry is the state token
//! that lets the engine finish the request later; no response leaves the
//! server for that client until its entry is resolved.

use std::collections::VecDeque;

use var_protocol::{ClientId, VarHandle};

/// Why the client is waiting.
#[derive(Debug)]
pub enum BlockReason {
    NotifyCalc,
    NotifyValidate,
    NotifyPrint,
    /// Remaining chunks of an oversized GET or PRINT response
    Render { parts: VecDeque<Vec<u8>> },
}

impl BlockReason {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotifyCalc => "calc",
            Self::NotifyValidate => "validate",
            Self::NotifyPrint => "print",
            Self::Render { .. } => "render",
        }
    }
}

/// How to shape the final response once the peer completes.
#[derive(Debug, Clone, Copy)]
pub enum UnblockMode {
    /// Answer like GET: value bytes in the payload
    GetValue,
    /// Answer like GET_FIRST / GET_NEXT: handle, context and item payload
    Iteration { context: u32 },
    /// Answer like SET: a bare result code
    SetResult,
    /// Answer like PRINT: rendered output in the payload
    PrintOutput,
}

#[derive(Debug)]
pub struct BlockedEntry {
    pub client: ClientId,
    pub reason: BlockReason,
    /// Canonical handle of the variable the request targets
    pub handle: VarHandle,
    /// Transaction the entry waits on; 0 for render entries
    pub txn_id: u32,
    pub mode: UnblockMode,
}

/// Queue of suspended clients, in blocking order.
#[derive(Debug, Default)]
pub struct BlockedQueue {
    entries: Vec<BlockedEntry>,
}

impl BlockedQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: BlockedEntry) {
        self.entries.push(entry);
    }

    /// Published as the blocked-clients metric.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the entry waiting on a transaction.
    pub fn take_by_txn(&mut self, txn_id: u32) -> Option<BlockedEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.txn_id == txn_id && txn_id != 0)?;
        Some(self.entries.remove(pos))
    }

    /// Every reader parked on a calc for this variable, in blocking order.
    pub fn take_calc_waiters(&mut self, handle: VarHandle) -> Vec<BlockedEntry> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let hit = matches!(self.entries[i].reason, BlockReason::NotifyCalc)
                && self.entries[i].handle == handle;
            if hit {
                taken.push(self.entries.remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }

    /// The departing client's own entry, if it was blocked.
    pub fn take_by_client(&mut self, client: ClientId) -> Option<BlockedEntry> {
        let pos = self.entries.iter().position(|e| e.client == client)?;
        Some(self.entries.remove(pos))
    }

    /// The client's render entry, for feeding out the next chunk.
    pub fn render_entry_mut(&mut self, client: ClientId) -> Option<&mut BlockedEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.client == client && matches!(e.reason, BlockReason::Render { .. }))
    }

    /// Remove a drained render entry.
    pub fn finish_render(&mut self, client: ClientId) {
        self.entries.retain(|e| {
            !(e.client == client && matches!(e.reason, BlockReason::Render { .. }))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(client: u16, handle: u32, txn_id: u32, reason: BlockReason) -> BlockedEntry {
        BlockedEntry {
            client: ClientId::new(client),
            reason,
            handle: VarHandle::new(handle),
            txn_id,
            mode: UnblockMode::GetValue,
        }
    }

    #[test]
    fn take_by_txn_matches_only_real_ids() {
        let mut queue = BlockedQueue::new();
        queue.push(entry(1, 10, 7, BlockReason::NotifyValidate));
        queue.push(entry(
            2,
            11,
            0,
            BlockReason::Render {
                parts: VecDeque::new(),
            },
        ));
        assert!(queue.take_by_txn(0).is_none());
        let taken = queue.take_by_txn(7).unwrap();
        assert_eq!(taken.client, ClientId::new(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn calc_waiters_are_taken_in_order() {
        let mut queue = BlockedQueue::new();
        queue.push(entry(1, 10, 1, BlockReason::NotifyCalc));
        queue.push(entry(2, 11, 2, BlockReason::NotifyCalc));
        queue.push(entry(3, 10, 3, BlockReason::NotifyCalc));
        let taken = queue.take_calc_waiters(VarHandle::new(10));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].client, ClientId::new(1));
        assert_eq!(taken[1].client, ClientId::new(3));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn client_teardown_takes_its_entry() {
        let mut queue = BlockedQueue::new();
        queue.push(entry(5, 10, 9, BlockReason::NotifyPrint));
        assert!(queue.take_by_client(ClientId::new(6)).is_none());
        assert!(queue.take_by_client(ClientId::new(5)).is_some());
        assert!(queue.is_empty());
    }
}
