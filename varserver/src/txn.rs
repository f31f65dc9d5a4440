//! Cross-client transaction table.
//!
//! A transaction exists exactly while one client is blocked waiting for a
//! peer: a setter waiting for its validator, a reader waiting for a
//! calculator, a print requester waiting for its renderer. Ids are
//! monotonic; when the counter would wrap to zero, new transactions are
//! refused until the table drains.

use std::collections::HashMap;

use var_protocol::{ClientId, VarErr, VarHandle, VarValue};

/// The requestor's in-flight state.
#[derive(Debug)]
pub enum TxnState {
    /// A SET held back until the validator answers
    Validate { proposed: VarValue },
    /// A GET held back until the calculator writes
    Calc,
    /// A PRINT held back until the renderer closes the session
    Print {
        output: Vec<u8>,
        stream_attached: bool,
    },
}

#[derive(Debug)]
pub struct TxnRecord {
    pub id: u32,
    /// The blocked client this transaction will eventually answer
    pub requestor: ClientId,
    /// The peer acting on the transaction
    pub server: ClientId,
    /// Canonical variable handle
    pub handle: VarHandle,
    pub state: TxnState,
}

#[derive(Debug)]
pub struct TxnTable {
    next_id: u32,
    active: HashMap<u32, TxnRecord>,
}

impl TxnTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            active: HashMap::new(),
        }
    }

    pub fn create(
        &mut self,
        requestor: ClientId,
        server: ClientId,
        handle: VarHandle,
        state: TxnState,
    ) -> Result<u32, VarErr> {
        if self.next_id == 0 {
            // Counter wrapped. Restart only once every in-flight id is gone.
            if !self.active.is_empty() {
                return Err(VarErr::NoMem);
            }
            self.next_id = 1;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.active.insert(
            id,
            TxnRecord {
                id,
                requestor,
                server,
                handle,
                state,
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&TxnRecord> {
        self.active.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut TxnRecord> {
        self.active.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<TxnRecord> {
        self.active.remove(&id)
    }

    /// Drop every transaction the departing client requested.
    pub fn remove_by_requestor(&mut self, client: ClientId) -> Vec<TxnRecord> {
        let ids: Vec<u32> = self
            .active
            .values()
            .filter(|t| t.requestor == client)
            .map(|t| t.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.active.remove(&id))
            .collect()
    }

    /// Drop every transaction the departing client was serving; the
    /// requestors still need their ENOENT answers.
    pub fn remove_by_server(&mut self, client: ClientId) -> Vec<TxnRecord> {
        let ids: Vec<u32> = self
            .active
            .values()
            .filter(|t| t.server == client)
            .map(|t| t.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.active.remove(&id))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl Default for TxnTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut table = TxnTable::new();
        let a = table
            .create(ClientId::new(1), ClientId::new(2), VarHandle::new(5), TxnState::Calc)
            .unwrap();
        let b = table
            .create(ClientId::new(1), ClientId::new(2), VarHandle::new(5), TxnState::Calc)
            .unwrap();
        assert!(b > a);
        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
    }

    #[test]
    fn wrap_refuses_until_drained() {
        let mut table = TxnTable::new();
        table.next_id = u32::MAX;
        let id = table
            .create(ClientId::new(1), ClientId::new(2), VarHandle::new(5), TxnState::Calc)
            .unwrap();
        assert_eq!(id, u32::MAX);
        // Counter is now 0 and an id is still active: refuse.
        assert_eq!(
            table
                .create(ClientId::new(1), ClientId::new(2), VarHandle::new(5), TxnState::Calc)
                .unwrap_err(),
            VarErr::NoMem
        );
        table.remove(id).unwrap();
        let restarted = table
            .create(ClientId::new(1), ClientId::new(2), VarHandle::new(5), TxnState::Calc)
            .unwrap();
        assert_eq!(restarted, 1);
    }

    #[test]
    fn removal_by_role() {
        let mut table = TxnTable::new();
        let a = table
            .create(ClientId::new(1), ClientId::new(9), VarHandle::new(5), TxnState::Calc)
            .unwrap();
        let b = table
            .create(ClientId::new(2), ClientId::new(9), VarHandle::new(6), TxnState::Calc)
            .unwrap();
        let c = table
            .create(ClientId::new(1), ClientId::new(8), VarHandle::new(7), TxnState::Calc)
            .unwrap();

        let mine = table.remove_by_requestor(ClientId::new(1));
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|t| t.id == a || t.id == c));

        let served = table.remove_by_server(ClientId::new(9));
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].id, b);
        assert!(table.is_empty());
    }
}
