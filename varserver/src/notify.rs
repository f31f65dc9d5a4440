//! Notification registry.
//!
//! Per-variable subscriber lists with the registration policy from the
//! dispatcher's contract: MODIFIED and MODIFIED_QUEUE allow many
//! subscribers (deduplicated per client), CALC, VALIDATE and PRINT allow
//! exactly one. A record whose receiver is gone becomes a tombstone
//! (`NotifyKind::None`) and is reused before the list grows.
//!
//! The registry never touches channels itself. Delivery walks happen in
//! two phases: the engine asks for the target list, performs the sends,
//! and reports dead receivers back for tombstoning. The per-variable
//! `mask` always equals the OR of the kinds present in the list.

use std::collections::HashMap;

use var_protocol::{ClientId, NotifyKind, VarErr, VarHandle};

/// One subscription.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    /// `None` marks a tombstone
    pub kind: NotifyKind,
    pub client: ClientId,
    /// The handle the subscriber passed to NOTIFY, preserved across alias
    /// resolution so events carry the handle the subscriber knows.
    pub requested_handle: VarHandle,
    /// Queue mode: armed for the next posting
    pub pending: bool,
}

#[derive(Debug, Default)]
struct VarNotifications {
    records: Vec<NotificationRecord>,
    mask: u32,
}

impl VarNotifications {
    fn recompute_mask(&mut self) {
        self.mask = self
            .records
            .iter()
            .fold(0, |mask, r| mask | r.kind.mask_bit());
    }
}

/// All subscriptions, keyed by canonical variable handle.
#[derive(Debug, Default)]
pub struct NotifyRegistry {
    by_var: HashMap<u32, VarNotifications>,
}

impl NotifyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription on the canonical record.
    ///
    /// Duplicate `(kind, client)` pairs for the fan-out kinds are
    /// absorbed; a second CALC, VALIDATE or PRINT subscriber is refused
    /// with `ENOTSUP`.
    pub fn register(
        &mut self,
        canonical: VarHandle,
        kind: NotifyKind,
        client: ClientId,
        requested_handle: VarHandle,
    ) -> Result<(), VarErr> {
        let entry = self.by_var.entry(canonical.id()).or_default();
        match kind {
            NotifyKind::Modified | NotifyKind::ModifiedQueue => {
                if entry
                    .records
                    .iter()
                    .any(|r| r.kind == kind && r.client == client)
                {
                    return Ok(());
                }
            }
            NotifyKind::Calc | NotifyKind::Validate | NotifyKind::Print => {
                if entry.mask & kind.mask_bit() != 0 {
                    return Err(VarErr::NotSup);
                }
            }
            NotifyKind::None => return Err(VarErr::Inval),
        }
        let record = NotificationRecord {
            kind,
            client,
            requested_handle,
            pending: true,
        };
        // Reuse a tombstone before growing the list
        if let Some(slot) = entry.records.iter_mut().find(|r| r.kind == NotifyKind::None) {
            *slot = record;
        } else {
            entry.records.push(record);
        }
        entry.mask |= kind.mask_bit();
        Ok(())
    }

    /// Drop a subscription. `ENOENT` when no live record matches.
    pub fn cancel(
        &mut self,
        canonical: VarHandle,
        kind: NotifyKind,
        client: ClientId,
    ) -> Result<(), VarErr> {
        let entry = self
            .by_var
            .get_mut(&canonical.id())
            .ok_or(VarErr::NoEnt)?;
        let record = entry
            .records
            .iter_mut()
            .find(|r| r.kind == kind && r.client == client)
            .ok_or(VarErr::NoEnt)?;
        record.kind = NotifyKind::None;
        entry.recompute_mask();
        Ok(())
    }

    /// OR of the kinds currently registered on the variable.
    #[must_use]
    pub fn mask(&self, canonical: VarHandle) -> u32 {
        self.by_var.get(&canonical.id()).map_or(0, |e| e.mask)
    }

    /// The unique CALC / VALIDATE / PRINT subscriber, if any.
    #[must_use]
    pub fn exclusive(
        &self,
        canonical: VarHandle,
        kind: NotifyKind,
    ) -> Option<(ClientId, VarHandle)> {
        self.by_var.get(&canonical.id()).and_then(|e| {
            e.records
                .iter()
                .find(|r| r.kind == kind)
                .map(|r| (r.client, r.requested_handle))
        })
    }

    /// MODIFIED subscribers in registration order.
    #[must_use]
    pub fn modified_targets(&self, canonical: VarHandle) -> Vec<(ClientId, VarHandle)> {
        self.by_var.get(&canonical.id()).map_or_else(Vec::new, |e| {
            e.records
                .iter()
                .filter(|r| r.kind == NotifyKind::Modified)
                .map(|r| (r.client, r.requested_handle))
                .collect()
        })
    }

    /// MODIFIED_QUEUE subscribers currently armed for a posting.
    #[must_use]
    pub fn queue_targets(&self, canonical: VarHandle) -> Vec<(ClientId, VarHandle)> {
        self.by_var.get(&canonical.id()).map_or_else(Vec::new, |e| {
            e.records
                .iter()
                .filter(|r| r.kind == NotifyKind::ModifiedQueue && r.pending)
                .map(|r| (r.client, r.requested_handle))
                .collect()
        })
    }

    /// A queued payload went out: suppress further postings until the
    /// consumer drains.
    pub fn mark_posted(&mut self, canonical: VarHandle, client: ClientId) {
        if let Some(r) = self.queue_record(canonical, client) {
            r.pending = false;
        }
    }

    /// The consumer drained its queue: arm the next posting.
    pub fn rearm(&mut self, canonical: VarHandle, client: ClientId) {
        if let Some(r) = self.queue_record(canonical, client) {
            r.pending = true;
        }
    }

    fn queue_record(
        &mut self,
        canonical: VarHandle,
        client: ClientId,
    ) -> Option<&mut NotificationRecord> {
        self.by_var.get_mut(&canonical.id()).and_then(|e| {
            e.records
                .iter_mut()
                .find(|r| r.kind == NotifyKind::ModifiedQueue && r.client == client)
        })
    }

    /// Delivery found the receiver gone: tombstone that subscription.
    pub fn tombstone(&mut self, canonical: VarHandle, kind: NotifyKind, client: ClientId) {
        if let Some(entry) = self.by_var.get_mut(&canonical.id()) {
            for record in &mut entry.records {
                if record.kind == kind && record.client == client {
                    record.kind = NotifyKind::None;
                }
            }
            entry.recompute_mask();
        }
    }

    /// Tombstone every subscription a departing client holds.
    pub fn sweep_client(&mut self, client: ClientId) {
        for entry in self.by_var.values_mut() {
            let mut changed = false;
            for record in &mut entry.records {
                if record.client == client && record.kind != NotifyKind::None {
                    record.kind = NotifyKind::None;
                    changed = true;
                }
            }
            if changed {
                entry.recompute_mask();
            }
        }
    }
}
