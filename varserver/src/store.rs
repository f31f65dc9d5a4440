//! Variable store and alias map.
//!
//! Owns every `VarStorage` record, keyed by stable handle. An alias is a
//! second handle resolving to the same record; aliases carry their own
//! name in the name index but share value, flags and permissions.

use std::collections::HashMap;

use var_protocol::{VarErr, VarHandle, VarInfo, VarValue};

use crate::handle::HandleGen;

bitflags::bitflags! {
    /// Per-variable flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VarFlags: u32 {
        /// Modified since creation
        const DIRTY = 1 << 0;
        /// Writes through SET are refused
        const READONLY = 1 << 1;
        /// Skipped by iteration unless asked for explicitly
        const HIDDEN = 1 << 2;
        /// Every committed write is logged
        const AUDIT = 1 << 3;
        /// Doorbell variable; the value is secondary to the event
        const TRIGGER = 1 << 4;
        /// Value changes outside of client writes
        const VOLATILE = 1 << 5;
        /// Never rendered in clear text
        const PASSWORD = 1 << 6;
    }
}

/// Read and write UID lists. Empty list means anyone; UID 0 always passes.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    pub read: Vec<u32>,
    pub write: Vec<u32>,
}

impl AccessList {
    #[must_use]
    pub fn can_read(&self, uid: u32) -> bool {
        uid == 0 || self.read.is_empty() || self.read.contains(&uid)
    }

    #[must_use]
    pub fn can_write(&self, uid: u32) -> bool {
        uid == 0 || self.write.is_empty() || self.write.contains(&uid)
    }
}

/// One canonical variable.
#[derive(Debug)]
pub struct VarStorage {
    /// Canonical handle
    pub handle: VarHandle,
    /// Canonical name
    pub name: String,
    pub instance_id: u32,
    /// Server-unique id, distinct from the handle space
    pub guid: u32,
    pub value: VarValue,
    pub flags: VarFlags,
    /// Interned tag numbers
    pub tags: Vec<u16>,
    /// printf-like format specifier for PRINT
    pub format: Option<String>,
    pub acl: AccessList,
}

/// All variables, plus the alias-to-canonical map.
pub struct VarStore {
    vars: HashMap<u32, VarStorage>,
    aliases: HashMap<u32, u32>,
    gen: HandleGen,
    next_guid: u32,
    capacity: usize,
}

impl VarStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            vars: HashMap::new(),
            aliases: HashMap::new(),
            gen: HandleGen::new(),
            next_guid: 1,
            capacity,
        }
    }

    /// Live records plus aliases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len() + self.aliases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Create a variable from client-supplied info. The caller has already
    /// reserved the name in the name index and interned the tags.
    pub fn create(&mut self, info: &VarInfo, tags: Vec<u16>, flags: VarFlags) -> Result<VarHandle, VarErr> {
        if self.is_full() {
            return Err(VarErr::NoMem);
        }
        let handle = self.gen.next().ok_or(VarErr::NoMem)?;
        let guid = self.next_guid;
        self.next_guid = self.next_guid.wrapping_add(1);
        self.vars.insert(
            handle.id(),
            VarStorage {
                handle,
                name: info.name.clone(),
                instance_id: info.instance_id,
                guid,
                value: info.value.clone(),
                flags,
                tags,
                format: info.format.clone(),
                acl: AccessList {
                    read: info.read_acl.clone(),
                    write: info.write_acl.clone(),
                },
            },
        );
        Ok(handle)
    }

    /// Add an alias handle for an existing variable. The caller has
    /// already reserved the alias name.
    pub fn add_alias(&mut self, handle: VarHandle) -> Result<VarHandle, VarErr> {
        let canonical = self.canonical(handle).ok_or(VarErr::NoEnt)?;
        if self.is_full() {
            return Err(VarErr::NoMem);
        }
        let alias = self.gen.next().ok_or(VarErr::NoMem)?;
        self.aliases.insert(alias.id(), canonical.id());
        Ok(alias)
    }

    /// Resolve any handle (canonical or alias) to the canonical handle.
    #[must_use]
    pub fn canonical(&self, handle: VarHandle) -> Option<VarHandle> {
        if self.vars.contains_key(&handle.id()) {
            return Some(handle);
        }
        self.aliases
            .get(&handle.id())
            .map(|id| VarHandle::new(*id))
    }

    /// Resolve a handle to its storage record.
    #[must_use]
    pub fn get(&self, handle: VarHandle) -> Option<&VarStorage> {
        let canonical = self.canonical(handle)?;
        self.vars.get(&canonical.id())
    }

    pub fn get_mut(&mut self, handle: VarHandle) -> Option<&mut VarStorage> {
        let canonical = self.canonical(handle)?;
        self.vars.get_mut(&canonical.id())
    }

    /// Every handle resolving to the same storage: the canonical handle
    /// first, then the aliases in handle order.
    #[must_use]
    pub fn aliases_of(&self, handle: VarHandle) -> Option<Vec<VarHandle>> {
        let canonical = self.canonical(handle)?;
        let mut handles = vec![canonical];
        let mut rest: Vec<VarHandle> = self
            .aliases
            .iter()
            .filter(|(_, c)| **c == canonical.id())
            .map(|(a, _)| VarHandle::new(*a))
            .collect();
        rest.sort();
        handles.extend(rest);
        Some(handles)
    }

    /// Canonical handles in creation order, for iteration snapshots.
    #[must_use]
    pub fn canonical_handles(&self) -> Vec<VarHandle> {
        let mut handles: Vec<VarHandle> =
            self.vars.keys().map(|id| VarHandle::new(*id)).collect();
        handles.sort();
        handles
    }
}
