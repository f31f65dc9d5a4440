//! Name index: variable name to handle.
//!
//! A fixed bucket array with chained entries. The bucket count is a power
//! of two so the FNV-1a hash can be masked instead of divided; typical
//! hierarchical names like `/a/b/c` spread well under FNV. Lookups are
//! case-sensitive.

use var_protocol::{VarErr, VarHandle};

const BUCKET_COUNT: usize = 1024;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(name: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Debug)]
struct IndexEntry {
    name: String,
    handle: VarHandle,
}

/// Fixed-capacity chained hash table over variable and alias names.
#[derive(Debug)]
pub struct NameIndex {
    buckets: Vec<Vec<IndexEntry>>,
    len: usize,
    capacity: usize,
}

impl NameIndex {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Vec::new);
        Self {
            buckets,
            len: 0,
            capacity,
        }
    }

    fn bucket(&self, name: &str) -> usize {
        (fnv1a(name) as usize) & (BUCKET_COUNT - 1)
    }

    pub fn insert(&mut self, name: &str, handle: VarHandle) -> Result<(), VarErr> {
        if self.len >= self.capacity {
            return Err(VarErr::NoMem);
        }
        let bucket = self.bucket(name);
        if self.buckets[bucket].iter().any(|e| e.name == name) {
            return Err(VarErr::Exist);
        }
        self.buckets[bucket].push(IndexEntry {
            name: name.to_string(),
            handle,
        });
        self.len += 1;
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<VarHandle> {
        self.buckets[self.bucket(name)]
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.handle)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<VarHandle> {
        let bucket = self.bucket(name);
        let pos = self.buckets[bucket].iter().position(|e| e.name == name)?;
        let entry = self.buckets[bucket].swap_remove(pos);
        self.len -= 1;
        Some(entry.handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }
}
