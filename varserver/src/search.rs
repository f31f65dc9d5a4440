//! Iteration over the variable set.
//!
//! GET_FIRST snapshots the candidate handles and stores a cursor scoped
//! to the initiating client; GET_NEXT advances it. Snapshotting keeps a
//! traversal stable against concurrent creation: a variable is never
//! reported twice, and variables created mid-scan simply do not appear.

use std::collections::HashMap;

use var_protocol::{ClientId, SearchQuery, VarHandle};

use crate::store::{VarFlags, VarStorage};
use crate::tags::TagTable;

/// A query with its selectors resolved against the server's tables.
#[derive(Debug, Default)]
pub struct QuerySpec {
    pub name_match: Option<String>,
    pub instance_id: Option<u32>,
    pub flags: VarFlags,
    /// Interned tag numbers. `None` when the query named a tag the server
    /// has never seen, which cannot match anything.
    pub tags: Option<Vec<u16>>,
}

impl QuerySpec {
    /// Resolve tag names case-insensitively through the tag table.
    #[must_use]
    pub fn resolve(query: &SearchQuery, tags: &TagTable) -> Self {
        let mut resolved = Vec::with_capacity(query.tags.len());
        for name in &query.tags {
            match tags.lookup(name) {
                Some(tag) => resolved.push(tag),
                None => {
                    return Self {
                        name_match: query.name_match.clone(),
                        instance_id: query.instance_id,
                        flags: VarFlags::from_bits_truncate(query.flags),
                        tags: None,
                    }
                }
            }
        }
        Self {
            name_match: query.name_match.clone(),
            instance_id: query.instance_id,
            flags: VarFlags::from_bits_truncate(query.flags),
            tags: Some(resolved),
        }
    }

    /// Every populated selector must match. Hidden variables only match
    /// when the query asks for the hidden flag explicitly.
    #[must_use]
    pub fn matches(&self, var: &VarStorage) -> bool {
        let Some(required_tags) = &self.tags else {
            return false;
        };
        if var.flags.contains(VarFlags::HIDDEN) && !self.flags.contains(VarFlags::HIDDEN) {
            return false;
        }
        if let Some(needle) = &self.name_match {
            if !var.name.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(instance) = self.instance_id {
            if var.instance_id != instance {
                return false;
            }
        }
        if !var.flags.contains(self.flags) {
            return false;
        }
        required_tags.iter().all(|tag| var.tags.contains(tag))
    }
}

/// One in-flight traversal.
#[derive(Debug)]
pub struct SearchContext {
    pub id: u32,
    /// Snapshot of matching canonical handles
    pub handles: Vec<VarHandle>,
    pub pos: usize,
}

impl SearchContext {
    /// The next not-yet-reported handle, advancing the cursor.
    pub fn advance(&mut self) -> Option<VarHandle> {
        let handle = self.handles.get(self.pos).copied()?;
        self.pos += 1;
        Some(handle)
    }
}

/// At most one live context per client; a new scan replaces the old one.
#[derive(Debug, Default)]
pub struct SearchContexts {
    by_client: HashMap<u16, SearchContext>,
    next_id: u32,
}

impl SearchContexts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a traversal, returning its context id.
    pub fn begin(&mut self, client: ClientId, handles: Vec<VarHandle>) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        self.by_client.insert(
            client.id(),
            SearchContext {
                id,
                handles,
                pos: 0,
            },
        );
        id
    }

    pub fn get_mut(&mut self, client: ClientId, context_id: u32) -> Option<&mut SearchContext> {
        self.by_client
            .get_mut(&client.id())
            .filter(|ctx| ctx.id == context_id)
    }

    /// Drop a finished traversal.
    pub fn finish(&mut self, client: ClientId, context_id: u32) {
        if let Some(ctx) = self.by_client.get(&client.id()) {
            if ctx.id == context_id {
                self.by_client.remove(&client.id());
            }
        }
    }

    pub fn drop_client(&mut self, client: ClientId) {
        self.by_client.remove(&client.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use var_protocol::{VarInfo, VarValue};

    use crate::store::{AccessList, VarStorage};

    fn var(name: &str, instance_id: u32, flags: VarFlags, tags: Vec<u16>) -> VarStorage {
        let info = VarInfo::new(name, VarValue::Int32(0));
        VarStorage {
            handle: VarHandle::new(1),
            name: info.name,
            instance_id,
            guid: 1,
            value: info.value,
            flags,
            tags,
            format: None,
            acl: AccessList::default(),
        }
    }

    fn spec(query: SearchQuery, tags: &TagTable) -> QuerySpec {
        QuerySpec::resolve(&query, tags)
    }

    #[test]
    fn empty_query_matches_everything_visible() {
        let tags = TagTable::new();
        let q = spec(SearchQuery::default(), &tags);
        assert!(q.matches(&var("/a", 0, VarFlags::empty(), Vec::new())));
        assert!(!q.matches(&var("/a", 0, VarFlags::HIDDEN, Vec::new())));
    }

    #[test]
    fn hidden_is_matched_when_asked_for() {
        let tags = TagTable::new();
        let q = spec(
            SearchQuery {
                flags: VarFlags::HIDDEN.bits(),
                ..SearchQuery::default()
            },
            &tags,
        );
        assert!(q.matches(&var("/a", 0, VarFlags::HIDDEN, Vec::new())));
        assert!(!q.matches(&var("/a", 0, VarFlags::empty(), Vec::new())));
    }

    #[test]
    fn name_and_instance_selectors() {
        let tags = TagTable::new();
        let q = spec(
            SearchQuery {
                name_match: Some("/sys/".to_string()),
                instance_id: Some(2),
                ..SearchQuery::default()
            },
            &tags,
        );
        assert!(q.matches(&var("/sys/temp", 2, VarFlags::empty(), Vec::new())));
        assert!(!q.matches(&var("/sys/temp", 3, VarFlags::empty(), Vec::new())));
        assert!(!q.matches(&var("/net/temp", 2, VarFlags::empty(), Vec::new())));
    }

    #[test]
    fn unknown_tag_matches_nothing() {
        let mut tags = TagTable::new();
        let hw = tags.intern("hw").unwrap();
        let q = spec(
            SearchQuery {
                tags: vec!["missing".to_string()],
                ..SearchQuery::default()
            },
            &tags,
        );
        assert!(!q.matches(&var("/a", 0, VarFlags::empty(), vec![hw])));
    }

    #[test]
    fn tag_selector_requires_all_tags() {
        let mut tags = TagTable::new();
        let hw = tags.intern("hw").unwrap();
        let dbg = tags.intern("debug").unwrap();
        let q = spec(
            SearchQuery {
                tags: vec!["HW".to_string(), "Debug".to_string()],
                ..SearchQuery::default()
            },
            &tags,
        );
        assert!(q.matches(&var("/a", 0, VarFlags::empty(), vec![hw, dbg])));
        assert!(!q.matches(&var("/a", 0, VarFlags::empty(), vec![hw])));
    }

    #[test]
    fn contexts_replace_and_advance() {
        let mut contexts = SearchContexts::new();
        let client = ClientId::new(3);
        let first = contexts.begin(client, vec![VarHandle::new(1), VarHandle::new(2)]);

        let ctx = contexts.get_mut(client, first).unwrap();
        assert_eq!(ctx.advance(), Some(VarHandle::new(1)));

        // A new scan invalidates the old context id
        let second = contexts.begin(client, vec![VarHandle::new(9)]);
        assert!(contexts.get_mut(client, first).is_none());
        let ctx = contexts.get_mut(client, second).unwrap();
        assert_eq!(ctx.advance(), Some(VarHandle::new(9)));
        assert_eq!(ctx.advance(), None);

        contexts.finish(client, second);
        assert!(contexts.get_mut(client, second).is_none());
    }
}
