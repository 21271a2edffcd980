//! The ordered list of groups of a query cache.

use std::collections::HashMap;

use super::TableMatches;
use crate::query::builder::GroupCtx;
use crate::slab::Slab;

/// A partition of the tables of a query cache.
pub(crate) struct Group {
    pub(crate) id:          u64,
    pub(crate) tables:      Vec<TableMatches>,
    /// Incremented whenever a table enters or leaves the group.
    pub(crate) match_count: u32,
    pub(crate) ctx:         Option<GroupCtx>,
    pub(crate) next:        Option<usize>,
}

/// Groups linked in ascending or descending order of their id.
pub(crate) struct GroupList {
    groups: Slab<Group>,
    index:  HashMap<u64, usize>,
    first:  Option<usize>,
    desc:   bool,
}

impl GroupList {
    pub(crate) fn new(desc: bool) -> Self {
        Self { groups: Slab::default(), index: HashMap::new(), first: None, desc }
    }

    pub(crate) fn first(&self) -> Option<usize> { self.first }

    pub(crate) fn slot(&self, id: u64) -> Option<usize> { self.index.get(&id).copied() }

    pub(crate) fn get(&self, slot: usize) -> &Group { self.groups.get(slot).expect("group slot is live") }

    pub(crate) fn get_mut(&mut self, slot: usize) -> &mut Group {
        self.groups.get_mut(slot).expect("group slot is live")
    }

    pub(crate) fn by_id(&self, id: u64) -> Option<&Group> { self.slot(id).map(|slot| self.get(slot)) }

    pub(crate) fn len(&self) -> usize { self.groups.len() }

    /// Whether a group with id `a` is visited before a group with id `b`.
    fn precedes(&self, a: u64, b: u64) -> bool {
        if self.desc {
            a > b
        } else {
            a < b
        }
    }

    /// Inserts a new group after the last group that precedes it.
    pub(crate) fn insert(&mut self, id: u64, ctx: Option<GroupCtx>) -> usize {
        debug_assert!(!self.index.contains_key(&id), "group {id} already exists");

        let mut prev = None;
        let mut cursor = self.first;
        while let Some(slot) = cursor {
            let group = self.get(slot);
            if !self.precedes(group.id, id) {
                break;
            }
            prev = Some(slot);
            cursor = group.next;
        }

        let slot = self.groups.insert(Group { id, tables: Vec::new(), match_count: 0, ctx, next: cursor });
        match prev {
            Some(prev) => self.get_mut(prev).next = Some(slot),
            None => self.first = Some(slot),
        }
        self.index.insert(id, slot);
        slot
    }

    /// Unlinks and returns a group.
    pub(crate) fn remove(&mut self, slot: usize) -> Group {
        let next = self.get(slot).next;

        if self.first == Some(slot) {
            self.first = next;
        } else {
            let mut cursor = self.first;
            while let Some(current) = cursor {
                let group = self.get_mut(current);
                if group.next == Some(slot) {
                    group.next = next;
                    break;
                }
                cursor = group.next;
            }
        }

        let group = self.groups.remove(slot).expect("group slot is live");
        self.index.remove(&group.id);
        group
    }

    /// Iterates groups in order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Group> + '_ {
        let mut cursor = self.first;
        std::iter::from_fn(move || {
            let group = self.get(cursor?);
            cursor = group.next;
            Some(group)
        })
    }
}
