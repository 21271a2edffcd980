//! Table-keyed caches that separate empty and non-empty tables.
//!
//! A [`TableCache`] stores one entry per table in one of two doubly linked lists,
//! depending on whether the table currently has rows.
//! Iterating the non-empty list never visits empty tables,
//! and moving a table between the lists is O(1),
//! which keeps the row count transitions of every entity move cheap.
//!
//! Entries live in an arena and are linked by index,
//! so they stay valid when the arena grows.
//! A [`Cursor`] captures the next entry before yielding the current one,
//! so the owner may remove the current entry between two steps.

use std::fmt;

use indexmap::IndexMap;

use crate::slab::Slab;
use crate::table::{Table, TableId};

/// The arena index of an entry in a [`TableCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

/// A table as seen by a [`TableCache`]: its identity and current row count.
pub trait CachedTable {
    /// The stable identity of the table.
    fn id(&self) -> TableId;
    /// The number of rows in the table.
    fn count(&self) -> usize;
}

impl CachedTable for Table {
    fn id(&self) -> TableId { Table::id(self) }

    fn count(&self) -> usize { Table::count(self) }
}

/// A cache entry, i.e. the list node wrapping the owner's per-table value.
pub struct Entry<T> {
    table: Option<TableId>,
    empty: bool,
    prev:  Option<EntryId>,
    next:  Option<EntryId>,
    value: T,
}

impl<T> Entry<T> {
    /// The table of this entry. `None` for the "no `$this`" entry.
    pub fn table(&self) -> Option<TableId> { self.table }

    /// Whether the entry is in the empty list.
    pub fn is_empty(&self) -> bool { self.empty }

    /// The owner's value for this table.
    pub fn value(&self) -> &T { &self.value }

    /// The previous entry in the same list.
    pub fn prev(&self) -> Option<EntryId> { self.prev }

    /// The next entry in the same list.
    pub fn next(&self) -> Option<EntryId> { self.next }
}

#[derive(Debug, Default, Clone, Copy)]
struct List {
    first: Option<EntryId>,
    last:  Option<EntryId>,
    count: usize,
}

/// Maps tables to entries of type `T`, partitioned into an empty and a non-empty list.
pub struct TableCache<T> {
    index:     IndexMap<TableId, EntryId>,
    entries:   Slab<Entry<T>>,
    non_empty: List,
    empty:     List,
}

impl<T> Default for TableCache<T> {
    fn default() -> Self {
        Self {
            index:     IndexMap::new(),
            entries:   Slab::default(),
            non_empty: List::default(),
            empty:     List::default(),
        }
    }
}

impl<T> TableCache<T> {
    /// Creates an empty cache.
    pub fn new() -> Self { Self::default() }

    /// Tears down the cache.
    ///
    /// # Panics
    /// Panics if entries are still present.
    /// Owners must remove their entries individually before destroying the cache.
    pub fn fini(self) {
        assert!(self.entries.is_empty(), "table cache destroyed with {} entries", self.entries.len());
    }

    /// The number of entries in the cache.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// The number of entries for tables with rows.
    pub fn non_empty_count(&self) -> usize { self.non_empty.count }

    /// The number of entries for tables without rows.
    pub fn empty_count(&self) -> usize { self.empty.count }

    /// Whether the cache has an entry for `table`.
    pub fn contains(&self, table: TableId) -> bool { self.index.contains_key(&table) }

    fn list_mut(&mut self, empty: bool) -> &mut List {
        if empty {
            &mut self.empty
        } else {
            &mut self.non_empty
        }
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut Entry<T> {
        self.entries.get_mut(id.0).expect("linked entry is live")
    }

    /// Returns the entry at an arena index.
    pub fn entry(&self, id: EntryId) -> Option<&Entry<T>> { self.entries.get(id.0) }

    /// Inserts an entry for `table`, classifying it as empty by the table's row count.
    ///
    /// `None` inserts the "no `$this`" entry, which is never empty and not indexed.
    ///
    /// # Panics
    /// Panics if the cache already has an entry for `table`.
    pub fn insert(&mut self, table: Option<&impl CachedTable>, value: T) -> EntryId {
        let empty = table.map_or(false, |table| table.count() == 0);
        let table = table.map(|table| table.id());

        if let Some(table) = table {
            assert!(!self.index.contains_key(&table), "{table:?} is already in the table cache");
        }

        let id = EntryId(self.entries.insert(Entry { table, empty, prev: None, next: None, value }));
        self.link(id, empty);

        if let Some(table) = table {
            self.index.insert(table, id);
        }

        id
    }

    /// Replaces the value of an existing entry in place, returning the previous value.
    ///
    /// The entry keeps its list position.
    ///
    /// # Panics
    /// Panics if `table` has no entry.
    pub fn replace(&mut self, table: TableId, value: T) -> T {
        let id = *self.index.get(&table).unwrap_or_else(|| panic!("{table:?} is not in the table cache"));
        std::mem::replace(&mut self.entry_mut(id).value, value)
    }

    /// Returns the value for `table`.
    ///
    /// `None` returns the head of the non-empty list,
    /// which holds the entry of queries that do not match on tables.
    pub fn get(&self, table: Option<TableId>) -> Option<&T> {
        let id = match table {
            Some(table) => *self.index.get(&table)?,
            None => self.non_empty.first?,
        };
        self.entries.get(id.0).map(|entry| &entry.value)
    }

    /// Returns the value for `table` mutably.
    pub fn get_mut(&mut self, table: TableId) -> Option<&mut T> {
        let id = *self.index.get(&table)?;
        self.entries.get_mut(id.0).map(|entry| &mut entry.value)
    }

    /// Returns the full entry for `table`.
    pub fn get_entry(&self, table: TableId) -> Option<&Entry<T>> {
        let id = *self.index.get(&table)?;
        self.entries.get(id.0)
    }

    /// Removes the entry for `table` and returns its value.
    ///
    /// # Panics
    /// Panics if `table` has no entry.
    pub fn remove(&mut self, table: TableId) -> T {
        let id =
            self.index.swap_remove(&table).unwrap_or_else(|| panic!("{table:?} is not in the table cache"));
        self.unlink(id);
        self.entries.remove(id.0).expect("indexed entry is live").value
    }

    /// Moves the entry of `table` to the tail of the list matching `empty`.
    ///
    /// Returns `false` if the table has no entry or the entry is already in that list.
    pub fn set_empty(&mut self, table: TableId, empty: bool) -> bool {
        let Some(&id) = self.index.get(&table) else { return false };
        if self.entry_mut(id).empty == empty {
            return false;
        }

        self.unlink(id);
        self.entry_mut(id).empty = empty;
        self.link(id, empty);
        true
    }

    fn link(&mut self, id: EntryId, empty: bool) {
        let last = self.list_mut(empty).last;

        {
            let entry = self.entry_mut(id);
            entry.prev = last;
            entry.next = None;
        }

        match last {
            Some(last) => self.entry_mut(last).next = Some(id),
            None => self.list_mut(empty).first = Some(id),
        }

        let list = self.list_mut(empty);
        list.last = Some(id);
        list.count += 1;
    }

    fn unlink(&mut self, id: EntryId) {
        let entry = self.entry_mut(id);
        let (prev, next, empty) = (entry.prev.take(), entry.next.take(), entry.empty);

        match prev {
            Some(prev) => self.entry_mut(prev).next = next,
            None => self.list_mut(empty).first = next,
        }
        match next {
            Some(next) => self.entry_mut(next).prev = prev,
            None => self.list_mut(empty).last = prev,
        }

        let list = self.list_mut(empty);
        debug_assert!(list.count > 0, "unlinking from an empty list");
        list.count -= 1;
    }

    /// A cursor over the non-empty list.
    pub fn cursor(&self) -> Cursor { Cursor { cur: self.non_empty.first, then: None } }

    /// A cursor over the empty list.
    pub fn empty_cursor(&self) -> Cursor { Cursor { cur: self.empty.first, then: None } }

    /// A cursor over the empty list followed by the non-empty list.
    pub fn all_cursor(&self) -> Cursor {
        Cursor { cur: self.empty.first, then: self.non_empty.first }
    }

    /// Iterates over entries of tables with rows.
    pub fn iter(&self) -> Iter<'_, T> { Iter { cache: self, cursor: self.cursor() } }

    /// Iterates over entries of tables without rows.
    pub fn empty_iter(&self) -> Iter<'_, T> { Iter { cache: self, cursor: self.empty_cursor() } }

    /// Iterates over all entries, empty tables first.
    pub fn all_iter(&self) -> Iter<'_, T> { Iter { cache: self, cursor: self.all_cursor() } }

    /// Returns the tables of all entries, empty tables first.
    pub fn tables(&self) -> Vec<TableId> {
        self.all_iter().filter_map(|entry| entry.table).collect()
    }
}

impl<T> fmt::Debug for TableCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableCache")
            .field("non_empty", &self.iter().map(|entry| entry.table).collect::<Vec<_>>())
            .field("empty", &self.empty_iter().map(|entry| entry.table).collect::<Vec<_>>())
            .finish()
    }
}

/// A detached position in a [`TableCache`] list.
///
/// A cursor does not borrow the cache,
/// so it can be stored across calls and advanced against the same cache later.
/// The only mutation allowed between two steps is removing the entry last returned.
#[derive(Debug, Default, Clone, Copy)]
pub struct Cursor {
    cur:  Option<EntryId>,
    then: Option<EntryId>,
}

impl Cursor {
    /// Returns the next entry and advances the cursor.
    pub fn next<'c, T>(&mut self, cache: &'c TableCache<T>) -> Option<&'c Entry<T>> {
        let id = match self.cur {
            Some(id) => id,
            None => self.then.take()?,
        };
        let entry = cache.entries.get(id.0).expect("cursor points to a live entry");
        self.cur = entry.next;
        Some(entry)
    }
}

/// A lazy, non-restartable iterator over a [`TableCache`] list.
pub struct Iter<'c, T> {
    cache:  &'c TableCache<T>,
    cursor: Cursor,
}

impl<'c, T> Iterator for Iter<'c, T> {
    type Item = &'c Entry<T>;

    fn next(&mut self) -> Option<Self::Item> { self.cursor.next(self.cache) }
}
