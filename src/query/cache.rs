//! The query cache incrementally maintains the tables matched by the cacheable terms of a query.
//!
//! Matched tables are partitioned into groups.
//! Groups are linked in the order of their id,
//! and each group stores the matches of its tables in a vector.
//! The table cache of the query maps each table to its group and its index in that vector,
//! and tracks which matched tables are empty.
//!
//! The world notifies the cache when tables are created or deleted
//! and when they become empty or non-empty.
//! When an entity that is the target of a traversable relationship moves,
//! caches with traversal terms rematch all tables.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::builder::{GroupBy, GroupCreateFn, GroupDeleteFn, OrderBy};
use super::compiler::CacheSpec;
use super::engine::{Engine, VarValue};
use super::plan::THIS;
use super::term::{InOut, Oper, TermRef, Trav};
use super::{GroupInfo, QueryId, QueryImpl};
use crate::table::TableRange;
use crate::table_cache::TableCache;
use crate::{Entity, Id, Table, TableId, World};

mod group;
use group::GroupList;

pub(crate) mod sort;
use sort::{Slice, SortState};

#[cfg(test)]
mod tests;

/// One way a table matches the cached terms.
///
/// A table has one match for each combination of wildcard matches.
pub(crate) struct Match {
    pub(crate) table:      TableId,
    /// The matched id of each field.
    pub(crate) ids:        Box<[Id]>,
    /// The column of each field matched on the table itself.
    pub(crate) columns:    Box<[Option<usize>]>,
    /// The source of each field, null if matched on the table itself.
    pub(crate) sources:    Box<[Entity]>,
    pub(crate) set_fields: u64,
    pub(crate) up_fields:  u64,
    /// The dirty state observed by the last complete iteration.
    /// Slot 0 is the row version of the table, slot `f + 1` the column version of field `f`.
    pub(crate) monitor:    OnceLock<Box<[AtomicU32]>>,
}

impl Match {
    fn same_as(&self, other: &Match) -> bool {
        self.ids == other.ids
            && self.columns == other.columns
            && self.sources == other.sources
            && self.set_fields == other.set_fields
            && self.up_fields == other.up_fields
    }
}

/// The matches of one table.
pub(crate) struct TableMatches {
    pub(crate) table:   TableId,
    pub(crate) group:   u64,
    pub(crate) matches: Box<[Match]>,
}

impl TableMatches {
    pub(crate) fn get(&self, index: usize) -> Option<&Match> { self.matches.get(index) }
}

/// The position of a table in the groups.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheTable {
    group: u64,
    index: usize,
}

pub(crate) struct QueryCache {
    id:               QueryId,
    /// Evaluates the cached terms on a single table.
    query:            QueryImpl,
    tables:           TableCache<CacheTable>,
    groups:           GroupList,
    group_by:         Option<GroupBy>,
    on_group_create:  Option<GroupCreateFn>,
    on_group_delete:  Option<GroupDeleteFn>,
    order_by:         Option<OrderBy>,
    sort:             Mutex<SortState>,
    has_refs:         bool,
    /// Whether each field is tracked for change detection.
    tracked:          Box<[bool]>,
    /// Incremented whenever a table enters or leaves the cache or changes its matches.
    match_count:      u32,
    prev_match_count: AtomicU32,
}

impl QueryCache {
    pub(crate) fn new(world: &World, id: QueryId, spec: CacheSpec) -> Self {
        let desc = spec.group_by.as_ref().map_or(false, |group_by| group_by.desc);
        let tracked = spec
            .query
            .fields
            .iter()
            .map(|field| {
                field.term.inout != InOut::None
                    && field.term.src == TermRef::This
                    && field.term.trav == Trav::SelfOnly
                    && !matches!(field.term.oper, Oper::Not | Oper::NotFrom)
            })
            .collect();

        let mut cache = Self {
            id,
            query: spec.query,
            tables: TableCache::new(),
            groups: GroupList::new(desc),
            group_by: spec.group_by,
            on_group_create: spec.on_group_create,
            on_group_delete: spec.on_group_delete,
            order_by: spec.order_by,
            sort: Mutex::new(SortState::default()),
            has_refs: spec.has_refs,
            tracked,
            match_count: 0,
            prev_match_count: AtomicU32::new(0),
        };

        // the default group always exists
        cache.ensure_group(world, 0);
        cache
    }

    /// Whether matches depend on entities other than the matched table.
    pub(crate) fn has_refs(&self) -> bool { self.has_refs }

    pub(crate) fn table_count(&self) -> usize { self.tables.len() }

    pub(crate) fn group_ids(&self) -> Vec<u64> { self.groups.iter().map(|group| group.id).collect() }

    pub(crate) fn group_info(&self, id: u64) -> Option<GroupInfo<'_>> {
        let group = self.groups.by_id(id)?;
        Some(GroupInfo {
            table_count: group.tables.len(),
            match_count: group.match_count,
            ctx:         group.ctx.as_deref(),
        })
    }

    pub(crate) fn table_matches(&self, table: TableId) -> Option<&TableMatches> {
        let entry = self.tables.get(Some(table))?;
        let slot = self.groups.slot(entry.group).expect("cached table is in a live group");
        let matches = &self.groups.get(slot).tables[entry.index];
        assert_eq!(matches.table, table, "group of {table:?} is out of sync with the table cache");
        Some(matches)
    }

    fn ensure_group(&mut self, world: &World, id: u64) -> usize {
        if let Some(slot) = self.groups.slot(id) {
            return slot;
        }

        let ctx = self.on_group_create.as_ref().and_then(|callback| callback(world, id));
        world.tracer().create_group(self.id, id);
        self.groups.insert(id, ctx)
    }

    fn delete_group(&mut self, world: &World, slot: usize) {
        let group = self.groups.remove(slot);
        debug_assert!(group.tables.is_empty(), "deleting group {} with tables", group.id);

        if let Some(callback) = &self.on_group_delete {
            callback(world, group.id, group.ctx);
        }
        world.tracer().delete_group(self.id, group.id);
    }

    /// Computes the group of a table.
    fn group_id(&self, world: &World, table: &Table) -> u64 {
        let Some(group_by) = &self.group_by else { return 0 };

        if let Some(callback) = &group_by.callback {
            callback(world, table, group_by.rel)
        } else if group_by.cascade {
            world.depth(table, group_by.rel)
        } else {
            world.target_of(table, group_by.rel).map_or(0, Entity::to_bits)
        }
    }

    /// Evaluates the cached terms on one table.
    fn evaluate(&self, world: &World, table: &Table) -> Vec<Match> {
        if !self.query.flags.accepts(table) {
            return Vec::new();
        }

        let mut engine = Engine::new(world, &self.query);
        engine.constrain(THIS, VarValue {
            range:  Some(TableRange { table: table.id(), offset: 0, count: table.count() }),
            entity: None,
        });

        let mut matches = Vec::new();
        while engine.next() {
            let fields = &engine.state.fields;
            matches.push(Match {
                table:      table.id(),
                ids:        fields.iter().map(|slot| slot.id).collect(),
                columns:    fields
                    .iter()
                    .map(|slot| if slot.src.is_null() { slot.column.map(|column| column.column) } else { None })
                    .collect(),
                sources:    fields.iter().map(|slot| slot.src).collect(),
                set_fields: engine.state.set_fields,
                up_fields:  engine.state.up_fields,
                monitor:    OnceLock::new(),
            });
        }
        matches
    }

    /// Matches a new table against the cache.
    pub(crate) fn match_table(&mut self, world: &World, table: TableId) {
        let table = world.table(table);
        let matches = self.evaluate(world, table);
        if !matches.is_empty() {
            self.add_table(world, table, matches);
        }
    }

    fn add_table(&mut self, world: &World, table: &Table, matches: Vec<Match>) {
        let group_id = self.group_id(world, table);
        let slot = self.ensure_group(world, group_id);

        let group = self.groups.get_mut(slot);
        group.tables.push(TableMatches { table: table.id(), group: group_id, matches: matches.into() });
        group.match_count += 1;
        let index = group.tables.len() - 1;

        self.tables.insert(Some(table), CacheTable { group: group_id, index });
        self.match_count += 1;
        world.tracer().match_table(self.id, table.id(), group_id);
    }

    /// Removes a table from its group, deleting the group if it becomes empty.
    fn take_from_group(&mut self, world: &World, table: TableId, entry: CacheTable) -> TableMatches {
        let slot = self.groups.slot(entry.group).expect("cached table is in a live group");
        let group = self.groups.get_mut(slot);
        let removed = group.tables.swap_remove(entry.index);
        assert_eq!(removed.table, table, "group of {table:?} is out of sync with the table cache");
        group.match_count += 1;

        if let Some(moved) = group.tables.get(entry.index) {
            let moved = moved.table;
            self.tables.get_mut(moved).expect("grouped table is cached").index = entry.index;
        }

        if self.groups.get(slot).tables.is_empty() && entry.group != 0 {
            self.delete_group(world, slot);
        }

        removed
    }

    /// Removes a table from the cache.
    pub(crate) fn remove_table(&mut self, world: &World, table: TableId) {
        if !self.tables.contains(table) {
            return;
        }

        let entry = self.tables.remove(table);
        self.take_from_group(world, table, entry);
        self.match_count += 1;
        world.tracer().unmatch_table(self.id, table, entry.group);
    }

    fn move_table_to_group(&mut self, world: &World, table: TableId, to: u64) {
        let entry = *self.tables.get(Some(table)).expect("moved table is cached");
        let mut matches = self.take_from_group(world, table, entry);
        matches.group = to;

        let slot = self.ensure_group(world, to);
        let group = self.groups.get_mut(slot);
        group.tables.push(matches);
        group.match_count += 1;
        let index = group.tables.len() - 1;

        *self.tables.get_mut(table).expect("moved table is cached") = CacheTable { group: to, index };
        self.match_count += 1;
        world.tracer().move_table_group(self.id, table, entry.group, to);
    }

    pub(crate) fn set_empty(&mut self, table: TableId, empty: bool) { self.tables.set_empty(table, empty); }

    /// Recomputes the matches and groups of `tables`.
    pub(crate) fn rematch(&mut self, world: &World, tables: &[TableId]) {
        for &table in tables {
            let table = world.table(table);
            let matches = self.evaluate(world, table);

            if !self.tables.contains(table.id()) {
                if !matches.is_empty() {
                    self.add_table(world, table, matches);
                }
                continue;
            }

            if matches.is_empty() {
                self.remove_table(world, table.id());
                continue;
            }

            let group_id = self.group_id(world, table);
            let entry = *self.tables.get(Some(table.id())).expect("checked above");
            if entry.group != group_id {
                self.move_table_to_group(world, table.id(), group_id);
            }

            let entry = *self.tables.get(Some(table.id())).expect("checked above");
            let slot = self.groups.slot(entry.group).expect("cached table is in a live group");
            let cached = &mut self.groups.get_mut(slot).tables[entry.index];
            let unchanged = cached.matches.len() == matches.len()
                && cached.matches.iter().zip(&matches).all(|(old, new)| old.same_as(new));
            if !unchanged {
                cached.matches = matches.into();
                self.match_count += 1;
            }
        }

        world.tracer().rematch(self.id, tables.len());
    }

    /// Removes all tables and groups.
    pub(crate) fn fini(mut self, world: &World) {
        for table in self.tables.tables() {
            self.remove_table(world, table);
        }
        if let Some(slot) = self.groups.slot(0) {
            self.delete_group(world, slot);
        }
        debug_assert_eq!(self.groups.len(), 0, "all groups are deleted with their last table");
        self.tables.fini();
    }

    fn monitor_values<'a>(&'a self, table: &'a Table, matched: &'a Match) -> impl Iterator<Item = u32> + 'a {
        std::iter::once(table.rows_version()).chain(self.tracked.iter().enumerate().map(|(field, &tracked)| {
            match matched.columns[field] {
                Some(column) if tracked && matched.sources[field].is_null() => table.column_version(column),
                _ => 0,
            }
        }))
    }

    /// Whether the cache or the data of a non-empty matched table changed since the last sync.
    pub(crate) fn changed(&self, world: &World) -> bool {
        if self.match_count != self.prev_match_count.load(Ordering::Acquire) {
            return true;
        }

        for entry in self.tables.iter() {
            let table = entry.table().expect("query caches only contain tables");
            let matches = self.table_matches(table).expect("iterated table is cached");
            let table = world.table(table);

            for matched in matches.matches.iter() {
                let Some(monitor) = matched.monitor.get() else { return true };
                let differs = monitor
                    .iter()
                    .zip(self.monitor_values(table, matched))
                    .any(|(seen, current)| seen.load(Ordering::Acquire) != current);
                if differs {
                    return true;
                }
            }
        }

        false
    }

    pub(crate) fn sync_monitor(&self, world: &World, matched: &Match) {
        let table = world.table(matched.table);
        match matched.monitor.get() {
            Some(monitor) => {
                for (seen, current) in monitor.iter().zip(self.monitor_values(table, matched)) {
                    seen.store(current, Ordering::Release);
                }
            }
            None => {
                let monitor = self.monitor_values(table, matched).map(AtomicU32::new).collect();
                // another thread may have initialized the same monitor with the same values
                let _ = matched.monitor.set(monitor);
            }
        }
    }

    pub(crate) fn sync_match_count(&self) { self.prev_match_count.store(self.match_count, Ordering::Release); }

    /// Rebuilds the sorted slices if matched tables or sorted values changed.
    fn sorted_slices(&self, world: &World) -> Option<Arc<[Slice]>> {
        let order_by = self.order_by.as_ref()?;
        let id = Id::from(order_by.component);

        let tables: Vec<TableId> = self
            .groups
            .iter()
            .flat_map(|group| group.tables.iter().map(|matches| matches.table))
            .filter(|&table| !world.table(table).is_empty())
            .collect();
        let versions: Vec<(TableId, u32, u32)> = tables
            .iter()
            .map(|&table_id| {
                let table = world.table(table_id);
                let column = table.column_for_id(id).expect("sorted component is matched on $this");
                (table_id, table.rows_version(), table.column_version(column))
            })
            .collect();

        let mut sort = self.sort.lock();
        if sort.match_count != Some(self.match_count) || sort.versions != versions {
            sort.slices = (order_by.sort)(world, order_by.component, &tables).into();
            sort.match_count = Some(self.match_count);
            sort.versions = versions;
            world.tracer().sort(self.id, sort.slices.len());
        }
        Some(Arc::clone(&sort.slices))
    }

    pub(crate) fn cursor<'w>(&'w self, world: &World) -> CacheCursor<'w> {
        CacheCursor {
            cache:        self,
            group:        self.groups.first(),
            single_group: false,
            table:        0,
            index:        0,
            slices:       self.sorted_slices(world).map(|slices| (slices, 0)),
        }
    }

    pub(crate) fn cursor_for_group(&self, group: u64) -> CacheCursor<'_> {
        CacheCursor {
            cache:        self,
            group:        self.groups.slot(group),
            single_group: true,
            table:        0,
            index:        0,
            slices:       None,
        }
    }
}

/// A match produced by a [`CacheCursor`].
pub(crate) struct CacheItem<'w> {
    pub(crate) matched: &'w Match,
    /// The rows to visit, or `None` for the whole table.
    pub(crate) range:   Option<TableRange>,
    pub(crate) group:   u64,
}

/// Iterates the matches of a cache in group order, or in sorted order.
pub(crate) struct CacheCursor<'w> {
    cache:        &'w QueryCache,
    group:        Option<usize>,
    single_group: bool,
    table:        usize,
    index:        usize,
    slices:       Option<(Arc<[Slice]>, usize)>,
}

impl<'w> CacheCursor<'w> {
    pub(crate) fn next(&mut self) -> Option<CacheItem<'w>> {
        let cache = self.cache;

        // every match of a table is yielded for each of its slices
        if let Some((slices, position)) = &mut self.slices {
            loop {
                let slice = *slices.get(*position)?;
                let matches = cache.table_matches(slice.table).expect("sorted table is cached");
                let Some(matched) = matches.get(self.index) else {
                    *position += 1;
                    self.index = 0;
                    continue;
                };
                self.index += 1;
                return Some(CacheItem {
                    matched,
                    range: Some(TableRange { table: slice.table, offset: slice.offset, count: slice.count }),
                    group: matches.group,
                });
            }
        }

        loop {
            let group = cache.groups.get(self.group?);

            if let Some(matches) = group.tables.get(self.table) {
                if let Some(matched) = matches.get(self.index) {
                    self.index += 1;
                    return Some(CacheItem { matched, range: None, group: group.id });
                }
                self.table += 1;
                self.index = 0;
                continue;
            }

            self.group = if self.single_group { None } else { group.next };
            self.table = 0;
            self.index = 0;
        }
    }
}
