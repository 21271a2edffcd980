//! The world stores entities, their tables and the query caches.
//!
//! All structural changes go through the world,
//! which keeps the id index and the query caches in sync with the tables:
//! new tables are matched against every cache,
//! tables that become empty or non-empty are moved between the lists of each table cache,
//! and moving an entity that other entities traverse to rematches the caches that depend on it.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use xias::Xias;

use crate::component::{IdIndex, Registry};
use crate::entity::EntityIndex;
use crate::query::cache::QueryCache;
use crate::query::{self, CacheLink, Query, QueryId};
use crate::slab::Slab;
use crate::table::ColumnRead;
use crate::tracer::Tracer;
use crate::{Component, Entity, Id, Record, Table, TableId};

mod builder;
pub use builder::Builder;

#[cfg(test)]
mod tests;

/// Hierarchies deeper than this are assumed to contain a cycle.
const MAX_DEPTH: u64 = 256;

static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(0);

/// The data structure that stores all entities and tables.
pub struct World {
    id:                    u64,
    entities:              EntityIndex,
    tables:                Slab<Table>,
    /// Finds the table of a type.
    table_index:           HashMap<Box<[Id]>, TableId>,
    ids:                   IdIndex,
    components:            Registry,
    /// Relationships that queries can traverse.
    traversable:           HashSet<Entity>,
    caches:                Slab<QueryCache>,
    tracer:                Box<dyn Tracer>,
    cleanup_relationships: bool,
}

impl Default for World {
    fn default() -> Self { Builder::new().build() }
}

impl World {
    pub(crate) fn from_builder(builder: Builder) -> Self {
        let mut world = Self {
            id:                    NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed),
            entities:              EntityIndex::with_capacity(builder.entity_capacity),
            tables:                Slab::default(),
            table_index:           HashMap::new(),
            ids:                   IdIndex::default(),
            components:            Registry::default(),
            traversable:           [Entity::CHILD_OF, Entity::IS_A].into_iter().collect(),
            caches:                Slab::default(),
            tracer:                builder.tracer,
            cleanup_relationships: builder.cleanup_relationships,
        };

        let root = world.ensure_table(Vec::new());
        assert_eq!(root, TableId::ROOT, "the first table is the root table");
        world
    }

    pub(crate) fn id(&self) -> u64 { self.id }

    pub(crate) fn tracer(&self) -> &dyn Tracer { &*self.tracer }

    pub(crate) fn ids(&self) -> &IdIndex { &self.ids }

    /// Returns a table by id.
    ///
    /// # Panics
    /// Panics if the table was deleted.
    pub fn table(&self, table: TableId) -> &Table {
        self.tables.get(table.index().small_int()).unwrap_or_else(|| panic!("{table:?} does not exist"))
    }

    /// Iterates all tables.
    pub fn tables(&self) -> impl Iterator<Item = &Table> + '_ { self.tables.iter().map(|(_, table)| table) }

    /// The number of tables.
    pub fn table_count(&self) -> usize { self.tables.len() }

    /// Finds the table of an exact type.
    pub fn find_table(&self, ty: &[Id]) -> Option<TableId> {
        let mut ty = ty.to_vec();
        ty.sort();
        self.table_index.get(&*ty).copied()
    }

    /// Returns the location of an entity.
    pub fn record(&self, entity: Entity) -> Option<Record> { self.entities.record(entity) }

    /// Whether the entity has not been deleted.
    pub fn is_alive(&self, entity: Entity) -> bool { self.entities.is_alive(entity) }

    /// The number of live entities, excluding builtins.
    pub fn entity_count(&self) -> usize { self.entities.len() }

    pub(crate) fn entity_by_index(&self, index: u32) -> Option<Entity> { self.entities.alive_by_index(index) }

    /// Whether `rel` is a traversable relationship.
    pub fn is_traversable(&self, rel: Entity) -> bool { self.traversable.contains(&rel) }

    /// Whether an entity is the target of a traversable relationship.
    pub(crate) fn is_traversable_entity(&self, entity: Entity) -> bool { self.entities.is_traversable(entity) }

    /// The target of the first `(rel, *)` pair in the type of a table.
    pub(crate) fn target_of(&self, table: &Table, rel: Entity) -> Option<Entity> {
        let index = table.next_match(Id::pair(rel, Entity::WILDCARD), 0)?;
        self.entity_by_index(table.ty()[index].second_index())
    }

    /// The number of `rel` hops from the entities of a table to the root of the hierarchy.
    pub(crate) fn depth(&self, table: &Table, rel: Entity) -> u64 {
        let mut depth = 0;
        let mut table = table;

        while let Some(target) = self.target_of(table, rel) {
            depth += 1;
            assert!(depth < MAX_DEPTH, "{rel:?} hierarchy is deeper than {MAX_DEPTH}, it probably has a cycle");
            match self.record(target) {
                Some(record) => table = self.table(record.table),
                None => break,
            }
        }

        depth
    }

    pub(crate) fn query_cache(&self, id: QueryId) -> &QueryCache {
        self.caches.get(id.0).unwrap_or_else(|| panic!("{id:?} was destroyed"))
    }

    /// Marks a relationship as traversable, allowing queries to match ids on its targets.
    ///
    /// [`Entity::CHILD_OF`] and [`Entity::IS_A`] are traversable by default.
    pub fn set_traversable(&mut self, rel: Entity) {
        assert!(self.is_alive(rel), "{rel:?} is not alive");
        self.traversable.insert(rel);
    }

    /// Creates an entity without components.
    pub fn entity(&mut self) -> Entity {
        let entity = self.entities.alloc();
        let root = self.tables.get_mut(TableId::ROOT.index().small_int()).expect("root table always exists");
        let row = root.push_entity(entity);
        self.entities.set_record(entity, Record { table: TableId::ROOT, row });
        if row == 0 {
            self.set_table_empty(TableId::ROOT, false);
        }
        entity
    }

    /// Returns the entity of a data component, registering it on first use.
    pub fn component<C: Component>(&mut self) -> Entity {
        if let Some(entity) = self.components.get::<C>() {
            return entity;
        }

        let entity = self.entity();
        self.components.register::<C>(entity);
        entity
    }

    /// Whether an entity has an id.
    pub fn has(&self, entity: Entity, id: impl Into<Id>) -> bool {
        let id = id.into();
        self.record(entity).map_or(false, |record| self.table(record.table).next_match(id, 0).is_some())
    }

    /// Adds a tag or a pair to an entity.
    ///
    /// # Panics
    /// Panics if the entity is not alive, the id stores data or is a wildcard,
    /// or a pair element is not alive.
    pub fn add_id(&mut self, entity: Entity, id: impl Into<Id>) {
        let id = id.into();
        assert!(self.components.info(id).is_none(), "{id:?} stores data, use World::set instead");
        assert!(!id.is_wildcard(), "cannot add the wildcard {id:?}");

        let record = self.record(entity).unwrap_or_else(|| panic!("{entity:?} is not alive"));
        if self.table(record.table).has(id) {
            return;
        }

        if id.is_pair() {
            let first = self
                .entity_by_index(id.first_index())
                .unwrap_or_else(|| panic!("relationship of {id:?} is not alive"));
            let target =
                self.entity_by_index(id.second_index()).unwrap_or_else(|| panic!("target of {id:?} is not alive"));

            if self.is_traversable(first) && self.entities.set_traversable(target) {
                if let Some(record) = self.record(target) {
                    self.table_mut(record.table).add_traversable(1);
                }
            }
        }

        let mut ty = self.table(record.table).ty().to_vec();
        let position = ty.binary_search(&id).expect_err("checked above");
        ty.insert(position, id);
        let dest = self.ensure_table(ty);
        self.move_entity(entity, dest, |_, _| {});
    }

    /// Adds the pair `(first, second)` to an entity.
    pub fn add_pair(&mut self, entity: Entity, first: Entity, second: Entity) {
        self.add_id(entity, Id::pair(first, second));
    }

    /// Removes an id from an entity, dropping its data if any.
    ///
    /// Returns `false` if the entity does not have the id.
    pub fn remove_id(&mut self, entity: Entity, id: impl Into<Id>) -> bool {
        let id = id.into();
        let Some(record) = self.record(entity) else { return false };

        let mut ty = self.table(record.table).ty().to_vec();
        let Ok(position) = ty.binary_search(&id) else { return false };
        ty.remove(position);
        let dest = self.ensure_table(ty);
        self.move_entity(entity, dest, |_, _| {});
        true
    }

    /// Sets the value of a data component, adding it if necessary.
    ///
    /// # Panics
    /// Panics if the entity is not alive.
    pub fn set<C: Component>(&mut self, entity: Entity, value: C) {
        let id = Id::from(self.component::<C>());
        let record = self.record(entity).unwrap_or_else(|| panic!("{entity:?} is not alive"));

        let table = self.table_mut(record.table);
        if let Some(column) = table.column_for_id(id) {
            table.column_mut(column).typed_mut::<C>()[record.row] = value;
            table.mark_column_dirty(column);
            return;
        }

        let mut ty = table.ty().to_vec();
        let position = ty.binary_search(&id).expect_err("table has no column for the id");
        ty.insert(position, id);
        let dest = self.ensure_table(ty);
        self.move_entity(entity, dest, move |table, row| {
            let column = table.column_for_id(id).expect("destination table stores the component");
            let data = table.column_mut(column).typed_mut::<C>();
            debug_assert_eq!(data.len(), row, "new component is pushed at the new row");
            data.push(value);
        });
    }

    /// Borrows the value of a data component.
    pub fn get<C: Component>(&self, entity: Entity) -> Option<ColumnRead<'_, C>> {
        let id = Id::from(self.components.get::<C>()?);
        let record = self.record(entity)?;
        let table = self.table(record.table);
        let column = table.column_for_id(id)?;
        let data = table.column(column).read::<C>(record.row..record.row + 1);
        Some(ColumnRead::map(data, |data| &data[0]))
    }

    /// Mutably borrows the value of a data component and marks its column as changed.
    pub fn get_mut<C: Component>(&mut self, entity: Entity) -> Option<&mut C> {
        let id = Id::from(self.components.get::<C>()?);
        let record = self.record(entity)?;
        let table = self.table_mut(record.table);
        let column = table.column_for_id(id)?;
        table.mark_column_dirty(column);
        Some(&mut table.column_mut(column).typed_mut::<C>()[record.row])
    }

    /// Deletes an entity.
    ///
    /// Unless disabled in the [`Builder`], pairs targeting the entity are removed,
    /// and its [`ChildOf`](Entity::CHILD_OF) children are deleted recursively.
    ///
    /// Returns `false` if the entity is not alive.
    pub fn delete(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        assert!(!entity.is_builtin(), "cannot delete the builtin {entity:?}");

        if self.cleanup_relationships {
            self.cleanup_targets(entity);
        }

        let record = self.record(entity).expect("live user entities are stored in a table");
        let traversable = self.is_traversable_entity(entity);

        let table = self.table_mut(record.table);
        if traversable {
            table.add_traversable(-1);
        }
        let moved = table.delete_row(record.row);
        let now_empty = table.is_empty();

        if let Some(moved) = moved {
            self.entities.set_row(moved, record.row);
        }
        if now_empty {
            self.set_table_empty(record.table, true);
        }
        let below = if traversable { self.tables_below(entity) } else { Vec::new() };
        self.entities.free(entity);

        if traversable {
            self.rematch_refs(&below);
        }
        true
    }

    /// Removes the pairs targeting `entity`, deleting the entities that are its children.
    fn cleanup_targets(&mut self, entity: Entity) {
        let pattern = Id::pair(Entity::WILDCARD, entity);
        let child_of = Id::pair(Entity::CHILD_OF, entity);

        loop {
            let holders: Vec<(Entity, Vec<Id>)> = self
                .ids
                .tables(pattern, true)
                .flat_map(|table| {
                    let table = self.table(table);
                    let ids: Vec<Id> = table
                        .ty()
                        .iter()
                        .copied()
                        .filter(|id| id.is_pair() && id.second_index() == entity.index())
                        .collect();
                    table.entities().iter().map(move |&holder| (holder, ids.clone()))
                })
                .filter(|&(holder, _)| holder != entity)
                .collect();

            if holders.is_empty() {
                break;
            }

            for (holder, ids) in holders {
                if ids.contains(&child_of) {
                    log::trace!("Deleting {holder:?} with its parent {entity:?}");
                    self.delete(holder);
                } else {
                    for id in ids {
                        self.remove_id(holder, id);
                    }
                }
            }
        }
    }

    /// Compiles a query. Cached queries are matched against all existing tables.
    pub fn query(&mut self, builder: query::Builder) -> Query {
        let compiled = query::compiler::compile(self, builder);
        let mut inner = compiled.query;

        if let Some(spec) = compiled.cache {
            let id = QueryId(self.caches.next_index());
            let field_map = spec.field_map.clone();
            let trivial = spec.trivial;

            let mut cache = QueryCache::new(self, id, spec);
            for (_, table) in self.tables.iter() {
                cache.match_table(self, table.id());
            }
            log::debug!("Created {id:?} with {} tables", cache.table_count());

            let index = self.caches.insert(cache);
            debug_assert_eq!(index, id.0, "cache is inserted at the reserved index");
            inner.cache = Some(CacheLink { id, field_map, trivial });
        }

        Query { inner }
    }

    /// Releases the cache of a query.
    pub fn destroy_query(&mut self, query: Query) {
        if let Some(link) = &query.inner.cache {
            let cache = self.caches.remove(link.id.0).unwrap_or_else(|| panic!("{:?} was destroyed", link.id));
            cache.fini(self);
            log::debug!("Destroyed {:?}", link.id);
        }
    }

    /// Deletes all tables without entities except the root table.
    ///
    /// Returns the number of deleted tables.
    pub fn delete_empty_tables(&mut self) -> usize {
        let empty: Vec<TableId> = self
            .tables
            .iter()
            .map(|(_, table)| table)
            .filter(|table| table.is_empty() && table.id() != TableId::ROOT)
            .map(Table::id)
            .collect();

        for &table_id in &empty {
            let mut caches = mem::take(&mut self.caches);
            for (_, cache) in caches.iter_mut() {
                cache.remove_table(self, table_id);
            }
            self.caches = caches;

            let table = self.tables.remove(table_id.index().small_int()).expect("table is live");
            self.ids.unregister(&table);
            self.table_index.remove(table.ty());
            self.tracer.delete_table(table_id);
        }

        log::debug!("Deleted {} empty tables", empty.len());
        empty.len()
    }

    fn table_mut(&mut self, table: TableId) -> &mut Table {
        self.tables.get_mut(table.index().small_int()).unwrap_or_else(|| panic!("{table:?} does not exist"))
    }

    /// Finds or creates the table of a sorted type.
    fn ensure_table(&mut self, ty: Vec<Id>) -> TableId {
        if let Some(&table) = self.table_index.get(&*ty) {
            return table;
        }

        let id = TableId(self.tables.next_index().small_int());
        let components = &self.components;
        let table = Table::new(id, ty.clone().into_boxed_slice(), |component| {
            components.info(component).map(|info| (info.new_column)())
        });

        self.ids.register(&table);
        let index = self.tables.insert(table);
        debug_assert_eq!(index.small_int::<u32>(), id.index(), "table is inserted at the reserved index");
        self.table_index.insert(ty.into_boxed_slice(), id);
        self.tracer.create_table(id, self.table(id).ty());

        let mut caches = mem::take(&mut self.caches);
        for (_, cache) in caches.iter_mut() {
            cache.match_table(self, id);
        }
        self.caches = caches;

        id
    }

    fn set_table_empty(&mut self, table_id: TableId, empty: bool) {
        let table = self.tables.get(table_id.index().small_int()).expect("table is live");
        self.ids.set_empty(table, empty);
        for (_, cache) in self.caches.iter_mut() {
            cache.set_empty(table_id, empty);
        }
        self.tracer.table_empty(table_id, empty);
    }

    /// Moves an entity to another table.
    ///
    /// Data of ids in both tables is moved, data of ids missing in `dest` is dropped,
    /// and `init` pushes the data of ids missing in the source table.
    fn move_entity(&mut self, entity: Entity, dest: TableId, init: impl FnOnce(&mut Table, usize)) {
        let record = self.record(entity).expect("moved entity is alive");
        if record.table == dest {
            return;
        }

        let traversable = self.is_traversable_entity(entity);
        let (src_table, dest_table) =
            self.tables.get2_mut(record.table.index().small_int(), dest.index().small_int());
        let src_table = src_table.expect("source table is live");
        let dest_table = dest_table.expect("destination table is live");

        let dest_row = dest_table.push_entity(entity);
        for column in src_table.columns_mut() {
            match dest_table.column_for_id(column.id) {
                Some(dest_column) => {
                    column.get_mut().move_row(record.row, dest_table.column_mut(dest_column).get_mut())
                }
                None => column.get_mut().swap_remove(record.row),
            }
        }
        init(&mut *dest_table, dest_row);

        let moved = src_table.swap_remove_entity(record.row);
        if traversable {
            src_table.add_traversable(-1);
            dest_table.add_traversable(1);
        }
        src_table.debug_validate();
        dest_table.debug_validate();

        let src_empty = src_table.is_empty();
        let dest_filled = dest_table.count() == 1;

        if let Some(moved) = moved {
            self.entities.set_row(moved, record.row);
        }
        self.entities.set_record(entity, Record { table: dest, row: dest_row });

        if src_empty {
            self.set_table_empty(record.table, true);
        }
        if dest_filled {
            self.set_table_empty(dest, false);
        }

        if traversable {
            let below = self.tables_below(entity);
            self.rematch_refs(&below);
        }
    }

    /// Collects the tables of the entities that reach `entity` through pairs,
    /// directly or through their ancestors.
    fn tables_below(&self, entity: Entity) -> Vec<TableId> {
        let mut tables = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![entity];

        while let Some(target) = stack.pop() {
            for table_id in self.ids.tables(Id::pair(Entity::WILDCARD, target), true) {
                if !seen.insert(table_id) {
                    continue;
                }
                tables.push(table_id);

                let table = self.table(table_id);
                if table.traversable_count() > 0 {
                    stack.extend(table.entities().iter().copied().filter(|&child| self.is_traversable_entity(child)));
                }
            }
        }

        tables
    }

    /// Rematches `tables` in the caches whose matches depend on other entities.
    fn rematch_refs(&mut self, tables: &[TableId]) {
        let mut caches = mem::take(&mut self.caches);
        for (_, cache) in caches.iter_mut() {
            if cache.has_refs() {
                cache.rematch(self, tables);
            }
        }
        self.caches = caches;
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("entities", &self.entities.len())
            .field("tables", &self.tables.len())
            .field("caches", &self.caches.len())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(World: Send, Sync);
