//! Component types and the id index.
//!
//! Every id that appears in a table type has an [`IdRecord`],
//! and so does each wildcard form of every pair.
//! An id record is a [`TableCache`] of the tables containing the id,
//! which is how queries find candidate tables without scanning all of them.

use std::any::{self, TypeId};
use std::collections::HashMap;

use indexmap::IndexMap;

use crate::table::{self, AnyColumn, Table, TableId};
use crate::table_cache::TableCache;
use crate::{Entity, Id};

/// A type that can be stored as component data.
///
/// Use `#[derive(strata::Component)]` to implement this trait.
pub trait Component: Send + Sync + 'static {
    /// The debug name of the component.
    fn name() -> &'static str
    where
        Self: Sized,
    {
        any::type_name::<Self>()
    }
}

/// Runtime information about a data component.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TypeInfo {
    pub(crate) name:       &'static str,
    pub(crate) type_id:    TypeId,
    pub(crate) new_column: fn() -> Box<dyn AnyColumn>,
}

/// Maps Rust types to component entities.
#[derive(Default)]
pub(crate) struct Registry {
    by_type: HashMap<TypeId, Entity>,
    info:    HashMap<Id, TypeInfo>,
}

impl Registry {
    pub(crate) fn get<C: Component>(&self) -> Option<Entity> {
        self.by_type.get(&TypeId::of::<C>()).copied()
    }

    pub(crate) fn register<C: Component>(&mut self, entity: Entity) {
        let info = TypeInfo {
            name:       C::name(),
            type_id:    TypeId::of::<C>(),
            new_column: table::new_column::<C>,
        };
        self.by_type.insert(info.type_id, entity);
        self.info.insert(Id::from(entity), info);
        log::debug!("Registered component {} as {entity:?}", info.name);
    }

    /// Returns the data type of `id`. Tags and pairs have no data.
    pub(crate) fn info(&self, id: Id) -> Option<&TypeInfo> { self.info.get(&id) }
}

/// The position of an id in a table type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRecord {
    /// The first type index matching the id.
    pub column: usize,
    /// The number of type indices matching the id. Greater than 1 only for wildcards.
    pub count:  usize,
}

/// The tables containing one id.
pub struct IdRecord {
    pub(crate) cache: TableCache<TableRecord>,
}

impl IdRecord {
    /// The tables containing the id.
    pub fn cache(&self) -> &TableCache<TableRecord> { &self.cache }

    /// Whether no table with rows contains the id.
    pub fn is_unpopulated(&self) -> bool { self.cache.non_empty_count() == 0 }
}

/// Maps ids to the tables containing them.
#[derive(Default)]
pub(crate) struct IdIndex {
    records: IndexMap<Id, IdRecord>,
}

impl IdIndex {
    pub(crate) fn get(&self, id: Id) -> Option<&IdRecord> { self.records.get(&id) }

    /// Looks up where `id` lives in `table`.
    pub(crate) fn table_record(&self, id: Id, table: TableId) -> Option<TableRecord> {
        self.get(id)?.cache.get(Some(table)).copied()
    }

    pub(crate) fn register(&mut self, table: &Table) {
        for &key in table.records() {
            let column = table.next_match(key, 0).expect("records are derived from the table type");
            let count = table.ty()[column..].iter().filter(|id| id.matches(key)).count();

            self.records
                .entry(key)
                .or_insert_with(|| IdRecord { cache: TableCache::new() })
                .cache
                .insert(Some(table), TableRecord { column, count });
        }
    }

    pub(crate) fn unregister(&mut self, table: &Table) {
        for &key in table.records() {
            let record = self.records.get_mut(&key).expect("table was registered under this key");
            record.cache.remove(table.id());
        }
    }

    pub(crate) fn set_empty(&mut self, table: &Table, empty: bool) {
        for &key in table.records() {
            if let Some(record) = self.records.get_mut(&key) {
                record.cache.set_empty(table.id(), empty);
            }
        }
    }

    /// Iterates the tables containing `id`.
    #[auto_enums::auto_enum(Iterator)]
    pub(crate) fn tables(&self, id: Id, include_empty: bool) -> impl Iterator<Item = TableId> + '_ {
        match self.get(id) {
            None => std::iter::empty(),
            Some(record) if include_empty => {
                record.cache.all_iter().filter_map(|entry| entry.table())
            }
            Some(record) => record.cache.iter().filter_map(|entry| entry.table()),
        }
    }
}
