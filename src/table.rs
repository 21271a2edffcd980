//! Archetype tables.
//!
//! A table stores all entities with the exact same type.
//! Its type is the sorted list of component ids and pairs;
//! each data component in the type has a dense [`Column`],
//! and tags and pairs only appear in the type.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Entity, Id};

mod column;
pub(crate) use column::{new_column, AnyColumn, Column};
pub use column::{ColumnRead, ColumnWrite};

/// Identifies a table for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub(crate) u32);

impl TableId {
    /// The table of entities without components.
    pub const ROOT: Self = Self(0);

    /// The raw index of the table.
    pub fn index(self) -> u32 { self.0 }
}

impl fmt::Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "table#{}", self.0) }
}

/// A contiguous range of rows in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRange {
    /// The table containing the rows.
    pub table:  TableId,
    /// The first row.
    pub offset: usize,
    /// The number of rows.
    pub count:  usize,
}

/// Table-level attributes that queries filter on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableFlags {
    /// The type contains [`Entity::PREFAB`].
    pub prefab:   bool,
    /// The type contains [`Entity::DISABLED`].
    pub disabled: bool,
}

/// An archetype table.
pub struct Table {
    id:                TableId,
    ty:                Box<[Id]>,
    entities:          Vec<Entity>,
    columns:           Box<[Column]>,
    /// Maps each type index to its column index, if the id has data.
    column_map:        Box<[Option<usize>]>,
    /// Slot 0 counts row additions and removals, slot `c + 1` counts writes to column `c`.
    dirty:             Box<[AtomicU32]>,
    flags:             TableFlags,
    traversable_count: usize,
    /// The keys under which this table is registered in the id index.
    records:           Box<[Id]>,
}

impl Table {
    pub(crate) fn new(
        id: TableId,
        ty: Box<[Id]>,
        mut column_for: impl FnMut(Id) -> Option<Box<dyn AnyColumn>>,
    ) -> Self {
        debug_assert!(ty.windows(2).all(|pair| pair[0] < pair[1]), "table type must be sorted");

        let mut columns = Vec::new();
        let column_map: Box<[Option<usize>]> = ty
            .iter()
            .map(|&id| {
                column_for(id).map(|data| {
                    columns.push(Column::new(id, data));
                    columns.len() - 1
                })
            })
            .collect();

        let mut records: Vec<Id> = ty.to_vec();
        for &id in ty.iter() {
            records.extend(id.wildcard_forms());
        }
        records.sort();
        records.dedup();

        let flags = TableFlags {
            prefab:   ty.binary_search(&Id::from(Entity::PREFAB)).is_ok(),
            disabled: ty.binary_search(&Id::from(Entity::DISABLED)).is_ok(),
        };

        let dirty = (0..=columns.len()).map(|_| AtomicU32::new(1)).collect();

        Self {
            id,
            ty,
            entities: Vec::new(),
            columns: columns.into_boxed_slice(),
            column_map,
            dirty,
            flags,
            traversable_count: 0,
            records: records.into_boxed_slice(),
        }
    }

    /// The identity of this table.
    pub fn id(&self) -> TableId { self.id }

    /// The sorted type of this table.
    pub fn ty(&self) -> &[Id] { &self.ty }

    /// The number of rows.
    pub fn count(&self) -> usize { self.entities.len() }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool { self.entities.is_empty() }

    /// The entity of each row.
    pub fn entities(&self) -> &[Entity] { &self.entities }

    /// Table-level attributes.
    pub fn flags(&self) -> TableFlags { self.flags }

    /// The number of rows whose entity is the target of a traversable relationship.
    pub fn traversable_count(&self) -> usize { self.traversable_count }

    /// Whether the type contains `id` exactly.
    pub fn has(&self, id: Id) -> bool { self.ty.binary_search(&id).is_ok() }

    /// The position of `id` in the type.
    pub fn type_index(&self, id: Id) -> Option<usize> { self.ty.binary_search(&id).ok() }

    /// The first position at or after `from` whose id matches `pattern`.
    pub fn next_match(&self, pattern: Id, from: usize) -> Option<usize> {
        self.ty.get(from..)?.iter().position(|id| id.matches(pattern)).map(|offset| from + offset)
    }

    /// The column index storing the data of the id at `type_index`.
    pub fn column_of(&self, type_index: usize) -> Option<usize> {
        self.column_map.get(type_index).copied().flatten()
    }

    /// The number of data columns.
    pub fn column_count(&self) -> usize { self.columns.len() }

    /// The current dirty counter of row changes.
    pub fn rows_version(&self) -> u32 { self.dirty[0].load(Ordering::Acquire) }

    /// The current dirty counter of writes to `column`.
    pub fn column_version(&self, column: usize) -> u32 {
        self.dirty[column + 1].load(Ordering::Acquire)
    }

    pub(crate) fn mark_column_dirty(&self, column: usize) {
        self.dirty[column + 1].fetch_add(1, Ordering::AcqRel);
    }

    fn mark_rows_dirty(&self) { self.dirty[0].fetch_add(1, Ordering::AcqRel); }

    pub(crate) fn records(&self) -> &[Id] { &self.records }

    pub(crate) fn column(&self, column: usize) -> &Column { &self.columns[column] }

    pub(crate) fn column_mut(&mut self, column: usize) -> &mut Column { &mut self.columns[column] }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] { &mut self.columns }

    /// Finds the column storing `id`.
    pub(crate) fn column_for_id(&self, id: Id) -> Option<usize> {
        self.type_index(id).and_then(|index| self.column_of(index))
    }

    /// Appends a row for `entity`. Columns must be filled by the caller.
    pub(crate) fn push_entity(&mut self, entity: Entity) -> usize {
        self.entities.push(entity);
        self.mark_rows_dirty();
        self.entities.len() - 1
    }

    /// Removes the entity at `row` after its column values were moved or dropped.
    ///
    /// Returns the entity that was moved into `row`, if any.
    pub(crate) fn swap_remove_entity(&mut self, row: usize) -> Option<Entity> {
        self.entities.swap_remove(row);
        self.mark_rows_dirty();
        self.entities.get(row).copied()
    }

    /// Drops the column values at `row` and removes the row.
    pub(crate) fn delete_row(&mut self, row: usize) -> Option<Entity> {
        for column in self.columns.iter_mut() {
            column.get_mut().swap_remove(row);
        }
        self.swap_remove_entity(row)
    }

    pub(crate) fn add_traversable(&mut self, delta: isize) {
        self.traversable_count = self
            .traversable_count
            .checked_add_signed(delta)
            .expect("traversable count must not underflow");
    }

    /// Checks that all columns have one value per row.
    pub(crate) fn debug_validate(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(debug_assertions)] {
                let count = self.entities.len();
                for column in self.columns.iter_mut() {
                    assert_eq!(column.len(), count, "column {:?} of {:?} is out of sync", column.id, self.id);
                }
            }
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
