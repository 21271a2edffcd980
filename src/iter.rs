//! Iterating query results.
//!
//! Every iterator produces a sequence of windows.
//! A window is a range of rows of one table,
//! together with the id, source and column of each query field.
//! The window is exposed as an [`IterState`],
//! which derived iterators ([`PageIter`], [`WorkerIter`]) copy from their source and then narrow.

use std::fmt;


use crate::query::engine::{Engine, VarValue};
use crate::query::plan::VarKind;
use crate::query::{QueryImpl, Var};
use crate::table::{ColumnRead, ColumnWrite, TableRange};
use crate::{Component, Entity, Id, Table, TableId, World};

mod page;
pub use page::PageIter;

mod worker;
pub use worker::WorkerIter;

#[cfg(test)]
mod tests;

/// Where the data of a field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldRef {
    pub(crate) table:  TableId,
    pub(crate) column: usize,
    /// The row of the source entity, or `None` to use the rows of the window.
    pub(crate) row:    Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSlot {
    pub(crate) id:     Id,
    /// The entity the field was matched on, null for the iterated table.
    pub(crate) src:    Entity,
    /// `None` for tags, pairs without data and unset fields.
    pub(crate) column: Option<FieldRef>,
}

/// The current window of an iterator.
#[derive(Clone)]
pub struct IterState<'w> {
    world:                 &'w World,
    pub(crate) table:      Option<TableId>,
    pub(crate) offset:     usize,
    pub(crate) count:      usize,
    pub(crate) fields:     Vec<FieldSlot>,
    pub(crate) set_fields: u64,
    pub(crate) up_fields:  u64,
    pub(crate) group_id:   u64,
}

impl<'w> IterState<'w> {
    pub(crate) fn new(world: &'w World, fields: Vec<FieldSlot>) -> Self {
        Self { world, table: None, offset: 0, count: 0, fields, set_fields: 0, up_fields: 0, group_id: 0 }
    }

    /// Copies the window of another state without reallocating.
    pub(crate) fn copy_from(&mut self, other: &Self) {
        self.world = other.world;
        self.table = other.table;
        self.offset = other.offset;
        self.count = other.count;
        self.fields.clone_from(&other.fields);
        self.set_fields = other.set_fields;
        self.up_fields = other.up_fields;
        self.group_id = other.group_id;
    }

    pub(crate) fn clear(&mut self) {
        self.table = None;
        self.offset = 0;
        self.count = 0;
        self.set_fields = 0;
        self.up_fields = 0;
    }

    /// The world being iterated.
    pub fn world(&self) -> &'w World { self.world }

    /// The number of rows in the window.
    pub fn count(&self) -> usize { self.count }

    /// The first row of the window in its table.
    pub fn offset(&self) -> usize { self.offset }

    /// The entities in the window.
    pub fn entities(&self) -> &'w [Entity] {
        match self.table() {
            Some(table) => &table.entities()[self.offset..self.offset + self.count],
            None => &[],
        }
    }

    /// The table of the window, `None` for queries that do not match on `$this`.
    pub fn table(&self) -> Option<&'w Table> { self.table.map(|table| self.world.table(table)) }

    /// The group of the current table, 0 for queries without groups.
    pub fn group_id(&self) -> u64 { self.group_id }

    /// The number of fields.
    pub fn field_count(&self) -> usize { self.fields.len() }

    fn slot(&self, index: usize) -> &FieldSlot {
        assert!(index < self.fields.len(), "field index {index} out of bounds for {} fields", self.fields.len());
        &self.fields[index]
    }

    /// Whether the field was matched in this window.
    ///
    /// Unmatched optional terms and `Not` terms are not set.
    pub fn field_is_set(&self, index: usize) -> bool {
        self.slot(index);
        self.set_fields & (1 << index) != 0
    }

    /// Whether the field was matched on the iterated table itself.
    pub fn field_is_self(&self, index: usize) -> bool { self.slot(index).src.is_null() }

    /// Whether the field was matched on an ancestor.
    pub fn field_is_up(&self, index: usize) -> bool {
        self.slot(index);
        self.up_fields & (1 << index) != 0
    }

    /// The entity the field was matched on, or [`Entity::NULL`] for the iterated table.
    pub fn field_src(&self, index: usize) -> Entity { self.slot(index).src }

    /// The id the field matched.
    ///
    /// For wildcard terms, this is the concrete id of the current match.
    pub fn field_id(&self, index: usize) -> Id { self.slot(index).id }

    fn field_rows(&self, index: usize) -> Option<(FieldRef, std::ops::Range<usize>)> {
        if !self.field_is_set(index) {
            return None;
        }
        let column = self.slot(index).column?;
        let rows = match column.row {
            Some(row) => row..row + 1,
            None => self.offset..self.offset + self.count,
        };
        Some((column, rows))
    }

    /// Borrows the data of a field.
    ///
    /// Fields matched on the iterated table have one value per row of the window.
    /// Fields matched on another entity have a single value.
    /// Returns `None` if the field is not set or has no data.
    ///
    /// Blocks while another thread borrows the column mutably.
    ///
    /// # Panics
    /// Panics if the index is out of bounds, the field does not store `C`,
    /// or the column is mutably borrowed on this thread.
    pub fn field<C: Component>(&self, index: usize) -> Option<ColumnRead<'w, [C]>> {
        let (column, rows) = self.field_rows(index)?;
        Some(self.world.table(column.table).column(column.column).read::<C>(rows))
    }

    /// Mutably borrows the data of a field and marks its column as changed.
    ///
    /// Blocks while another thread borrows the column.
    /// Fields of the same column, such as a component matched twice, cannot be borrowed together.
    ///
    /// # Panics
    /// Panics if the index is out of bounds, the field does not store `C`,
    /// or the column is already borrowed on this thread.
    pub fn field_mut<C: Component>(&self, index: usize) -> Option<ColumnWrite<'w, [C]>> {
        let (column, rows) = self.field_rows(index)?;
        let table = self.world.table(column.table);
        table.mark_column_dirty(column.column);
        Some(table.column(column.column).write::<C>(rows))
    }

    /// Borrows the value of a field for one row of the window.
    pub fn field_at<C: Component>(&self, index: usize, row: usize) -> Option<ColumnRead<'w, C>> {
        let data = self.field::<C>(index)?;
        let row = if data.len() == 1 { 0 } else { row };
        assert!(row < data.len(), "row {row} out of bounds for {} rows", data.len());
        Some(ColumnRead::map(data, |data| &data[row]))
    }
}

impl<'w> fmt::Debug for IterState<'w> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IterState")
            .field("table", &self.table)
            .field("offset", &self.offset)
            .field("count", &self.count)
            .field("set_fields", &format_args!("{:#b}", self.set_fields))
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

/// A resumable iterator over query results.
///
/// Each successful [`next`](Cursor::next) call exposes a new window through [`state`](Cursor::state).
/// Once `next` returns `false`, the iterator is finished and must not be advanced again.
pub trait Cursor<'w> {
    /// Advances to the next window.
    ///
    /// Returns `false` and releases the iterator when there are no more results.
    ///
    /// # Panics
    /// Panics if the iterator is already finished.
    fn next(&mut self) -> bool;

    /// Releases the iterator before it is exhausted. Calling this more than once has no effect.
    fn fini(&mut self);

    /// The current window.
    fn state(&self) -> &IterState<'w>;

    /// Whether the iterator has been finished.
    fn is_finished(&self) -> bool;

    /// The number of rows in the current window.
    fn count(&self) -> usize { self.state().count() }

    /// The entities in the current window.
    fn entities(&self) -> &'w [Entity] { self.state().entities() }

    /// Borrows the data of a field in the current window. See [`IterState::field`].
    fn field<C: Component>(&self, index: usize) -> Option<ColumnRead<'w, [C]>>
    where
        Self: Sized,
    {
        self.state().field(index)
    }

    /// Mutably borrows the data of a field in the current window. See [`IterState::field_mut`].
    fn field_mut<C: Component>(&self, index: usize) -> Option<ColumnWrite<'w, [C]>>
    where
        Self: Sized,
    {
        self.state().field_mut(index)
    }

    /// Restricts the results to `limit` rows after skipping `offset` rows.
    ///
    /// A `limit` of 0 means no limit.
    fn page(self, offset: usize, limit: usize) -> PageIter<'w, Self>
    where
        Self: Sized,
    {
        PageIter::new(self, offset, limit)
    }

    /// Restricts the results to the share of worker `index` out of `count` workers.
    fn worker(self, index: usize, count: usize) -> WorkerIter<'w, Self>
    where
        Self: Sized,
    {
        WorkerIter::new(self, index, count)
    }

    /// Returns the first matched entity and finishes the iterator.
    fn first(&mut self) -> Option<Entity> {
        while self.next() {
            if let Some(&entity) = self.entities().first() {
                self.fini();
                return Some(entity);
            }
        }
        None
    }

    /// Returns whether there is any result and finishes the iterator.
    fn is_true(&mut self) -> bool {
        let result = self.next();
        self.fini();
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Fresh,
    Running,
    Finished,
}

/// Iterates the results of a [`Query`](crate::Query).
pub struct QueryIter<'w> {
    engine: Engine<'w>,
    status: Status,
}

impl<'w> QueryIter<'w> {
    pub(crate) fn new(world: &'w World, query: &'w QueryImpl) -> Self {
        Self { engine: Engine::new(world, query), status: Status::Fresh }
    }

    fn assert_fresh(&self, var: Var) {
        assert!(self.status == Status::Fresh, "variables cannot be set after iteration started");
        assert!(usize::from(var.0) < self.engine.vars.len(), "{var:?} is not a variable of this query");
    }

    fn var_kind(&self, var: Var) -> VarKind { self.engine.query.plan.vars[usize::from(var.0)].kind }

    /// Constrains a variable to an entity.
    ///
    /// A table variable such as `$this` is constrained to the row of the entity.
    ///
    /// # Panics
    /// Panics if iteration has started, or if a table variable is set to an entity without a table.
    pub fn set_var(&mut self, var: Var, entity: Entity) {
        self.assert_fresh(var);
        let world = self.engine.world;
        let record = world.record(entity);
        let range = record.map(|record| TableRange { table: record.table, offset: record.row, count: 1 });

        match self.var_kind(var) {
            VarKind::Table => {
                let range = range.unwrap_or_else(|| panic!("{entity:?} is not stored in a table"));
                self.engine.constrain(var.0, VarValue { range: Some(range), entity: Some(entity) });
            }
            VarKind::Entity => {
                self.engine.constrain(var.0, VarValue { range, entity: Some(entity) });
                let companion = self.engine.query.plan.vars[usize::from(var.0)].table_var;
                if let (Some(companion), Some(range)) = (companion, range) {
                    self.engine.constrain(companion, VarValue { range: Some(range), entity: None });
                }
            }
        }
    }

    /// Constrains a table variable to all rows of a table.
    pub fn set_var_as_table(&mut self, var: Var, table: TableId) {
        let count = self.engine.world.table(table).count();
        self.set_var_as_range(var, TableRange { table, offset: 0, count });
    }

    /// Constrains a table variable to a range of rows.
    ///
    /// # Panics
    /// Panics if iteration has started, the variable is an entity variable,
    /// or the range exceeds the table.
    pub fn set_var_as_range(&mut self, var: Var, range: TableRange) {
        self.assert_fresh(var);
        assert!(self.var_kind(var) == VarKind::Table, "{var:?} is an entity variable");
        let table = self.engine.world.table(range.table);
        assert!(range.offset + range.count <= table.count(), "{range:?} exceeds {:?}", table.id());
        self.engine.constrain(var.0, VarValue { range: Some(range), entity: None });
    }

    /// The entity a variable is bound to.
    ///
    /// A table variable is bound to an entity if its range is a single row.
    pub fn get_var(&self, var: Var) -> Option<Entity> {
        let value = self.engine.vars.get(usize::from(var.0))?;
        if let Some(entity) = value.entity {
            return Some(entity);
        }
        let range = value.range?;
        if range.count != 1 {
            return None;
        }
        self.engine.world.table(range.table).entities().get(range.offset).copied()
    }

    /// The table a variable is bound to.
    pub fn get_var_as_table(&self, var: Var) -> Option<TableId> { Some(self.get_var_as_range(var)?.table) }

    /// The rows a variable is bound to.
    pub fn get_var_as_range(&self, var: Var) -> Option<TableRange> { self.engine.vars.get(usize::from(var.0))?.range }

    /// Restricts iteration to the tables of one group.
    ///
    /// # Panics
    /// Panics if iteration has started or the query is not cached.
    pub fn set_group(&mut self, group: u64) {
        assert!(self.status == Status::Fresh, "the group cannot be set after iteration started");
        self.engine.set_group(group);
    }
}

impl<'w> Cursor<'w> for QueryIter<'w> {
    fn next(&mut self) -> bool {
        assert!(self.status != Status::Finished, "next called on a finished iterator");
        self.status = Status::Running;

        if self.engine.next() {
            return true;
        }

        self.engine.sync_monitors();
        self.fini();
        false
    }

    fn fini(&mut self) {
        if self.status == Status::Finished {
            return;
        }
        self.status = Status::Finished;
        self.engine.visited = Vec::new();
        self.engine.state.clear();
    }

    fn state(&self) -> &IterState<'w> { &self.engine.state }

    fn is_finished(&self) -> bool { self.status == Status::Finished }
}

impl<'w> fmt::Debug for QueryIter<'w> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueryIter").field("status", &self.status).field("state", &self.engine.state).finish()
    }
}

static_assertions::assert_impl_all!(IterState<'static>: Send, Sync);
static_assertions::assert_impl_all!(QueryIter<'static>: Send);
