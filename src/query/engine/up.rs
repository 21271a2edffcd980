//! Matching ids on ancestors along a traversable relationship.

use std::sync::Arc;

use super::{at, AndCtx, Engine, OpCtx, UpCtx};
use crate::iter::FieldRef;
use crate::query::plan::{Label, Ref, VarId, VarKind};
use crate::{Entity, Id, Table, TableId, World};

/// Hierarchies deeper than this are assumed to contain a cycle.
const MAX_DEPTH: usize = 256;

/// An ancestor owning an id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Owner {
    pub(crate) entity:     Entity,
    pub(crate) table:      TableId,
    pub(crate) row:        usize,
    pub(crate) type_index: usize,
}

/// Finds the nearest ancestor of the entities in `table` along `trav` that has an id matching `pattern`.
pub(crate) fn find_owner(world: &World, table: &Table, trav: Entity, pattern: Id) -> Option<Owner> {
    let mut table = table;

    for _ in 0..MAX_DEPTH {
        let target = world.target_of(table, trav)?;
        let record = world.record(target)?;
        let target_table = world.table(record.table);

        if let Some(type_index) = target_table.next_match(pattern, 0) {
            return Some(Owner { entity: target, table: record.table, row: record.row, type_index });
        }
        table = target_table;
    }

    panic!("{trav:?} hierarchy above {:?} is deeper than {MAX_DEPTH}, it probably has a cycle", table.id())
}

/// Collects the tables below `owner` along `trav` whose nearest owner of `pattern` is `owner`.
///
/// Tables that have the id themselves are leaves.
/// They are included unless `self_` is set, in which case they are matched on themselves.
/// A table with several `(trav, *)` targets is only reached through its first one,
/// the same target [`find_owner`] follows.
fn down_tables(world: &World, owner: Entity, trav: Entity, pattern: Id, self_: bool) -> Arc<[TableId]> {
    let mut tables = Vec::new();
    let mut stack = vec![owner];

    while let Some(entity) = stack.pop() {
        for table_id in world.ids().tables(Id::pair(trav, entity), true) {
            let table = world.table(table_id);
            if world.target_of(table, trav) != Some(entity) {
                continue;
            }

            if table.next_match(pattern, 0).is_some() {
                if !self_ {
                    tables.push(table_id);
                }
                continue;
            }

            tables.push(table_id);
            if table.traversable_count() > 0 {
                stack.extend(table.entities().iter().copied().filter(|&child| world.is_traversable_entity(child)));
            }
        }
    }

    tables.into()
}

impl<'w> Engine<'w> {
    fn up_ctx(&mut self, op: Label) -> &mut UpCtx {
        let ctx = &mut self.ctx[at(op)];
        if !matches!(ctx, OpCtx::Up(_)) {
            *ctx = OpCtx::Up(Box::default());
        }
        match ctx {
            OpCtx::Up(ctx) => ctx,
            _ => unreachable!(),
        }
    }

    fn set_up_field(&mut self, field: usize, owner: Owner) {
        let owner_table = self.world.table(owner.table);
        let slot = &mut self.state.fields[field];
        slot.id = owner_table.ty()[owner.type_index];
        slot.src = owner.entity;
        slot.column = owner_table.column_of(owner.type_index).map(|column| FieldRef {
            table: owner.table,
            column,
            row: Some(owner.row),
        });
        self.state.set_fields |= 1 << field;
        self.state.up_fields |= 1 << field;
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn up(
        &mut self,
        op: Label,
        redo: bool,
        src: Ref,
        first: Ref,
        second: Option<Ref>,
        trav: Entity,
        self_: bool,
        field: usize,
    ) -> bool {
        match src {
            Ref::Var(var) if self.var_kind(var) == VarKind::Table => {
                if self.is_written(op, var) {
                    let range = self.vars[usize::from(var)].range.expect("written table variable has a range");
                    self.up_with(op, redo, range.table, Entity::NULL, None, first, second, trav, self_, field)
                } else {
                    self.up_select(op, redo, var, first, second, trav, self_, field)
                }
            }
            src => {
                let entity = match src {
                    Ref::Entity(entity) => entity,
                    Ref::Var(var) => {
                        self.vars[usize::from(var)].entity.expect("written entity variable has a value")
                    }
                };
                let Some(record) = self.world.record(entity) else { return false };
                self.up_with(op, redo, record.table, entity, Some(record.row), first, second, trav, self_, field)
            }
        }
    }

    /// Tests a bound table, then its ancestors.
    #[allow(clippy::too_many_arguments)]
    fn up_with(
        &mut self,
        op: Label,
        redo: bool,
        table: TableId,
        src: Entity,
        row: Option<usize>,
        first: Ref,
        second: Option<Ref>,
        trav: Entity,
        self_: bool,
        field: usize,
    ) -> bool {
        if redo {
            return false;
        }

        let world = self.world;
        let table = world.table(table);
        let pattern = self.resolve_id(op, first, second);

        if self_ {
            if let Some(type_index) = table.next_match(pattern, 0) {
                if self.bind_id_vars(op, first, second, table.ty()[type_index]) {
                    self.set_field(field, table, type_index, src, row);
                    return true;
                }
            }
        }

        match find_owner(world, table, trav, pattern) {
            Some(owner) => {
                let owner_id = world.table(owner.table).ty()[owner.type_index];
                if !self.bind_id_vars(op, first, second, owner_id) {
                    return false;
                }
                self.set_up_field(field, owner);
                true
            }
            None => false,
        }
    }

    /// Searches the tables that have the id on themselves (with `self_`) or on an ancestor.
    ///
    /// For every table with the id, the traversable entities in it are owners,
    /// and the tables below each owner are yielded with the owner as the field source.
    #[allow(clippy::too_many_arguments)]
    fn up_select(
        &mut self,
        op: Label,
        redo: bool,
        var: VarId,
        first: Ref,
        second: Option<Ref>,
        trav: Entity,
        self_: bool,
        field: usize,
    ) -> bool {
        let world = self.world;
        let flags = self.query.flags;

        if !redo {
            let pattern = self.resolve_id(op, first, second);
            let Some(record) = world.ids().get(pattern) else { return false };
            let cursor = if self_ && flags.match_empty {
                record.cache().all_cursor()
            } else {
                record.cache().cursor()
            };
            let ctx = self.up_ctx(op);
            ctx.with = AndCtx { cursor, pattern: Some(pattern), ..AndCtx::default() };
            ctx.row = 0;
            ctx.down = None;
            ctx.index = 0;
            ctx.source = None;
        }

        loop {
            let ctx = self.up_ctx(op);
            let pattern = ctx.with.pattern.expect("pattern is resolved on the first call");

            if let Some(down) = ctx.down.clone() {
                while ctx.index < down.len() {
                    let table_id = down[ctx.index];
                    ctx.index += 1;

                    let table = world.table(table_id);
                    if !flags.accepts(table) || (table.is_empty() && !flags.match_empty) {
                        continue;
                    }

                    let source = ctx.source.expect("down tables have an owner");
                    let record = world.record(source).expect("owner is alive during iteration");
                    let owner = Owner {
                        entity: source,
                        table: record.table,
                        row: record.row,
                        type_index: ctx.with.column,
                    };

                    if !self.bind_id_vars(op, first, second, world.table(owner.table).ty()[owner.type_index]) {
                        break;
                    }
                    self.bind_table(var, table);
                    self.set_up_field(field, owner);
                    return true;
                }

                let ctx = self.up_ctx(op);
                ctx.down = None;
                ctx.source = None;
                continue;
            }

            if let Some(with_table) = ctx.with.table {
                let table = world.table(with_table);
                if let Some(&entity) = table.entities().get(ctx.row) {
                    ctx.row += 1;
                    if world.is_traversable_entity(entity) {
                        let down = ctx
                            .cache
                            .entry(entity)
                            .or_insert_with(|| down_tables(world, entity, trav, pattern, self_))
                            .clone();
                        ctx.down = Some(down);
                        ctx.index = 0;
                        ctx.source = Some(entity);
                    }
                    continue;
                }
            }

            let record = world.ids().get(pattern).expect("id record outlives the iteration");
            let Some(entry) = ctx.with.cursor.next(record.cache()) else { return false };
            let table = world.table(entry.table().expect("id records only contain tables"));

            ctx.with.table = Some(table.id());
            ctx.with.column = entry.value().column;
            ctx.with.remaining = 1;
            ctx.row = if table.traversable_count() > 0 { 0 } else { table.count() };

            if self_
                && flags.accepts(table)
                && (!table.is_empty() || flags.match_empty)
                && self.bind_id_vars(op, first, second, table.ty()[entry.value().column])
            {
                self.bind_table(var, table);
                self.set_field(field, table, entry.value().column, Entity::NULL, None);
                return true;
            }
        }
    }
}
