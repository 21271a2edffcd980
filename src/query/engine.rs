//! The query engine evaluates a [`Plan`](super::Plan) with backtracking.
//!
//! Every instruction is dispatched with a `redo` flag.
//! Without `redo`, the instruction finds its first solution given the current variable bindings;
//! with `redo`, it finds the next solution after the one it last produced.
//! An instruction that succeeds continues at its `next` label,
//! and one that is exhausted backtracks to its `prev` label,
//! which is then dispatched with `redo` set.
//!
//! The `written` mask of each instruction tracks which variables are bound when it runs,
//! which decides whether an instruction searches for a table or tests a bound one.

use std::collections::HashMap;
use std::sync::Arc;

use super::cache::{CacheCursor, Match, QueryCache};
use super::plan::{var_bit, Label, OpKind, Ref, VarId, VarKind, THIS};
use super::term::Oper;
use super::QueryImpl;
use crate::iter::{FieldRef, FieldSlot, IterState};
use crate::table::{Table, TableRange};
use crate::table_cache::Cursor;
use crate::{Entity, Id, TableId, World};

mod up;

fn at(label: Label) -> usize { usize::try_from(label).expect("label is not the sentinel") }

/// The value of a variable.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct VarValue {
    pub(crate) range:  Option<TableRange>,
    pub(crate) entity: Option<Entity>,
}

/// The state of an instruction that matches an id on a table.
#[derive(Debug, Default)]
struct AndCtx {
    cursor:    Cursor,
    pattern:   Option<Id>,
    table:     Option<TableId>,
    /// The type index of the current match.
    column:    usize,
    /// The number of matches left in the current table, including the current one.
    remaining: usize,
}

#[derive(Debug, Default)]
struct UpCtx {
    with:     AndCtx,
    /// The next row of the current table to check for traversable entities.
    row:      usize,
    down:     Option<Arc<[TableId]>>,
    index:    usize,
    /// The entity owning the id for the tables in `down`.
    source:   Option<Entity>,
    /// Tables reached downwards from each owner.
    cache:    HashMap<Entity, Arc<[TableId]>>,
}

#[derive(Debug, Default)]
struct OrCtx {
    alt:    Label,
    select: bool,
}

#[derive(Debug, Default)]
struct EachCtx {
    row: usize,
    end: usize,
}

#[derive(Debug, Default)]
enum OpCtx {
    #[default]
    None,
    And(AndCtx),
    Up(Box<UpCtx>),
    Or(OrCtx),
    Each(EachCtx),
    /// The index of the next match in the table matches of a bound `$this`.
    CacheTable(usize),
}

/// The evaluation state of one iteration.
pub(crate) struct Engine<'w> {
    pub(crate) world:       &'w World,
    pub(crate) query:       &'w QueryImpl,
    pub(crate) cache:       Option<&'w QueryCache>,
    pub(crate) state:       IterState<'w>,
    pub(crate) vars:        Vec<VarValue>,
    /// Variables set before the first result.
    pub(crate) constrained: u64,
    written:                Vec<u64>,
    ctx:                    Vec<OpCtx>,
    redo:                   bool,
    cursor:                 Option<CacheCursor<'w>>,
    /// Cache matches visited so far, including skipped empty tables.
    pub(crate) visited:     Vec<&'w Match>,
}

impl<'w> Engine<'w> {
    pub(crate) fn new(world: &'w World, query: &'w QueryImpl) -> Self {
        assert_eq!(query.world_id, world.id(), "query was created by another world");

        let cache = query.cache.as_ref().map(|link| world.query_cache(link.id));
        let fields = query
            .fields
            .iter()
            .map(|field| FieldSlot { id: field.id, src: Entity::NULL, column: None })
            .collect();

        Self {
            world,
            query,
            cache,
            state: IterState::new(world, fields),
            vars: vec![VarValue::default(); query.plan.vars.len()],
            constrained: 0,
            written: vec![0; query.plan.len()],
            ctx: query.plan.ops.iter().map(|_| OpCtx::None).collect(),
            redo: false,
            cursor: None,
            visited: Vec::new(),
        }
    }

    fn var_kind(&self, var: VarId) -> VarKind { self.query.plan.vars[usize::from(var)].kind }

    fn is_written(&self, op: Label, var: VarId) -> bool { self.written[at(op)] & var_bit(var) != 0 }

    /// Binds a variable before the first result.
    pub(crate) fn constrain(&mut self, var: VarId, value: VarValue) {
        self.vars[usize::from(var)] = value;
        self.constrained |= var_bit(var);
    }

    /// Restricts iteration to one group of the cache.
    pub(crate) fn set_group(&mut self, group: u64) {
        let cache = self.cache.expect("set_group requires a cached query");
        self.cursor = Some(cache.cursor_for_group(group));
    }

    /// Produces the next result.
    pub(crate) fn next(&mut self) -> bool {
        if self.cursor.is_none() {
            if let Some(cache) = self.cache {
                self.cursor = Some(cache.cursor(self.world));
            }
        }

        let trivial_cache = self.query.cache.as_ref().map_or(false, |link| link.trivial);
        if trivial_cache && self.constrained & var_bit(THIS) == 0 {
            self.redo = true;
            return self.next_cached();
        }

        let last = self.query.plan.yield_label();
        let cur = if self.redo {
            last - 1
        } else {
            self.written[0] = self.constrained;
            0
        };

        let found = self.run_until(self.redo, -1, cur, last);
        self.redo = true;

        if found {
            self.populate();
        }
        found
    }

    /// Iterates the query cache without evaluating instructions.
    fn next_cached(&mut self) -> bool {
        loop {
            let Some(item) = self.cursor.as_mut().expect("cursor is created on first next").next()
            else {
                return false;
            };

            self.visited.push(item.matched);
            let table = self.world.table(item.matched.table);
            if table.is_empty() && !self.query.flags.match_empty {
                continue;
            }

            self.apply_match(item.matched);
            let range = item.range.unwrap_or(TableRange { table: table.id(), offset: 0, count: table.count() });
            self.vars[usize::from(THIS)].range = Some(range);
            self.state.group_id = item.group;
            self.populate();
            return true;
        }
    }

    fn populate(&mut self) {
        if self.query.has_this {
            let range = self.vars[usize::from(THIS)].range.expect("$this is bound when yielding");
            self.state.table = Some(range.table);
            self.state.offset = range.offset;
            self.state.count = range.count;
        } else {
            self.state.table = None;
            self.state.offset = 0;
            self.state.count = 0;
        }
    }

    /// Evaluates instructions from `cur` until reaching `last` or backtracking to `first`.
    pub(crate) fn run_until(&mut self, mut redo: bool, first: Label, mut cur: Label, last: Label) -> bool {
        loop {
            let op_index = cur;
            let op = self.query.plan.op(op_index);
            let result = self.dispatch(op_index, redo);

            cur = if result { op.next } else { op.prev };
            redo = cur < op_index;

            // Recomputed on every forward step, so bindings made inside a finished
            // Not or Optional block do not reach the instructions after it.
            if !redo {
                self.written[at(cur)] = self.written[at(op_index)] | op.written;
            }

            if cur == first {
                return false;
            }
            if cur >= last {
                return true;
            }
        }
    }

    fn dispatch(&mut self, op: Label, redo: bool) -> bool {
        let query = self.query;
        let plan_op = query.plan.op(op);
        let field = plan_op.field;

        match &plan_op.kind {
            &OpKind::And { src, first, second } => {
                self.and(op, redo, src, first, second, field.expect("and writes a field"))
            }
            &OpKind::Up { src, first, second, trav, self_ } => {
                self.up(op, redo, src, first, second, trav, self_, field.expect("up writes a field"))
            }
            &OpKind::From { oper, src, from } => {
                !redo && self.from(oper, src, from, field.expect("from writes a field"), op)
            }
            OpKind::Trivial { terms } => self.trivial(op, redo, terms),
            OpKind::Cache => self.cache_op(op, redo),
            &OpKind::Or { end } => self.or(op, redo, end),
            &OpKind::Not { end, resets } => {
                if redo {
                    return false;
                }
                let result = self.run_block(op, end);
                self.reset_block(field, resets);
                !result
            }
            &OpKind::Optional { end, resets } => {
                if redo {
                    return false;
                }
                if !self.run_block(op, end) {
                    self.reset_block(field, resets);
                }
                true
            }
            OpKind::End => !redo,
            &OpKind::Each { table, entity } => self.each(op, redo, table, entity),
            OpKind::SetVars { fields } => {
                if redo {
                    return false;
                }
                self.set_vars(fields);
                true
            }
            OpKind::Yield => false,
        }
    }

    fn run_block(&mut self, op: Label, end: Label) -> bool {
        self.written[at(op + 1)] = self.written[at(op)];
        self.run_until(false, op, op + 1, end)
    }

    fn reset_block(&mut self, field: Option<usize>, resets: u64) {
        for var in 0..self.vars.len() {
            if resets & (1 << var) != 0 {
                self.vars[var] = VarValue::default();
            }
        }

        if let Some(field) = field {
            let slot = &mut self.state.fields[field];
            slot.id = self.query.fields[field].id;
            slot.src = Entity::NULL;
            slot.column = None;
            self.state.set_fields &= !(1 << field);
            self.state.up_fields &= !(1 << field);
        }
    }

    fn resolve_elem(&self, op: Label, r: Ref) -> Option<Entity> {
        match r {
            Ref::Entity(entity) => Some(entity),
            Ref::Var(var) if self.is_written(op, var) => {
                Some(self.vars[usize::from(var)].entity.expect("written entity variable has a value"))
            }
            Ref::Var(_) => None,
        }
    }

    /// The id to match, with unbound variables replaced by wildcards.
    fn resolve_id(&self, op: Label, first: Ref, second: Option<Ref>) -> Id {
        let first = self.resolve_elem(op, first);
        match second {
            Some(second) => {
                let second = self.resolve_elem(op, second);
                Id::pair_from_indices(
                    first.map_or(Entity::WILDCARD.index(), Entity::index),
                    second.map_or(Entity::WILDCARD.index(), Entity::index),
                )
            }
            None => first.map_or(Id::WILDCARD, Id::from),
        }
    }

    /// Binds the unbound variables in the id of a term to the matched id.
    ///
    /// Returns `false` if a pair element no longer refers to a live entity.
    fn bind_id_vars(&mut self, op: Label, first: Ref, second: Option<Ref>, matched: Id) -> bool {
        let mut bind = |var: VarId, entity: Option<Entity>| match entity {
            Some(entity) => {
                self.vars[usize::from(var)] = VarValue { range: None, entity: Some(entity) };
                true
            }
            None => false,
        };

        if matched.is_pair() {
            if let Ref::Var(var) = first {
                if self.written[at(op)] & var_bit(var) == 0
                    && !bind(var, self.world.entity_by_index(matched.first_index()))
                {
                    return false;
                }
            }
            if let Some(Ref::Var(var)) = second {
                if self.written[at(op)] & var_bit(var) == 0
                    && !bind(var, self.world.entity_by_index(matched.second_index()))
                {
                    return false;
                }
            }
        } else if let Ref::Var(var) = first {
            if self.written[at(op)] & var_bit(var) == 0 && !bind(var, matched.as_entity()) {
                return false;
            }
        }
        true
    }

    fn set_field(&mut self, field: usize, table: &Table, type_index: usize, src: Entity, row: Option<usize>) {
        let slot = &mut self.state.fields[field];
        slot.id = table.ty()[type_index];
        slot.src = src;
        slot.column = table.column_of(type_index).map(|column| FieldRef { table: table.id(), column, row });
        self.state.set_fields |= 1 << field;
        self.state.up_fields &= !(1 << field);
    }

    fn bind_table(&mut self, var: VarId, table: &Table) {
        self.vars[usize::from(var)] = VarValue {
            range:  Some(TableRange { table: table.id(), offset: 0, count: table.count() }),
            entity: None,
        };
    }

    fn and_ctx(&mut self, op: Label) -> &mut AndCtx {
        let ctx = &mut self.ctx[at(op)];
        if !matches!(ctx, OpCtx::And(_)) {
            *ctx = OpCtx::And(AndCtx::default());
        }
        match ctx {
            OpCtx::And(ctx) => ctx,
            _ => unreachable!(),
        }
    }

    fn and(&mut self, op: Label, redo: bool, src: Ref, first: Ref, second: Option<Ref>, field: usize) -> bool {
        match src {
            Ref::Var(var) if self.var_kind(var) == VarKind::Table => {
                if self.is_written(op, var) {
                    let range = self.vars[usize::from(var)].range.expect("written table variable has a range");
                    self.with(op, redo, range.table, first, second, field, Entity::NULL, None)
                } else {
                    self.select(op, redo, var, first, second, field)
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
                self.with(op, redo, record.table, first, second, field, entity, Some(record.row))
            }
        }
    }

    /// Searches the tables containing the id.
    fn select(&mut self, op: Label, redo: bool, var: VarId, first: Ref, second: Option<Ref>, field: usize) -> bool {
        let world = self.world;
        let match_empty = self.query.flags.match_empty;
        let flags = self.query.flags;

        if redo {
            if let Some(type_index) = self.next_valid_column(op, first, second) {
                let table = world.table(self.and_ctx(op).table.expect("redo after a match"));
                self.set_field(field, table, type_index, Entity::NULL, None);
                return true;
            }
        } else {
            let pattern = self.resolve_id(op, first, second);
            let Some(record) = world.ids().get(pattern) else { return false };
            let cursor = if match_empty { record.cache().all_cursor() } else { record.cache().cursor() };
            *self.and_ctx(op) = AndCtx { cursor, pattern: Some(pattern), ..AndCtx::default() };
        }

        loop {
            let ctx = self.and_ctx(op);
            let pattern = ctx.pattern.expect("pattern is resolved on the first call");
            let record = world.ids().get(pattern).expect("id record outlives the iteration");
            let Some(entry) = ctx.cursor.next(record.cache()) else { return false };

            let table = world.table(entry.table().expect("id records only contain tables"));
            if !flags.accepts(table) {
                continue;
            }

            let table_record = *entry.value();
            ctx.table = Some(table.id());
            ctx.column = table_record.column;
            ctx.remaining = table_record.count;

            if !self.bind_id_vars(op, first, second, table.ty()[table_record.column]) {
                match self.next_valid_column(op, first, second) {
                    Some(type_index) => {
                        self.bind_table(var, table);
                        self.set_field(field, table, type_index, Entity::NULL, None);
                        return true;
                    }
                    None => continue,
                }
            }

            self.bind_table(var, table);
            self.set_field(field, table, table_record.column, Entity::NULL, None);
            return true;
        }
    }

    /// Advances to the next column of the current table matching the pattern.
    fn next_column(&mut self, op: Label) -> Option<usize> {
        let world = self.world;
        let ctx = self.and_ctx(op);
        if ctx.remaining <= 1 {
            return None;
        }

        let table = world.table(ctx.table?);
        let pattern = ctx.pattern.expect("pattern is resolved on the first call");
        ctx.column = table.next_match(pattern, ctx.column + 1).expect("table record counts all matches");
        ctx.remaining -= 1;
        Some(ctx.column)
    }

    fn next_valid_column(&mut self, op: Label, first: Ref, second: Option<Ref>) -> Option<usize> {
        while let Some(type_index) = self.next_column(op) {
            let table = self.world.table(self.and_ctx(op).table.expect("column of a matched table"));
            if self.bind_id_vars(op, first, second, table.ty()[type_index]) {
                return Some(type_index);
            }
        }
        None
    }

    /// Tests a bound table for the id.
    #[allow(clippy::too_many_arguments)]
    fn with(
        &mut self,
        op: Label,
        redo: bool,
        table: TableId,
        first: Ref,
        second: Option<Ref>,
        field: usize,
        src: Entity,
        row: Option<usize>,
    ) -> bool {
        let table = self.world.table(table);

        let type_index = if redo {
            self.next_valid_column(op, first, second)
        } else {
            let pattern = self.resolve_id(op, first, second);
            let Some(record) = self.world.ids().table_record(pattern, table.id()) else { return false };
            *self.and_ctx(op) = AndCtx {
                cursor:    Cursor::default(),
                pattern:   Some(pattern),
                table:     Some(table.id()),
                column:    record.column,
                remaining: record.count,
            };

            if self.bind_id_vars(op, first, second, table.ty()[record.column]) {
                Some(record.column)
            } else {
                self.next_valid_column(op, first, second)
            }
        };

        match type_index {
            Some(type_index) => {
                self.set_field(field, table, type_index, src, row);
                true
            }
            None => false,
        }
    }

    /// The table of a source, and the entity and row if the source is an entity.
    fn src_table(&self, op: Label, src: Ref) -> Option<(TableId, Entity, Option<usize>)> {
        match src {
            Ref::Var(var) if self.var_kind(var) == VarKind::Table => {
                debug_assert!(self.is_written(op, var), "source of a test is bound");
                let range = self.vars[usize::from(var)].range?;
                Some((range.table, Entity::NULL, None))
            }
            Ref::Var(var) => {
                let entity = self.vars[usize::from(var)].entity?;
                let record = self.world.record(entity)?;
                Some((record.table, entity, Some(record.row)))
            }
            Ref::Entity(entity) => {
                let record = self.world.record(entity)?;
                Some((record.table, entity, Some(record.row)))
            }
        }
    }

    fn from(&mut self, oper: Oper, src: Ref, from: Entity, field: usize, op: Label) -> bool {
        let Some((table, src, _)) = self.src_table(op, src) else { return false };
        let table = self.world.table(table);
        let ids: &[Id] = match self.world.record(from) {
            Some(record) => self.world.table(record.table).ty(),
            None => &[],
        };

        let result = match oper {
            Oper::AndFrom => ids.iter().all(|&id| table.has(id)),
            Oper::OrFrom => ids.iter().any(|&id| table.has(id)),
            Oper::NotFrom => !ids.iter().any(|&id| table.has(id)),
            _ => unreachable!("from instructions only use from operators"),
        };

        let slot = &mut self.state.fields[field];
        slot.id = Id::from(from);
        slot.src = src;
        slot.column = None;
        if result && oper != Oper::NotFrom {
            self.state.set_fields |= 1 << field;
        } else {
            self.state.set_fields &= !(1 << field);
        }
        result
    }

    fn trivial(&mut self, op: Label, redo: bool, terms: &[(usize, Id)]) -> bool {
        let world = self.world;
        let flags = self.query.flags;

        if self.is_written(op, THIS) {
            if redo {
                return false;
            }
            let range = self.vars[usize::from(THIS)].range.expect("written $this has a range");
            return self.trivial_test(world.table(range.table), terms);
        }

        if !redo {
            let Some(record) = world.ids().get(terms[0].1) else { return false };
            let cursor = if flags.match_empty { record.cache().all_cursor() } else { record.cache().cursor() };
            *self.and_ctx(op) = AndCtx { cursor, pattern: Some(terms[0].1), ..AndCtx::default() };
        }

        let record = world.ids().get(terms[0].1).expect("id record outlives the iteration");
        loop {
            let Some(entry) = self.and_ctx(op).cursor.next(record.cache()) else { return false };
            let table = world.table(entry.table().expect("id records only contain tables"));
            if flags.accepts(table) && self.trivial_test(table, terms) {
                self.bind_table(THIS, table);
                return true;
            }
        }
    }

    fn trivial_test(&mut self, table: &Table, terms: &[(usize, Id)]) -> bool {
        let ids = self.world.ids();
        if !terms.iter().all(|&(_, id)| table.has(id)) {
            return false;
        }

        for &(field, id) in terms {
            let column = ids.table_record(id, table.id()).expect("table has the id").column;
            self.set_field(field, table, column, Entity::NULL, None);
        }
        true
    }

    fn or(&mut self, op: Label, redo: bool, end: Label) -> bool {
        let first_alt = op + 1;

        if !redo {
            let incoming = self.written[at(op)];
            for alt in first_alt..end {
                self.written[at(alt)] = incoming;
            }

            let select = match &self.query.plan.op(first_alt).kind {
                OpKind::And { src: Ref::Var(var), .. } | OpKind::Up { src: Ref::Var(var), .. } => {
                    self.var_kind(*var) == VarKind::Table && incoming & var_bit(*var) == 0
                }
                _ => false,
            };
            self.ctx[at(op)] = OpCtx::Or(OrCtx { alt: first_alt, select });
        }

        let OpCtx::Or(OrCtx { alt, select }) = self.ctx[at(op)] else {
            unreachable!("or context is set on the first call")
        };
        let (mut alt, mut redo_alt) = (alt, redo);

        loop {
            if alt >= end {
                return false;
            }

            if self.dispatch(alt, redo_alt) {
                if select && self.found_earlier(op, first_alt, alt) {
                    redo_alt = true;
                    continue;
                }
                self.ctx[at(op)] = OpCtx::Or(OrCtx { alt, select });
                return true;
            }

            if redo && !select {
                return false;
            }
            alt += 1;
            redo_alt = false;
        }
    }

    /// Whether a table found by alternative `alt` is also matched by an earlier alternative.
    fn found_earlier(&mut self, op: Label, first_alt: Label, alt: Label) -> bool {
        let var = match &self.query.plan.op(alt).kind {
            OpKind::And { src: Ref::Var(var), .. } | OpKind::Up { src: Ref::Var(var), .. } => *var,
            _ => return false,
        };
        let field = self.query.plan.op(alt).field.expect("alternatives write a field");
        let saved_slot = self.state.fields[field];
        let saved_bits = (self.state.set_fields, self.state.up_fields);

        let mut found = false;
        for earlier in first_alt..alt {
            let saved_written = self.written[at(earlier)];
            self.written[at(earlier)] = self.written[at(op)] | var_bit(var);
            let saved_ctx = std::mem::take(&mut self.ctx[at(earlier)]);

            found = self.dispatch(earlier, false);

            self.ctx[at(earlier)] = saved_ctx;
            self.written[at(earlier)] = saved_written;
            if found {
                break;
            }
        }

        self.state.fields[field] = saved_slot;
        (self.state.set_fields, self.state.up_fields) = saved_bits;
        found
    }

    fn each(&mut self, op: Label, redo: bool, table_var: VarId, entity_var: VarId) -> bool {
        if self.is_written(op, entity_var) {
            return !redo;
        }

        let range = self.vars[usize::from(table_var)].range.expect("each follows a table match");
        let row = if redo {
            match &mut self.ctx[at(op)] {
                OpCtx::Each(ctx) => {
                    ctx.row += 1;
                    ctx.row
                }
                _ => unreachable!("each context is set on the first call"),
            }
        } else {
            self.ctx[at(op)] =
                OpCtx::Each(EachCtx { row: range.offset, end: range.offset + range.count });
            range.offset
        };

        let OpCtx::Each(EachCtx { end, .. }) = self.ctx[at(op)] else { unreachable!() };
        if row >= end {
            return false;
        }

        let entity = self.world.table(range.table).entities()[row];
        self.vars[usize::from(entity_var)] = VarValue {
            range:  Some(TableRange { table: range.table, offset: row, count: 1 }),
            entity: Some(entity),
        };
        true
    }

    fn set_vars(&mut self, fields: &[(usize, VarId)]) {
        for &(field, var) in fields {
            if self.state.set_fields & (1 << field) == 0 {
                continue;
            }
            let entity = self.vars[usize::from(var)].entity.expect("entity variable is bound by each");
            let record = self.world.record(entity).expect("bound entity is alive");
            let slot = &mut self.state.fields[field];
            slot.src = entity;
            if let Some(column) = &mut slot.column {
                column.row = Some(record.row);
            }
        }
    }

    fn cache_op(&mut self, op: Label, redo: bool) -> bool {
        let cache = self.cache.expect("cache instruction requires a cache");

        if self.is_written(op, THIS) {
            let range = self.vars[usize::from(THIS)].range.expect("written $this has a range");
            let Some(matches) = cache.table_matches(range.table) else { return false };

            let index = match (&mut self.ctx[at(op)], redo) {
                (OpCtx::CacheTable(index), true) => {
                    *index += 1;
                    *index
                }
                (ctx, _) => {
                    *ctx = OpCtx::CacheTable(0);
                    0
                }
            };
            let Some(matched) = matches.get(index) else { return false };
            self.apply_match(matched);
            self.state.group_id = matches.group;
            return true;
        }

        loop {
            let Some(item) = self.cursor.as_mut().expect("cursor is created on first next").next()
            else {
                return false;
            };

            self.visited.push(item.matched);
            let table = self.world.table(item.matched.table);
            if table.is_empty() && !self.query.flags.match_empty {
                continue;
            }

            self.apply_match(item.matched);
            let range = item.range.unwrap_or(TableRange { table: table.id(), offset: 0, count: table.count() });
            self.vars[usize::from(THIS)] = VarValue { range: Some(range), entity: None };
            self.state.group_id = item.group;
            return true;
        }
    }

    fn apply_match(&mut self, matched: &Match) {
        let link = self.query.cache.as_ref().expect("cache matches are applied to cached queries");

        for (cache_field, &field) in link.field_map.iter().enumerate() {
            let bit = 1 << field;
            let slot = &mut self.state.fields[field];
            slot.id = matched.ids[cache_field];

            if matched.set_fields & (1 << cache_field) == 0 {
                slot.src = Entity::NULL;
                slot.column = None;
                self.state.set_fields &= !bit;
                self.state.up_fields &= !bit;
                continue;
            }

            self.state.set_fields |= bit;
            let src = matched.sources[cache_field];
            if src.is_null() {
                slot.src = Entity::NULL;
                slot.column = matched.columns[cache_field].map(|column| FieldRef {
                    table: matched.table,
                    column,
                    row: None,
                });
                self.state.up_fields &= !bit;
            } else {
                slot.src = src;
                slot.column = self.world.record(src).and_then(|record| {
                    let column = self.world.table(record.table).column_for_id(slot.id)?;
                    Some(FieldRef { table: record.table, column, row: Some(record.row) })
                });
                if matched.up_fields & (1 << cache_field) != 0 {
                    self.state.up_fields |= bit;
                } else {
                    self.state.up_fields &= !bit;
                }
            }
        }
    }

    /// Synchronizes the monitors of the visited cache matches after a complete iteration.
    pub(crate) fn sync_monitors(&mut self) {
        if let Some(cache) = self.cache {
            for matched in self.visited.drain(..) {
                cache.sync_monitor(self.world, matched);
            }
            cache.sync_match_count();
        }
    }
}
