//! Compiles query terms into instruction lists.

use itertools::Itertools;
use xias::Xias;

use super::builder::{Builder, CacheKind, GroupBy, GroupCreateFn, GroupDeleteFn, OrderBy};
use super::plan::{var_bit, Label, Op, OpKind, Plan, Ref, VarId, VarInfo, VarKind, THIS};
use super::term::{Oper, Term, TermRef, Trav};
use super::{FieldInfo, QueryFlags, QueryImpl};
use crate::{Entity, Id, World};

/// The terms sharing one field. Only `Or` chains have more than one term.
#[derive(Debug, Clone)]
struct Chain {
    terms: Vec<Term>,
    field: usize,
}

impl Chain {
    fn head(&self) -> &Term { &self.terms[0] }

    fn oper(&self) -> Oper {
        if self.terms.len() > 1 {
            Oper::Or
        } else {
            self.head().oper
        }
    }

    fn selects(&self) -> bool { matches!(self.oper(), Oper::And | Oper::Or) }

    fn cacheable(&self) -> bool {
        self.terms.iter().all(|term| term.src == TermRef::This && !term.has_id_var())
    }

    /// Terms that select come first, then tests of bound sources, then optional and negated terms.
    fn rank(&self) -> u8 {
        match self.oper() {
            Oper::And | Oper::Or => 0,
            Oper::AndFrom | Oper::OrFrom => 1,
            Oper::Optional => 2,
            Oper::Not | Oper::NotFrom => 3,
        }
    }
}

fn chains(terms: &[Term]) -> Vec<Chain> {
    let mut chains: Vec<Chain> = Vec::new();
    let mut joined = false;

    for term in terms {
        if joined {
            chains.last_mut().expect("an or term precedes").terms.push(*term);
        } else {
            chains.push(Chain { terms: vec![*term], field: chains.len() });
        }
        joined = term.oper == Oper::Or;
    }

    assert!(!joined, "an or chain must end with a term");

    for chain in &mut chains {
        if chain.terms.len() > 1 {
            for term in &mut chain.terms {
                term.oper = Oper::Or;
            }
        }
    }

    chains
}

/// The id a term matches, with variables replaced by wildcards.
pub(crate) fn term_id(term: &Term) -> Id {
    fn index(r: TermRef) -> u32 {
        match r {
            TermRef::Entity(entity) => entity.index(),
            _ => Entity::WILDCARD.index(),
        }
    }

    match (term.first, term.second) {
        (first, Some(second)) => Id::pair_from_indices(index(first), index(second)),
        (TermRef::Entity(entity), None) => Id::from(entity),
        (_, None) => Id::WILDCARD,
    }
}

/// The cache half of a compiled query.
pub(crate) struct CacheSpec {
    pub(crate) query:           QueryImpl,
    /// Maps each field of the cache query to the field of the main query.
    pub(crate) field_map:       Box<[usize]>,
    /// The main query only replays the cache.
    pub(crate) trivial:         bool,
    pub(crate) group_by:        Option<GroupBy>,
    pub(crate) on_group_create: Option<GroupCreateFn>,
    pub(crate) on_group_delete: Option<GroupDeleteFn>,
    pub(crate) order_by:        Option<OrderBy>,
    /// Matches depend on entities other than the matched tables.
    pub(crate) has_refs:        bool,
}

pub(crate) struct Compiled {
    pub(crate) query: QueryImpl,
    pub(crate) cache: Option<CacheSpec>,
}

pub(crate) fn compile(world: &World, builder: Builder) -> Compiled {
    let Builder { terms, cache_kind, flags, mut group_by, on_group_create, on_group_delete, order_by } =
        builder;

    assert!(!terms.is_empty(), "a query needs at least one term");

    let chains = chains(&terms);

    for chain in &chains {
        for term in &chain.terms {
            if let Some(rel) = term.trav.rel() {
                assert!(world.is_traversable(rel), "{rel:?} is not a traversable relationship");
            }
        }
        if chain.terms.len() > 1 {
            assert!(
                chain.terms.iter().all(|term| term.src == chain.head().src && !term.has_id_var()),
                "terms of an or chain must share their source and have no variables in their ids"
            );
        }
    }

    let use_cache = match cache_kind {
        CacheKind::None => false,
        CacheKind::All => {
            if let Some(chain) = chains.iter().find(|chain| !chain.cacheable()) {
                panic!("term {:?} cannot be cached", chain.head());
            }
            true
        }
        CacheKind::Default | CacheKind::Auto => {
            chains.iter().any(|chain| chain.cacheable() && chain.selects())
        }
    };

    let cascade = chains.iter().flat_map(|chain| &chain.terms).find_map(|term| match term.trav {
        Trav::Cascade { rel, desc } => Some((rel, desc)),
        _ => None,
    });
    if group_by.is_none() && use_cache {
        if let Some((rel, desc)) = cascade {
            group_by = Some(GroupBy { rel, callback: None, desc, cascade: true });
        }
    }

    assert!(
        use_cache || (group_by.is_none() && order_by.is_none() && on_group_create.is_none()),
        "group_by and order_by require a cached query"
    );

    let fields: Box<[FieldInfo]> =
        chains.iter().map(|chain| FieldInfo { term: *chain.head(), id: term_id(chain.head()) }).collect();
    assert!(fields.len() <= 64, "a query can have at most 64 fields");

    if !use_cache {
        let plan = compile_uncached(&chains);
        return Compiled { query: QueryImpl::new(world, fields, plan, flags, has_this(&chains)), cache: None };
    }

    let (cached, rest): (Vec<&Chain>, Vec<&Chain>) = chains.iter().partition(|chain| chain.cacheable());

    if let Some(order_by) = &order_by {
        let component = Id::from(order_by.component);
        assert!(
            cached.iter().any(|chain| {
                chain.oper() == Oper::And
                    && chain.head().trav == Trav::SelfOnly
                    && term_id(chain.head()) == component
            }),
            "order_by component {:?} must be matched on $this",
            order_by.component
        );
    }

    let cache_chains: Vec<Chain> = cached
        .iter()
        .enumerate()
        .map(|(field, chain)| Chain { terms: chain.terms.clone(), field })
        .collect();
    let field_map: Box<[usize]> = cached.iter().map(|chain| chain.field).collect();
    let cache_fields: Box<[FieldInfo]> = cache_chains
        .iter()
        .map(|chain| FieldInfo { term: *chain.head(), id: term_id(chain.head()) })
        .collect();
    let cache_flags = QueryFlags { match_empty: true, ..flags };
    let cache_plan = compile_uncached(&cache_chains);
    let has_refs = cache_chains.iter().flat_map(|chain| &chain.terms).any(|term| term.trav != Trav::SelfOnly);

    let trivial = rest.is_empty() && chains.iter().all(|chain| chain.cacheable());

    let mut compiler = Compiler::new(&chains);
    compiler.written = var_bit(THIS);
    compiler.push(OpKind::Cache, None, var_bit(THIS));
    let rest: Vec<Chain> = rest.into_iter().cloned().collect();
    compiler.emit_all(&rest);
    let plan = compiler.finish();

    Compiled {
        query: QueryImpl::new(world, fields, plan, flags, true),
        cache: Some(CacheSpec {
            query: QueryImpl::new(world, cache_fields, cache_plan, cache_flags, true),
            field_map,
            trivial,
            group_by,
            on_group_create,
            on_group_delete,
            order_by,
            has_refs,
        }),
    }
}

fn has_this(chains: &[Chain]) -> bool {
    chains.iter().flat_map(|chain| &chain.terms).any(|term| term.src == TermRef::This)
}

fn compile_uncached(chains: &[Chain]) -> Plan {
    let trivial = chains.iter().all(|chain| {
        let term = chain.head();
        chain.terms.len() == 1
            && term.oper == Oper::And
            && term.src == TermRef::This
            && term.trav == Trav::SelfOnly
            && !term.has_id_var()
            && !term_id(term).is_wildcard()
    });

    let mut compiler = Compiler::new(chains);
    if trivial {
        let terms = chains.iter().map(|chain| (chain.field, term_id(chain.head()))).collect();
        compiler.push(OpKind::Trivial { terms }, None, var_bit(THIS));
        compiler.written = var_bit(THIS);
    } else {
        compiler.emit_all(chains);
    }
    compiler.finish()
}

struct Compiler {
    vars:     Vec<VarInfo>,
    ops:      Vec<Op>,
    /// Variables bound by the instructions emitted so far.
    written:  u64,
    /// Fields whose source is an entity variable matched through its table variable.
    set_vars: Vec<(usize, VarId)>,
}

impl Compiler {
    fn new(chains: &[Chain]) -> Self {
        let mut compiler = Self {
            vars: vec![VarInfo { name: "this", kind: VarKind::Table, table_var: None, companion: false }],
            ops: Vec::new(),
            written: 0,
            set_vars: Vec::new(),
        };

        for term in chains.iter().flat_map(|chain| &chain.terms) {
            for r in [Some(term.first), term.second, Some(term.src)].into_iter().flatten() {
                if let TermRef::Var(name) = r {
                    compiler.var(name);
                }
            }
        }

        compiler
    }

    fn var(&mut self, name: &'static str) -> VarId {
        if let Some(index) =
            self.vars.iter().position(|var| var.name == name && var.kind == VarKind::Entity)
        {
            return index.small_int();
        }

        assert!(self.vars.len() < 64, "a query can have at most 64 variables");
        self.vars.push(VarInfo { name, kind: VarKind::Entity, table_var: None, companion: false });
        (self.vars.len() - 1).small_int()
    }

    fn table_var(&mut self, var: VarId) -> VarId {
        if let Some(table_var) = self.vars[usize::from(var)].table_var {
            return table_var;
        }

        assert!(self.vars.len() < 64, "a query can have at most 64 variables");
        let name = self.vars[usize::from(var)].name;
        self.vars.push(VarInfo { name, kind: VarKind::Table, table_var: None, companion: true });
        let table_var: VarId = (self.vars.len() - 1).small_int();
        self.vars[usize::from(var)].table_var = Some(table_var);
        table_var
    }

    fn label(&self) -> Label { self.ops.len().small_int() }

    fn push(&mut self, kind: OpKind, field: Option<usize>, written: u64) -> Label {
        let label = self.label();
        self.ops.push(Op { kind, prev: label - 1, next: label + 1, field, written });
        label
    }

    fn op_mut(&mut self, label: Label) -> &mut Op {
        &mut self.ops[usize::try_from(label).expect("label is not the sentinel")]
    }

    fn id_ref(&mut self, r: TermRef) -> (Ref, u64) {
        match r {
            TermRef::Entity(entity) => (Ref::Entity(entity), 0),
            TermRef::Wildcard => (Ref::Entity(Entity::WILDCARD), 0),
            TermRef::Var(name) => {
                let var = self.var(name);
                let written = if self.written & var_bit(var) == 0 { var_bit(var) } else { 0 };
                (Ref::Var(var), written)
            }
            TermRef::This => panic!("$this cannot be used in an id"),
        }
    }

    /// Resolves the source of a term. Also returns the entity variable matched through its table.
    fn src(&mut self, src: TermRef) -> (Ref, u64, Option<VarId>) {
        match src {
            TermRef::This => {
                let written = if self.written & var_bit(THIS) == 0 { var_bit(THIS) } else { 0 };
                (Ref::Var(THIS), written, None)
            }
            TermRef::Entity(entity) => (Ref::Entity(entity), 0, None),
            TermRef::Var(name) => {
                let var = self.var(name);
                if self.written & var_bit(var) != 0 {
                    (Ref::Var(var), 0, None)
                } else {
                    let table_var = self.table_var(var);
                    let written =
                        if self.written & var_bit(table_var) == 0 { var_bit(table_var) } else { 0 };
                    (Ref::Var(table_var), written, Some(var))
                }
            }
            TermRef::Wildcard => panic!("a wildcard source is not supported"),
        }
    }

    fn term_op(&mut self, term: &Term, src: Ref) -> (OpKind, u64) {
        let (first, first_written) = self.id_ref(term.first);
        let (second, second_written) = match term.second {
            Some(second) => {
                let (second, written) = self.id_ref(second);
                (Some(second), written)
            }
            None => (None, 0),
        };

        let kind = match term.trav {
            Trav::SelfOnly => OpKind::And { src, first, second },
            Trav::Up(trav) | Trav::Cascade { rel: trav, .. } => {
                OpKind::Up { src, first, second, trav, self_: false }
            }
            Trav::SelfUp(trav) => OpKind::Up { src, first, second, trav, self_: true },
        };
        (kind, first_written | second_written)
    }

    fn assert_src_bound(&self, chain: &Chain, src: Ref) {
        if let Ref::Var(THIS) = src {
            assert!(
                self.written & var_bit(THIS) != 0,
                "{:?} on $this requires another term that selects $this",
                chain.oper()
            );
        }
    }

    fn emit_all(&mut self, chains: &[Chain]) {
        let ordered: Vec<&Chain> = chains.iter().sorted_by_key(|chain| chain.rank()).collect();

        for (index, chain) in ordered.iter().enumerate() {
            let matched_through = self.emit(chain);

            if let Some(var) = matched_through {
                let used_later = ordered[index + 1..]
                    .iter()
                    .any(|later| later.selects() && later.head().src == chain.head().src);
                if !used_later {
                    let table = self.vars[usize::from(var)].table_var.expect("table variable was created");
                    self.push(OpKind::Each { table, entity: var }, None, var_bit(var));
                    self.written |= var_bit(var);
                }
            }
        }
    }

    /// Emits the instructions of one chain.
    ///
    /// Returns the entity variable whose table variable was used as the source, if any.
    fn emit(&mut self, chain: &Chain) -> Option<VarId> {
        let head = *chain.head();
        let field = chain.field;

        match chain.oper() {
            Oper::And => {
                let (src, src_written, through) = self.src(head.src);
                let (kind, id_written) = self.term_op(&head, src);
                let written = src_written | id_written;
                self.push(kind, Some(field), written);
                self.written |= written;
                if through.is_some() && head.trav == Trav::SelfOnly {
                    self.set_vars.push((field, through.expect("checked")));
                }
                through
            }
            Oper::Or => {
                let (src, src_written, through) = self.src(head.src);
                let or = self.push(OpKind::Or { end: 0 }, Some(field), src_written);

                let mut alternatives = Vec::new();
                for term in &chain.terms {
                    let (kind, _) = self.term_op(term, src);
                    let label = self.push(kind, Some(field), src_written);
                    self.op_mut(label).prev = or;
                    alternatives.push(label);
                }

                let end = self.push(OpKind::End, None, 0);
                self.op_mut(end).prev = or;
                for label in alternatives {
                    self.op_mut(label).next = end;
                }
                let or_op = self.op_mut(or);
                or_op.kind = OpKind::Or { end };
                or_op.next = end;

                self.written |= src_written;
                if through.is_some() && head.trav == Trav::SelfOnly {
                    self.set_vars.push((field, through.expect("checked")));
                }
                through
            }
            oper @ (Oper::Not | Oper::Optional) => {
                let saved = self.written;
                let (src, src_written, _) = self.src(head.src);
                self.assert_src_bound(chain, src);

                let block = self.push(OpKind::End, Some(field), 0);
                let (kind, id_written) = self.term_op(&head, src);
                let resets = src_written | id_written;
                let inner = self.push(kind, Some(field), resets);
                let end = self.push(OpKind::End, None, 0);

                self.op_mut(inner).prev = block;
                self.op_mut(inner).next = end;
                self.op_mut(end).prev = block;
                let block_op = self.op_mut(block);
                block_op.next = end;
                block_op.kind = if oper == Oper::Not {
                    OpKind::Not { end, resets }
                } else {
                    OpKind::Optional { end, resets }
                };

                self.written = saved;
                None
            }
            oper @ (Oper::AndFrom | Oper::OrFrom | Oper::NotFrom) => {
                let (src, _, _) = self.src(head.src);
                self.assert_src_bound(chain, src);
                let from = match head.first {
                    TermRef::Entity(entity) if head.second.is_none() => entity,
                    first => panic!("{oper:?} requires a fixed entity, got {first:?}"),
                };
                self.push(OpKind::From { oper, src, from }, Some(field), 0);
                None
            }
        }
    }

    fn finish(mut self) -> Plan {
        if !self.set_vars.is_empty() {
            let fields = std::mem::take(&mut self.set_vars).into_boxed_slice();
            self.push(OpKind::SetVars { fields }, None, 0);
        }
        self.push(OpKind::Yield, None, 0);

        log::trace!("Compiled query with {} instructions and {} variables", self.ops.len(), self.vars.len());

        let plan = Plan { ops: self.ops.into_boxed_slice(), vars: self.vars.into_boxed_slice() };
        validate(&plan);
        plan
    }
}

fn validate(plan: &Plan) {
    cfg_if::cfg_if! {
        if #[cfg(debug_assertions)] {
            for (index, op) in plan.ops.iter().enumerate() {
                let index: Label = index.small_int();
                assert!(op.prev < index, "instruction {index} backtracks forward");
                assert!(op.next > index, "instruction {index} continues backward");
            }
        } else {
            let _ = plan;
        }
    }
}
