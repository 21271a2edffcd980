use std::any::Any;
use std::cmp::Ordering;

use super::cache::sort::{self, Slice};
use super::term::{InOut, Oper, Term, TermRef, Trav};
use super::QueryFlags;
use crate::{Component, Entity, Id, Table, TableId, World};

/// User data attached to a group of a cached query.
pub type GroupCtx = Box<dyn Any + Send + Sync>;

/// Computes the group of a table from the table and the grouping relationship.
pub type GroupByFn = Box<dyn Fn(&World, &Table, Entity) -> u64 + Send + Sync>;

/// Called when a group is created. The returned value is stored as the group context.
pub type GroupCreateFn = Box<dyn Fn(&World, u64) -> Option<GroupCtx> + Send + Sync>;

/// Called before a group is deleted, receiving the group context.
pub type GroupDeleteFn = Box<dyn Fn(&World, u64, Option<GroupCtx>) + Send + Sync>;

/// Builds the sorted slices of the given tables.
pub(crate) type SortFn = Box<dyn Fn(&World, Entity, &[TableId]) -> Vec<Slice> + Send + Sync>;

/// Whether and how a query caches its matched tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheKind {
    /// Same as [`Auto`](Self::Auto).
    #[default]
    Default,
    /// Caches the terms that can be cached and evaluates the rest on iteration.
    Auto,
    /// Caches all terms.
    ///
    /// Building the query panics if a term cannot be cached.
    All,
    /// Evaluates all terms on every iteration.
    None,
}

pub(crate) struct GroupBy {
    pub(crate) rel:      Entity,
    pub(crate) callback: Option<GroupByFn>,
    pub(crate) desc:     bool,
    /// Group by hierarchy depth along `rel`.
    pub(crate) cascade:  bool,
}

pub(crate) struct OrderBy {
    pub(crate) component: Entity,
    pub(crate) sort:      SortFn,
}

/// Describes a query.
///
/// Methods that configure a term apply to the last added term.
#[must_use = "the builder does nothing until passed to `World::query`"]
pub struct Builder {
    pub(crate) terms:           Vec<Term>,
    pub(crate) cache_kind:      CacheKind,
    pub(crate) flags:           QueryFlags,
    pub(crate) group_by:        Option<GroupBy>,
    pub(crate) on_group_create: Option<GroupCreateFn>,
    pub(crate) on_group_delete: Option<GroupDeleteFn>,
    pub(crate) order_by:        Option<OrderBy>,
}

impl Default for Builder {
    fn default() -> Self { Self::new() }
}

impl Builder {
    /// Creates an empty query description.
    pub fn new() -> Self {
        Self {
            terms:           Vec::new(),
            cache_kind:      CacheKind::Default,
            flags:           QueryFlags::default(),
            group_by:        None,
            on_group_create: None,
            on_group_delete: None,
            order_by:        None,
        }
    }

    /// Adds a term.
    pub fn term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// Adds an `And` term for `id`.
    pub fn with(self, id: impl Into<Id>) -> Self { self.term(Term::new(id.into())) }

    /// Adds an `And` term for a pair whose elements may be variables or wildcards.
    pub fn with_pair(self, first: impl Into<TermRef>, second: impl Into<TermRef>) -> Self {
        self.term(Term::pair(first, second))
    }

    /// Adds a `Not` term for `id`.
    pub fn without(self, id: impl Into<Id>) -> Self { self.with(id).oper(Oper::Not) }

    /// Adds an `Optional` term for `id`.
    pub fn optional(self, id: impl Into<Id>) -> Self { self.with(id).oper(Oper::Optional) }

    /// Joins the last term with a new term for `id`, so that either of them must match.
    pub fn or(self, id: impl Into<Id>) -> Self { self.oper(Oper::Or).with(id) }

    /// Adds a term requiring all ids of the type of `entity`.
    pub fn and_from(self, entity: Entity) -> Self { self.with(entity).oper(Oper::AndFrom) }

    /// Adds a term requiring at least one id of the type of `entity`.
    pub fn or_from(self, entity: Entity) -> Self { self.with(entity).oper(Oper::OrFrom) }

    /// Adds a term requiring none of the ids of the type of `entity`.
    pub fn not_from(self, entity: Entity) -> Self { self.with(entity).oper(Oper::NotFrom) }

    fn last(&mut self) -> &mut Term {
        self.terms.last_mut().expect("configure a term after adding it")
    }

    /// Sets the operator of the last term.
    pub fn oper(mut self, oper: Oper) -> Self {
        self.last().oper = oper;
        self
    }

    /// Sets the source of the last term.
    pub fn src(mut self, src: impl Into<TermRef>) -> Self {
        self.last().src = src.into();
        self
    }

    /// Matches the last term on the entities reached by following `rel` upwards.
    pub fn up(mut self, rel: Entity) -> Self {
        self.last().trav = Trav::Up(rel);
        self
    }

    /// Matches the last term on the source itself, or on the entities reached by following `rel` upwards.
    pub fn self_up(mut self, rel: Entity) -> Self {
        self.last().trav = Trav::SelfUp(rel);
        self
    }

    /// Matches the last term upwards along `rel` and groups results by depth.
    pub fn cascade(mut self, rel: Entity) -> Self {
        self.last().trav = Trav::Cascade { rel, desc: false };
        self
    }

    /// Reverses the order of a cascade or group-by.
    pub fn desc(mut self) -> Self {
        if let Some(group_by) = &mut self.group_by {
            group_by.desc = true;
        } else {
            let term = self.last();
            match &mut term.trav {
                Trav::Cascade { desc, .. } => *desc = true,
                trav => panic!("desc() requires a cascade or group_by, last term traverses {trav:?}"),
            }
        }
        self
    }

    /// Sets the access mode of the last term.
    pub fn inout(mut self, inout: InOut) -> Self {
        self.last().inout = inout;
        self
    }

    /// Sets whether and how the query caches its matched tables.
    pub fn cache_kind(mut self, kind: CacheKind) -> Self {
        self.cache_kind = kind;
        self
    }

    /// Also yield tables without rows.
    pub fn match_empty_tables(mut self, value: bool) -> Self {
        self.flags.match_empty = value;
        self
    }

    /// Also match tables with [`Entity::PREFAB`].
    pub fn match_prefab(mut self, value: bool) -> Self {
        self.flags.match_prefab = value;
        self
    }

    /// Also match tables with [`Entity::DISABLED`].
    pub fn match_disabled(mut self, value: bool) -> Self {
        self.flags.match_disabled = value;
        self
    }

    /// Groups cached tables by the target of their first `(rel, *)` pair.
    pub fn group_by(mut self, rel: Entity) -> Self {
        self.group_by = Some(GroupBy { rel, callback: None, desc: false, cascade: false });
        self
    }

    /// Groups cached tables by a custom function.
    pub fn group_by_with(
        mut self,
        rel: Entity,
        callback: impl Fn(&World, &Table, Entity) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.group_by =
            Some(GroupBy { rel, callback: Some(Box::new(callback)), desc: false, cascade: false });
        self
    }

    /// Sets a callback invoked when a group is created.
    pub fn on_group_create(
        mut self,
        callback: impl Fn(&World, u64) -> Option<GroupCtx> + Send + Sync + 'static,
    ) -> Self {
        self.on_group_create = Some(Box::new(callback));
        self
    }

    /// Sets a callback invoked before a group is deleted.
    pub fn on_group_delete(
        mut self,
        callback: impl Fn(&World, u64, Option<GroupCtx>) + Send + Sync + 'static,
    ) -> Self {
        self.on_group_delete = Some(Box::new(callback));
        self
    }

    /// Orders results by the value of a component.
    ///
    /// `component` must be matched by a term on `$this`.
    pub fn order_by<C: Component>(
        mut self,
        component: Entity,
        compare: impl Fn(Entity, &C, Entity, &C) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.order_by = Some(OrderBy {
            component,
            sort: Box::new(move |world, component, tables| {
                sort::build_slices::<C>(world, component, tables, &compare)
            }),
        });
        self
    }
}
