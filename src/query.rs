//! Queries match tables against a list of terms.
//!
//! A query is built from a [`Builder`] by [`World::query`].
//! It compiles into a [`Plan`] of instructions that the query engine evaluates with backtracking.
//! Unless disabled with [`CacheKind::None`],
//! the terms that only depend on the matched table are also cached:
//! the world keeps the cache up to date as tables are created, emptied and deleted,
//! so iterating only replays the cached matches and evaluates the remaining terms.

use std::any::Any;
use std::fmt;

use crate::iter::QueryIter;
use crate::{Id, Table, World};

pub mod builder;
pub use builder::{Builder, CacheKind, GroupCtx};

pub mod term;
pub use term::{InOut, Oper, Term, TermRef, Trav};

pub(crate) mod plan;
pub use plan::Plan;
pub(crate) use plan::VarId;

pub(crate) mod cache;
pub(crate) mod compiler;
pub(crate) mod engine;

#[cfg(test)]
mod tests;

/// Identifies the cache of a query in its world.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) usize);

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "query#{}", self.0) }
}

/// Table filters applied while matching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueryFlags {
    pub(crate) match_empty:    bool,
    pub(crate) match_prefab:   bool,
    pub(crate) match_disabled: bool,
}

impl QueryFlags {
    /// Whether the table passes the prefab and disabled filters.
    pub(crate) fn accepts(self, table: &Table) -> bool {
        let flags = table.flags();
        (self.match_prefab || !flags.prefab) && (self.match_disabled || !flags.disabled)
    }
}

/// A variable of a query, as returned by [`Query::find_var`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(pub(crate) VarId);

impl Var {
    /// The `$this` variable.
    pub const THIS: Self = Self(plan::THIS);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldInfo {
    /// The head term of the field.
    pub(crate) term: Term,
    /// The id of the term with variables replaced by wildcards.
    pub(crate) id:   Id,
}

#[derive(Debug)]
pub(crate) struct CacheLink {
    pub(crate) id:        QueryId,
    pub(crate) field_map: Box<[usize]>,
    pub(crate) trivial:   bool,
}

pub(crate) struct QueryImpl {
    pub(crate) world_id: u64,
    pub(crate) fields:   Box<[FieldInfo]>,
    pub(crate) plan:     Plan,
    pub(crate) flags:    QueryFlags,
    /// Whether any term is matched on `$this`.
    pub(crate) has_this: bool,
    pub(crate) cache:    Option<CacheLink>,
}

impl QueryImpl {
    pub(crate) fn new(
        world: &World,
        fields: Box<[FieldInfo]>,
        plan: Plan,
        flags: QueryFlags,
        has_this: bool,
    ) -> Self {
        Self { world_id: world.id(), fields, plan, flags, has_this, cache: None }
    }
}

/// A compiled query.
///
/// Cached queries should be released with [`World::destroy_query`].
pub struct Query {
    pub(crate) inner: QueryImpl,
}

impl Query {
    /// Starts iterating the query.
    ///
    /// # Panics
    /// Panics if the query was created by another world.
    pub fn iter<'w>(&'w self, world: &'w World) -> QueryIter<'w> { QueryIter::new(world, &self.inner) }

    /// The number of fields, i.e. terms not joined by `Or`.
    pub fn field_count(&self) -> usize { self.inner.fields.len() }

    /// Finds a variable by name. `$this` is named `"this"`.
    pub fn find_var(&self, name: &str) -> Option<Var> {
        let index = self.inner.plan.vars.iter().position(|var| var.name == name && !var.companion)?;
        Some(Var(u8::try_from(index).expect("at most 64 variables")))
    }

    /// The compiled instructions.
    pub fn plan(&self) -> &Plan { &self.inner.plan }

    /// The cache of this query, if it is cached.
    pub fn cache_id(&self) -> Option<QueryId> { self.inner.cache.as_ref().map(|cache| cache.id) }

    /// Whether the cached tables or the data of tracked fields changed
    /// since the last iteration that ran to completion.
    ///
    /// Uncached queries are always considered changed.
    pub fn changed(&self, world: &World) -> bool {
        match &self.inner.cache {
            Some(link) => world.query_cache(link.id).changed(world),
            None => true,
        }
    }

    /// Information about a group of a cached query.
    pub fn group_info<'w>(&self, world: &'w World, group: u64) -> Option<GroupInfo<'w>> {
        let link = self.inner.cache.as_ref()?;
        world.query_cache(link.id).group_info(group)
    }

    /// The number of tables in the cache of this query, including empty tables.
    pub fn table_count(&self, world: &World) -> Option<usize> {
        let link = self.inner.cache.as_ref()?;
        Some(world.query_cache(link.id).table_count())
    }

    /// The ids of the groups of a cached query, in iteration order.
    pub fn groups(&self, world: &World) -> Vec<u64> {
        match &self.inner.cache {
            Some(link) => world.query_cache(link.id).group_ids(),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Query")
            .field("fields", &self.inner.fields.len())
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}

/// Information about a group of a cached query.
pub struct GroupInfo<'w> {
    /// The number of tables in the group, including empty tables.
    pub table_count: usize,
    /// The number of times tables were added to or removed from the group.
    pub match_count: u32,
    /// The context returned by the group creation callback.
    pub ctx:         Option<&'w (dyn Any + Send + Sync)>,
}

static_assertions::assert_impl_all!(Query: Send, Sync);
