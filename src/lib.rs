//! An archetype-based ECS storage with a relational query engine.
//!
//! # Storage
//! Entities with the exact same set of components and relationship pairs
//! (the entity's *type*) live in the same [table](table::Table).
//! Each table stores one dense column per data component,
//! so iterating a table visits contiguous memory.
//! Adding or removing a component moves the entity to another table.
//!
//! Every component id, and every relationship pair including its wildcard forms
//! (`(ChildOf, *)`, `(*, parent)`, `(*, *)`),
//! has a [`TableCache`](table_cache::TableCache)
//! that answers "which tables have this id" without visiting empty tables.
//!
//! # Queries
//! A [`Query`] is a list of terms,
//! each requiring (or forbidding, or optionally reading) an id on a source.
//! The source is usually the matched table itself (`$this`),
//! but it can also be a fixed entity, a variable,
//! or an entity found by walking up a traversable relationship such as [`Entity::CHILD_OF`].
//!
//! Queries are compiled into a small [instruction plan](query::Plan)
//! that is evaluated with backtracking:
//! every instruction can be *redone* to produce its next solution,
//! so joins across components, wildcards and relationship traversal
//! all reduce to the same search loop.
//!
//! Queries can be *cached*.
//! A cached query keeps the list of matching tables up to date as tables are created,
//! become empty or are deleted, partitions them into ordered [groups](query::GroupInfo),
//! and tracks per-table change counters so that [`Query::changed`]
//! can tell whether anything relevant was written since the last full iteration.
//!
//! # Iteration
//! All queries are consumed through the [`Cursor`] protocol,
//! which yields one table window per [`Cursor::next`] call.
//! Cursors can be re-windowed with [`Cursor::page`]
//! or split across threads with [`Cursor::worker`].
//!
//! ```
//! use strata::{query, Cursor, World};
//!
//! #[derive(strata::Component)]
//! struct Position(f32);
//! #[derive(strata::Component)]
//! struct Velocity(f32);
//!
//! let mut world = World::default();
//! let pos = world.component::<Position>();
//! let vel = world.component::<Velocity>();
//!
//! let e = world.entity();
//! world.set(e, Position(1.0));
//! world.set(e, Velocity(2.0));
//!
//! let query = world.query(query::Builder::new().with(pos).with(vel));
//! let mut iter = query.iter(&world);
//! while iter.next() {
//!     let mut positions = iter.field_mut::<Position>(0).expect("position is required");
//!     let velocities = iter.field::<Velocity>(1).expect("velocity is required");
//!     for (p, v) in positions.iter_mut().zip(velocities.iter()) {
//!         p.0 += v.0;
//!     }
//! }
//! ```

#![cfg_attr(not(debug_assertions), deny(missing_docs))]
#![cfg_attr(doc, warn(missing_docs))]

/// Internal re-exports used in macros.
#[doc(hidden)]
pub mod _reexports {
    pub use {static_assertions, xias};
}

pub use strata_codegen::Component;

#[macro_use]
pub mod tracer;

mod slab;

pub mod id;
pub use id::{Entity, Id};

pub(crate) mod entity;
pub use entity::Record;

pub mod component;
pub use component::Component;

pub mod table;
pub use table::{Table, TableId};

pub mod table_cache;
pub use table_cache::TableCache;

pub mod world;
pub use world::World;

pub mod query;
pub use query::Query;

pub mod iter;
pub use iter::{Cursor, IterState, PageIter, QueryIter, WorkerIter};

#[cfg(any(test, feature = "internal-bench"))]
pub mod test_util;
