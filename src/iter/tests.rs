use std::cell::Cell;
use std::rc::Rc;

use rayon::prelude::*;

use super::worker::share;
use super::{Cursor, IterState};
use crate::query::Builder;
use crate::test_util::{collect, spawn, tags, world, Position, Velocity};
use crate::{Entity, Id, Query, World};

/// Counts the calls to `next` of the wrapped cursor.
struct Counting<I> {
    inner: I,
    calls: Rc<Cell<usize>>,
}

impl<'w, I: Cursor<'w>> Cursor<'w> for Counting<I> {
    fn next(&mut self) -> bool {
        self.calls.set(self.calls.get() + 1);
        self.inner.next()
    }

    fn fini(&mut self) { self.inner.fini(); }

    fn state(&self) -> &IterState<'w> { self.inner.state() }

    fn is_finished(&self) -> bool { self.inner.is_finished() }
}

/// Three tables with Position, holding 3, 5 and 2 entities in this order.
fn paged_world() -> (World, Query, Vec<Vec<Entity>>) {
    let (mut world, c) = world();
    let [t1, t2] = <[Entity; 2]>::try_from(tags(&mut world, 2)).expect("two tags");

    let tables: Vec<Vec<Entity>> = [(3, None), (5, Some(t1)), (2, Some(t2))]
        .into_iter()
        .map(|(count, tag): (usize, Option<Entity>)| {
            let ids: Vec<Id> = tag.into_iter().map(Into::into).collect();
            (0..count).map(|_| spawn(&mut world, Some(Position(0.0, 0.0)), None, &ids)).collect()
        })
        .collect();

    let query = world.query(Builder::new().with(c.pos));
    (world, query, tables)
}

#[test]
fn test_page_within_one_table() {
    let (world, query, tables) = paged_world();

    let calls = Rc::new(Cell::new(0));
    let source = Counting { inner: query.iter(&world), calls: Rc::clone(&calls) };
    let mut page = source.page(4, 3);

    assert!(page.next());
    assert_eq!(page.state().offset(), 1);
    assert_eq!(page.count(), 3);
    assert_eq!(page.entities(), &tables[1][1..4]);
    assert_eq!(calls.get(), 2, "the first table is skipped");

    assert!(!page.next());
    assert_eq!(calls.get(), 2, "the source is not advanced after the limit");
    assert!(page.is_finished());
    assert!(page.source().is_finished());
}

#[test]
fn test_page_across_tables() {
    let (world, query, tables) = paged_world();
    let all: Vec<Entity> = tables.concat();

    assert_eq!(collect(query.iter(&world).page(0, 0)), all);
    assert_eq!(collect(query.iter(&world).page(1, 0)), all[1..]);
    assert_eq!(collect(query.iter(&world).page(2, 5)), all[2..7]);
    assert_eq!(collect(query.iter(&world).page(8, 0)), tables[2]);
    assert_eq!(collect(query.iter(&world).page(0, 100)), all);
    assert!(collect(query.iter(&world).page(10, 0)).is_empty());
    assert!(collect(query.iter(&world).page(20, 3)).is_empty());

    let mut counts = Vec::new();
    let mut page = query.iter(&world).page(2, 5);
    while page.next() {
        counts.push(page.count());
    }
    assert_eq!(counts, vec![1, 4]);
}

#[test]
fn test_page_fields_follow_offset() {
    let (mut world, c) = world();
    let entities: Vec<Entity> =
        (0..6).map(|i| spawn(&mut world, Some(Position(i as f32, 0.0)), None, &[])).collect();

    let query = world.query(Builder::new().with(c.pos));
    let mut page = query.iter(&world).page(2, 3);
    assert!(page.next());
    assert_eq!(page.entities(), &entities[2..5]);
    let positions = page.field::<Position>(0).expect("position is required");
    assert_eq!(&*positions, &[Position(2.0, 0.0), Position(3.0, 0.0), Position(4.0, 0.0)]);
}

#[test]
fn test_page_passes_results_without_rows() {
    let (mut world, c) = world();
    let settings = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[]);

    let query = world.query(Builder::new().with(c.vel).src(settings));
    let mut page = query.iter(&world).page(5, 1);
    assert!(page.next());
    assert!(page.state().table().is_none());
    assert!(page.field::<Velocity>(0).is_some());
}

#[test]
fn test_share() {
    assert_eq!(share(10, 0, 3), (0, 4));
    assert_eq!(share(10, 1, 3), (4, 3));
    assert_eq!(share(10, 2, 3), (7, 3));
    assert_eq!(share(9, 2, 3), (6, 3));
    assert_eq!(share(2, 0, 3), (0, 1));
    assert_eq!(share(2, 1, 3), (1, 1));
    assert_eq!(share(2, 2, 3), (2, 0));
    assert_eq!(share(0, 1, 4), (0, 0));
}

#[test]
fn test_workers_partition_rows() {
    let (mut world, c) = world();
    let entities: Vec<Entity> =
        (0..10).map(|_| spawn(&mut world, Some(Position(0.0, 0.0)), None, &[])).collect();
    let query = world.query(Builder::new().with(c.pos));

    let shares: Vec<Vec<Entity>> =
        (0..3).into_par_iter().map(|index| collect(query.iter(&world).worker(index, 3))).collect();

    assert_eq!(shares.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 3, 3]);
    assert_eq!(shares.concat(), entities);
}

#[test]
fn test_workers_see_every_table() {
    let (mut world, c) = world();
    let [tag] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[tag.into()]);
    let query = world.query(Builder::new().with(c.pos));

    let mut worker = query.iter(&world).worker(2, 3);
    assert_eq!(worker.index(), 2);
    assert_eq!(worker.worker_count(), 3);

    let mut counts = Vec::new();
    while worker.next() {
        counts.push(worker.count());
    }
    assert_eq!(counts, vec![0, 0], "workers without rows still visit each table");
}

#[test]
fn test_results_without_rows_go_to_first_worker() {
    let (mut world, c) = world();
    let settings = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[]);
    let query = world.query(Builder::new().with(c.vel).src(settings));

    assert!(query.iter(&world).worker(0, 2).is_true());
    assert!(!query.iter(&world).worker(1, 2).is_true());
}

#[test]
fn test_worker_then_page() {
    let (mut world, c) = world();
    let entities: Vec<Entity> =
        (0..8).map(|_| spawn(&mut world, Some(Position(0.0, 0.0)), None, &[])).collect();
    let query = world.query(Builder::new().with(c.pos));

    assert_eq!(collect(query.iter(&world).worker(1, 2).page(1, 2)), entities[5..7]);
}

#[test]
fn test_first_finishes() {
    let (mut world, c) = world();
    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let query = world.query(Builder::new().with(c.pos));

    let mut iter = query.iter(&world);
    assert_eq!(iter.first(), Some(e1));
    assert!(iter.is_finished());

    iter.fini();
    assert!(iter.is_finished());
    assert_eq!(collect(query.iter(&world)).len(), 2);
}

#[test]
#[should_panic = "next called on a finished iterator"]
fn test_next_after_finish_panics() {
    let (world, query, _) = paged_world();
    let mut iter = query.iter(&world);
    iter.fini();
    iter.next();
}

#[test]
#[should_panic = "next called on a finished iterator"]
fn test_page_next_after_finish_panics() {
    let (world, query, _) = paged_world();
    let mut page = query.iter(&world).page(0, 1);
    while page.next() {}
    page.next();
}

#[test]
#[should_panic = "variables cannot be set after iteration started"]
fn test_set_var_after_start_panics() {
    let (world, query, tables) = paged_world();
    let mut iter = query.iter(&world);
    iter.next();
    iter.set_var(crate::query::Var::THIS, tables[0][0]);
}

#[test]
#[should_panic = "worker count must be positive"]
fn test_zero_workers_panics() {
    let (world, query, _) = paged_world();
    let _ = query.iter(&world).worker(0, 0);
}

#[test]
#[should_panic = "is already borrowed on this thread"]
fn test_field_mut_while_reading_panics() {
    let (world, query, _) = paged_world();
    let mut iter = query.iter(&world);
    assert!(iter.next());
    let _positions = iter.field::<Position>(0).expect("position is required");
    let _ = iter.field_mut::<Position>(0);
}

#[test]
fn test_field_borrows_end_with_guards() {
    let (world, query, _) = paged_world();
    let mut iter = query.iter(&world);
    assert!(iter.next());
    {
        let first = iter.field::<Position>(0).expect("position is required");
        let second = iter.field::<Position>(0).expect("shared borrows coexist");
        assert_eq!(first.len(), second.len());
    }
    iter.field_mut::<Position>(0).expect("position is required")[0] = Position(9.0, 9.0);
    assert_eq!(*iter.state().field_at::<Position>(0, 0).expect("position is required"), Position(9.0, 9.0));
}
