use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::query::{Builder, GroupCtx};
use crate::test_util::{
    collect, sorted, spawn, tags, world, world_with, Event, Mass, Position, RecordingTracer, Velocity,
};
use crate::world::Builder as WorldBuilder;
use crate::{Cursor, Entity, Id};

#[test]
fn test_tables_follow_world() {
    let tracer = RecordingTracer::new();
    let (mut world, c) = world_with(WorldBuilder::new().tracer(tracer.clone()));

    let query = world.query(Builder::new().with(c.pos));
    let id = query.cache_id().expect("query is cached");
    assert_eq!(query.table_count(&world), Some(0));
    assert!(tracer.contains(&Event::CreateGroup(id, 0)));

    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let table = world.record(e1).expect("e1 is alive").table;
    assert!(tracer.contains(&Event::MatchTable(id, table, 0)));
    assert_eq!(query.table_count(&world), Some(1));
    assert_eq!(collect(query.iter(&world)), vec![e1]);

    world.delete(e1);
    assert!(tracer.contains(&Event::TableEmpty(table, true)));
    assert_eq!(query.table_count(&world), Some(1), "empty tables stay cached");
    assert!(collect(query.iter(&world)).is_empty());

    assert_eq!(world.delete_empty_tables(), 1);
    assert!(tracer.contains(&Event::UnmatchTable(id, table, 0)));
    assert_eq!(query.table_count(&world), Some(0));

    world.destroy_query(query);
    assert!(tracer.contains(&Event::DeleteGroup(id, 0)));
}

#[test]
fn test_group_by_target() {
    let (mut world, c) = world();
    let [team, red, blue] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

    let r1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(team, red)]);
    let b1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(team, blue)]);
    let r2 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(team, red)]);

    let query = world.query(Builder::new().with(c.pos).group_by(team));
    assert_eq!(query.groups(&world), vec![0, red.to_bits(), blue.to_bits()]);

    let mut groups = Vec::new();
    let mut entities = Vec::new();
    let mut iter = query.iter(&world);
    while iter.next() {
        groups.push(iter.state().group_id());
        entities.extend_from_slice(iter.entities());
    }
    assert_eq!(groups, vec![red.to_bits(), blue.to_bits()]);
    assert_eq!(entities, vec![r1, r2, b1]);

    let mut iter = query.iter(&world);
    iter.set_group(blue.to_bits());
    assert_eq!(collect(iter), vec![b1]);

    let mut iter = query.iter(&world);
    iter.set_group(12345);
    assert!(collect(iter).is_empty());

    let info = query.group_info(&world, red.to_bits()).expect("red group exists");
    assert_eq!(info.table_count, 1);
    assert!(info.ctx.is_none());
}

#[test]
fn test_group_by_desc() {
    let (mut world, c) = world();
    let [team, red, blue] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(team, red)]);
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(team, blue)]);

    let query = world.query(Builder::new().with(c.pos).group_by(team).desc());
    assert_eq!(query.groups(&world), vec![blue.to_bits(), red.to_bits(), 0]);
}

#[test]
fn test_group_callbacks() {
    let (mut world, c) = world();
    let [a, b] = <[Entity; 2]>::try_from(tags(&mut world, 2)).expect("two tags");
    let deleted = Arc::new(AtomicUsize::new(0));

    let query = world.query(
        Builder::new()
            .with(c.pos)
            .group_by_with(a, move |_, table, _| table.ty().len() as u64)
            .on_group_create(|_, group| Some(Box::new(format!("group {group}")) as GroupCtx))
            .on_group_delete({
                let deleted = Arc::clone(&deleted);
                move |_, group, ctx| {
                    let ctx = ctx.expect("every group has a context");
                    assert_eq!(ctx.downcast_ref::<String>(), Some(&format!("group {group}")));
                    deleted.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );

    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[a.into(), b.into()]);
    let info = query.group_info(&world, 3).expect("table with three ids is in group 3");
    assert_eq!(info.table_count, 1);
    let ctx = info.ctx.expect("group has a context");
    assert_eq!(ctx.downcast_ref::<String>().map(String::as_str), Some("group 3"));

    world.delete(e1);
    world.delete_empty_tables();
    assert_eq!(deleted.load(Ordering::SeqCst), 3, "groups 1, 2 and 3 are deleted with their tables");
    assert_eq!(query.groups(&world), vec![0]);
}

#[test]
fn test_cascade_moves_tables_between_groups() {
    let tracer = RecordingTracer::new();
    let (mut world, c) = world_with(WorldBuilder::new().tracer(tracer.clone()));

    let parent = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let child = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[Id::pair(Entity::CHILD_OF, parent)]);
    let grandparent = spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);

    let query = world.query(Builder::new().with(c.vel).with(c.pos).cascade(Entity::CHILD_OF));
    let id = query.cache_id().expect("query is cached");
    let table = world.record(child).expect("child is alive").table;
    assert_eq!(query.groups(&world), vec![0, 1]);

    world.add_pair(parent, Entity::CHILD_OF, grandparent);
    assert!(tracer.contains(&Event::Rematch(id, 1)), "only the child table is below the parent");
    assert!(tracer.contains(&Event::MoveTableGroup(id, table, 1, 2)));
    assert!(tracer.contains(&Event::DeleteGroup(id, 1)));
    assert_eq!(query.groups(&world), vec![0, 2]);

    let info = query.group_info(&world, 2).expect("child table is at depth 2");
    assert_eq!(info.table_count, 1);
    assert!(query.group_info(&world, 1).is_none());

    let mut iter = query.iter(&world);
    assert!(iter.next());
    assert_eq!(iter.entities(), [child]);
    assert_eq!(iter.state().group_id(), 2);
    assert_eq!(iter.state().field_src(1), parent, "the nearest owner is matched");
}

#[test]
fn test_rematch_skips_tables_outside_hierarchy() {
    let tracer = RecordingTracer::new();
    let (mut world, c) = world_with(WorldBuilder::new().tracer(tracer.clone()));
    let unrelated_tags = tags(&mut world, 4);

    let parent = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let child = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[Id::pair(Entity::CHILD_OF, parent)]);
    let grandchild = spawn(
        &mut world,
        None,
        Some(Velocity(0.0, 0.0)),
        &[Id::pair(Entity::CHILD_OF, child), unrelated_tags[0].into()],
    );
    for &tag in &unrelated_tags {
        spawn(&mut world, Some(Position(0.0, 0.0)), Some(Velocity(0.0, 0.0)), &[tag.into()]);
    }

    let query = world.query(Builder::new().with(c.vel).with(c.pos).up(Entity::CHILD_OF));
    let id = query.cache_id().expect("query is cached");
    assert_eq!(sorted(collect(query.iter(&world))), sorted(vec![child, grandchild]));

    world.remove_id(parent, c.pos);
    assert!(
        tracer.contains(&Event::Rematch(id, 2)),
        "the tables of the child and the grandchild are rematched, and nothing else"
    );
    assert!(collect(query.iter(&world)).is_empty());
}

#[test]
fn test_cascade_desc_visits_deepest_first() {
    let (mut world, c) = world();
    let root = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let middle = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(Entity::CHILD_OF, root)]);
    let leaf = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(Entity::CHILD_OF, middle)]);

    let query = world.query(Builder::new().with(c.pos).cascade(Entity::CHILD_OF).desc());
    assert_eq!(collect(query.iter(&world)), vec![leaf, middle]);
}

#[test]
fn test_change_detection() {
    let (mut world, c) = world();
    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);

    let query = world.query(Builder::new().with(c.pos));
    assert!(query.changed(&world), "a query that was never iterated has changed");

    collect(query.iter(&world));
    assert!(!query.changed(&world));

    world.get_mut::<Position>(e1).expect("e1 has a position").0 = 5.0;
    assert!(query.changed(&world));
    assert!(query.changed(&world), "checking does not reset the state");

    collect(query.iter(&world));
    assert!(!query.changed(&world));

    let mut iter = query.iter(&world);
    assert!(iter.next());
    iter.field_mut::<Position>(0).expect("position is required")[0].1 = 1.0;
    iter.fini();
    assert!(query.changed(&world), "an unfinished iteration does not synchronize");

    collect(query.iter(&world));
    assert!(!query.changed(&world));

    spawn(&mut world, Some(Position(0.0, 0.0)), Some(Velocity(0.0, 0.0)), &[]);
    assert!(query.changed(&world), "a new table was matched");

    collect(query.iter(&world));
    assert!(!query.changed(&world));

    world.delete(e1);
    assert!(query.changed(&world), "rows were removed");
}

#[test]
fn test_order_by() {
    let (mut world, c) = world();
    let [tag] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");

    let masses = [7, 3, 9, 1, 4, 8, 2];
    let entities: Vec<Entity> = masses
        .iter()
        .enumerate()
        .map(|(index, &mass)| {
            let entity = world.entity();
            world.set(entity, Mass(mass));
            if index % 2 == 1 {
                world.add_id(entity, tag);
            }
            entity
        })
        .collect();

    let query = world.query(Builder::new().with(c.mass).order_by::<Mass>(c.mass, |_, a, _, b| a.0.cmp(&b.0)));

    let visited: Vec<u32> = collect(query.iter(&world))
        .into_iter()
        .map(|entity| world.get::<Mass>(entity).expect("sorted entity has a mass").0)
        .collect();
    assert_eq!(visited, vec![1, 2, 3, 4, 7, 8, 9]);

    *world.get_mut::<Mass>(entities[2]).expect("entity has a mass") = Mass(0);
    let first = query.iter(&world).first();
    assert_eq!(first, Some(entities[2]));

    let mut iter = query.iter(&world);
    let mut windows = 0;
    while iter.next() {
        windows += 1;
        let values = iter.field::<Mass>(0).expect("mass is required");
        assert!(values.windows(2).all(|pair| pair[0].0 <= pair[1].0));
    }
    assert!(windows > 1, "rows from two tables are interleaved");
    assert_eq!(sorted(collect(query.iter(&world))), sorted(entities));
}

#[test]
fn test_order_by_yields_every_wildcard_match() {
    let (mut world, c) = world();
    let [likes, alice, bob] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

    let fan = world.entity();
    world.set(fan, Mass(2));
    world.add_id(fan, Id::pair(likes, alice));
    world.add_id(fan, Id::pair(likes, bob));
    let single = world.entity();
    world.set(single, Mass(1));
    world.add_id(single, Id::pair(likes, alice));

    let query = world.query(
        Builder::new()
            .with(c.mass)
            .with_pair(likes, Entity::WILDCARD)
            .order_by::<Mass>(c.mass, |_, a, _, b| a.0.cmp(&b.0)),
    );

    let mut results = Vec::new();
    let mut iter = query.iter(&world);
    while iter.next() {
        for &entity in iter.entities() {
            results.push((entity, iter.state().field_id(1)));
        }
    }
    assert_eq!(results[0], (single, Id::pair(likes, alice)));
    assert!(results[1..].iter().all(|&(entity, _)| entity == fan));
    let mut fan_ids: Vec<Id> = results[1..].iter().map(|&(_, id)| id).collect();
    fan_ids.sort();
    let mut expected = vec![Id::pair(likes, alice), Id::pair(likes, bob)];
    expected.sort();
    assert_eq!(fan_ids, expected);
}
