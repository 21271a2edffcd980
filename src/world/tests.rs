use super::Builder;
use crate::query;
use crate::test_util::{collect, spawn, tags, world, world_with, Event, Mass, Position, RecordingTracer, Velocity};
use crate::{Cursor, Entity, Id, TableId};

#[test]
fn test_set_get() {
    let (mut world, c) = world();
    let entity = world.entity();
    assert_eq!(world.record(entity).map(|record| record.table), Some(TableId::ROOT));
    assert!(world.get::<Position>(entity).is_none());

    world.set(entity, Position(1.0, 2.0));
    let table = world.record(entity).expect("entity is alive").table;
    assert_eq!(world.table(table).ty(), [Id::from(c.pos)]);
    assert_eq!(*world.get::<Position>(entity).expect("position was set"), Position(1.0, 2.0));

    world.set(entity, Position(3.0, 4.0));
    assert_eq!(world.record(entity).expect("entity is alive").table, table, "overwriting does not move");
    assert_eq!(*world.get::<Position>(entity).expect("position was set"), Position(3.0, 4.0));

    world.get_mut::<Position>(entity).expect("position was set").1 = 5.0;
    assert_eq!(*world.get::<Position>(entity).expect("position was set"), Position(3.0, 5.0));
}

#[test]
fn test_moving_keeps_data() {
    let (mut world, c) = world();
    let [tag] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");

    let e1 = spawn(&mut world, Some(Position(1.0, 1.0)), Some(Velocity(2.0, 2.0)), &[]);
    let e2 = spawn(&mut world, Some(Position(3.0, 3.0)), Some(Velocity(4.0, 4.0)), &[]);

    world.add_id(e1, tag);
    assert!(world.has(e1, tag));
    assert!(world.has(e1, c.pos));
    assert_eq!(*world.get::<Velocity>(e1).expect("velocity moved with e1"), Velocity(2.0, 2.0));
    assert_eq!(*world.get::<Position>(e2).expect("e2 took the row of e1"), Position(3.0, 3.0));
    assert_eq!(world.record(e2).map(|record| record.row), Some(0));

    assert!(world.remove_id(e1, c.vel));
    assert!(!world.remove_id(e1, c.vel));
    assert!(world.get::<Velocity>(e1).is_none());
    assert_eq!(*world.get::<Position>(e1).expect("position is kept"), Position(1.0, 1.0));

    let ty = [Id::from(c.pos), Id::from(tag)];
    assert_eq!(world.find_table(&ty), world.record(e1).map(|record| record.table));
    assert_eq!(world.find_table(&[Id::from(tag), Id::from(c.mass)]), None);
}

#[test]
fn test_pairs() {
    let (mut world, _) = world();
    let [likes, alice, bob] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

    let fan = world.entity();
    world.add_pair(fan, likes, alice);
    world.add_pair(fan, likes, bob);

    assert!(world.has(fan, Id::pair(likes, alice)));
    assert!(world.has(fan, Id::pair(likes, Entity::WILDCARD)));
    assert!(world.has(fan, Id::pair(Entity::WILDCARD, bob)));
    assert!(!world.has(fan, Id::pair(alice, Entity::WILDCARD)));
    assert!(!world.is_traversable(likes));
}

#[test]
fn test_delete() {
    let (mut world, _) = world();
    let count = world.entity_count();

    let e1 = spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);
    let e2 = spawn(&mut world, Some(Position(2.0, 0.0)), None, &[]);
    assert_eq!(world.entity_count(), count + 2);

    assert!(world.delete(e1));
    assert!(!world.delete(e1));
    assert!(!world.is_alive(e1));
    assert!(world.get::<Position>(e1).is_none());
    assert_eq!(world.entity_count(), count + 1);
    assert_eq!(*world.get::<Position>(e2).expect("e2 is alive"), Position(2.0, 0.0));

    let e3 = world.entity();
    assert_eq!(e3.index(), e1.index(), "indices are recycled");
    assert_ne!(e3, e1);
    assert!(!world.is_alive(e1));
}

#[test]
fn test_delete_cleans_up_relationships() {
    let (mut world, _) = world();
    let [likes] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");

    let parent = world.entity();
    let child = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(Entity::CHILD_OF, parent)]);
    let grandchild = spawn(&mut world, None, None, &[Id::pair(Entity::CHILD_OF, child)]);
    let fan = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(likes, parent)]);

    world.delete(parent);
    assert!(!world.is_alive(child));
    assert!(!world.is_alive(grandchild));
    assert!(world.is_alive(fan));
    assert!(!world.has(fan, Id::pair(likes, Entity::WILDCARD)));
    assert_eq!(*world.get::<Position>(fan).expect("fan keeps its data"), Position(0.0, 0.0));
}

#[test]
fn test_delete_without_cleanup() {
    let (mut world, c) = world_with(Builder::new().cleanup_relationships(false));

    let parent = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let child = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[Id::pair(Entity::CHILD_OF, parent)]);

    let query = world.query(query::Builder::new().with(c.vel).with(c.pos).up(Entity::CHILD_OF));
    assert_eq!(collect(query.iter(&world)), vec![child]);

    world.delete(parent);
    assert!(world.is_alive(child));
    assert!(world.has(child, Id::pair(Entity::CHILD_OF, Entity::WILDCARD)));
    assert!(collect(query.iter(&world)).is_empty(), "the deleted parent no longer provides a position");
}

#[test]
fn test_custom_traversable_relationship() {
    let (mut world, c) = world();
    let [owned_by] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");
    assert!(!world.is_traversable(owned_by));
    world.set_traversable(owned_by);
    assert!(world.is_traversable(owned_by));

    let owner = spawn(&mut world, None, None, &[]);
    world.set(owner, Mass(10));
    let item = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(owned_by, owner)]);

    let query = world.query(query::Builder::new().with(c.pos).with(c.mass).up(owned_by));
    let mut iter = query.iter(&world);
    assert!(iter.next());
    assert_eq!(iter.entities(), [item]);
    assert_eq!(*iter.state().field_at::<Mass>(1, 0).expect("owner mass"), Mass(10));
}

#[test]
#[should_panic = "is not a traversable relationship"]
fn test_up_requires_traversable() {
    let (mut world, c) = world();
    let rel = world.entity();
    world.query(query::Builder::new().with(c.pos).with(c.mass).up(rel));
}

#[test]
#[should_panic = "stores data, use World::set instead"]
fn test_add_data_id_panics() {
    let (mut world, c) = world();
    let entity = world.entity();
    world.add_id(entity, c.pos);
}

#[test]
#[should_panic = "cannot add the wildcard"]
fn test_add_wildcard_panics() {
    let (mut world, _) = world();
    let [likes] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");
    let entity = world.entity();
    world.add_id(entity, Id::pair(likes, Entity::WILDCARD));
}

#[test]
fn test_delete_empty_tables() {
    let tracer = RecordingTracer::new();
    let (mut world, _) = world_with(Builder::new().tracer(tracer.clone()));
    let [a, b] = <[Entity; 2]>::try_from(tags(&mut world, 2)).expect("two tags");

    let entity = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[a.into(), b.into()]);
    let tables = world.table_count();
    let table = world.record(entity).expect("entity is alive").table;
    assert!(tracer.contains(&Event::CreateTable(table)));

    // {pos} and {pos, a} were only passed through
    assert_eq!(world.delete_empty_tables(), 2);
    assert_eq!(world.table_count(), tables - 2);
    assert_eq!(world.delete_empty_tables(), 0);

    world.delete(entity);
    assert!(tracer.contains(&Event::TableEmpty(table, true)));
    assert_eq!(world.delete_empty_tables(), 1);
    assert!(tracer.contains(&Event::DeleteTable(table)));
    assert_eq!(world.table_count(), 1, "the root table is never deleted");
}
