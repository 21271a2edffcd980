use super::{Builder, CacheKind, InOut, Oper, TermRef, Var};
use crate::test_util::{collect, sorted, spawn, tags, world, Position, Velocity};
use crate::{Cursor, Entity, Id, World};

/// e1 has Position, e2 has Position and Velocity, e3 has Velocity.
fn three_entities(world: &mut World) -> [Entity; 3] {
    let e1 = spawn(world, Some(Position(1.0, 1.0)), None, &[]);
    let e2 = spawn(world, Some(Position(2.0, 2.0)), Some(Velocity(0.5, 0.5)), &[]);
    let e3 = spawn(world, None, Some(Velocity(3.0, 3.0)), &[]);
    [e1, e2, e3]
}

fn both_cache_kinds(test: impl Fn(CacheKind)) {
    test(CacheKind::Default);
    test(CacheKind::None);
}

#[test]
fn test_and_not_optional() {
    both_cache_kinds(|kind| {
        let (mut world, c) = world();
        let [e1, e2, _] = three_entities(&mut world);

        let and = world.query(Builder::new().with(c.pos).with(c.vel).cache_kind(kind));
        assert_eq!(collect(and.iter(&world)), vec![e2]);

        let not = world.query(Builder::new().with(c.pos).without(c.vel).cache_kind(kind));
        assert_eq!(collect(not.iter(&world)), vec![e1]);

        let optional = world.query(Builder::new().with(c.pos).optional(c.vel).cache_kind(kind));
        assert_eq!(sorted(collect(optional.iter(&world))), sorted(vec![e1, e2]));

        let mut iter = optional.iter(&world);
        while iter.next() {
            let entity = iter.entities()[0];
            assert!(iter.state().field_is_set(0));
            assert_eq!(iter.state().field_is_set(1), entity == e2);
            assert_eq!(iter.field::<Velocity>(1).is_some(), entity == e2);
        }
    });
}

#[test]
fn test_field_data() {
    let (mut world, c) = world();
    let [_, e2, _] = three_entities(&mut world);

    let query = world.query(Builder::new().with(c.pos).with(c.vel));
    let mut iter = query.iter(&world);
    assert!(iter.next());
    {
        let mut positions = iter.field_mut::<Position>(0).expect("position is required");
        let velocities = iter.field::<Velocity>(1).expect("velocity is required");
        for (p, v) in positions.iter_mut().zip(velocities.iter()) {
            p.0 += v.0;
            p.1 += v.1;
        }
    }
    assert_eq!(iter.state().field_id(0), Id::from(c.pos));
    assert!(iter.state().field_is_self(0));
    assert!(!iter.next());

    assert_eq!(*world.get::<Position>(e2).expect("e2 has a position"), Position(2.5, 2.5));
}

#[test]
fn test_trivial_join_backtracks_over_tables() {
    both_cache_kinds(|kind| {
        let (mut world, _) = world();
        let [a, b] = <[Entity; 2]>::try_from(tags(&mut world, 2)).expect("two tags");

        let both = spawn(&mut world, None, None, &[a.into(), b.into()]);
        spawn(&mut world, None, None, &[a.into()]);
        spawn(&mut world, None, None, &[b.into()]);

        let query = world.query(Builder::new().with(a).with(b).cache_kind(kind));
        assert_eq!(collect(query.iter(&world)), vec![both]);
    });
}

#[test]
fn test_plan_kinds() {
    let (mut world, c) = world();

    let uncached = world.query(Builder::new().with(c.pos).with(c.vel).cache_kind(CacheKind::None));
    let plan = uncached.plan().to_string();
    assert!(plan.contains("trivial"), "unexpected plan:\n{plan}");
    assert_eq!(uncached.plan().len(), 2);
    assert!(uncached.cache_id().is_none());

    let cached = world.query(Builder::new().with(c.pos).without(c.vel));
    let plan = cached.plan().to_string();
    assert!(plan.contains("cache"), "unexpected plan:\n{plan}");
    assert!(cached.cache_id().is_some());
}

#[test]
fn test_or_yields_each_table_once() {
    both_cache_kinds(|kind| {
        let (mut world, _) = world();
        let [a, b, c] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

        let ab = spawn(&mut world, None, None, &[a.into(), b.into()]);
        let only_a = spawn(&mut world, None, None, &[a.into()]);
        let only_b = spawn(&mut world, None, None, &[b.into()]);
        spawn(&mut world, None, None, &[c.into()]);

        let query = world.query(Builder::new().with(a).or(b).cache_kind(kind));
        assert_eq!(query.field_count(), 1);
        assert_eq!(sorted(collect(query.iter(&world))), sorted(vec![ab, only_a, only_b]));

        let mut iter = query.iter(&world);
        while iter.next() {
            let id = iter.state().field_id(0);
            if iter.entities() == [only_b] {
                assert_eq!(id, Id::from(b));
            } else {
                assert_eq!(id, Id::from(a), "the first matching alternative is reported");
            }
        }
    });
}

#[test]
fn test_wildcard_yields_each_pair() {
    both_cache_kinds(|kind| {
        let (mut world, _) = world();
        let [likes, alice, bob] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

        let fan = spawn(&mut world, None, None, &[Id::pair(likes, alice), Id::pair(likes, bob)]);

        let query = world.query(Builder::new().with_pair(likes, TermRef::Wildcard).cache_kind(kind));
        let mut ids = Vec::new();
        let mut iter = query.iter(&world);
        while iter.next() {
            assert_eq!(iter.entities(), [fan]);
            ids.push(iter.state().field_id(0));
        }
        ids.sort();
        let mut expected = vec![Id::pair(likes, alice), Id::pair(likes, bob)];
        expected.sort();
        assert_eq!(ids, expected);
    });
}

#[test]
fn test_id_variable() {
    let (mut world, c) = world();
    let [likes, alice, bob] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

    let fan = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(likes, alice), Id::pair(likes, bob)]);
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);

    let query = world.query(Builder::new().with(c.pos).with_pair(likes, TermRef::Var("x")));
    let x = query.find_var("x").expect("x is a variable of the query");
    assert_eq!(query.find_var("this"), Some(Var::THIS));
    assert_eq!(query.find_var("y"), None);

    let mut targets = Vec::new();
    let mut iter = query.iter(&world);
    while iter.next() {
        assert_eq!(iter.entities(), [fan]);
        let target = iter.get_var(x).expect("x is bound in every result");
        assert_eq!(iter.state().field_id(1), Id::pair(likes, target));
        targets.push(target);
    }
    assert_eq!(sorted(targets), sorted(vec![alice, bob]));

    let mut iter = query.iter(&world);
    iter.set_var(x, bob);
    assert!(iter.next());
    assert_eq!(iter.get_var(x), Some(bob));
    assert_eq!(iter.state().field_id(1), Id::pair(likes, bob));
    assert!(!iter.next());
}

#[test]
fn test_set_this() {
    let (mut world, c) = world();
    let first = spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);
    let second = spawn(&mut world, Some(Position(2.0, 0.0)), None, &[]);

    let query = world.query(Builder::new().with(c.pos));
    let mut iter = query.iter(&world);
    iter.set_var(Var::THIS, second);
    assert!(iter.next());
    assert_eq!(iter.entities(), [second]);
    assert_eq!(*iter.state().field_at::<Position>(0, 0).expect("position is set"), Position(2.0, 0.0));
    assert!(!iter.next());

    let table = world.record(first).expect("first is alive").table;
    let mut iter = query.iter(&world);
    iter.set_var_as_table(Var::THIS, table);
    assert_eq!(iter.get_var_as_table(Var::THIS), Some(table));
    assert!(iter.next());
    assert_eq!(iter.entities(), [first, second]);
}

#[test]
fn test_entity_variable_source() {
    let (mut world, c) = world();
    let moving = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let v1 = spawn(&mut world, None, Some(Velocity(1.0, 0.0)), &[]);
    let v2 = spawn(&mut world, None, Some(Velocity(2.0, 0.0)), &[]);

    let query = world.query(Builder::new().with(c.pos).with(c.vel).src(TermRef::Var("other")));
    let other = query.find_var("other").expect("other is a variable of the query");

    let mut sources = Vec::new();
    let mut iter = query.iter(&world);
    while iter.next() {
        assert_eq!(iter.entities(), [moving]);
        let src = iter.state().field_src(1);
        assert!(!iter.state().field_is_self(1));
        assert_eq!(iter.get_var(other), Some(src));
        sources.push(src);
    }
    assert_eq!(sorted(sources), sorted(vec![v1, v2]));

    let mut iter = query.iter(&world);
    iter.set_var(other, v2);
    assert!(iter.next());
    assert_eq!(iter.state().field_src(1), v2);
    assert_eq!(*iter.state().field_at::<Velocity>(1, 0).expect("velocity of v2"), Velocity(2.0, 0.0));
    assert!(!iter.next());
}

#[test]
fn test_fixed_source() {
    let (mut world, c) = world();
    let settings = spawn(&mut world, None, Some(Velocity(9.0, 9.0)), &[]);
    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);

    let query = world.query(Builder::new().with(c.pos).with(c.vel).src(settings));
    let mut iter = query.iter(&world);
    assert!(iter.next());
    assert_eq!(iter.entities(), [e1]);
    assert_eq!(iter.state().field_src(1), settings);
    assert_eq!(iter.field::<Velocity>(1).expect("velocity of settings").len(), 1);
    assert!(!iter.next());

    world.remove_id(settings, c.vel);
    assert!(collect(query.iter(&world)).is_empty());
}

#[test]
fn test_no_this() {
    let (mut world, c) = world();
    let settings = spawn(&mut world, None, Some(Velocity(9.0, 9.0)), &[]);

    let query = world.query(Builder::new().with(c.vel).src(settings));
    let mut iter = query.iter(&world);
    assert!(iter.next());
    assert!(iter.state().table().is_none());
    assert_eq!(iter.count(), 0);
    assert_eq!(*iter.state().field_at::<Velocity>(0, 0).expect("velocity is set"), Velocity(9.0, 9.0));
    assert!(!iter.next());

    assert!(query.iter(&world).is_true());
}

#[test]
fn test_optional_binding_does_not_reach_later_terms() {
    both_cache_kinds(|kind| {
        let (mut world, c) = world();
        let [likes, eats, bob] = <[Entity; 3]>::try_from(tags(&mut world, 3)).expect("three tags");

        let plain = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
        let fan = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(likes, bob)]);
        let moving = spawn(&mut world, Some(Position(0.0, 0.0)), Some(Velocity(0.0, 0.0)), &[]);
        spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Id::pair(eats, bob)]);

        let query = world.query(
            Builder::new()
                .with(c.pos)
                .with_pair(likes, TermRef::Var("x"))
                .oper(Oper::Optional)
                .with_pair(eats, TermRef::Var("x"))
                .oper(Oper::Not)
                .cache_kind(kind),
        );

        let mut seen = Vec::new();
        let mut iter = query.iter(&world);
        while iter.next() {
            assert_eq!(iter.state().field_is_set(1), iter.entities() == [fan]);
            assert!(!iter.state().field_is_set(2));
            seen.extend_from_slice(iter.entities());
        }
        assert_eq!(sorted(seen), sorted(vec![plain, fan, moving]));
    });
}

#[test]
fn test_up() {
    let (mut world, c) = world();
    let parent = spawn(&mut world, Some(Position(1.0, 2.0)), None, &[]);
    let child = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[Id::pair(Entity::CHILD_OF, parent)]);
    spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[]);

    for kind in [CacheKind::Default, CacheKind::None] {
        let query =
            world.query(Builder::new().with(c.vel).with(c.pos).up(Entity::CHILD_OF).cache_kind(kind));

        let mut iter = query.iter(&world);
        assert!(iter.next());
        assert_eq!(iter.entities(), [child]);
        let state = iter.state();
        assert!(state.field_is_up(1));
        assert!(!state.field_is_self(1));
        assert_eq!(state.field_src(1), parent);
        assert_eq!(*state.field_at::<Position>(1, 0).expect("parent position"), Position(1.0, 2.0));
        assert!(!iter.next());
    }
}

#[test]
fn test_self_up() {
    let (mut world, c) = world();
    let parent = spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);
    let child = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[Id::pair(Entity::CHILD_OF, parent)]);
    let owner = spawn(&mut world, Some(Position(5.0, 0.0)), Some(Velocity(0.0, 0.0)), &[]);

    let query = world.query(Builder::new().with(c.vel).with(c.pos).self_up(Entity::CHILD_OF));
    let mut seen = Vec::new();
    let mut iter = query.iter(&world);
    while iter.next() {
        let entity = iter.entities()[0];
        let state = iter.state();
        if entity == owner {
            assert!(state.field_is_self(1));
            assert!(!state.field_is_up(1));
        } else {
            assert_eq!(entity, child);
            assert!(state.field_is_up(1));
            assert_eq!(state.field_src(1), parent);
        }
        seen.push(entity);
    }
    assert_eq!(sorted(seen), sorted(vec![child, owner]));
}

#[test]
fn test_up_with_two_bases_yields_once() {
    both_cache_kinds(|kind| {
        let (mut world, c) = world();
        let base1 = spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);
        let base2 = spawn(&mut world, Some(Position(2.0, 0.0)), None, &[]);
        let derived = spawn(
            &mut world,
            None,
            Some(Velocity(0.0, 0.0)),
            &[Id::pair(Entity::IS_A, base1), Id::pair(Entity::IS_A, base2)],
        );

        let query = world.query(Builder::new().with(c.vel).with(c.pos).up(Entity::IS_A).cache_kind(kind));
        let mut sources = Vec::new();
        let mut iter = query.iter(&world);
        while iter.next() {
            assert_eq!(iter.entities(), [derived]);
            sources.push(iter.state().field_src(1));
        }
        assert_eq!(sources.len(), 1, "{kind:?} yielded {sources:?}");
        assert!(sources[0] == base1 || sources[0] == base2);
    });
}

#[test]
fn test_up_follows_reparenting() {
    let (mut world, c) = world();
    let parent = spawn(&mut world, Some(Position(1.0, 0.0)), None, &[]);
    let child = spawn(&mut world, None, Some(Velocity(0.0, 0.0)), &[Id::pair(Entity::CHILD_OF, parent)]);

    let query = world.query(Builder::new().with(c.vel).with(c.pos).up(Entity::CHILD_OF));
    assert_eq!(collect(query.iter(&world)), vec![child]);

    world.remove_id(parent, c.pos);
    assert!(collect(query.iter(&world)).is_empty());

    world.set(parent, Position(3.0, 0.0));
    assert_eq!(collect(query.iter(&world)), vec![child]);
}

#[test]
fn test_from_operators() {
    let (mut world, c) = world();
    let [a, b] = <[Entity; 2]>::try_from(tags(&mut world, 2)).expect("two tags");
    let kit = spawn(&mut world, None, None, &[a.into(), b.into()]);

    let all = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[a.into(), b.into()]);
    let some = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[a.into()]);
    let none = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);

    let and_from = world.query(Builder::new().with(c.pos).and_from(kit));
    assert_eq!(collect(and_from.iter(&world)), vec![all]);

    let or_from = world.query(Builder::new().with(c.pos).or_from(kit));
    assert_eq!(sorted(collect(or_from.iter(&world))), sorted(vec![all, some]));

    let not_from = world.query(Builder::new().with(c.pos).not_from(kit));
    assert_eq!(collect(not_from.iter(&world)), vec![none]);
}

#[test]
fn test_prefab_and_disabled_filters() {
    let (mut world, c) = world();
    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
    let prefab = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Entity::PREFAB.into()]);
    let disabled = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[Entity::DISABLED.into()]);

    let query = world.query(Builder::new().with(c.pos));
    assert_eq!(collect(query.iter(&world)), vec![e1]);

    let query = world.query(Builder::new().with(c.pos).match_prefab(true).match_disabled(true));
    assert_eq!(sorted(collect(query.iter(&world))), sorted(vec![e1, prefab, disabled]));
}

#[test]
fn test_match_empty_tables() {
    both_cache_kinds(|kind| {
        let (mut world, c) = world();
        let [tag] = <[Entity; 1]>::try_from(tags(&mut world, 1)).expect("one tag");
        let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);
        let e2 = spawn(&mut world, Some(Position(0.0, 0.0)), None, &[tag.into()]);
        world.delete(e2);

        let query = world.query(Builder::new().with(c.pos).cache_kind(kind));
        assert_eq!(collect(query.iter(&world)), vec![e1]);

        let query = world.query(Builder::new().with(c.pos).match_empty_tables(true).cache_kind(kind));
        let mut counts = Vec::new();
        let mut iter = query.iter(&world);
        while iter.next() {
            counts.push(iter.count());
        }
        counts.sort_unstable();
        assert_eq!(counts, vec![0, 1]);
    });
}

#[test]
fn test_uncached_always_changed() {
    let (mut world, c) = world();
    spawn(&mut world, Some(Position(0.0, 0.0)), None, &[]);

    let query = world.query(Builder::new().with(c.pos).cache_kind(CacheKind::None));
    collect(query.iter(&world));
    assert!(query.changed(&world));
}

#[test]
fn test_inout_none_is_not_tracked() {
    let (mut world, c) = world();
    let e1 = spawn(&mut world, Some(Position(0.0, 0.0)), Some(Velocity(0.0, 0.0)), &[]);

    let query = world.query(Builder::new().with(c.pos).with(c.vel).inout(InOut::None));
    collect(query.iter(&world));
    assert!(!query.changed(&world));

    world.get_mut::<Velocity>(e1).expect("e1 has a velocity").0 = 1.0;
    assert!(!query.changed(&world));

    world.get_mut::<Position>(e1).expect("e1 has a position").0 = 1.0;
    assert!(query.changed(&world));
}

#[test]
#[should_panic = "a query needs at least one term"]
fn test_empty_query_panics() {
    let (mut world, _) = world();
    world.query(Builder::new());
}

#[test]
#[should_panic = "requires another term that selects $this"]
fn test_only_not_panics() {
    let (mut world, c) = world();
    world.query(Builder::new().without(c.pos));
}

#[test]
#[should_panic = "cannot be cached"]
fn test_cache_all_rejects_variables() {
    let (mut world, c) = world();
    let likes = world.entity();
    world.query(Builder::new().with(c.pos).with_pair(likes, TermRef::Var("x")).cache_kind(CacheKind::All));
}

#[test]
#[should_panic = "query was created by another world"]
fn test_foreign_world_panics() {
    let (mut world, c) = world();
    let (other, _) = crate::test_util::world();
    let query = world.query(Builder::new().with(c.pos));
    let _ = query.iter(&other);
}
