#![allow(missing_docs)]

use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::{Mutex, Once};

use crate::query::QueryId;
use crate::tracer::Tracer;
use crate::{world, Entity, Id, TableId, World};

/// Initializes the logger once.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, crate::Component)]
#[strata(strata_as(crate))]
pub struct Position(pub f32, pub f32);

#[derive(Debug, Clone, Copy, PartialEq, crate::Component)]
#[strata(strata_as(crate))]
pub struct Velocity(pub f32, pub f32);

#[derive(Debug, Clone, Copy, PartialEq, crate::Component)]
#[strata(strata_as(crate), name = "mass")]
pub struct Mass(pub u32);

/// The component entities registered by [`world`].
#[derive(Debug, Clone, Copy)]
pub struct Comps {
    pub pos:  Entity,
    pub vel:  Entity,
    pub mass: Entity,
}

/// Creates a world with the test components registered.
pub fn world() -> (World, Comps) { world_with(world::Builder::new()) }

/// Creates a world from a builder with the test components registered.
pub fn world_with(builder: world::Builder) -> (World, Comps) {
    init();
    let mut world = builder.build();
    let comps = Comps {
        pos:  world.component::<Position>(),
        vel:  world.component::<Velocity>(),
        mass: world.component::<Mass>(),
    };
    (world, comps)
}

/// Creates `count` entities to use as tags.
pub fn tags(world: &mut World, count: usize) -> Vec<Entity> { (0..count).map(|_| world.entity()).collect() }

/// Creates an entity with the given components and ids.
pub fn spawn(world: &mut World, pos: Option<Position>, vel: Option<Velocity>, ids: &[Id]) -> Entity {
    let entity = world.entity();
    if let Some(pos) = pos {
        world.set(entity, pos);
    }
    if let Some(vel) = vel {
        world.set(entity, vel);
    }
    for &id in ids {
        world.add_id(entity, id);
    }
    entity
}

/// A traced event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    CreateTable(TableId),
    DeleteTable(TableId),
    TableEmpty(TableId, bool),
    MatchTable(QueryId, TableId, u64),
    UnmatchTable(QueryId, TableId, u64),
    MoveTableGroup(QueryId, TableId, u64, u64),
    CreateGroup(QueryId, u64),
    DeleteGroup(QueryId, u64),
    Rematch(QueryId, usize),
    Sort(QueryId, usize),
}

/// Records traced events in order.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingTracer {
    pub fn new() -> Self { Self::default() }

    fn push(&self, event: Event) { self.events.lock().push(event); }

    /// Takes the events recorded so far.
    pub fn take(&self) -> Vec<Event> { std::mem::take(&mut *self.events.lock()) }

    /// The distinct events recorded so far, in order of first occurrence.
    pub fn distinct(&self) -> IndexSet<Event> { self.events.lock().iter().cloned().collect() }

    /// Whether an event was recorded.
    pub fn contains(&self, event: &Event) -> bool { self.events.lock().contains(event) }
}

impl Tracer for RecordingTracer {
    fn create_table(&self, table: TableId, _: &[Id]) { self.push(Event::CreateTable(table)); }

    fn delete_table(&self, table: TableId) { self.push(Event::DeleteTable(table)); }

    fn table_empty(&self, table: TableId, empty: bool) { self.push(Event::TableEmpty(table, empty)); }

    fn match_table(&self, query: QueryId, table: TableId, group: u64) {
        self.push(Event::MatchTable(query, table, group));
    }

    fn unmatch_table(&self, query: QueryId, table: TableId, group: u64) {
        self.push(Event::UnmatchTable(query, table, group));
    }

    fn move_table_group(&self, query: QueryId, table: TableId, from: u64, to: u64) {
        self.push(Event::MoveTableGroup(query, table, from, to));
    }

    fn create_group(&self, query: QueryId, group: u64) { self.push(Event::CreateGroup(query, group)); }

    fn delete_group(&self, query: QueryId, group: u64) { self.push(Event::DeleteGroup(query, group)); }

    fn rematch(&self, query: QueryId, tables: usize) { self.push(Event::Rematch(query, tables)); }

    fn sort(&self, query: QueryId, slices: usize) { self.push(Event::Sort(query, slices)); }
}

/// Collects the entities of all windows of a cursor.
pub fn collect<'w>(mut cursor: impl crate::Cursor<'w>) -> Vec<Entity> {
    let mut entities = Vec::new();
    while cursor.next() {
        entities.extend_from_slice(cursor.entities());
    }
    entities
}

/// Sorts entities for order-independent comparison.
pub fn sorted(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by_key(|entity| entity.to_bits());
    entities
}

static_assertions::assert_impl_all!(RecordingTracer: Tracer);
