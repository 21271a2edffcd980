//! The entity index maps live entities to their table row.

use xias::Xias;

use crate::table::TableId;
use crate::Entity;

/// The location of a live entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// The table the entity is stored in.
    pub table: TableId,
    /// The row of the entity in its table.
    pub row:   usize,
}

#[derive(Debug, Default, Clone)]
struct Slot {
    generation:  u16,
    alive:       bool,
    record:      Option<Record>,
    /// Set once the entity becomes the target of a traversable relationship.
    traversable: bool,
}

/// Allocates entity ids and tracks their locations.
#[derive(Debug)]
pub(crate) struct EntityIndex {
    slots: Vec<Slot>,
    free:  Vec<u32>,
    alive: usize,
}

impl EntityIndex {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let reserved = Entity::FIRST_USER_INDEX.small_int::<usize>();
        let mut slots = Vec::with_capacity(reserved + capacity);
        slots.resize_with(reserved, Slot::default);

        // builtins are always alive, but never stored in a table
        for builtin in [
            Entity::WILDCARD,
            Entity::CHILD_OF,
            Entity::IS_A,
            Entity::PREFAB,
            Entity::DISABLED,
        ] {
            slots[builtin.index().small_int::<usize>()].alive = true;
        }

        Self { slots, free: Vec::new(), alive: 0 }
    }

    /// Allocates a new entity without a location.
    pub(crate) fn alloc(&mut self) -> Entity {
        self.alive += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index.small_int::<usize>()];
            debug_assert!(!slot.alive, "free list contains a live entity");
            slot.alive = true;
            Entity::from_parts(index, slot.generation)
        } else {
            let index: u32 = self.slots.len().small_int();
            self.slots.push(Slot { alive: true, ..Slot::default() });
            Entity::from_parts(index, 0)
        }
    }

    /// Frees a live entity and bumps the generation of its slot.
    pub(crate) fn free(&mut self, entity: Entity) -> Option<Record> {
        let slot = self.slot_mut(entity)?;
        let record = slot.record.take();
        slot.alive = false;
        slot.traversable = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(entity.index());
        self.alive -= 1;
        record
    }

    fn slot(&self, entity: Entity) -> Option<&Slot> {
        let slot = self.slots.get(entity.index().small_int::<usize>())?;
        (slot.alive && slot.generation == entity.generation()).then_some(slot)
    }

    fn slot_mut(&mut self, entity: Entity) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(entity.index().small_int::<usize>())?;
        (slot.alive && slot.generation == entity.generation()).then_some(slot)
    }

    /// The number of live user entities.
    pub(crate) fn len(&self) -> usize { self.alive }

    pub(crate) fn is_alive(&self, entity: Entity) -> bool { self.slot(entity).is_some() }

    /// Resolves a slot index, e.g. from a pair element, to the live entity.
    pub(crate) fn alive_by_index(&self, index: u32) -> Option<Entity> {
        let slot = self.slots.get(index.small_int::<usize>())?;
        slot.alive.then(|| Entity::from_parts(index, slot.generation))
    }

    pub(crate) fn record(&self, entity: Entity) -> Option<Record> { self.slot(entity)?.record }

    pub(crate) fn set_record(&mut self, entity: Entity, record: Record) {
        let slot = self.slot_mut(entity).expect("cannot locate a dead entity");
        slot.record = Some(record);
    }

    /// Updates the row of an entity that was moved inside its table.
    pub(crate) fn set_row(&mut self, entity: Entity, row: usize) {
        let slot = self.slot_mut(entity).expect("moved entity must be alive");
        let record = slot.record.as_mut().expect("moved entity must have a record");
        record.row = row;
    }

    pub(crate) fn is_traversable(&self, entity: Entity) -> bool {
        self.slot(entity).map_or(false, |slot| slot.traversable)
    }

    /// Flags an entity as traversable. Returns `true` if the flag was newly set.
    pub(crate) fn set_traversable(&mut self, entity: Entity) -> bool {
        match self.slot_mut(entity) {
            Some(slot) if !slot.traversable => {
                slot.traversable = true;
                true
            }
            _ => false,
        }
    }
}
