use crate::tracer::{self, Tracer};

/// This type is used to configure and build a world.
pub struct Builder {
    pub(crate) tracer:                Box<dyn Tracer>,
    pub(crate) entity_capacity:       usize,
    pub(crate) cleanup_relationships: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self { tracer: Box::new(tracer::Noop), entity_capacity: 0, cleanup_relationships: true }
    }
}

impl Builder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self { Self::default() }

    /// Sets the tracer that observes table and cache events.
    pub fn tracer(mut self, tracer: impl Tracer + 'static) -> Self {
        self.tracer = Box::new(tracer);
        self
    }

    /// Preallocates the entity index.
    pub fn entity_capacity(mut self, capacity: usize) -> Self {
        self.entity_capacity = capacity;
        self
    }

    /// Whether deleting an entity removes the pairs that target it from other entities,
    /// deleting the entities that are its children through [`ChildOf`](crate::Entity::CHILD_OF).
    ///
    /// Enabled by default.
    /// When disabled, pairs targeting deleted entities remain in table types.
    pub fn cleanup_relationships(mut self, cleanup: bool) -> Self {
        self.cleanup_relationships = cleanup;
        self
    }

    /// Constructs the world from the builder.
    pub fn build(self) -> super::World { super::World::from_builder(self) }
}
