#![forbid(unsafe_code)]

//! Class-tag registry.
//!
//! Maps the class tag stored in every [`EntityRecord`](crate::io::EntityRecord)
//! to a factory building an empty entity of that class and the
//! [`EntityIo`] service that fills it. The registry is built once and shared
//! by every document and context that needs to reconstruct entities.

use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;

use crate::entity::{EntityId, EntityRef};
use crate::io::EntityIo;

/// Builds an empty entity carrying the given id.
pub type EntityFactory = Box<dyn Fn(&EntityId) -> EntityRef>;

struct ClassEntry {
    factory: EntityFactory,
    io: Rc<dyn EntityIo>,
}

/// Class tag → (factory, IO) table.
#[derive(Default)]
pub struct EntityRegistry {
    classes: AHashMap<String, ClassEntry>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("classes", &self.class_tags())
            .finish()
    }
}

impl EntityRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a class.
    #[must_use]
    pub fn register_class<F, I>(mut self, tag: impl Into<String>, factory: F, io: I) -> Self
    where
        F: Fn(&EntityId) -> EntityRef + 'static,
        I: EntityIo + 'static,
    {
        self.insert(tag, factory, Rc::new(io));
        self
    }

    /// Register a class with a shared IO service. A previous registration
    /// under the same tag is replaced.
    pub fn insert<F>(&mut self, tag: impl Into<String>, factory: F, io: Rc<dyn EntityIo>)
    where
        F: Fn(&EntityId) -> EntityRef + 'static,
    {
        let tag = tag.into();
        if self.classes.contains_key(&tag) {
            tracing::debug!(class = %tag, "replacing class registration");
        }
        self.classes.insert(
            tag,
            ClassEntry {
                factory: Box::new(factory),
                io,
            },
        );
    }

    /// IO service for a class tag.
    #[must_use]
    pub fn io_for(&self, tag: &str) -> Option<Rc<dyn EntityIo>> {
        self.classes.get(tag).map(|entry| Rc::clone(&entry.io))
    }

    /// IO service for a live entity.
    #[must_use]
    pub fn io_of(&self, entity: &EntityRef) -> Option<Rc<dyn EntityIo>> {
        self.io_for(entity.borrow().class_tag())
    }

    /// Build an empty entity of class `tag`.
    #[must_use]
    pub fn create(&self, tag: &str, id: &EntityId) -> Option<EntityRef> {
        self.classes.get(tag).map(|entry| (entry.factory)(id))
    }

    /// Whether `tag` is registered.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.classes.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn class_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}
