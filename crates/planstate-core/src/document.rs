#![forbid(unsafe_code)]

//! The live entity graph.
//!
//! A [`Document`] owns every entity by id, plus the material and state side
//! tables. Entity fields only ever hold non-owning links into it.
//!
//! All mutation goes through `&self`: the document is shared between the
//! requests of a session, which restore entities into it during undo/redo.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use ahash::AHashSet;

use crate::context::{GraphDump, TransactionContext};
use crate::entity::{EntityId, EntityRef, id_of};
use crate::io::DumpOptions;
use crate::registry::EntityRegistry;
use crate::side_table::{MaterialData, StateData};
use crate::warning::{SerializationWarning, WarningKind};

/// Result of [`Document::dump`].
#[derive(Debug, Default)]
pub struct DumpReport {
    /// The dumped records and side objects.
    pub dump: GraphDump,
    /// Soft errors raised while dumping.
    pub warnings: Vec<SerializationWarning>,
}

/// Result of [`Document::load`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Root entities, in dump order. Roots that failed to resolve are absent.
    pub loaded: Vec<EntityRef>,
    /// Entities that did not exist before and were inserted.
    pub created: Vec<EntityRef>,
    /// Soft errors raised while loading.
    pub warnings: Vec<SerializationWarning>,
}

impl LoadReport {
    /// Whether the load finished without soft errors.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Live entity graph with side tables.
pub struct Document {
    registry: Rc<EntityRegistry>,
    entities: RefCell<BTreeMap<EntityId, EntityRef>>,
    materials: RefCell<BTreeMap<String, Rc<MaterialData>>>,
    states: RefCell<BTreeMap<String, Rc<StateData>>>,
    next_id: Cell<u64>,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("entities", &self.entities.borrow().len())
            .field("materials", &self.materials.borrow().len())
            .field("states", &self.states.borrow().len())
            .finish()
    }
}

impl Document {
    /// Empty document using `registry` for reconstruction.
    #[must_use]
    pub fn new(registry: Rc<EntityRegistry>) -> Self {
        Self {
            registry,
            entities: RefCell::new(BTreeMap::new()),
            materials: RefCell::new(BTreeMap::new()),
            states: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(1),
        }
    }

    /// Class registry.
    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Shared handle to the class registry.
    #[must_use]
    pub fn registry_handle(&self) -> Rc<EntityRegistry> {
        Rc::clone(&self.registry)
    }

    // ---- entities ----------------------------------------------------------

    /// Insert an entity, returning the one it replaced.
    pub fn add(&self, entity: EntityRef) -> Option<EntityRef> {
        let id = id_of(&entity);
        self.entities.borrow_mut().insert(id, entity)
    }

    /// Remove an entity by id.
    pub fn remove(&self, id: &EntityId) -> Option<EntityRef> {
        self.entities.borrow_mut().remove(id)
    }

    /// Live entity by id.
    #[must_use]
    pub fn get_entity_by_id(&self, id: &EntityId) -> Option<EntityRef> {
        self.entities.borrow().get(id).cloned()
    }

    /// Whether `id` is live.
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.borrow().contains_key(id)
    }

    /// Live ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.borrow().keys().cloned().collect()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.borrow().len()
    }

    /// Whether the document has no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.borrow().is_empty()
    }

    /// A numeric id not used by any live entity.
    #[must_use]
    pub fn next_entity_id(&self) -> EntityId {
        loop {
            let n = self.next_id.get();
            self.next_id.set(n + 1);
            let id = EntityId::from(n);
            if !self.contains(&id) {
                return id;
            }
        }
    }

    /// Build an entity of class `tag` with a fresh id and insert it.
    pub fn create(&self, tag: &str) -> Option<EntityRef> {
        let entity = self.registry.create(tag, &self.next_entity_id())?;
        self.add(entity.clone());
        Some(entity)
    }

    // ---- side tables -------------------------------------------------------

    /// Insert or replace a material.
    pub fn add_material(&self, material: Rc<MaterialData>) {
        self.materials
            .borrow_mut()
            .insert(material.id.clone(), material);
    }

    /// Material by id.
    #[must_use]
    pub fn material(&self, id: &str) -> Option<Rc<MaterialData>> {
        self.materials.borrow().get(id).cloned()
    }

    /// Insert or replace a state.
    pub fn add_state(&self, state: Rc<StateData>) {
        self.states.borrow_mut().insert(state.id.clone(), state);
    }

    /// State by id.
    #[must_use]
    pub fn state(&self, id: &str) -> Option<Rc<StateData>> {
        self.states.borrow().get(id).cloned()
    }

    // ---- dump / load -------------------------------------------------------

    /// Dump `roots` (and, with `options.deep`, everything they reach).
    pub fn dump(&self, roots: &[EntityRef], options: &DumpOptions) -> DumpReport {
        let _span = tracing::debug_span!("document.dump", roots = roots.len()).entered();

        let mut ctx = TransactionContext::new(self);
        for root in roots {
            ctx.add_root(id_of(root));
            ctx.dump_entity(root, options);
        }
        let outcome = ctx.finish();
        tracing::debug!(
            records = outcome.dump.records.len(),
            warnings = outcome.warnings.len(),
            "dump finished"
        );
        DumpReport {
            dump: outcome.dump,
            warnings: outcome.warnings,
        }
    }

    /// Load a dump into the graph.
    ///
    /// Roots (every record, when the dump names none) that are already live
    /// get their record applied in place; the others are reconstructed.
    /// References resolve to live entities first. Reconstructed entities are
    /// inserted and verified.
    pub fn load(&self, dump: &GraphDump) -> LoadReport {
        let _span = tracing::debug_span!("document.load", records = dump.records.len()).entered();

        let mut ctx = TransactionContext::from_dump(self, dump);
        let targets: Vec<EntityId> = if dump.roots.is_empty() {
            dump.records.keys().cloned().collect()
        } else {
            dump.roots.clone()
        };

        let mut seen = AHashSet::new();
        let mut loaded = Vec::new();
        for id in targets {
            if !seen.insert(id.clone()) {
                continue;
            }
            let entity = match self.get_entity_by_id(&id) {
                Some(live) => {
                    self.reload(&live, &mut ctx);
                    Some(live)
                }
                None => ctx.load_entity(&id),
            };
            loaded.extend(entity);
        }

        let created = ctx.created().to_vec();
        for entity in &created {
            self.add(entity.clone());
            let verified = entity.try_borrow().map(|e| e.verify()).unwrap_or(false);
            if !verified {
                ctx.warn(
                    SerializationWarning::new(
                        WarningKind::VerificationFailed,
                        "entity failed verification after load",
                    )
                    .for_entity(id_of(entity)),
                );
            }
        }

        let outcome = ctx.finish();
        tracing::debug!(
            loaded = loaded.len(),
            created = created.len(),
            warnings = outcome.warnings.len(),
            "load finished"
        );
        LoadReport {
            loaded,
            created,
            warnings: outcome.warnings,
        }
    }

    fn reload(&self, live: &EntityRef, ctx: &mut TransactionContext<'_>) {
        let id = id_of(live);
        let Some(record) = ctx.record(&id) else {
            return;
        };
        let Some(io) = self.registry.io_of(live) else {
            ctx.warn(
                SerializationWarning::new(WarningKind::UnknownClass, "live entity has no IO")
                    .for_entity(id),
            );
            return;
        };
        ctx.register_entity(live.clone());
        ctx.enter_entity(id);
        io.load(live, &record, ctx);
        ctx.leave_entity();
    }
}
