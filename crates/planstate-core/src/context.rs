#![forbid(unsafe_code)]

//! Per-operation transaction context.
//!
//! One [`TransactionContext`] lives for exactly one dump or one load across a
//! (sub)graph. It carries:
//!
//! ```text
//!   data        id -> raw EntityRecord            (what to load from)
//!   txn_states  id -> RestoreMarker               (cycle guard)
//!   entities    id -> EntityRef rebuilt here      (looked up before the document)
//!   materials / states                            (side tables dumped alongside)
//!   warnings                                      (soft-error channel)
//! ```
//!
//! # Invariants
//!
//! - An entity is reconstructed from `data` at most once per context: it is
//!   registered in `entities` *before* its IO loads any field, so a cycle
//!   reaching it again resolves to the same handle.
//! - An entity is dumped at most once per context.
//! - Every warning pushed through [`TransactionContext::warn`] is also logged.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::entity::{EntityId, EntityRef};
use crate::field::FieldValueWrapper;
use crate::io::{DumpCallback, DumpOptions, EntityRecord};
use crate::side_table::{MaterialData, StateData};
use crate::warning::{SerializationWarning, WarningKind};

/// In-progress restoration of one entity.
///
/// Installed in a context with [`TransactionContext::set_txn_state`]. When a
/// reference to the entity is resolved while the marker is present, the
/// marker is asked to restore it instead of a fresh reconstruction.
/// Implementations must restore at most once however often they are called.
pub trait RestoreMarker {
    /// Bring the entity to the state described by `record`.
    fn restore(&self, ctx: &mut TransactionContext<'_>, record: Option<&EntityRecord>);
}

/// Serializable result of one dump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDump {
    /// Entities the dump was requested for, in request order.
    #[serde(default)]
    pub roots: Vec<EntityId>,
    /// Raw records keyed by entity id.
    #[serde(default)]
    pub records: BTreeMap<EntityId, EntityRecord>,
    /// Materials referenced through `MaterialDataField` fields.
    #[serde(default)]
    pub materials: BTreeMap<String, MaterialData>,
    /// States referenced through `StateField` fields.
    #[serde(default)]
    pub states: BTreeMap<String, StateData>,
}

impl GraphDump {
    /// Whether nothing was dumped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.materials.is_empty() && self.states.is_empty()
    }

    /// Raw record of one entity.
    #[must_use]
    pub fn record(&self, id: &EntityId) -> Option<&EntityRecord> {
        self.records.get(id)
    }
}

/// Everything a finished context produced.
#[derive(Debug, Default)]
pub struct ContextOutcome {
    /// Records and side objects collected by the context.
    pub dump: GraphDump,
    /// Entities reconstructed from records, in creation order.
    pub created: Vec<EntityRef>,
    /// Soft errors raised while the context was alive.
    pub warnings: Vec<SerializationWarning>,
}

#[derive(Debug)]
struct Cursor {
    entity: EntityId,
    field: Option<String>,
}

/// Bag of state shared by every codec call of one dump or load.
pub struct TransactionContext<'d> {
    document: &'d Document,
    roots: Vec<EntityId>,
    data: BTreeMap<EntityId, Rc<EntityRecord>>,
    materials: BTreeMap<String, MaterialData>,
    states: BTreeMap<String, StateData>,
    txn_states: AHashMap<EntityId, Rc<dyn RestoreMarker>>,
    entities: AHashMap<EntityId, EntityRef>,
    created: Vec<EntityRef>,
    dumped: AHashSet<EntityId>,
    warnings: Vec<SerializationWarning>,
    cursor: Vec<Cursor>,
}

impl fmt::Debug for TransactionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("records", &self.data.len())
            .field("txn_states", &self.txn_states.len())
            .field("entities", &self.entities.len())
            .field("materials", &self.materials.len())
            .field("states", &self.states.len())
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

impl<'d> TransactionContext<'d> {
    /// Empty context bound to a live document.
    #[must_use]
    pub fn new(document: &'d Document) -> Self {
        Self {
            document,
            roots: Vec::new(),
            data: BTreeMap::new(),
            materials: BTreeMap::new(),
            states: BTreeMap::new(),
            txn_states: AHashMap::new(),
            entities: AHashMap::new(),
            created: Vec::new(),
            dumped: AHashSet::new(),
            warnings: Vec::new(),
            cursor: Vec::new(),
        }
    }

    /// Context pre-filled with the records and side objects of a dump.
    #[must_use]
    pub fn from_dump(document: &'d Document, dump: &GraphDump) -> Self {
        let mut ctx = Self::new(document);
        ctx.roots.clone_from(&dump.roots);
        ctx.data = dump
            .records
            .iter()
            .map(|(id, record)| (id.clone(), Rc::new(record.clone())))
            .collect();
        ctx.materials.clone_from(&dump.materials);
        ctx.states.clone_from(&dump.states);
        ctx
    }

    /// The live document this context resolves against.
    #[must_use]
    pub fn document(&self) -> &'d Document {
        self.document
    }

    /// Root ids recorded so far.
    #[must_use]
    pub fn roots(&self) -> &[EntityId] {
        &self.roots
    }

    /// Mark an entity as a root of the dump.
    pub fn add_root(&mut self, id: EntityId) {
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    // ---- raw records -------------------------------------------------------

    /// Raw record for `id`.
    #[must_use]
    pub fn record(&self, id: &EntityId) -> Option<Rc<EntityRecord>> {
        self.data.get(id).cloned()
    }

    /// Store a raw record, replacing any previous one for the same id.
    pub fn insert_record(&mut self, record: EntityRecord) {
        self.data.insert(record.id.clone(), Rc::new(record));
    }

    /// Number of raw records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.data.len()
    }

    // ---- cycle guard -------------------------------------------------------

    /// Install a restoration marker for `id`.
    pub fn set_txn_state(&mut self, id: EntityId, marker: Rc<dyn RestoreMarker>) {
        self.txn_states.insert(id, marker);
    }

    /// Restoration marker for `id`, if one is installed.
    #[must_use]
    pub fn txn_state(&self, id: &EntityId) -> Option<Rc<dyn RestoreMarker>> {
        self.txn_states.get(id).cloned()
    }

    // ---- entity resolution -------------------------------------------------

    /// Entity rebuilt in this context, else the live one from the document.
    #[must_use]
    pub fn get_entity_by_id(&self, id: &EntityId) -> Option<EntityRef> {
        self.entities
            .get(id)
            .cloned()
            .or_else(|| self.document.get_entity_by_id(id))
    }

    /// Make `entity` resolvable by id for the rest of this context.
    pub fn register_entity(&mut self, entity: EntityRef) {
        let id = entity.borrow().id().clone();
        self.entities.insert(id, entity);
    }

    /// Resolve `id` the way a reference field does.
    pub fn load_entity(&mut self, id: &EntityId) -> Option<EntityRef> {
        FieldValueWrapper::load_entity(id, self)
    }

    /// Reconstruct an entity from its raw record.
    ///
    /// Returns `None` without a warning when no record exists, so the caller
    /// can report the unresolved reference once. A record with an unknown
    /// class tag is reported here.
    pub fn load_from_dump_by_id(&mut self, id: &EntityId) -> Option<EntityRef> {
        let record = self.record(id)?;
        let registry = self.document.registry();

        let Some(class) = record.class.as_deref() else {
            self.warn(
                SerializationWarning::new(WarningKind::UnknownClass, "record has no class tag")
                    .for_entity(id.clone()),
            );
            return None;
        };
        let (Some(entity), Some(io)) = (registry.create(class, id), registry.io_for(class)) else {
            self.warn(
                SerializationWarning::new(
                    WarningKind::UnknownClass,
                    format!("class '{class}' is not registered"),
                )
                .for_entity(id.clone()),
            );
            return None;
        };

        tracing::debug!(entity = %id, class = %class, "reconstructing entity from dump");
        self.entities.insert(id.clone(), entity.clone());
        self.created.push(entity.clone());

        self.enter_entity(id.clone());
        io.load(&entity, &record, self);
        self.leave_entity();
        Some(entity)
    }

    /// Entities reconstructed by this context so far.
    #[must_use]
    pub fn created(&self) -> &[EntityRef] {
        &self.created
    }

    // ---- dumping -----------------------------------------------------------

    /// Dump one entity through the IO registered for its class tag.
    ///
    /// Returns the produced records (empty when the entity was already dumped
    /// in this context). The records are also stored in the context.
    pub fn dump_entity(&mut self, entity: &EntityRef, options: &DumpOptions) -> Vec<EntityRecord> {
        self.dump_entity_with(entity, options, None)
    }

    /// [`dump_entity`](Self::dump_entity) with a callback that may rewrite
    /// the produced records.
    pub fn dump_entity_with(
        &mut self,
        entity: &EntityRef,
        options: &DumpOptions,
        callback: Option<DumpCallback<'_>>,
    ) -> Vec<EntityRecord> {
        let (id, class) = {
            let e = entity.borrow();
            (e.id().clone(), e.class_tag().to_owned())
        };
        if !self.dumped.insert(id.clone()) {
            return Vec::new();
        }

        let Some(io) = self.document.registry().io_for(&class) else {
            self.warn(
                SerializationWarning::new(
                    WarningKind::UnknownClass,
                    format!("no IO registered for class '{class}'"),
                )
                .for_entity(id),
            );
            return Vec::new();
        };

        self.enter_entity(id);
        let records = io.dump(entity, self, options, callback);
        self.leave_entity();

        for record in &records {
            self.insert_record(record.clone());
        }
        records
    }

    /// Whether `id` was dumped through this context.
    #[must_use]
    pub fn is_dumped(&self, id: &EntityId) -> bool {
        self.dumped.contains(id)
    }

    // ---- side tables -------------------------------------------------------

    /// Store a material next to the entity records.
    pub fn dump_material(&mut self, material: &MaterialData) {
        self.materials
            .entry(material.id.clone())
            .or_insert_with(|| material.clone());
    }

    /// Store a state next to the entity records.
    pub fn dump_state(&mut self, state: &StateData) {
        self.states
            .entry(state.id.clone())
            .or_insert_with(|| state.clone());
    }

    /// Resolve a material id, creating it in the document from the dumped
    /// copy when the document does not know it yet.
    pub fn load_material(&mut self, id: &str) -> Option<Rc<MaterialData>> {
        if let Some(live) = self.document.material(id) {
            return Some(live);
        }
        if let Some(dumped) = self.materials.get(id) {
            let material = Rc::new(dumped.clone());
            self.document.add_material(material.clone());
            return Some(material);
        }
        self.warn(SerializationWarning::new(
            WarningKind::MissingSideObject,
            format!("material '{id}' is neither live nor dumped"),
        ));
        None
    }

    /// Resolve a state id, creating it in the document from the dumped copy
    /// when the document does not know it yet.
    pub fn load_state(&mut self, id: &str) -> Option<Rc<StateData>> {
        if let Some(live) = self.document.state(id) {
            return Some(live);
        }
        if let Some(dumped) = self.states.get(id) {
            let state = Rc::new(dumped.clone());
            self.document.add_state(state.clone());
            return Some(state);
        }
        self.warn(SerializationWarning::new(
            WarningKind::MissingSideObject,
            format!("state '{id}' is neither live nor dumped"),
        ));
        None
    }

    // ---- warnings ----------------------------------------------------------

    /// Record a soft error, attributing it to the entity/field being
    /// processed when the warning does not name one itself.
    pub fn warn(&mut self, mut warning: SerializationWarning) {
        if let Some(top) = self.cursor.last() {
            if warning.entity.is_none() {
                warning.entity = Some(top.entity.clone());
            }
            if warning.field.is_none() {
                warning.field.clone_from(&top.field);
            }
        }
        tracing::warn!(
            kind = %warning.kind,
            entity = ?warning.entity,
            field = ?warning.field,
            "{}",
            warning.message
        );
        self.warnings.push(warning);
    }

    /// Warnings recorded so far.
    #[must_use]
    pub fn warnings(&self) -> &[SerializationWarning] {
        &self.warnings
    }

    /// Begin processing `id`; later warnings are attributed to it.
    pub fn enter_entity(&mut self, id: EntityId) {
        self.cursor.push(Cursor {
            entity: id,
            field: None,
        });
    }

    /// Finish processing the current entity.
    pub fn leave_entity(&mut self) {
        self.cursor.pop();
    }

    /// Attribute later warnings to `field` of the current entity.
    pub fn enter_field(&mut self, field: &str) {
        if let Some(top) = self.cursor.last_mut() {
            top.field = Some(field.to_owned());
        }
    }

    /// Stop attributing warnings to a field.
    pub fn leave_field(&mut self) {
        if let Some(top) = self.cursor.last_mut() {
            top.field = None;
        }
    }

    /// Consume the context.
    #[must_use]
    pub fn finish(self) -> ContextOutcome {
        let records = self
            .data
            .into_iter()
            .map(|(id, record)| (id, Rc::unwrap_or_clone(record)))
            .collect();
        ContextOutcome {
            dump: GraphDump {
                roots: self.roots,
                records,
                materials: self.materials,
                states: self.states,
            },
            created: self.created,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tracing_test::traced_test;

    use super::*;
    use crate::entity::{RecordEntity, entity_ref};
    use crate::io::SchemaIo;
    use crate::registry::EntityRegistry;

    fn document() -> Document {
        let registry = EntityRegistry::new().register_class(
            "Wall",
            |id| entity_ref(RecordEntity::new(id.clone(), "Wall")),
            SchemaIo::new(),
        );
        Document::new(Rc::new(registry))
    }

    struct CountingMarker {
        calls: Cell<usize>,
    }

    impl RestoreMarker for CountingMarker {
        fn restore(&self, _ctx: &mut TransactionContext<'_>, _record: Option<&EntityRecord>) {
            self.calls.set(self.calls.get() + 1);
        }
    }

    #[test]
    fn marker_takes_priority_over_live_lookup() {
        let doc = document();
        let wall = entity_ref(RecordEntity::new("1", "Wall"));
        doc.add(wall.clone());

        let marker = Rc::new(CountingMarker {
            calls: Cell::new(0),
        });
        let mut ctx = TransactionContext::new(&doc);
        ctx.set_txn_state(EntityId::from("1"), marker.clone());

        let resolved = ctx.load_entity(&EntityId::from("1")).unwrap();
        assert!(Rc::ptr_eq(&resolved, &wall));
        assert_eq!(marker.calls.get(), 1);
    }

    #[test]
    fn context_entities_shadow_document() {
        let doc = document();
        doc.add(entity_ref(RecordEntity::new("1", "Wall")));
        let shadow = entity_ref(RecordEntity::new("1", "Wall"));

        let mut ctx = TransactionContext::new(&doc);
        ctx.register_entity(shadow.clone());
        assert!(Rc::ptr_eq(
            &ctx.get_entity_by_id(&EntityId::from("1")).unwrap(),
            &shadow
        ));
    }

    #[test]
    fn reconstruction_happens_once() {
        let doc = document();
        let mut ctx = TransactionContext::new(&doc);
        ctx.insert_record(EntityRecord::new("9", "Wall"));

        let first = ctx.load_entity(&EntityId::from("9")).unwrap();
        let second = ctx.load_entity(&EntityId::from("9")).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(ctx.created().len(), 1);
    }

    #[test]
    fn side_objects_are_created_once_in_document() {
        let doc = document();
        let mut ctx = TransactionContext::new(&doc);
        ctx.dump_material(&MaterialData::new("oak"));

        let a = ctx.load_material("oak").unwrap();
        let b = ctx.load_material("oak").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert!(doc.material("oak").is_some());
    }

    #[test]
    #[traced_test]
    fn unknown_class_is_reported_and_logged() {
        let doc = document();
        let mut ctx = TransactionContext::new(&doc);
        ctx.insert_record(EntityRecord::new("5", "Chimney"));

        assert!(ctx.load_entity(&EntityId::from("5")).is_none());
        let kinds: Vec<_> = ctx.warnings().iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            [WarningKind::UnknownClass, WarningKind::UnresolvedReference]
        );
        assert_eq!(ctx.warnings()[0].entity, Some(EntityId::from("5")));
        assert!(logs_contain("class 'Chimney' is not registered"));
    }

    #[test]
    fn warnings_pick_up_cursor_attribution() {
        let doc = document();
        let mut ctx = TransactionContext::new(&doc);
        ctx.enter_entity(EntityId::from("2"));
        ctx.enter_field("host");
        ctx.warn(SerializationWarning::new(WarningKind::ContractViolation, "bad"));
        ctx.leave_field();
        ctx.leave_entity();

        let w = &ctx.warnings()[0];
        assert_eq!(w.entity, Some(EntityId::from("2")));
        assert_eq!(w.field.as_deref(), Some("host"));
    }

    #[test]
    fn finish_collects_dump() {
        let doc = document();
        let mut ctx = TransactionContext::new(&doc);
        ctx.add_root(EntityId::from("1"));
        ctx.insert_record(EntityRecord::new("1", "Wall"));
        ctx.dump_state(&StateData::new("s1", "height", serde_json::json!(2.8)));

        let outcome = ctx.finish();
        assert_eq!(outcome.dump.roots, [EntityId::from("1")]);
        assert!(outcome.dump.record(&EntityId::from("1")).is_some());
        assert!(outcome.dump.states.contains_key("s1"));
        assert!(outcome.warnings.is_empty());
    }
}
