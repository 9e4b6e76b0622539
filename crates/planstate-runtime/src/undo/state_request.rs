#![forbid(unsafe_code)]

//! Entity-graph request: captures entity state around a mutation.
//!
//! While open, a [`StateRequest`] is told about every entity about to change
//! (`transact`). It keeps one [`EntityTxnState`] per entity and dumps the
//! "before" data right away, through the entity's IO and the field codec.
//! `commit` dumps the matching "after" data. Undo and redo load one of the
//! two snapshots back through a [`TransactionContext`] whose restore markers
//! guarantee that every transacted entity is restored at most once, however
//! the references between them are shaped.
//!
//! # Capture rules
//!
//! | announced change              | before (transact)          | after (commit)        |
//! |-------------------------------|----------------------------|-----------------------|
//! | `Modification`, named field   | that field, first value    | the same fields       |
//! | `Modification`, whole entity  | full record                | full record           |
//! | `Deletion`                    | full record                | nothing               |
//! | `Creation`                    | nothing                    | full record           |
//! | `Recycling`                   | nothing                    | nothing               |
//!
//! Undoing a creation removes the entity from the document and redoing it
//! adds it back; deletions behave the other way round. An entity that is
//! no longer in the document at commit time counts as deleted, and one that
//! was created and removed again inside the request is forgotten.
//!
//! Passing `{"deep": true}` as transact options captures every entity
//! reachable from the transacted one (or from the announced field) as well.
//! Those linked entities are tracked as modifications of their own: commit
//! dumps their full "after" record, and undo/redo restore them next to the
//! transacted ones.

use std::any::Any;
use std::cell::Cell;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use planstate_core::{
    ContextOutcome, Document, DumpOptions, EntityId, EntityRecord, EntityRef, FieldValue,
    FieldValueType, FieldValueWrapper, GraphDump, RestoreMarker, SerializationWarning,
    TransactionContext, WarningKind, id_of,
};
use serde_json::Value;

use super::request::{
    ChangeType, Request, RequestError, RequestMeta, RequestRef, RequestResult, RequestState,
    TransactOptions,
};

/// Registered type name of entity-state requests.
pub const STATE_REQUEST_TYPE: &str = "State";

/// What has been captured of an entity's "before" state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Capture {
    /// Nothing yet.
    #[default]
    None,
    /// Individual fields.
    Fields(BTreeSet<String>),
    /// The whole record.
    Full,
}

impl Capture {
    fn merge(&mut self, other: &Capture) {
        match other {
            Capture::None => {}
            Capture::Full => *self = Capture::Full,
            Capture::Fields(theirs) => match self {
                Capture::Full => {}
                Capture::Fields(mine) => mine.extend(theirs.iter().cloned()),
                Capture::None => *self = Capture::Fields(theirs.clone()),
            },
        }
    }
}

/// Per-entity bookkeeping of one request.
#[derive(Debug, Clone)]
pub struct EntityTxnState {
    entity: EntityRef,
    change: ChangeType,
    last_change: ChangeType,
    capture: Capture,
}

impl EntityTxnState {
    fn new(entity: EntityRef, change: ChangeType) -> Self {
        Self {
            entity,
            change,
            last_change: change,
            capture: Capture::None,
        }
    }

    /// The tracked entity.
    #[must_use]
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    /// Change announced first.
    #[must_use]
    pub fn change(&self) -> ChangeType {
        self.change
    }

    /// Change announced last.
    #[must_use]
    pub fn last_change(&self) -> ChangeType {
        self.last_change
    }

    /// Captured "before" state.
    #[must_use]
    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    fn id(&self) -> EntityId {
        id_of(&self.entity)
    }

    fn absorb(&mut self, later: &EntityTxnState) {
        self.last_change = later.last_change;
        self.capture.merge(&later.capture);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

// ============================================================================
// StateRequest
// ============================================================================

/// Request capturing entity state in a document.
pub struct StateRequest {
    meta: RequestMeta,
    document: Rc<Document>,
    txn_states: BTreeMap<EntityId, EntityTxnState>,
    linked: BTreeMap<EntityId, EntityTxnState>,
    before: GraphDump,
    after: GraphDump,
    restoring: bool,
    warnings: Vec<SerializationWarning>,
}

impl fmt::Debug for StateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRequest")
            .field("meta", &self.meta)
            .field("entities", &self.txn_states.len())
            .field("linked", &self.linked.len())
            .field("before", &self.before.records.len())
            .field("after", &self.after.records.len())
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

impl StateRequest {
    /// Open request on `document`.
    #[must_use]
    pub fn new(document: Rc<Document>) -> Self {
        Self {
            meta: RequestMeta::new(STATE_REQUEST_TYPE),
            document,
            txn_states: BTreeMap::new(),
            linked: BTreeMap::new(),
            before: GraphDump::default(),
            after: GraphDump::default(),
            restoring: false,
            warnings: Vec::new(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    /// Document the request works on.
    #[must_use]
    pub fn document(&self) -> &Rc<Document> {
        &self.document
    }

    /// Ids of the tracked entities.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.txn_states.keys().cloned().collect()
    }

    /// Ids of the entities captured only through a deep transact.
    #[must_use]
    pub fn linked_ids(&self) -> Vec<EntityId> {
        self.linked.keys().cloned().collect()
    }

    /// Bookkeeping of one tracked entity.
    #[must_use]
    pub fn txn_state(&self, id: &EntityId) -> Option<&EntityTxnState> {
        self.txn_states.get(id)
    }

    /// Snapshot restored by undo.
    #[must_use]
    pub fn before(&self) -> &GraphDump {
        &self.before
    }

    /// Snapshot restored by redo.
    #[must_use]
    pub fn after(&self) -> &GraphDump {
        &self.after
    }

    /// Whether an undo or redo is being applied right now.
    #[must_use]
    pub fn is_restoring(&self) -> bool {
        self.restoring
    }

    /// Soft errors raised by the last capture, commit or restore.
    #[must_use]
    pub fn warnings(&self) -> &[SerializationWarning] {
        &self.warnings
    }

    // ========================================================================
    // Capture
    // ========================================================================

    fn capture_before(&mut self, id: &EntityId, field: &str, change: ChangeType, deep: bool) {
        let Some(state) = self.txn_states.get_mut(id) else {
            return;
        };
        state.last_change = change;
        if state.change == ChangeType::Creation
            || (state.change == ChangeType::Recycling && change == ChangeType::Recycling)
            || state.capture == Capture::Full
        {
            return;
        }

        let entity = Rc::clone(&state.entity);
        if field.is_empty() || change == ChangeType::Deletion {
            state.capture = Capture::Full;
            self.capture_full(id, &entity, deep);
        } else {
            match &mut state.capture {
                Capture::Fields(names) => {
                    names.insert(field.to_owned());
                }
                other => *other = Capture::Fields(BTreeSet::from([field.to_owned()])),
            }
            self.capture_field(id, &entity, field, deep);
        }
    }

    fn capture_full(&mut self, id: &EntityId, entity: &EntityRef, deep: bool) {
        let options = if deep {
            DumpOptions::deep()
        } else {
            DumpOptions::default()
        };
        let mut ctx = TransactionContext::new(&self.document);
        let mut records = ctx.dump_entity(entity, &options).into_iter();
        let own = records.next();
        let outcome = ctx.finish();

        let Some(mut own) = own else {
            self.warnings.extend(outcome.warnings);
            return;
        };
        self.track_linked(id, &outcome.dump);
        // Fields captured earlier hold older values.
        if let Some(earlier) = self.before.records.remove(id) {
            own.fields.extend(earlier.fields);
        }
        self.before.records.insert(id.clone(), own);
        self.absorb_before(outcome);
    }

    fn capture_field(&mut self, id: &EntityId, entity: &EntityRef, field: &str, deep: bool) {
        if self
            .before
            .records
            .get(id)
            .is_some_and(|r| r.fields.contains_key(field))
        {
            return;
        }
        let (class, value) = {
            let e = entity.borrow();
            (
                e.class_tag().to_owned(),
                e.field(field).unwrap_or(FieldValue::Null),
            )
        };
        let value_type = self.codec_type(entity, field, &value, None);

        let mut ctx = TransactionContext::new(&self.document);
        ctx.enter_entity(id.clone());
        ctx.enter_field(field);
        let stored = FieldValueWrapper::dump_value(&value, value_type, &mut ctx);
        ctx.leave_field();
        ctx.leave_entity();
        if deep {
            for target in value.linked_entities() {
                ctx.dump_entity(&target, &DumpOptions::deep());
            }
        }
        let outcome = ctx.finish();
        self.track_linked(id, &outcome.dump);

        self.before
            .records
            .entry(id.clone())
            .or_insert_with(|| EntityRecord::new(id.clone(), class))
            .fields
            .insert(field.to_owned(), stored);
        self.absorb_before(outcome);
    }

    /// Codec tag for one field: entity links always keep their link tag,
    /// otherwise the tag used for the earlier capture, then the IO's
    /// declaration.
    fn codec_type(
        &self,
        entity: &EntityRef,
        field: &str,
        value: &FieldValue,
        captured: Option<FieldValueType>,
    ) -> FieldValueType {
        let inferred = FieldValueType::inferred(value);
        if inferred.is_entity_link() {
            return inferred;
        }
        captured
            .or_else(|| {
                self.document
                    .registry()
                    .io_of(entity)
                    .and_then(|io| io.field_type(field))
            })
            .unwrap_or_default()
    }

    /// Start tracking every entity of `dumped` other than `own` that no
    /// transact announced.
    fn track_linked(&mut self, own: &EntityId, dumped: &GraphDump) {
        for id in dumped.records.keys() {
            if id == own || self.txn_states.contains_key(id) || self.linked.contains_key(id) {
                continue;
            }
            let Some(entity) = self.document.get_entity_by_id(id) else {
                continue;
            };
            let mut state = EntityTxnState::new(entity, ChangeType::Modification);
            state.capture = Capture::Full;
            tracing::debug!(entity = %id, via = %own, "captured through deep transact");
            self.linked.insert(id.clone(), state);
        }
    }

    fn absorb_before(&mut self, outcome: ContextOutcome) {
        let ContextOutcome { dump, warnings, .. } = outcome;
        // First capture of each field wins.
        for (id, record) in dump.records {
            match self.before.records.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    let mine = slot.get_mut();
                    for (name, stored) in record.fields {
                        mine.fields.entry(name).or_insert(stored);
                    }
                }
            }
        }
        for (id, material) in dump.materials {
            self.before.materials.entry(id).or_insert(material);
        }
        for (id, state) in dump.states {
            self.before.states.entry(id).or_insert(state);
        }
        self.warnings.extend(warnings);
    }

    fn absorb_after(&mut self, outcome: ContextOutcome) {
        let ContextOutcome { dump, warnings, .. } = outcome;
        self.after.records.extend(dump.records);
        self.after.materials.extend(dump.materials);
        self.after.states.extend(dump.states);
        self.warnings.extend(warnings);
    }

    /// Full "after" records of the deep-captured entities. Fields already
    /// captured for a transacted entity of the same id are kept.
    fn capture_linked_after(&mut self) {
        let targets: Vec<EntityRef> = self
            .linked
            .iter()
            .filter(|(id, state)| {
                state.last_change != ChangeType::Deletion
                    && self.txn_states.get(*id).is_none_or(|txn| {
                        txn.change == ChangeType::Modification
                            && txn.last_change != ChangeType::Deletion
                    })
            })
            .map(|(_, state)| Rc::clone(&state.entity))
            .collect();
        if targets.is_empty() {
            return;
        }

        let mut ctx = TransactionContext::new(&self.document);
        for entity in &targets {
            ctx.dump_entity(entity, &DumpOptions::default());
        }
        let ContextOutcome { dump, warnings, .. } = ctx.finish();
        for (id, record) in dump.records {
            match self.after.records.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    let mine = slot.get_mut();
                    for (name, stored) in record.fields {
                        mine.fields.entry(name).or_insert(stored);
                    }
                }
            }
        }
        for (id, material) in dump.materials {
            self.after.materials.entry(id).or_insert(material);
        }
        for (id, state) in dump.states {
            self.after.states.entry(id).or_insert(state);
        }
        self.warnings.extend(warnings);
    }

    fn capture_after(&mut self, id: &EntityId) {
        let Some(state) = self.txn_states.get(id) else {
            return;
        };
        if state.last_change == ChangeType::Deletion || state.change == ChangeType::Recycling {
            return;
        }
        let entity = Rc::clone(&state.entity);
        let fields = match &state.capture {
            Capture::Fields(names) if state.change != ChangeType::Creation => Some(names.clone()),
            _ => None,
        };

        let mut ctx = TransactionContext::new(&self.document);
        match fields {
            None => {
                let records = ctx.dump_entity(&entity, &DumpOptions::default());
                for record in records {
                    ctx.insert_record(record);
                }
            }
            Some(names) => {
                let (class, data) = {
                    let e = entity.borrow();
                    (e.class_tag().to_owned(), e.get_data())
                };
                let mut record = EntityRecord::new(id.clone(), class);
                ctx.enter_entity(id.clone());
                for name in names {
                    let value = data.get(&name).cloned().unwrap_or(FieldValue::Null);
                    let captured = self
                        .before
                        .record(id)
                        .and_then(|r| r.field(&name))
                        .map(|w| w.value_type);
                    let value_type = self.codec_type(&entity, &name, &value, captured);
                    ctx.enter_field(&name);
                    let stored = FieldValueWrapper::dump_value(&value, value_type, &mut ctx);
                    ctx.leave_field();
                    record.fields.insert(name, stored);
                }
                ctx.leave_entity();
                ctx.insert_record(record);
            }
        }
        self.absorb_after(ctx.finish());
    }

    // ========================================================================
    // Restore
    // ========================================================================

    fn check_restorable(&self) -> RequestResult<()> {
        let registry = self.document.registry();
        for state in self.txn_states.values() {
            if state.change == ChangeType::Recycling || registry.io_of(&state.entity).is_some() {
                continue;
            }
            let class = state.entity.borrow().class_tag().to_owned();
            return Err(RequestError::Restore(format!(
                "no IO registered for class '{class}' of entity {}",
                state.id()
            )));
        }
        Ok(())
    }

    fn restore(&mut self, direction: Direction) -> RequestResult<()> {
        let _span = tracing::debug_span!(
            "state_request.restore",
            request = %self.meta.request_type,
            direction = ?direction,
            entities = self.txn_states.len()
        )
        .entered();
        self.check_restorable()?;

        self.restoring = true;
        let outcome = {
            let snapshot = match direction {
                Direction::Undo => &self.before,
                Direction::Redo => &self.after,
            };
            let mut ctx = TransactionContext::from_dump(&self.document, snapshot);
            let linked = self
                .linked
                .iter()
                .filter(|(id, _)| !self.txn_states.contains_key(*id));
            let markers: Vec<(EntityId, Rc<EntityRestore>)> = self
                .txn_states
                .iter()
                .chain(linked)
                .map(|(id, state)| (id.clone(), Rc::new(EntityRestore::new(state, direction))))
                .collect();
            for (id, marker) in &markers {
                ctx.register_entity(Rc::clone(&marker.entity));
                ctx.set_txn_state(id.clone(), Rc::clone(marker) as Rc<dyn RestoreMarker>);
            }
            for (id, marker) in &markers {
                let record = ctx.record(id);
                marker.restore(&mut ctx, record.as_deref());
            }
            ctx.finish()
        };
        self.restoring = false;

        for entity in &outcome.created {
            self.document.add(Rc::clone(entity));
        }
        tracing::debug!(
            created = outcome.created.len(),
            warnings = outcome.warnings.len(),
            "restore finished"
        );
        self.warnings = outcome.warnings;
        Ok(())
    }
}

#[async_trait(?Send)]
impl Request for StateRequest {
    fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RequestMeta {
        &mut self.meta
    }

    fn can_transact(&self) -> bool {
        self.meta.state == RequestState::Open && !self.restoring
    }

    fn transact(
        &mut self,
        entity: &EntityRef,
        field: &str,
        change: ChangeType,
        options: &TransactOptions,
    ) {
        if !self.can_transact() {
            return;
        }
        let id = id_of(entity);
        let repeated = self
            .txn_states
            .get(&id)
            .is_some_and(|state| state.change == change);
        if repeated && field.is_empty() {
            return;
        }
        self.txn_states
            .entry(id.clone())
            .or_insert_with(|| EntityTxnState::new(Rc::clone(entity), change));
        if change != ChangeType::Creation {
            let deep = options.get("deep").and_then(Value::as_bool).unwrap_or(false);
            self.capture_before(&id, field, change, deep);
        }
    }

    fn commit(&mut self) -> RequestResult {
        self.meta.expect_state(RequestState::Open, "commit")?;
        let _span = tracing::debug_span!(
            "state_request.commit",
            request = %self.meta.request_type,
            entities = self.txn_states.len()
        )
        .entered();

        let document = Rc::clone(&self.document);
        self.txn_states.retain(|id, state| {
            let orphan = !document.contains(id);
            if orphan && state.change == ChangeType::Creation {
                tracing::debug!(entity = %id, "created entity left the document, dropped");
                return false;
            }
            if orphan && state.change != ChangeType::Recycling {
                state.last_change = ChangeType::Deletion;
            }
            true
        });
        for (id, state) in &mut self.linked {
            if !document.contains(id) {
                state.last_change = ChangeType::Deletion;
            }
        }

        let ids: Vec<EntityId> = self.txn_states.keys().cloned().collect();
        for id in &ids {
            self.capture_after(id);
        }
        self.capture_linked_after();
        self.meta.transition(RequestState::Committed, "commit")?;
        Ok(Value::from(ids.len()))
    }

    fn undo(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Committed, "undo")?;
        self.restore(Direction::Undo)?;
        self.meta.transition(RequestState::Undone, "undo")
    }

    fn redo(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Undone, "redo")?;
        self.restore(Direction::Redo)?;
        self.meta.transition(RequestState::Committed, "redo")
    }

    /// Puts the captured entities back to their state before the request.
    fn abort(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Open, "abort")?;
        self.restore(Direction::Undo)?;
        self.meta.transition(RequestState::Aborted, "abort")
    }

    fn compose(&mut self, other: &RequestRef) -> bool {
        let other = other.borrow();
        let Some(other) = other.as_any().downcast_ref::<StateRequest>() else {
            return false;
        };
        if other.meta.request_type != self.meta.request_type
            || other.meta.state != self.meta.state
            || !self.is_committed()
            || !Rc::ptr_eq(&other.document, &self.document)
        {
            return false;
        }

        // before: first capture of each field wins
        for (id, record) in &other.before.records {
            match self.before.records.get_mut(id) {
                Some(mine) => {
                    for (name, stored) in &record.fields {
                        mine.fields
                            .entry(name.clone())
                            .or_insert_with(|| stored.clone());
                    }
                }
                None => {
                    self.before.records.insert(id.clone(), record.clone());
                }
            }
        }
        for (id, material) in &other.before.materials {
            self.before
                .materials
                .entry(id.clone())
                .or_insert_with(|| material.clone());
        }
        for (id, state) in &other.before.states {
            self.before
                .states
                .entry(id.clone())
                .or_insert_with(|| state.clone());
        }

        // after: last value of each field wins
        for (id, record) in &other.after.records {
            match self.after.records.get_mut(id) {
                Some(mine) => mine
                    .fields
                    .extend(record.fields.iter().map(|(k, v)| (k.clone(), v.clone()))),
                None => {
                    self.after.records.insert(id.clone(), record.clone());
                }
            }
        }
        self.after.materials.extend(
            other
                .after
                .materials
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.after.states.extend(
            other
                .after
                .states
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        for (id, state) in &other.txn_states {
            match self.txn_states.get_mut(id) {
                Some(mine) => mine.absorb(state),
                None => {
                    self.txn_states.insert(id.clone(), state.clone());
                }
            }
        }
        for (id, state) in &other.linked {
            match self.linked.get_mut(id) {
                Some(mine) => mine.absorb(state),
                None => {
                    self.linked.insert(id.clone(), state.clone());
                }
            }
        }
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Restore marker
// ============================================================================

/// Restores one transacted entity, at most once per restore pass.
struct EntityRestore {
    entity: EntityRef,
    id: EntityId,
    change: ChangeType,
    last_change: ChangeType,
    direction: Direction,
    done: Cell<bool>,
}

impl EntityRestore {
    fn new(state: &EntityTxnState, direction: Direction) -> Self {
        Self {
            entity: Rc::clone(&state.entity),
            id: state.id(),
            change: state.change,
            last_change: state.last_change,
            direction,
            done: Cell::new(false),
        }
    }

    fn leaves_document(&self) -> bool {
        match self.direction {
            Direction::Undo => self.change == ChangeType::Creation,
            Direction::Redo => self.last_change == ChangeType::Deletion,
        }
    }
}

impl RestoreMarker for EntityRestore {
    fn restore(&self, ctx: &mut TransactionContext<'_>, record: Option<&EntityRecord>) {
        if self.done.replace(true) || self.change == ChangeType::Recycling {
            return;
        }
        let document = ctx.document();
        if self.leaves_document() {
            document.remove(&self.id);
            tracing::debug!(entity = %self.id, "removed from document");
            return;
        }
        if !document.contains(&self.id) {
            document.add(Rc::clone(&self.entity));
            tracing::debug!(entity = %self.id, "added back to document");
        }

        let Some(record) = record else {
            ctx.warn(
                SerializationWarning::new(WarningKind::MissingRecord, "no captured state")
                    .for_entity(self.id.clone()),
            );
            return;
        };
        let Some(io) = document.registry().io_of(&self.entity) else {
            return;
        };
        ctx.enter_entity(self.id.clone());
        io.load(&self.entity, record, ctx);
        ctx.leave_entity();
    }
}
