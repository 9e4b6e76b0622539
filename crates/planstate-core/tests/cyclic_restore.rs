#![forbid(unsafe_code)]

//! Cycle safety of reference resolution.
//!
//! Validates:
//! - A ↔ B reconstructed from a dump: each entity built and loaded once.
//! - A ↔ B restored through in-progress markers: each marker restores once,
//!   the IO loads each entity once, and the walk terminates.
//! - Self references and longer rings resolve to the same handles.

use std::cell::Cell;
use std::rc::Rc;

use planstate_core::{
    Document, DumpCallback, DumpOptions, EntityId, EntityIo, EntityRecord, EntityRef,
    EntityRegistry, FieldValue, FieldValueType, RecordEntity, RestoreMarker, SchemaIo,
    TransactionContext, entity_ref, id_of,
};

// ============================================================================
// Instrumentation
// ============================================================================

/// Schema IO that counts how often each operation runs.
struct CountingIo {
    inner: SchemaIo,
    loads: Rc<Cell<usize>>,
}

impl EntityIo for CountingIo {
    fn dump(
        &self,
        entity: &EntityRef,
        ctx: &mut TransactionContext<'_>,
        options: &DumpOptions,
        callback: Option<DumpCallback<'_>>,
    ) -> Vec<EntityRecord> {
        self.inner.dump(entity, ctx, options, callback)
    }

    fn load(&self, entity: &EntityRef, record: &EntityRecord, ctx: &mut TransactionContext<'_>) {
        self.loads.set(self.loads.get() + 1);
        self.inner.load(entity, record, ctx);
    }

    fn field_type(&self, name: &str) -> Option<FieldValueType> {
        self.inner.field_type(name)
    }
}

/// Marker restoring a live entity from its record, once.
struct OnceMarker {
    entity: EntityRef,
    done: Cell<bool>,
    calls: Cell<usize>,
}

impl RestoreMarker for OnceMarker {
    fn restore(&self, ctx: &mut TransactionContext<'_>, record: Option<&EntityRecord>) {
        self.calls.set(self.calls.get() + 1);
        if self.done.replace(true) {
            return;
        }
        let Some(record) = record else { return };
        if let Some(io) = ctx.document().registry().io_of(&self.entity) {
            io.load(&self.entity, record, ctx);
        }
    }
}

fn setup() -> (Document, Rc<Cell<usize>>) {
    let loads = Rc::new(Cell::new(0));
    let io = CountingIo {
        inner: SchemaIo::new().field("partner", FieldValueType::Entity),
        loads: Rc::clone(&loads),
    };
    let registry = EntityRegistry::new().register_class(
        "Wall",
        |id| entity_ref(RecordEntity::new(id.clone(), "Wall")),
        io,
    );
    (Document::new(Rc::new(registry)), loads)
}

fn link(from: &EntityRef, to: &EntityRef) {
    from.borrow_mut()
        .set([("partner".to_owned(), FieldValue::Entity(to.clone()))].into());
}

fn partner(entity: &EntityRef) -> EntityRef {
    entity
        .borrow()
        .field("partner")
        .and_then(|v| v.as_entity().cloned())
        .expect("partner link")
}

fn pair(doc: &Document) -> (EntityRef, EntityRef) {
    let a = entity_ref(RecordEntity::new("A", "Wall"));
    let b = entity_ref(RecordEntity::new("B", "Wall"));
    link(&a, &b);
    link(&b, &a);
    doc.add(a.clone());
    doc.add(b.clone());
    (a, b)
}

// ============================================================================
// Fresh reconstruction
// ============================================================================

#[test]
fn mutual_references_rebuild_once() {
    let (source, _) = setup();
    let (a, _) = pair(&source);
    let dump = source.dump(&[a], &DumpOptions::deep()).dump;
    assert_eq!(dump.records.len(), 2);

    let (target, loads) = setup();
    let report = target.load(&dump);
    assert!(report.is_clean(), "{:?}", report.warnings);
    assert_eq!(report.created.len(), 2);
    assert_eq!(loads.get(), 2);

    let a2 = target.get_entity_by_id(&EntityId::from("A")).unwrap();
    let b2 = partner(&a2);
    assert!(Rc::ptr_eq(&partner(&b2), &a2));
}

#[test]
fn self_reference_resolves_to_itself() {
    let (source, _) = setup();
    let solo = entity_ref(RecordEntity::new("S", "Wall"));
    link(&solo, &solo);
    let dump = source.dump(&[solo], &DumpOptions::deep()).dump;

    let (target, loads) = setup();
    let report = target.load(&dump);
    assert!(report.is_clean());
    assert_eq!(loads.get(), 1);
    let s2 = &report.loaded[0];
    assert!(Rc::ptr_eq(&partner(s2), s2));
}

#[test]
fn ring_of_five_terminates() {
    let (source, _) = setup();
    let ring: Vec<EntityRef> = (0..5u64)
        .map(|i| entity_ref(RecordEntity::new(i, "Wall")))
        .collect();
    for i in 0..ring.len() {
        link(&ring[i], &ring[(i + 1) % ring.len()]);
    }
    let dump = source.dump(&ring[..1], &DumpOptions::deep()).dump;
    assert_eq!(dump.records.len(), 5);

    let (target, loads) = setup();
    let report = target.load(&dump);
    assert_eq!(report.created.len(), 5);
    assert_eq!(loads.get(), 5);

    let mut cursor = report.loaded[0].clone();
    for _ in 0..5 {
        cursor = partner(&cursor);
    }
    assert!(Rc::ptr_eq(&cursor, &report.loaded[0]));
}

// ============================================================================
// Restoration through markers
// ============================================================================

#[test]
fn markers_restore_each_entity_once() {
    let (doc, loads) = setup();
    let (a, b) = pair(&doc);
    let before = doc.dump(&[a.clone(), b.clone()], &DumpOptions::default()).dump;

    // Break both links; the restore must bring them back.
    a.borrow_mut()
        .set([("partner".to_owned(), FieldValue::Null)].into());
    b.borrow_mut()
        .set([("partner".to_owned(), FieldValue::Null)].into());

    let markers: Vec<Rc<OnceMarker>> = [&a, &b]
        .into_iter()
        .map(|e| {
            Rc::new(OnceMarker {
                entity: e.clone(),
                done: Cell::new(false),
                calls: Cell::new(0),
            })
        })
        .collect();

    let mut ctx = TransactionContext::from_dump(&doc, &before);
    for marker in &markers {
        ctx.set_txn_state(id_of(&marker.entity), marker.clone());
    }
    for marker in &markers {
        let id = id_of(&marker.entity);
        ctx.load_entity(&id);
    }

    assert_eq!(loads.get(), 2);
    assert!(markers.iter().all(|m| m.done.get()));
    // A is asked twice (once directly, once via B), B twice (via A, then directly).
    assert_eq!(markers[0].calls.get(), 2);
    assert_eq!(markers[1].calls.get(), 2);
    assert!(ctx.warnings().is_empty());
    assert!(ctx.created().is_empty());

    assert!(Rc::ptr_eq(&partner(&a), &b));
    assert!(Rc::ptr_eq(&partner(&b), &a));
}
