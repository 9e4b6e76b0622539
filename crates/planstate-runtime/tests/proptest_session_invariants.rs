#![forbid(unsafe_code)]

//! Property tests for session history invariants.
//!
//! Validates against a plain model of the two stacks:
//! - the undo stack never exceeds the bound and evicts oldest first
//! - any commit clears the redo stack
//! - undo/redo on an empty stack change nothing
//! - a merged commit takes one slot
//! - entity snapshots restore the exact value seen before each edit

use std::cell::Cell;
use std::rc::Rc;

use proptest::prelude::*;

use planstate_core::{
    Document, EntityRef, EntityRegistry, FieldValue, FieldValueType, RecordEntity, SchemaIo,
    entity_ref,
};
use planstate_runtime::undo::{
    CallbackRequest, ChangeType, RequestFactory, RequestRef, RequestRegistry, Session,
    StateRequest, TransactOptions, request_ref,
};

// ============================================================================
// Strategy helpers
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Commit(i64),
    Merge(i64),
    Undo,
    Redo,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1i64..100).prop_map(Op::Commit),
        1 => (1i64..100).prop_map(Op::Merge),
        2 => Just(Op::Undo),
        2 => Just(Op::Redo),
    ]
}

fn counter_request(counter: &Rc<Cell<i64>>, delta: i64) -> RequestRef {
    let up = Rc::clone(counter);
    let down = Rc::clone(counter);
    request_ref(CallbackRequest::new(
        "Add",
        move || {
            up.set(up.get() + delta);
            Ok(())
        },
        move || {
            down.set(down.get() - delta);
            Ok(())
        },
    ))
}

/// Reference model: each stack entry is the total delta of one undo unit.
#[derive(Debug, Default)]
struct Model {
    undo: Vec<i64>,
    redo: Vec<i64>,
    value: i64,
}

impl Model {
    fn record(&mut self, max: usize, delta: i64, merge: bool) {
        self.value += delta;
        self.redo.clear();
        if max == 0 {
            return;
        }
        let entry = match self.undo.pop() {
            Some(previous) if merge => previous + delta,
            Some(previous) => {
                self.undo.push(previous);
                delta
            }
            None => delta,
        };
        while self.undo.len() >= max {
            self.undo.remove(0);
        }
        self.undo.push(entry);
    }

    fn undo(&mut self) {
        if let Some(entry) = self.undo.pop() {
            self.value -= entry;
            self.redo.push(entry);
        }
    }

    fn redo(&mut self) {
        if let Some(entry) = self.redo.pop() {
            self.value += entry;
            self.undo.push(entry);
        }
    }
}

fn wall_document() -> (Rc<Document>, EntityRef) {
    let registry = EntityRegistry::new().register_class(
        "Wall",
        |id| entity_ref(RecordEntity::new(id.clone(), "Wall")),
        SchemaIo::new().field("height", FieldValueType::Generic),
    );
    let document = Rc::new(Document::new(Rc::new(registry)));
    let wall = document.create("Wall").expect("Wall is registered");
    (document, wall)
}

fn set_height(wall: &EntityRef, height: f64) {
    wall.borrow_mut()
        .set([("height".to_owned(), FieldValue::Number(height))].into());
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn session_matches_stack_model(
        max in 0usize..6,
        ops in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let counter = Rc::new(Cell::new(0));
        let mut session =
            Session::new(Rc::new(RequestRegistry::new(max)) as Rc<dyn RequestFactory>);
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Commit(delta) => {
                    session.commit(counter_request(&counter, delta), false).unwrap();
                    model.record(max, delta, false);
                }
                Op::Merge(delta) => {
                    session.commit(counter_request(&counter, delta), true).unwrap();
                    model.record(max, delta, true);
                }
                Op::Undo => {
                    let expected = !model.undo.is_empty();
                    prop_assert_eq!(session.undo().is_some(), expected);
                    model.undo();
                }
                Op::Redo => {
                    let expected = !model.redo.is_empty();
                    prop_assert_eq!(session.redo().is_some(), expected);
                    model.redo();
                }
            }
            prop_assert!(session.undo_depth() <= max);
            prop_assert_eq!(session.undo_depth(), model.undo.len());
            prop_assert_eq!(session.redo_depth(), model.redo.len());
            prop_assert_eq!(counter.get(), model.value);
        }
    }

    #[test]
    fn snapshots_restore_previous_heights(
        heights in prop::collection::vec(0u16..500, 1..12),
        undos in 0usize..12,
    ) {
        let (document, wall) = wall_document();
        set_height(&wall, -1.0);
        let mut session =
            Session::new(Rc::new(RequestRegistry::default()) as Rc<dyn RequestFactory>);

        let mut seen = vec![-1.0];
        for h in &heights {
            let h = f64::from(*h);
            let request = request_ref(StateRequest::new(Rc::clone(&document)));
            session.set_active_request(Some(Rc::clone(&request)));
            session.transact(&wall, "height", ChangeType::Modification, &TransactOptions::new());
            set_height(&wall, h);
            session.commit(request, false).unwrap();
            seen.push(h);
        }

        let undos = undos.min(heights.len());
        for _ in 0..undos {
            session.undo().unwrap().unwrap();
        }
        let expected = seen[seen.len() - 1 - undos];
        prop_assert_eq!(wall.borrow().field("height"), Some(FieldValue::Number(expected)));

        while session.redo().is_some() {}
        let last = seen[seen.len() - 1];
        prop_assert_eq!(wall.borrow().field("height"), Some(FieldValue::Number(last)));
    }
}
