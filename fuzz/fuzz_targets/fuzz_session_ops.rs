#![no_main]

use std::cell::Cell;
use std::rc::Rc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use planstate_runtime::undo::{
    CallbackRequest, RequestArgs, SessionOptions, TransactionManager, request_ref,
};

#[derive(Debug, Arbitrary)]
enum Op {
    Commit(i8),
    Merge(i8),
    Undo,
    Redo,
    StartSession { undo_redo: bool },
    CommitSession { merge: bool },
    AbortSession,
    EndSession,
    Block(bool),
    Toggle(bool),
}

fuzz_target!(|ops: Vec<Op>| {
    let counter = Rc::new(Cell::new(0i64));
    let mut manager = TransactionManager::new();
    let shared = Rc::clone(&counter);
    manager.register("Add", move |args| {
        let delta = match args {
            RequestArgs::Value(v) => v.as_i64().unwrap_or(0),
            _ => 0,
        };
        let up = Rc::clone(&shared);
        let down = Rc::clone(&shared);
        Ok(request_ref(CallbackRequest::new(
            "Add",
            move || {
                up.set(up.get() + delta);
                Ok(())
            },
            move || {
                down.set(down.get() - delta);
                Ok(())
            },
        )))
    });

    for op in ops.into_iter().take(256) {
        match op {
            Op::Commit(d) | Op::Merge(d) => {
                let merge = matches!(op, Op::Merge(_));
                let Ok(request) =
                    manager.create_request("Add", RequestArgs::Value(i64::from(d).into()))
                else {
                    return;
                };
                assert!(manager.commit(request, merge).is_ok());
            }
            Op::Undo => {
                let expected = manager.can_undo();
                assert_eq!(manager.undo().is_some(), expected);
            }
            Op::Redo => {
                let expected = manager.can_redo();
                assert_eq!(manager.redo().is_some(), expected);
            }
            Op::StartSession { undo_redo } => {
                manager.start_session(SessionOptions {
                    undo_redo,
                    ..SessionOptions::default()
                });
            }
            Op::CommitSession { merge } => {
                let id = manager.active_session_id();
                manager.commit_session(id, merge);
            }
            Op::AbortSession => {
                let id = manager.active_session_id();
                manager.abort_session(id);
            }
            Op::EndSession => {
                let id = manager.active_session_id();
                manager.end_session(id);
            }
            Op::Block(true) => manager.block_undo_redo(),
            Op::Block(false) => manager.unblock_undo_redo(),
            Op::Toggle(true) => manager.enable(),
            Op::Toggle(false) => manager.disable(),
        }
        for stack in manager.request_stack(false) {
            assert!(stack.undo.len() <= 25);
        }
    }
});
