#![forbid(unsafe_code)]

//! Async commits through sessions and the manager.
//!
//! A failed async commit must leave the session exactly as it was: no undo
//! entry, the same redo stack, the same active request.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use async_trait::async_trait;
use futures::executor::block_on;
use futures::future;
use planstate_runtime::undo::{
    CallbackRequest, Request, RequestError, RequestFactory, RequestMeta, RequestRegistry,
    RequestResult, RequestState, Session, TransactionManager, request_ref,
};
use serde_json::Value;

/// Request that saves remotely before it counts as committed.
struct UploadRequest {
    meta: RequestMeta,
    accept: bool,
    uploads: Rc<Cell<usize>>,
}

impl UploadRequest {
    fn new(accept: bool, uploads: &Rc<Cell<usize>>) -> Self {
        Self {
            meta: RequestMeta::new("Upload"),
            accept,
            uploads: Rc::clone(uploads),
        }
    }
}

#[async_trait(?Send)]
impl Request for UploadRequest {
    fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RequestMeta {
        &mut self.meta
    }

    fn commit(&mut self) -> RequestResult {
        Err(RequestError::Failed("upload needs commit_async".into()))
    }

    async fn commit_async(&mut self) -> RequestResult {
        self.meta.expect_state(RequestState::Open, "commit")?;
        future::ready(()).await;
        if !self.accept {
            return Err(RequestError::Failed("server rejected upload".into()));
        }
        self.uploads.set(self.uploads.get() + 1);
        self.meta.transition(RequestState::Committed, "commit")?;
        Ok(Value::from("uploaded"))
    }

    fn undo(&mut self) -> RequestResult<()> {
        self.meta.transition(RequestState::Undone, "undo")
    }

    fn redo(&mut self) -> RequestResult<()> {
        self.meta.transition(RequestState::Committed, "redo")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn session() -> Session {
    Session::new(Rc::new(RequestRegistry::default()) as Rc<dyn RequestFactory>)
}

#[test]
fn successful_async_commit_is_recorded() {
    let uploads = Rc::new(Cell::new(0));
    let mut s = session();
    let request = request_ref(UploadRequest::new(true, &uploads));
    s.set_active_request(Some(Rc::clone(&request)));

    let output = block_on(s.commit_async(Rc::clone(&request), false)).unwrap();
    assert_eq!(output, Value::from("uploaded"));
    assert_eq!(uploads.get(), 1);
    assert_eq!(s.undo_depth(), 1);
    assert!(s.active_request().is_none());
}

#[test]
fn failed_async_commit_leaves_session_untouched() {
    let uploads = Rc::new(Cell::new(0));
    let mut s = session();
    let kept = request_ref(CallbackRequest::new("Edit", || Ok(()), || Ok(())));
    s.commit(Rc::clone(&kept), false).unwrap();
    s.undo().unwrap().unwrap();

    let request = request_ref(UploadRequest::new(false, &uploads));
    s.set_active_request(Some(Rc::clone(&request)));
    let err = block_on(s.commit_async(Rc::clone(&request), false)).unwrap_err();

    assert_eq!(err, RequestError::Failed("server rejected upload".into()));
    assert_eq!(s.undo_depth(), 0);
    assert_eq!(s.redo_depth(), 1);
    assert!(Rc::ptr_eq(&s.active_request().unwrap(), &request));
    assert_eq!(request.borrow().state(), RequestState::Open);
}

#[test]
fn borrowed_request_is_rejected() {
    let uploads = Rc::new(Cell::new(0));
    let mut s = session();
    let request = request_ref(UploadRequest::new(true, &uploads));
    s.set_active_request(Some(Rc::clone(&request)));

    let held = request.borrow_mut();
    let err = block_on(s.commit_async(Rc::clone(&request), false)).unwrap_err();
    drop(held);

    assert_eq!(err, RequestError::Busy);
    assert_eq!(uploads.get(), 0);
    assert_eq!(s.undo_depth(), 0);
    assert!(Rc::ptr_eq(&s.active_request().unwrap(), &request));
    assert_eq!(request.borrow().state(), RequestState::Open);
}

#[test]
fn sync_requests_commit_through_async_path() {
    let applied = Rc::new(Cell::new(0));
    let counted = Rc::clone(&applied);
    let mut s = session();
    let request = request_ref(CallbackRequest::new(
        "Edit",
        move || {
            counted.set(counted.get() + 1);
            Ok(())
        },
        || Ok(()),
    ));
    block_on(s.commit_async(request, false)).unwrap();
    assert_eq!(applied.get(), 1);
    assert!(s.can_undo());
}

#[test]
fn manager_commit_async_records_in_active_session() {
    let uploads = Rc::new(Cell::new(0));
    let mut m = TransactionManager::new();
    let accepted = Rc::clone(&uploads);
    m.register("Upload", move |_| {
        Ok(request_ref(UploadRequest::new(true, &accepted)))
    });

    let request = m
        .create_request("Upload", Default::default())
        .unwrap();
    block_on(m.commit_async(request, false)).unwrap();
    assert_eq!(uploads.get(), 1);
    assert!(m.can_undo());
    m.undo().unwrap().unwrap();
    assert!(m.can_redo());
}
