#![forbid(unsafe_code)]

//! Requests that commit, undo and redo together.
//!
//! A [`BatchRequest`] is what the session falls back to when two adjacent
//! requests refuse to compose. It is also the natural container for a
//! compound user action built from several child requests.
//!
//! Children run in order on commit/redo and in reverse order on undo. When
//! a child fails, the children already processed in the same call are
//! rolled back so the batch stays all-or-nothing.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use planstate_core::EntityRef;
use serde_json::Value;

use super::request::{
    ChangeType, Request, RequestMeta, RequestRef, RequestResult, RequestState, TransactOptions,
};

/// Registered type name of batch requests.
pub const BATCH_REQUEST_TYPE: &str = "Batch";

/// Ordered group of requests acting as one undo unit.
pub struct BatchRequest {
    meta: RequestMeta,
    children: Vec<RequestRef>,
    active: Option<RequestRef>,
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("meta", &self.meta)
            .field("children", &self.children.len())
            .field("has_active", &self.active.is_some())
            .finish()
    }
}

impl BatchRequest {
    /// Batch over `children`.
    ///
    /// A batch built only from committed requests starts out committed, so
    /// it can be pushed onto an undo stack directly.
    #[must_use]
    pub fn new(children: Vec<RequestRef>) -> Self {
        let mut meta = RequestMeta::new(BATCH_REQUEST_TYPE);
        let all_committed = !children.is_empty()
            && children
                .iter()
                .all(|c| c.borrow().state() == RequestState::Committed);
        if all_committed {
            meta.state = RequestState::Committed;
        }
        Self {
            meta,
            children,
            active: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    /// Append a child; it becomes the target of `transact`.
    pub fn push(&mut self, child: RequestRef) {
        self.active = Some(Rc::clone(&child));
        self.children.push(child);
    }

    /// Children in execution order.
    #[must_use]
    pub fn sub_requests(&self) -> &[RequestRef] {
        &self.children
    }

    /// Keep only the children matching `predicate`.
    pub fn filter_requests(&mut self, mut predicate: impl FnMut(&RequestRef) -> bool) {
        self.children.retain(|c| predicate(c));
        let active_kept = self
            .active
            .as_ref()
            .is_some_and(|active| self.children.iter().any(|c| Rc::ptr_eq(c, active)));
        if !active_kept {
            self.active = None;
        }
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the batch has no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn undo_range(children: &[RequestRef]) {
        for child in children.iter().rev() {
            let mut child = child.borrow_mut();
            if let Err(err) = child.undo() {
                tracing::warn!(
                    child = %child.request_type(),
                    error = %err,
                    "undo during batch rollback failed"
                );
            }
        }
    }

    fn redo_range(children: &[RequestRef]) {
        for child in children {
            let mut child = child.borrow_mut();
            if let Err(err) = child.redo() {
                tracing::warn!(
                    child = %child.request_type(),
                    error = %err,
                    "redo during batch rollback failed"
                );
            }
        }
    }
}

#[async_trait(?Send)]
impl Request for BatchRequest {
    fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RequestMeta {
        &mut self.meta
    }

    fn transact(
        &mut self,
        entity: &EntityRef,
        field: &str,
        change: ChangeType,
        options: &TransactOptions,
    ) {
        if let Some(active) = &self.active {
            let mut active = active.borrow_mut();
            if active.can_transact() {
                active.transact(entity, field, change, options);
            }
        }
    }

    fn commit(&mut self) -> RequestResult {
        self.meta.expect_state(RequestState::Open, "commit")?;
        let mut outputs = Vec::with_capacity(self.children.len());
        let mut committed_now: Vec<RequestRef> = Vec::new();
        for child in &self.children {
            if child.borrow().is_committed() {
                outputs.push(Value::Null);
                continue;
            }
            match child.borrow_mut().commit() {
                Ok(output) => {
                    outputs.push(output);
                    committed_now.push(Rc::clone(child));
                }
                Err(e) => {
                    Self::undo_range(&committed_now);
                    return Err(e);
                }
            }
        }
        self.active = None;
        self.meta.transition(RequestState::Committed, "commit")?;
        Ok(Value::Array(outputs))
    }

    fn undo(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Committed, "undo")?;
        for (i, child) in self.children.iter().enumerate().rev() {
            if let Err(e) = child.borrow_mut().undo() {
                Self::redo_range(&self.children[i + 1..]);
                return Err(e);
            }
        }
        self.meta.transition(RequestState::Undone, "undo")
    }

    fn redo(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Undone, "redo")?;
        for (i, child) in self.children.iter().enumerate() {
            if let Err(e) = child.borrow_mut().redo() {
                Self::undo_range(&self.children[..i]);
                return Err(e);
            }
        }
        self.meta.transition(RequestState::Committed, "redo")
    }

    fn abort(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Open, "abort")?;
        for child in &self.children {
            let mut child = child.borrow_mut();
            if child.state() == RequestState::Open {
                if let Err(err) = child.abort() {
                    tracing::warn!(
                        child = %child.request_type(),
                        error = %err,
                        "child abort failed"
                    );
                }
            }
        }
        self.active = None;
        self.meta.transition(RequestState::Aborted, "abort")
    }

    /// Merges `other` into the last child when that child accepts it.
    fn compose(&mut self, other: &RequestRef) -> bool {
        let Some(last) = self.children.last() else {
            return false;
        };
        if Rc::ptr_eq(last, other) {
            return false;
        }
        last.borrow_mut().compose(other)
    }

    fn active_request(&self) -> Option<RequestRef> {
        self.active.clone()
    }

    fn as_batch(&self) -> Option<&BatchRequest> {
        Some(self)
    }

    fn as_batch_mut(&mut self) -> Option<&mut BatchRequest> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use tracing_test::traced_test;

    use super::*;
    use crate::undo::request::{CallbackRequest, RequestError, request_ref};

    fn logging_request(log: &Rc<RefCell<Vec<String>>>, name: &str) -> RequestRef {
        let fwd_log = Rc::clone(log);
        let back_log = Rc::clone(log);
        let fwd = format!("+{name}");
        let back = format!("-{name}");
        request_ref(CallbackRequest::new(
            name,
            move || {
                fwd_log.borrow_mut().push(fwd.clone());
                Ok(())
            },
            move || {
                back_log.borrow_mut().push(back.clone());
                Ok(())
            },
        ))
    }

    fn failing_request() -> RequestRef {
        request_ref(CallbackRequest::new(
            "Fail",
            || Err(RequestError::Failed("nope".into())),
            || Ok(()),
        ))
    }

    #[test]
    fn commit_undo_redo_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut batch = BatchRequest::new(vec![
            logging_request(&log, "a"),
            logging_request(&log, "b"),
        ]);
        assert_eq!(batch.state(), RequestState::Open);
        batch.commit().unwrap();
        batch.undo().unwrap();
        batch.redo().unwrap();
        assert_eq!(*log.borrow(), ["+a", "+b", "-b", "-a", "+a", "+b"]);
    }

    #[test]
    fn commit_failure_rolls_back() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut batch = BatchRequest::new(vec![logging_request(&log, "a"), failing_request()]);
        assert!(batch.commit().is_err());
        assert_eq!(*log.borrow(), ["+a", "-a"]);
        assert_eq!(batch.state(), RequestState::Open);
    }

    #[traced_test]
    #[test]
    fn failed_rollback_is_logged() {
        let stuck = request_ref(CallbackRequest::new(
            "Stuck",
            || Ok(()),
            || Err(RequestError::Failed("cannot revert".into())),
        ));
        let mut batch = BatchRequest::new(vec![Rc::clone(&stuck), failing_request()]);
        assert!(batch.commit().is_err());
        assert_eq!(batch.state(), RequestState::Open);
        assert!(logs_contain("undo during batch rollback failed"));
        assert!(logs_contain("child=Stuck"));
    }

    #[test]
    fn built_from_committed_children_starts_committed() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = logging_request(&log, "a");
        let b = logging_request(&log, "b");
        a.borrow_mut().commit().unwrap();
        b.borrow_mut().commit().unwrap();
        let batch = BatchRequest::new(vec![a, b]);
        assert_eq!(batch.state(), RequestState::Committed);
        assert!(BatchRequest::new(Vec::new()).state() == RequestState::Open);
    }

    #[test]
    fn skips_children_already_committed() {
        let hits = Rc::new(Cell::new(0));
        let counted = Rc::clone(&hits);
        let child = request_ref(CallbackRequest::new(
            "Once",
            move || {
                counted.set(counted.get() + 1);
                Ok(())
            },
            || Ok(()),
        ));
        child.borrow_mut().commit().unwrap();
        let mut batch = BatchRequest::new(Vec::new());
        batch.push(Rc::clone(&child));
        batch.commit().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn filter_removes_children_in_place() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut batch = BatchRequest::new(Vec::new());
        batch.push(logging_request(&log, "keep"));
        batch.push(logging_request(&log, "drop"));
        batch.filter_requests(|r| r.borrow().request_type() == "keep");
        assert_eq!(batch.len(), 1);
        assert!(batch.active_request().is_none());
        assert_eq!(batch.sub_requests()[0].borrow().request_type(), "keep");
    }

    #[test]
    fn push_sets_active_child() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let child = logging_request(&log, "x");
        let mut batch = BatchRequest::new(Vec::new());
        batch.push(Rc::clone(&child));
        let active = batch.active_request().unwrap();
        assert!(Rc::ptr_eq(&active, &child));
    }

    #[test]
    fn compose_delegates_to_last_child() {
        let counter = Rc::new(Cell::new(0));
        let make = |delta: i32| {
            let up = Rc::clone(&counter);
            let down = Rc::clone(&counter);
            let req = request_ref(
                CallbackRequest::new(
                    "Nudge",
                    move || {
                        up.set(up.get() + delta);
                        Ok(())
                    },
                    move || {
                        down.set(down.get() - delta);
                        Ok(())
                    },
                )
                .with_merge_key("wall-1"),
            );
            req.borrow_mut().commit().unwrap();
            req
        };
        let first = make(1);
        let mut batch = BatchRequest::new(vec![first]);
        let second = make(10);
        assert!(batch.compose(&second));
        assert_eq!(batch.len(), 1);
        batch.undo().unwrap();
        assert_eq!(counter.get(), 0);
    }
}
