#![forbid(unsafe_code)]

//! Undo/redo engine of one editing session.
//!
//! A [`Session`] owns two request stacks and the request currently being
//! filled by `transact` calls.
//!
//! # Invariants
//!
//! 1. `undo_stack.len() <= max_undo_step` after every commit.
//! 2. `max_undo_step == 0` keeps the undo stack empty.
//! 3. The redo stack is cleared by every commit.
//! 4. A failed commit, undo or redo leaves both stacks as they were.
//! 5. Merging only ever looks at the most recent undo entry.
//!
//! ```text
//! commit(C)
//! ┌───────────────────────────────────────────────┐
//! │ Undo Stack: [A, B, C]                         │
//! │ Redo Stack: []                                │
//! └───────────────────────────────────────────────┘
//!
//! undo()
//! ┌───────────────────────────────────────────────┐
//! │ Undo Stack: [A, B]                            │
//! │ Redo Stack: [C]                               │
//! └───────────────────────────────────────────────┘
//!
//! commit(D, merge)  <-- B and D compose, redo cleared
//! ┌───────────────────────────────────────────────┐
//! │ Undo Stack: [A, B+D]                          │
//! │ Redo Stack: []                                │
//! └───────────────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use planstate_core::EntityRef;

use super::batch::{BATCH_REQUEST_TYPE, BatchRequest};
use super::factory::{RequestArgs, RequestFactory};
use super::request::{
    ChangeType, RequestError, RequestOutput, RequestRef, RequestResult, TransactOptions,
    request_ref,
};

/// Predicate selecting the requests a session exports.
pub type RequestFilter = Rc<dyn Fn(&RequestRef) -> bool>;

/// Per-session overrides.
#[derive(Clone, Default)]
pub struct SessionConfig {
    /// History bound; the factory's bound when `None`.
    pub max_undo_step: Option<usize>,
    /// Filter applied by [`Session::to_requests`].
    pub to_request_filter: Option<RequestFilter>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("max_undo_step", &self.max_undo_step)
            .field("has_filter", &self.to_request_filter.is_some())
            .finish()
    }
}

impl SessionConfig {
    /// Override the history bound.
    #[must_use]
    pub fn with_max_undo_step(mut self, max_undo_step: usize) -> Self {
        self.max_undo_step = Some(max_undo_step);
        self
    }

    /// Filter exported requests.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&RequestRef) -> bool + 'static) -> Self {
        self.to_request_filter = Some(Rc::new(filter));
        self
    }
}

/// Undo/redo history plus the request being built.
pub struct Session {
    /// Committed requests (newest at back).
    undo_stack: VecDeque<RequestRef>,
    /// Undone requests (newest at back).
    redo_stack: VecDeque<RequestRef>,
    active_request: Option<RequestRef>,
    config: SessionConfig,
    factory: Rc<dyn RequestFactory>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("undo_depth", &self.undo_stack.len())
            .field("redo_depth", &self.redo_stack.len())
            .field("has_active", &self.active_request.is_some())
            .field("max_undo_step", &self.max_undo_step())
            .finish()
    }
}

impl Session {
    /// Session using the factory's defaults.
    #[must_use]
    pub fn new(factory: Rc<dyn RequestFactory>) -> Self {
        Self::with_config(factory, SessionConfig::default())
    }

    /// Session with overrides.
    #[must_use]
    pub fn with_config(factory: Rc<dyn RequestFactory>, config: SessionConfig) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            active_request: None,
            config,
            factory,
        }
    }

    /// Effective history bound.
    #[must_use]
    pub fn max_undo_step(&self) -> usize {
        self.config
            .max_undo_step
            .unwrap_or_else(|| self.factory.max_undo_step())
    }

    /// Session overrides.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ========================================================================
    // Active request
    // ========================================================================

    /// Request currently receiving `transact` calls.
    #[must_use]
    pub fn active_request(&self) -> Option<RequestRef> {
        self.active_request.clone()
    }

    /// Replace the active request.
    pub fn set_active_request(&mut self, request: Option<RequestRef>) {
        self.active_request = request;
    }

    /// Forward a mutation notice to the innermost active request.
    ///
    /// Dropped silently when nothing accepts it.
    pub fn transact(
        &self,
        entity: &EntityRef,
        field: &str,
        change: ChangeType,
        options: &TransactOptions,
    ) {
        let Some(mut target) = self.active_request.clone() else {
            return;
        };
        loop {
            let nested = target.borrow().active_request();
            match nested {
                Some(nested) if !Rc::ptr_eq(&nested, &target) => target = nested,
                _ => break,
            }
        }
        if !target.borrow().can_transact() {
            tracing::trace!(
                request = %target.borrow().request_type(),
                "transact ignored by closed request"
            );
            return;
        }
        target.borrow_mut().transact(entity, field, change, options);
    }

    // ========================================================================
    // Core Operations
    // ========================================================================

    /// Commit `request` (unless already committed) and record it.
    ///
    /// With `merge`, the request is composed with the most recent undo
    /// entry. A failing commit leaves the session untouched.
    pub fn commit(&mut self, request: RequestRef, merge: bool) -> RequestResult {
        let _span = tracing::debug_span!(
            "session.commit",
            request = %request.borrow().request_type(),
            merge
        )
        .entered();
        let already = request.borrow().is_committed();
        let output = if already {
            RequestOutput::Null
        } else {
            request.borrow_mut().commit()?
        };
        self.post_commit(request, merge);
        Ok(output)
    }

    /// Async form of [`commit`](Self::commit); the request's own async
    /// commit is the only suspension point.
    ///
    /// The request stays mutably borrowed until its async commit settles.
    /// Code running while the future is suspended must not borrow the
    /// request; a request that is already borrowed when this is called is
    /// rejected with [`RequestError::Busy`] and the session is left as is.
    #[allow(clippy::await_holding_refcell_ref)]
    pub async fn commit_async(&mut self, request: RequestRef, merge: bool) -> RequestResult {
        let already = match request.try_borrow() {
            Ok(pending) => pending.is_committed(),
            Err(_) => return Err(RequestError::Busy),
        };
        let output = if already {
            RequestOutput::Null
        } else {
            let Ok(mut pending) = request.try_borrow_mut() else {
                return Err(RequestError::Busy);
            };
            pending.commit_async().await?
        };
        tracing::debug!(
            request = %request.borrow().request_type(),
            merge,
            "async commit settled"
        );
        self.post_commit(request, merge);
        Ok(output)
    }

    /// Record a committed request on the undo stack.
    pub fn post_commit(&mut self, request: RequestRef, merge: bool) {
        self.redo_stack.clear();
        self.active_request = None;

        let max = self.max_undo_step();
        if max == 0 {
            tracing::debug!("history disabled, request not recorded");
            return;
        }

        let previous = if merge { self.undo_stack.pop_back() } else { None };
        let entry = match previous {
            Some(previous) => self
                .compose_requests(vec![previous, Rc::clone(&request)])
                .unwrap_or(request),
            None => request,
        };

        while self.undo_stack.len() >= max {
            if let Some(evicted) = self.undo_stack.pop_front() {
                tracing::debug!(
                    request = %evicted.borrow().request_type(),
                    "evicted oldest undo entry"
                );
            }
        }
        self.undo_stack.push_back(entry);
        tracing::debug!(undo_depth = self.undo_stack.len(), "recorded request");
    }

    /// Undo the most recent request.
    ///
    /// # Returns
    ///
    /// - `Ok(description)` if undo succeeded
    /// - `Err(error)` if undo failed (request remains on the undo stack)
    /// - `None` if there is nothing to undo
    pub fn undo(&mut self) -> Option<RequestResult<String>> {
        let request = self.undo_stack.pop_back()?;
        let _span = tracing::debug_span!("session.undo", request = %request.borrow().request_type())
            .entered();
        let description = label(&request);

        let previous = self.active_request.replace(Rc::clone(&request));
        let result = request.borrow_mut().undo();
        self.active_request = previous;

        match result {
            Ok(()) => {
                self.redo_stack.push_back(request);
                Some(Ok(description))
            }
            Err(e) => {
                tracing::warn!(error = %e, "undo failed");
                self.undo_stack.push_back(request);
                Some(Err(e))
            }
        }
    }

    /// Redo the most recently undone request.
    ///
    /// Mirrors [`undo`](Self::undo).
    pub fn redo(&mut self) -> Option<RequestResult<String>> {
        let request = self.redo_stack.pop_back()?;
        let _span = tracing::debug_span!("session.redo", request = %request.borrow().request_type())
            .entered();
        let description = label(&request);

        let previous = self.active_request.replace(Rc::clone(&request));
        let result = request.borrow_mut().redo();
        self.active_request = previous;

        match result {
            Ok(()) => {
                self.undo_stack.push_back(request);
                Some(Ok(description))
            }
            Err(e) => {
                tracing::warn!(error = %e, "redo failed");
                self.redo_stack.push_back(request);
                Some(Err(e))
            }
        }
    }

    /// Discard an open request; clears it as the active request.
    pub fn abort(&mut self, request: &RequestRef) -> RequestResult<()> {
        if self
            .active_request
            .as_ref()
            .is_some_and(|active| Rc::ptr_eq(active, request))
        {
            self.active_request = None;
        }
        request.borrow_mut().abort()
    }

    // ========================================================================
    // Info
    // ========================================================================

    /// Check if undo is available.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    /// Check if redo is available.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Request the next `undo` would revert.
    #[must_use]
    pub fn peek_next_undo_request(&self) -> Option<RequestRef> {
        self.undo_stack.back().cloned()
    }

    /// Request the next `redo` would reapply.
    #[must_use]
    pub fn peek_next_redo_request(&self) -> Option<RequestRef> {
        self.redo_stack.back().cloned()
    }

    /// Number of undo entries.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of redo entries.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Undo entries, oldest first, optionally followed by the active request.
    #[must_use]
    pub fn undo_stack(&self, include_active: bool) -> Vec<RequestRef> {
        self.with_active(&self.undo_stack, include_active)
    }

    /// Redo entries, oldest first, optionally followed by the active request.
    #[must_use]
    pub fn redo_stack(&self, include_active: bool) -> Vec<RequestRef> {
        self.with_active(&self.redo_stack, include_active)
    }

    /// Descriptions of the undo entries, most recent first.
    #[must_use]
    pub fn undo_descriptions(&self, limit: usize) -> Vec<String> {
        self.undo_stack.iter().rev().take(limit).map(label).collect()
    }

    fn with_active(&self, stack: &VecDeque<RequestRef>, include_active: bool) -> Vec<RequestRef> {
        let mut out: Vec<RequestRef> = stack.iter().cloned().collect();
        if include_active {
            out.extend(self.active_request.iter().cloned());
        }
        out
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Undo entries passing the session filter.
    ///
    /// Batches are filtered in place; a batch left empty is dropped.
    #[must_use]
    pub fn to_requests(&self) -> Vec<RequestRef> {
        let Some(filter) = self.config.to_request_filter.clone() else {
            return self.undo_stack.iter().cloned().collect();
        };
        self.undo_stack
            .iter()
            .filter(|request| {
                let is_batch = request.borrow().as_batch().is_some();
                if !is_batch {
                    return filter(request);
                }
                let mut guard = request.borrow_mut();
                match guard.as_batch_mut() {
                    Some(batch) => {
                        batch.filter_requests(|child| filter(child));
                        !batch.is_empty()
                    }
                    None => false,
                }
            })
            .cloned()
            .collect()
    }

    /// The exported history as a single request.
    #[must_use]
    pub fn to_request(&self) -> Option<RequestRef> {
        let mut requests = self.to_requests();
        match requests.len() {
            0 => None,
            1 => requests.pop(),
            _ => self.compose_requests(requests),
        }
    }

    /// Left fold with [`Request::compose`](super::request::Request::compose).
    ///
    /// Adjacent requests that refuse to compose are wrapped in a batch,
    /// which becomes the new accumulator.
    #[must_use]
    pub fn compose_requests(&self, requests: Vec<RequestRef>) -> Option<RequestRef> {
        let mut iter = requests.into_iter();
        let mut acc = iter.next()?;
        for next in iter {
            if Rc::ptr_eq(&acc, &next) {
                continue;
            }
            let merged = acc.borrow_mut().compose(&next);
            if merged {
                continue;
            }
            let pair = vec![Rc::clone(&acc), Rc::clone(&next)];
            acc = match self
                .factory
                .create_request(BATCH_REQUEST_TYPE, RequestArgs::Requests(pair.clone()))
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "batch type unavailable, using a plain batch");
                    request_ref(BatchRequest::new(pair))
                }
            };
        }
        Some(acc)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Clear both stacks and the active request; entities are left as is.
    pub fn reset(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.active_request = None;
    }
}

fn label(request: &RequestRef) -> String {
    let request = request.borrow();
    if request.description().is_empty() {
        request.request_type().to_owned()
    } else {
        request.description().to_owned()
    }
}
