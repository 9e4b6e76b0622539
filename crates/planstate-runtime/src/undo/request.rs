#![forbid(unsafe_code)]

//! Request contract for undoable document mutations.
//!
//! A request is one undo unit. It is opened by the transaction manager,
//! receives `transact` notifications while the caller mutates entities,
//! is committed once, and afterwards moves between the undo and redo
//! stacks of a [`Session`](super::session::Session).
//!
//! # Lifecycle
//!
//! ```text
//!            commit()            undo()
//!   Open ──────────────► Committed ◄─────► Undone
//!     │                               redo()
//!     │ abort()
//!     ▼
//!   Aborted
//! ```
//!
//! # Invariants
//!
//! 1. `transact` is only forwarded while the request is `Open`.
//! 2. A request that is already committed is never committed again.
//! 3. `undo` requires `Committed`, `redo` requires `Undone`; a failing undo
//!    or redo leaves the state unchanged.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use async_trait::async_trait;
use planstate_core::EntityRef;
use serde_json::Value;

use super::batch::BatchRequest;

/// Shared handle to a request.
pub type RequestRef = Rc<RefCell<dyn Request>>;

/// Value produced by a successful commit.
pub type RequestOutput = Value;

/// Result of request operations.
pub type RequestResult<T = RequestOutput> = Result<T, RequestError>;

/// Free-form options attached to a `transact` call.
pub type TransactOptions = serde_json::Map<String, Value>;

/// Wrap a request into a shared handle.
pub fn request_ref<R: Request>(request: R) -> RequestRef {
    Rc::new(RefCell::new(request))
}

// ============================================================================
// Change and lifecycle tags
// ============================================================================

/// Kind of mutation announced through `transact`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// Fields of an existing entity change.
    #[default]
    Modification,
    /// The entity was just created and added to the document.
    Creation,
    /// The entity is about to leave the document.
    Deletion,
    /// The entity is moved to a recycle area and needs no capture.
    Recycling,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Modification => "modification",
            Self::Creation => "creation",
            Self::Deletion => "deletion",
            Self::Recycling => "recycling",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Accepting `transact` calls.
    #[default]
    Open,
    /// Applied and on an undo stack.
    Committed,
    /// Reverted and on a redo stack.
    Undone,
    /// Discarded before commit.
    Aborted,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Undone => "undone",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Bookkeeping shared by every request implementation.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Registered request type (e.g. `"State"`, `"Batch"`).
    pub request_type: String,
    /// Human-readable description for UI.
    pub description: String,
    /// Current lifecycle state.
    pub state: RequestState,
    /// When the request was created.
    pub timestamp: Instant,
}

impl RequestMeta {
    /// Open request of the given type.
    #[must_use]
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            description: String::new(),
            state: RequestState::Open,
            timestamp: Instant::now(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: RequestState, action: &'static str) -> RequestResult<()> {
        use RequestState::{Aborted, Committed, Open, Undone};
        let allowed = matches!(
            (self.state, to),
            (Open, Committed) | (Open, Aborted) | (Committed, Undone) | (Undone, Committed)
        );
        if !allowed {
            return Err(self.invalid(action));
        }
        self.state = to;
        Ok(())
    }

    /// Error describing `action` as illegal in the current state.
    #[must_use]
    pub fn invalid(&self, action: &'static str) -> RequestError {
        RequestError::InvalidState {
            request: self.request_type.clone(),
            state: self.state,
            action,
        }
    }

    /// Fail unless the request is in `expected`.
    pub fn expect_state(&self, expected: RequestState, action: &'static str) -> RequestResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by request operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The operation is not legal in the request's current state.
    InvalidState {
        /// Request type.
        request: String,
        /// State the request was in.
        state: RequestState,
        /// Operation that was attempted.
        action: &'static str,
    },
    /// The request was aborted while the operation ran.
    Aborted(String),
    /// Applying or reverting the mutation failed.
    Failed(String),
    /// Restoring entity state from a capture failed.
    Restore(String),
    /// No constructor is registered for the request type.
    UnknownType(String),
    /// The request is borrowed elsewhere and cannot be committed now.
    Busy,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState {
                request,
                state,
                action,
            } => write!(f, "cannot {action} request '{request}' while {state}"),
            Self::Aborted(request) => write!(f, "request '{request}' was aborted"),
            Self::Failed(msg) => write!(f, "request failed: {msg}"),
            Self::Restore(msg) => write!(f, "restore failed: {msg}"),
            Self::UnknownType(t) => write!(f, "unknown request type '{t}'"),
            Self::Busy => write!(f, "request is borrowed elsewhere"),
        }
    }
}

impl std::error::Error for RequestError {}

// ============================================================================
// Request trait
// ============================================================================

/// One undo unit.
///
/// Implementations own their [`RequestMeta`] and decide how mutations are
/// captured, applied and reverted. Requests are single-threaded; the one
/// suspension point is [`commit_async`](Request::commit_async).
#[async_trait(?Send)]
pub trait Request: Any {
    /// Shared bookkeeping.
    fn meta(&self) -> &RequestMeta;

    /// Mutable bookkeeping.
    fn meta_mut(&mut self) -> &mut RequestMeta;

    /// Registered request type.
    fn request_type(&self) -> &str {
        &self.meta().request_type
    }

    /// Human-readable description.
    fn description(&self) -> &str {
        &self.meta().description
    }

    /// Current lifecycle state.
    fn state(&self) -> RequestState {
        self.meta().state
    }

    /// Whether the request has been committed (it may be undone since).
    fn is_committed(&self) -> bool {
        matches!(self.state(), RequestState::Committed | RequestState::Undone)
    }

    /// Called once right after the manager created the request.
    fn activate(&mut self) {}

    /// Whether nested mutations are accepted right now.
    fn can_transact(&self) -> bool {
        self.state() == RequestState::Open
    }

    /// Announce that `entity` is about to change.
    ///
    /// `field` names the field about to change; an empty name means the
    /// whole entity.
    fn transact(
        &mut self,
        _entity: &EntityRef,
        _field: &str,
        _change: ChangeType,
        _options: &TransactOptions,
    ) {
    }

    /// Finalize the request.
    fn commit(&mut self) -> RequestResult;

    /// Finalize the request, possibly suspending.
    async fn commit_async(&mut self) -> RequestResult {
        self.commit()
    }

    /// Reverse the committed mutation.
    fn undo(&mut self) -> RequestResult<()>;

    /// Reapply the mutation after an undo.
    fn redo(&mut self) -> RequestResult<()>;

    /// Discard an open request.
    fn abort(&mut self) -> RequestResult<()> {
        self.meta_mut().transition(RequestState::Aborted, "abort")
    }

    /// Merge `other` into `self` as one undo unit.
    ///
    /// Returns `false` when the two cannot be merged; `other` is untouched
    /// in that case.
    fn compose(&mut self, _other: &RequestRef) -> bool {
        false
    }

    /// Nested request currently receiving `transact` calls.
    fn active_request(&self) -> Option<RequestRef> {
        None
    }

    /// Downcast to a batch.
    fn as_batch(&self) -> Option<&BatchRequest> {
        None
    }

    /// Mutable downcast to a batch.
    fn as_batch_mut(&mut self) -> Option<&mut BatchRequest> {
        None
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("type", &self.request_type())
            .field("description", &self.description())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// CallbackRequest
// ============================================================================

/// Closure applying or reverting part of a mutation.
pub type RequestAction = Rc<dyn Fn() -> RequestResult<()>>;

/// Request built from apply/revert closures.
///
/// `commit` and `redo` run the apply closures in order, `undo` runs the
/// revert closures in reverse. A failing closure rolls back the ones that
/// already ran. Two callback requests of the same type sharing a merge key
/// compose by concatenation.
pub struct CallbackRequest {
    meta: RequestMeta,
    apply: Vec<RequestAction>,
    revert: Vec<RequestAction>,
    merge_key: Option<String>,
}

impl fmt::Debug for CallbackRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRequest")
            .field("meta", &self.meta)
            .field("steps", &self.apply.len())
            .field("merge_key", &self.merge_key)
            .finish()
    }
}

impl CallbackRequest {
    /// Request applying `apply` on commit and `revert` on undo.
    pub fn new<A, R>(request_type: impl Into<String>, apply: A, revert: R) -> Self
    where
        A: Fn() -> RequestResult<()> + 'static,
        R: Fn() -> RequestResult<()> + 'static,
    {
        Self {
            meta: RequestMeta::new(request_type),
            apply: vec![Rc::new(apply)],
            revert: vec![Rc::new(revert)],
            merge_key: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = description.into();
        self
    }

    /// Allow composition with requests carrying the same key.
    #[must_use]
    pub fn with_merge_key(mut self, key: impl Into<String>) -> Self {
        self.merge_key = Some(key.into());
        self
    }

    /// Merge key, if any.
    #[must_use]
    pub fn merge_key(&self) -> Option<&str> {
        self.merge_key.as_deref()
    }

    /// Number of apply/revert pairs (grows through composition).
    #[must_use]
    pub fn steps(&self) -> usize {
        self.apply.len()
    }

    fn run_forward(&self) -> RequestResult<()> {
        for (i, step) in self.apply.iter().enumerate() {
            if let Err(e) = step() {
                for revert in self.revert[..i].iter().rev() {
                    if let Err(rollback) = revert() {
                        tracing::warn!(
                            request = %self.meta.request_type,
                            error = %rollback,
                            "revert during rollback failed"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn run_backward(&self) -> RequestResult<()> {
        let n = self.revert.len();
        for (k, step) in self.revert.iter().enumerate().rev() {
            if let Err(e) = step() {
                for apply in &self.apply[k + 1..n] {
                    if let Err(rollback) = apply() {
                        tracing::warn!(
                            request = %self.meta.request_type,
                            error = %rollback,
                            "re-apply during rollback failed"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Request for CallbackRequest {
    fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RequestMeta {
        &mut self.meta
    }

    fn commit(&mut self) -> RequestResult {
        self.meta.expect_state(RequestState::Open, "commit")?;
        self.run_forward()?;
        self.meta.transition(RequestState::Committed, "commit")?;
        Ok(Value::Null)
    }

    fn undo(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Committed, "undo")?;
        self.run_backward()?;
        self.meta.transition(RequestState::Undone, "undo")
    }

    fn redo(&mut self) -> RequestResult<()> {
        self.meta.expect_state(RequestState::Undone, "redo")?;
        self.run_forward()?;
        self.meta.transition(RequestState::Committed, "redo")
    }

    fn compose(&mut self, other: &RequestRef) -> bool {
        let Some(key) = self.merge_key.as_deref() else {
            return false;
        };
        let other = other.borrow();
        let Some(other) = other.as_any().downcast_ref::<CallbackRequest>() else {
            return false;
        };
        if other.meta.request_type != self.meta.request_type
            || other.merge_key.as_deref() != Some(key)
            || other.meta.state != self.meta.state
        {
            return false;
        }
        self.apply.extend(other.apply.iter().cloned());
        self.revert.extend(other.revert.iter().cloned());
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
