#![forbid(unsafe_code)]

//! Transaction manager: request creation, nested sessions, observers.
//!
//! The manager owns a default [`Session`] and a stack of nested sessions
//! started on top of it. Requests are created, committed and aborted in
//! the *active* session (the top of the stack). Undo and redo run in the
//! *undo/redo session*: the most recent session started with
//! `undo_redo = true`, or the default session.
//!
//! ```text
//!  start_session()        start_session(undo_redo = false)
//! ┌─────────┐            ┌─────────┐
//! │ default │            │ nested2 │ ◄── active
//! └─────────┘            ├─────────┤
//!     ▲                  │ nested1 │ ◄── undo/redo
//!     │                  ├─────────┤
//!     │                  │ default │
//!     │                  └─────────┘
//!  active and
//!  undo/redo
//! ```
//!
//! Undo or redo first aborts every session above the undo/redo session.
//! Committing a nested session moves its history into its parent as one
//! composed request (or request by request); aborting it undoes its
//! history; ending it keeps the document as is and drops the history.

use std::fmt;
use std::rc::Rc;

use planstate_core::EntityRef;

use super::factory::{DEFAULT_MAX_UNDO_STEP, RequestArgs, RequestFactory, RequestRegistry};
use super::request::{ChangeType, RequestRef, RequestResult, TransactOptions};
use super::session::{RequestFilter, Session, SessionConfig};
use crate::config::TransactionConfig;

/// Identifier of a session started with [`TransactionManager::start_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Options for a nested session.
#[derive(Clone)]
pub struct SessionOptions {
    /// History bound of the session; the manager's when `None`.
    pub max_undo_step: Option<usize>,
    /// Whether undo/redo target this session while it is open.
    pub undo_redo: bool,
    /// Filter applied when the session's history is exported.
    pub to_request_filter: Option<RequestFilter>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_undo_step: None,
            undo_redo: true,
            to_request_filter: None,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("max_undo_step", &self.max_undo_step)
            .field("undo_redo", &self.undo_redo)
            .field("has_filter", &self.to_request_filter.is_some())
            .finish()
    }
}

/// Notification sent to manager observers.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// A request was created and made active.
    Created(RequestRef),
    /// A request is about to be committed.
    Committing(RequestRef),
    /// A request was committed and recorded.
    Committed(RequestRef),
    /// A request is about to be aborted.
    Aborting(RequestRef),
    /// A request was aborted.
    Aborted(RequestRef),
    /// A request is about to be undone.
    Undoing(RequestRef),
    /// A request was undone.
    Undone(RequestRef),
    /// A request is about to be redone.
    Redoing(RequestRef),
    /// A request was redone.
    Redone(RequestRef),
    /// `can_undo`/`can_redo` may have changed.
    UndoRedoStateChanged,
}

impl TransactionEvent {
    /// Request the event is about, if any.
    #[must_use]
    pub fn request(&self) -> Option<&RequestRef> {
        match self {
            Self::Created(r)
            | Self::Committing(r)
            | Self::Committed(r)
            | Self::Aborting(r)
            | Self::Aborted(r)
            | Self::Undoing(r)
            | Self::Undone(r)
            | Self::Redoing(r)
            | Self::Redone(r) => Some(r),
            Self::UndoRedoStateChanged => None,
        }
    }
}

/// Observer callback.
pub type EventListener = Box<dyn Fn(&TransactionEvent)>;

/// Handle returned by [`TransactionManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Undo and redo stacks of one session.
#[derive(Debug, Clone)]
pub struct RequestStack {
    /// Undo entries, oldest first.
    pub undo: Vec<RequestRef>,
    /// Redo entries, oldest first.
    pub redo: Vec<RequestRef>,
}

struct SessionEntry {
    id: SessionId,
    session: Session,
}

/// Entry point for creating, committing and undoing requests.
pub struct TransactionManager {
    registry: Rc<RequestRegistry>,
    default: SessionEntry,
    nested: Vec<SessionEntry>,
    undo_redo_sessions: Vec<SessionId>,
    next_id: u64,
    default_max_undo_step: usize,
    enabled: bool,
    blocked: bool,
    suppressed: bool,
    listeners: Vec<(ListenerId, EventListener)>,
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("sessions", &self.session_count())
            .field("enabled", &self.enabled)
            .field("blocked", &self.blocked)
            .field("suppressed", &self.suppressed)
            .field("max_undo_step", &self.max_undo_step())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Manager with a fresh registry and the default history bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(Rc::new(RequestRegistry::new(DEFAULT_MAX_UNDO_STEP)))
    }

    /// Manager built from configuration.
    #[must_use]
    pub fn from_config(config: &TransactionConfig) -> Self {
        let mut manager =
            Self::with_registry(Rc::new(RequestRegistry::new(config.max_undo_step)));
        if !config.enabled {
            manager.disable();
        }
        manager
    }

    /// Manager creating requests through `registry`.
    #[must_use]
    pub fn with_registry(registry: Rc<RequestRegistry>) -> Self {
        let default_max_undo_step = registry.max_undo_step();
        let default = SessionEntry {
            id: SessionId(0),
            session: Session::new(Rc::clone(&registry) as Rc<dyn RequestFactory>),
        };
        Self {
            registry,
            default,
            nested: Vec::new(),
            undo_redo_sessions: Vec::new(),
            next_id: 1,
            default_max_undo_step,
            enabled: true,
            blocked: false,
            suppressed: false,
            listeners: Vec::new(),
        }
    }

    /// Request constructors.
    #[must_use]
    pub fn registry(&self) -> &Rc<RequestRegistry> {
        &self.registry
    }

    /// Register a request constructor.
    pub fn register<F>(&self, request_type: impl Into<String>, constructor: F)
    where
        F: Fn(RequestArgs) -> RequestResult<RequestRef> + 'static,
    {
        self.registry.register(request_type, constructor);
    }

    /// Default history bound.
    #[must_use]
    pub fn max_undo_step(&self) -> usize {
        self.registry.max_undo_step()
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Call `listener` for every event from now on.
    pub fn subscribe(&mut self, listener: impl Fn(&TransactionEvent) + 'static) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Stop notifying a listener.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn emit(&self, event: TransactionEvent) {
        for (_, listener) in &self.listeners {
            listener(&event);
        }
    }

    // ========================================================================
    // Flags
    // ========================================================================

    /// Whether history is recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn history back on with the configured bound.
    pub fn enable(&mut self) {
        if !self.enabled {
            self.enabled = true;
            self.registry.set_max_undo_step(self.default_max_undo_step);
        }
    }

    /// Turn history off: clears every session and sets the bound to 0.
    pub fn disable(&mut self) {
        if self.enabled {
            self.enabled = false;
            self.registry.set_max_undo_step(0);
            self.clear();
        }
    }

    /// Whether `transact` calls are dropped.
    #[must_use]
    pub fn suppressed(&self) -> bool {
        self.suppressed
    }

    /// Drop (or stop dropping) `transact` calls.
    pub fn set_suppressed(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }

    /// Refuse undo/redo until [`unblock_undo_redo`](Self::unblock_undo_redo).
    pub fn block_undo_redo(&mut self) {
        if !self.blocked {
            self.blocked = true;
            self.emit(TransactionEvent::UndoRedoStateChanged);
        }
    }

    /// Allow undo/redo again.
    pub fn unblock_undo_redo(&mut self) {
        if self.blocked {
            self.blocked = false;
            self.emit(TransactionEvent::UndoRedoStateChanged);
        }
    }

    /// Whether undo/redo are blocked.
    #[must_use]
    pub fn is_undo_redo_blocked(&self) -> bool {
        self.blocked
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Number of open sessions, the default one included.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.nested.len() + 1
    }

    /// Session receiving requests.
    #[must_use]
    pub fn active_session(&self) -> &Session {
        &self.nested.last().unwrap_or(&self.default).session
    }

    fn active_session_mut(&mut self) -> &mut Session {
        &mut self.nested.last_mut().unwrap_or(&mut self.default).session
    }

    /// Id of the active session.
    #[must_use]
    pub fn active_session_id(&self) -> SessionId {
        self.nested.last().unwrap_or(&self.default).id
    }

    /// The bottom session.
    #[must_use]
    pub fn default_session(&self) -> &Session {
        &self.default.session
    }

    fn undo_redo_session_id(&self) -> SessionId {
        self.undo_redo_sessions
            .last()
            .copied()
            .unwrap_or(self.default.id)
    }

    fn undo_redo_session(&self) -> &Session {
        let id = self.undo_redo_session_id();
        self.nested
            .iter()
            .find(|entry| entry.id == id)
            .map_or(&self.default.session, |entry| &entry.session)
    }

    /// Open a nested session on top of the active one.
    ///
    /// While history is disabled the session is not opened and the returned
    /// id matches no session.
    pub fn start_session(&mut self, options: SessionOptions) -> SessionId {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        if !self.enabled {
            return id;
        }
        let config = SessionConfig {
            max_undo_step: options.max_undo_step,
            to_request_filter: options.to_request_filter,
        };
        let factory = Rc::clone(&self.registry) as Rc<dyn RequestFactory>;
        self.nested.push(SessionEntry {
            id,
            session: Session::with_config(factory, config),
        });
        tracing::debug!(session = %id, undo_redo = options.undo_redo, "session started");
        if options.undo_redo {
            self.undo_redo_sessions.push(id);
            self.emit(TransactionEvent::UndoRedoStateChanged);
        }
        id
    }

    /// Move the history of session `id` into its parent.
    ///
    /// With `merge`, the history becomes one composed request; otherwise
    /// every request is committed to the parent in order. Returns `false`
    /// when `id` is not the active session.
    pub fn commit_session(&mut self, id: SessionId, merge: bool) -> bool {
        if !self.enabled || self.active_session_id() != id {
            return false;
        }
        self.commit_active_session(merge);
        true
    }

    /// Undo everything session `id` recorded and close it.
    pub fn abort_session(&mut self, id: SessionId) -> bool {
        if !self.enabled || self.active_session_id() != id {
            return false;
        }
        self.abort_active_session();
        true
    }

    /// Close session `id`, keeping the document as is.
    pub fn end_session(&mut self, id: SessionId) -> bool {
        if !self.enabled || self.active_session_id() != id {
            return false;
        }
        self.terminate_active_session();
        true
    }

    /// History of session `id` as one request, while it is active.
    #[must_use]
    pub fn session_request(&self, id: SessionId) -> Option<RequestRef> {
        if self.active_session_id() == id {
            self.active_session().to_request()
        } else {
            None
        }
    }

    fn commit_active_session(&mut self, merge: bool) {
        if self.nested.is_empty() {
            tracing::warn!("commit_session with only the default session in place");
            return;
        }
        let requests = if merge {
            self.active_session().to_request().into_iter().collect()
        } else {
            self.active_session().to_requests()
        };
        self.terminate_active_session();
        for request in requests {
            if let Err(e) = self.commit(request, false) {
                tracing::warn!(error = %e, "request of committed session failed");
            }
        }
    }

    fn abort_active_session(&mut self) {
        if self.nested.is_empty() {
            tracing::warn!("abort_session with only the default session in place");
            return;
        }
        while let Some(request) = self.active_session().peek_next_undo_request() {
            self.emit(TransactionEvent::Undoing(Rc::clone(&request)));
            let result = self.active_session_mut().undo();
            self.emit(TransactionEvent::Undone(request));
            if let Some(Err(e)) = result {
                tracing::warn!(error = %e, "undo failed while aborting session");
                break;
            }
        }
        self.terminate_active_session();
    }

    fn terminate_active_session(&mut self) {
        let Some(entry) = self.nested.pop() else {
            tracing::warn!("end_session with only the default session in place");
            return;
        };
        tracing::debug!(session = %entry.id, "session closed");
        if self.undo_redo_sessions.last() == Some(&entry.id) {
            self.undo_redo_sessions.pop();
            self.emit(TransactionEvent::UndoRedoStateChanged);
        }
    }

    /// Drop every session and start over with an empty default session.
    pub fn clear(&mut self) {
        let factory = Rc::clone(&self.registry) as Rc<dyn RequestFactory>;
        self.default.session = Session::new(factory);
        self.nested.clear();
        self.undo_redo_sessions.clear();
        self.emit(TransactionEvent::UndoRedoStateChanged);
    }

    /// Clear the history of the undo/redo session.
    pub fn reset(&mut self) {
        let id = self.undo_redo_session_id();
        let session = match self.nested.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => &mut entry.session,
            None => &mut self.default.session,
        };
        session.reset();
        self.emit(TransactionEvent::UndoRedoStateChanged);
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Request being filled in the active session.
    #[must_use]
    pub fn active_request(&self) -> Option<RequestRef> {
        self.active_session().active_request()
    }

    /// Most recent request of the default session.
    #[must_use]
    pub fn latest_committed_request(&self) -> Option<RequestRef> {
        self.default.session.peek_next_undo_request()
    }

    /// Most recent request of the active session.
    #[must_use]
    pub fn latest_committed_session_request(&self) -> Option<RequestRef> {
        self.active_session().peek_next_undo_request()
    }

    /// Build a request and make it the active request.
    pub fn create_request(
        &mut self,
        request_type: &str,
        args: RequestArgs,
    ) -> RequestResult<RequestRef> {
        let request = self.registry.create_request(request_type, args)?;
        self.active_session_mut()
            .set_active_request(Some(Rc::clone(&request)));
        request.borrow_mut().activate();
        tracing::debug!(request = request_type, "request created");
        self.emit(TransactionEvent::Created(Rc::clone(&request)));
        Ok(request)
    }

    /// Forward a mutation notice to the active request.
    pub fn transact(
        &self,
        entity: &EntityRef,
        field: &str,
        change: ChangeType,
        options: &TransactOptions,
    ) {
        if self.suppressed {
            return;
        }
        self.active_session().transact(entity, field, change, options);
    }

    /// Commit `request` in the active session.
    pub fn commit(&mut self, request: RequestRef, merge: bool) -> RequestResult {
        if !self.enabled {
            self.active_session_mut().set_active_request(None);
        }
        let in_undo_redo_session = self.active_session_id() == self.undo_redo_session_id();
        self.emit(TransactionEvent::Committing(Rc::clone(&request)));
        let output = self
            .active_session_mut()
            .commit(Rc::clone(&request), merge)?;
        self.emit(TransactionEvent::Committed(request));
        if in_undo_redo_session {
            self.emit(TransactionEvent::UndoRedoStateChanged);
        }
        Ok(output)
    }

    /// Async form of [`commit`](Self::commit).
    pub async fn commit_async(&mut self, request: RequestRef, merge: bool) -> RequestResult {
        if !self.enabled {
            self.active_session_mut().set_active_request(None);
        }
        let in_undo_redo_session = self.active_session_id() == self.undo_redo_session_id();
        self.emit(TransactionEvent::Committing(Rc::clone(&request)));
        let output = self
            .active_session_mut()
            .commit_async(Rc::clone(&request), merge)
            .await?;
        self.emit(TransactionEvent::Committed(request));
        if in_undo_redo_session {
            self.emit(TransactionEvent::UndoRedoStateChanged);
        }
        Ok(output)
    }

    /// Abort an open request of the active session.
    pub fn abort(&mut self, request: &RequestRef) -> RequestResult<()> {
        self.emit(TransactionEvent::Aborting(Rc::clone(request)));
        self.active_session_mut().abort(request)?;
        self.emit(TransactionEvent::Aborted(Rc::clone(request)));
        Ok(())
    }

    // ========================================================================
    // Undo / Redo
    // ========================================================================

    /// Whether [`undo`](Self::undo) would do anything.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.enabled && !self.blocked && self.undo_redo_session().can_undo()
    }

    /// Whether [`redo`](Self::redo) would do anything.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.enabled && !self.blocked && self.undo_redo_session().can_redo()
    }

    fn prepare_undo_redo(&mut self) {
        let target = self.undo_redo_session_id();
        while !self.nested.is_empty() && self.active_session_id() != target {
            self.abort_active_session();
        }
    }

    /// Undo the most recent request of the undo/redo session.
    ///
    /// Sessions opened above it are aborted first. Returns `None` when
    /// there is nothing to undo or undo is blocked or disabled.
    pub fn undo(&mut self) -> Option<RequestResult<String>> {
        if !self.can_undo() {
            return None;
        }
        self.prepare_undo_redo();
        let request = self.active_session().peek_next_undo_request()?;
        self.emit(TransactionEvent::Undoing(Rc::clone(&request)));
        let result = self.active_session_mut().undo();
        self.emit(TransactionEvent::Undone(request));
        self.emit(TransactionEvent::UndoRedoStateChanged);
        result
    }

    /// Redo the most recently undone request of the undo/redo session.
    pub fn redo(&mut self) -> Option<RequestResult<String>> {
        if !self.can_redo() {
            return None;
        }
        self.prepare_undo_redo();
        let request = self.active_session().peek_next_redo_request()?;
        self.emit(TransactionEvent::Redoing(Rc::clone(&request)));
        let result = self.active_session_mut().redo();
        self.emit(TransactionEvent::Redone(request));
        self.emit(TransactionEvent::UndoRedoStateChanged);
        result
    }

    /// Stacks of every open session, bottom first.
    #[must_use]
    pub fn request_stack(&self, include_active: bool) -> Vec<RequestStack> {
        std::iter::once(&self.default)
            .chain(&self.nested)
            .map(|entry| RequestStack {
                undo: entry.session.undo_stack(include_active),
                redo: entry.session.redo_stack(include_active),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::undo::request::{CallbackRequest, RequestError, RequestState, request_ref};

    fn manager() -> TransactionManager {
        let manager = TransactionManager::new();
        manager.register("Noop", |_| {
            Ok(request_ref(CallbackRequest::new("Noop", || Ok(()), || Ok(()))))
        });
        manager
    }

    fn commit_noop(manager: &mut TransactionManager) -> RequestRef {
        let request = manager.create_request("Noop", RequestArgs::None).unwrap();
        manager.commit(Rc::clone(&request), false).unwrap();
        request
    }

    #[test]
    fn create_request_becomes_active() {
        let mut m = manager();
        let request = m.create_request("Noop", RequestArgs::None).unwrap();
        assert!(Rc::ptr_eq(&m.active_request().unwrap(), &request));
        m.commit(request, false).unwrap();
        assert!(m.active_request().is_none());
        assert!(m.can_undo());
    }

    #[test]
    fn unknown_request_type() {
        let mut m = manager();
        let err = m.create_request("Missing", RequestArgs::None).unwrap_err();
        assert_eq!(err, RequestError::UnknownType("Missing".into()));
    }

    #[test]
    fn events_are_emitted_in_order() {
        let mut m = manager();
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        m.subscribe(move |event| {
            let name = match event {
                TransactionEvent::Created(_) => "created",
                TransactionEvent::Committing(_) => "committing",
                TransactionEvent::Committed(_) => "committed",
                TransactionEvent::Undoing(_) => "undoing",
                TransactionEvent::Undone(_) => "undone",
                TransactionEvent::UndoRedoStateChanged => "state",
                _ => "other",
            };
            sink.borrow_mut().push(name);
        });
        commit_noop(&mut m);
        m.undo().unwrap().unwrap();
        assert_eq!(
            *log.borrow(),
            ["created", "committing", "committed", "state", "undoing", "undone", "state"]
        );
    }

    #[test]
    fn unsubscribe_stops_events() {
        let mut m = manager();
        let hits = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&hits);
        let id = m.subscribe(move |_| *sink.borrow_mut() += 1);
        assert!(m.unsubscribe(id));
        commit_noop(&mut m);
        assert_eq!(*hits.borrow(), 0);
        assert!(!m.unsubscribe(id));
    }

    #[test]
    fn blocked_manager_refuses_undo() {
        let mut m = manager();
        commit_noop(&mut m);
        m.block_undo_redo();
        assert!(!m.can_undo());
        assert!(m.undo().is_none());
        m.unblock_undo_redo();
        assert!(m.undo().is_some());
    }

    #[test]
    fn disable_clears_and_zeroes_history() {
        let mut m = manager();
        commit_noop(&mut m);
        m.disable();
        assert_eq!(m.max_undo_step(), 0);
        assert!(!m.can_undo());
        commit_noop(&mut m);
        assert_eq!(m.default_session().undo_depth(), 0);
        m.enable();
        assert_eq!(m.max_undo_step(), DEFAULT_MAX_UNDO_STEP);
    }

    #[test]
    fn suppressed_drops_transact() {
        let mut m = manager();
        m.set_suppressed(true);
        assert!(m.suppressed());
        let wall = planstate_core::entity_ref(planstate_core::RecordEntity::new("w", "Wall"));
        m.transact(&wall, "", ChangeType::Modification, &TransactOptions::new());
    }

    #[test]
    fn abort_marks_request() {
        let mut m = manager();
        let request = m.create_request("Noop", RequestArgs::None).unwrap();
        m.abort(&request).unwrap();
        assert_eq!(request.borrow().state(), RequestState::Aborted);
        assert!(m.active_request().is_none());
    }

    #[test]
    fn session_ids_must_match_active() {
        let mut m = manager();
        let outer = m.start_session(SessionOptions::default());
        let inner = m.start_session(SessionOptions::default());
        assert_eq!(m.session_count(), 3);
        assert!(!m.end_session(outer));
        assert!(m.end_session(inner));
        assert!(m.end_session(outer));
        assert_eq!(m.session_count(), 1);
        assert!(m.session_request(outer).is_none());
    }

    #[test]
    fn request_stack_lists_every_session() {
        let mut m = manager();
        commit_noop(&mut m);
        m.start_session(SessionOptions::default());
        commit_noop(&mut m);
        commit_noop(&mut m);
        let stacks = m.request_stack(false);
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].undo.len(), 1);
        assert_eq!(stacks[1].undo.len(), 2);
    }

    #[test]
    fn from_config_honours_disabled() {
        let config = TransactionConfig {
            max_undo_step: 5,
            enabled: false,
        };
        let mut m = TransactionManager::from_config(&config);
        assert!(!m.is_enabled());
        m.enable();
        assert_eq!(m.max_undo_step(), 5);
    }
}
