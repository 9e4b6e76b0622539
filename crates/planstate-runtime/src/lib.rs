#![forbid(unsafe_code)]

//! Planstate Runtime
//!
//! Requests, sessions and undo/redo history on top of `planstate-core`.
//!
//! # Key Components
//!
//! - [`Request`] - Reversible user action with a checked lifecycle
//! - [`BatchRequest`] - All-or-nothing group of requests
//! - [`StateRequest`] - Undo by entity-state snapshots taken through the codec
//! - [`Session`] - Bounded undo/redo stacks with request composition
//! - [`TransactionManager`] - Nested sessions, request registry, observers
//! - [`TransactionConfig`] - History bound and enable flag, loadable from files
//!
//! # Role in planstate
//! Editing code opens a request, reports each mutation through `transact`
//! before applying it, and commits. `planstate-core` does the snapshotting;
//! this crate decides when snapshots are taken and in which order they are
//! restored.
//!
//! # Threading
//! Everything here is single-threaded (`Rc`/`RefCell`). The only suspension
//! point is [`Request::commit_async`].

pub mod config;
pub mod undo;

pub use config::{ConfigError, TransactionConfig};
pub use undo::{
    BatchRequest, CallbackRequest, ChangeType, Request, RequestArgs, RequestError,
    RequestFactory, RequestRef, RequestRegistry, RequestResult, RequestState, Session,
    SessionConfig, SessionId, SessionOptions, StateRequest, TransactOptions, TransactionEvent,
    TransactionManager, request_ref,
};
