#![forbid(unsafe_code)]

//! Undo/redo transactions over planstate documents.
//!
//! A *request* is one reversible user action. It is created open, collects
//! mutation notices while the user edits (`transact`), and is then committed
//! into a *session*, which keeps bounded undo and redo stacks. The
//! [`TransactionManager`] stacks nested sessions on top of a default one so
//! that a multi-step interaction can be committed as one undo entry or
//! thrown away as a whole.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── TransactionManager ────────────────────────┐
//! │  RequestRegistry        session stack              listeners       │
//! │  "Batch"  → ctor        ┌──────────┐                               │
//! │  "State"  → ctor        │ nested   │ ◄ active                      │
//! │  ...                    ├──────────┤                               │
//! │                         │ default  │                               │
//! │                         └──────────┘                               │
//! └────────────────────────────────────────────────────────────────────┘
//!           Session: undo stack ◄── commit ── active request
//!                    redo stack ◄── undo ──►  (redo moves back)
//! ```
//!
//! # Module Structure
//!
//! - [`request`]: `Request` trait, lifecycle states, `CallbackRequest`
//! - [`batch`]: `BatchRequest`, all-or-nothing groups of requests
//! - [`state_request`]: `StateRequest`, snapshot-based undo of entity state
//! - [`factory`]: request construction by type name
//! - [`session`]: bounded undo/redo history
//! - [`manager`]: nested sessions and observer events
//!
//! # Merge Strategy
//!
//! Committing with `merge` composes the new request into the top of the undo
//! stack. When the two refuse to compose they are wrapped in a batch, so a
//! merged commit always consumes one undo slot.

pub mod batch;
pub mod factory;
pub mod manager;
pub mod request;
pub mod session;
pub mod state_request;

pub use batch::{BATCH_REQUEST_TYPE, BatchRequest};
pub use factory::{
    ArgsAdapter, DEFAULT_MAX_UNDO_STEP, RequestArgs, RequestConstructor, RequestFactory,
    RequestRegistry,
};
pub use manager::{
    EventListener, ListenerId, RequestStack, SessionId, SessionOptions, TransactionEvent,
    TransactionManager,
};
pub use request::{
    CallbackRequest, ChangeType, Request, RequestAction, RequestError, RequestMeta,
    RequestOutput, RequestRef, RequestResult, RequestState, TransactOptions, request_ref,
};
pub use session::{RequestFilter, Session, SessionConfig};
pub use state_request::{Capture, EntityTxnState, STATE_REQUEST_TYPE, StateRequest};
