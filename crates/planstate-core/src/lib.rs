#![forbid(unsafe_code)]

//! Planstate Core
//!
//! Entity graph serialization for the planstate transaction engine.
//!
//! # Key Components
//!
//! - [`Entity`] - Contract every document object satisfies
//! - [`FieldValueWrapper`] - Typed field codec (runtime value ⇄ stored form)
//! - [`EntityIo`] - Per-class dump/load strategy ([`BaseIo`], [`SchemaIo`])
//! - [`TransactionContext`] - Per-operation bag with the cycle guard
//! - [`EntityRegistry`] - Class tag → factory + IO
//! - [`Document`] - Live entity graph with material/state side tables
//!
//! # Role in planstate
//! `planstate-core` knows how to turn any (possibly cyclic) entity graph into
//! plain records and back, restoring each entity at most once per operation.
//! `planstate-runtime` builds undo/redo requests on top of it.
//!
//! # Soft errors
//! Nothing in this crate returns `Err` for bad data. Contract violations and
//! unresolved references become [`SerializationWarning`]s collected by the
//! context and returned in [`DumpReport`]/[`LoadReport`].

pub mod context;
pub mod document;
pub mod entity;
pub mod field;
pub mod io;
pub mod registry;
pub mod side_table;
pub mod warning;

pub use context::{ContextOutcome, GraphDump, RestoreMarker, TransactionContext};
pub use document::{Document, DumpReport, LoadReport};
pub use entity::{
    Entity, EntityId, EntityRef, FieldMap, FieldValue, RecordEntity, entity_ref, id_of,
};
pub use field::{FieldValueType, FieldValueWrapper};
pub use io::{BaseIo, DumpCallback, DumpOptions, EntityIo, EntityRecord, FieldSpec, SchemaIo};
pub use registry::{EntityFactory, EntityRegistry};
pub use side_table::{MaterialData, StateData};
pub use warning::{SerializationWarning, WarningKind};
