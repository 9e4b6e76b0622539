#![forbid(unsafe_code)]

//! planstate public facade crate.
//!
//! Re-exports the entity graph codec from `planstate-core` and the
//! transaction engine from `planstate-runtime`, plus a prelude covering the
//! types most editing code touches.

use std::fmt;

// --- Core re-exports -------------------------------------------------------

pub use planstate_core::{
    Document, DumpOptions, DumpReport, Entity, EntityId, EntityIo, EntityRecord, EntityRef,
    EntityRegistry, FieldValue, FieldValueType, FieldValueWrapper, GraphDump, LoadReport,
    RecordEntity, SchemaIo, SerializationWarning, TransactionContext, WarningKind, entity_ref,
    id_of,
};

// --- Runtime re-exports ----------------------------------------------------

pub use planstate_runtime::{
    BatchRequest, CallbackRequest, ChangeType, ConfigError, Request, RequestArgs, RequestError,
    RequestRef, RequestState, Session, SessionId, SessionOptions, StateRequest, TransactOptions,
    TransactionConfig, TransactionEvent, TransactionManager, request_ref,
};

// --- Errors ---------------------------------------------------------------

/// Top-level error type for planstate callers.
#[derive(Debug)]
pub enum Error {
    /// A request could not be committed, undone, redone or built.
    Request(RequestError),
    /// Configuration could not be loaded.
    Config(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(err) => Some(err),
            Self::Config(err) => Some(err),
        }
    }
}

impl From<RequestError> for Error {
    fn from(err: RequestError) -> Self {
        Self::Request(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

/// Standard result type for planstate APIs.
pub type Result<T> = std::result::Result<T, Error>;

// --- Prelude --------------------------------------------------------------

pub mod prelude {
    pub use crate::{
        ChangeType, Document, Entity, EntityId, EntityRef, EntityRegistry, Error, FieldValue,
        FieldValueType, RecordEntity, Request, RequestArgs, Result, SchemaIo, SessionOptions,
        TransactOptions, TransactionConfig, TransactionManager,
    };

    pub use crate::{core, runtime};
}

pub use planstate_core as core;
pub use planstate_runtime as runtime;

#[cfg(test)]
mod tests {
    use super::*;

    fn fails() -> Result<()> {
        Err(RequestError::UnknownType("Wall".into()))?;
        Ok(())
    }

    #[test]
    fn request_errors_convert() {
        let err = fails().unwrap_err();
        assert!(matches!(err, Error::Request(RequestError::UnknownType(_))));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn config_errors_convert() {
        let err: Error = ConfigError::Validation(vec!["bad".into()]).into();
        assert_eq!(err.to_string(), "invalid transaction config: bad");
    }
}
