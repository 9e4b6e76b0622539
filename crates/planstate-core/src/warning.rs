#![forbid(unsafe_code)]

//! Soft errors raised while dumping or loading.
//!
//! Serialization never aborts half-way. Contract violations and unresolved
//! references are recorded as [`SerializationWarning`]s (and logged through
//! `tracing`), the offending value degrades to `null`, and the operation
//! carries on.

use std::fmt;

use serde::Serialize;

use crate::entity::EntityId;

/// Category of a soft error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WarningKind {
    /// A field value does not match its declared type.
    ContractViolation,
    /// An id could neither be found live nor reconstructed from the dump.
    UnresolvedReference,
    /// An entity being restored has no record in the context.
    MissingRecord,
    /// A record names a class tag with no registered factory/IO.
    UnknownClass,
    /// A material or state id could not be resolved.
    MissingSideObject,
    /// A reconstructed entity failed its own `verify()`.
    VerificationFailed,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContractViolation => "contract violation",
            Self::UnresolvedReference => "unresolved reference",
            Self::MissingRecord => "missing record",
            Self::UnknownClass => "unknown class",
            Self::MissingSideObject => "missing side object",
            Self::VerificationFailed => "verification failed",
        };
        f.write_str(name)
    }
}

/// One soft error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerializationWarning {
    /// Category.
    pub kind: WarningKind,
    /// Entity being processed, when known.
    pub entity: Option<EntityId>,
    /// Field being processed, when known.
    pub field: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

impl SerializationWarning {
    /// Create a warning with no entity/field attribution.
    #[must_use]
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            field: None,
            message: message.into(),
        }
    }

    /// Attribute the warning to an entity.
    #[must_use]
    pub fn for_entity(mut self, id: EntityId) -> Self {
        self.entity = Some(id);
        self
    }

    /// Attribute the warning to a field.
    #[must_use]
    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for SerializationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(id) = &self.entity {
            write!(f, " [entity {id}]")?;
        }
        if let Some(field) = &self.field {
            write!(f, " [field {field}]")?;
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_attribution() {
        let w = SerializationWarning::new(WarningKind::UnresolvedReference, "no record for 7")
            .for_entity(EntityId::from("3"))
            .for_field("host");
        assert_eq!(
            w.to_string(),
            "unresolved reference [entity 3] [field host]: no record for 7"
        );
    }
}
