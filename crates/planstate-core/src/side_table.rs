#![forbid(unsafe_code)]

//! Side-table records referenced by id from entity fields.
//!
//! Materials and parametric states are not entities: they live in their own
//! registries on the [`Document`](crate::document::Document) and are shared by
//! many entities. A field tagged `MaterialDataField` or `StateField` stores
//! only the record id and dumps the record itself into the transaction
//! context next to the entity records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A material definition (color, texture, tiling...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialData {
    /// Registry id.
    pub id: String,
    /// Free-form material properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl MaterialData {
    /// Create a material with no properties.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property assignment.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// A named parametric state shared between entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    /// Registry id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Current value.
    #[serde(default)]
    pub value: serde_json::Value,
}

impl StateData {
    /// Create a state.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
        }
    }
}
