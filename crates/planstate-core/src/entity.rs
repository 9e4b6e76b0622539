#![forbid(unsafe_code)]

//! Entity identity and the runtime field model.
//!
//! Entities are identity-bearing, mutable objects owned by a
//! [`Document`](crate::document::Document). Fields may link to other entities,
//! but those links never own their target: every link is an [`EntityRef`]
//! handle that the codec stores as the target's [`EntityId`].
//!
//! # Invariants
//!
//! - An entity's id never changes after construction.
//! - `set(data)` only touches the fields present in `data`.
//! - Two [`FieldValue`]s holding entity handles are equal only when the
//!   handles point at the same entity instance.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::side_table::{MaterialData, StateData};

/// Stable identifier of an entity, unique within a document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for EntityId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl std::borrow::Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Named field values of one entity.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Shared handle to a live entity.
pub type EntityRef = Rc<RefCell<dyn Entity>>;

/// The contract every document object satisfies.
///
/// Concrete entity types (walls, openings, moldings...) live outside this
/// crate. They expose their state as a [`FieldMap`] and let an
/// [`EntityIo`](crate::io::EntityIo) registered for their class tag decide how
/// each field is stored.
pub trait Entity: Any {
    /// Stable id of this entity.
    fn id(&self) -> &EntityId;

    /// Class tag used to find the factory and IO service on load.
    fn class_tag(&self) -> &str;

    /// Snapshot of all fields.
    fn get_data(&self) -> FieldMap;

    /// Overwrite the fields present in `data`, leaving the others untouched.
    fn set(&mut self, data: FieldMap);

    /// Read a single field.
    fn field(&self, name: &str) -> Option<FieldValue> {
        self.get_data().remove(name)
    }

    /// Self-check run after the entity was reconstructed from a dump.
    fn verify(&self) -> bool {
        true
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl fmt::Debug for dyn Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", self.id())
            .field("class", &self.class_tag())
            .finish()
    }
}

/// Wrap an entity into a shared handle.
pub fn entity_ref<E: Entity>(entity: E) -> EntityRef {
    Rc::new(RefCell::new(entity))
}

/// Read the id behind a handle.
///
/// # Panics
///
/// Panics if the entity is currently mutably borrowed.
#[must_use]
pub fn id_of(entity: &EntityRef) -> EntityId {
    entity.borrow().id().clone()
}

/// Entity with a free-form field map.
///
/// Suitable for entity types that carry no behavior of their own; the field
/// schema lives entirely in the IO service registered for the class tag.
#[derive(Debug, Clone)]
pub struct RecordEntity {
    id: EntityId,
    class_tag: String,
    fields: FieldMap,
}

impl RecordEntity {
    /// Create an entity with no fields.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, class_tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class_tag: class_tag.into(),
            fields: FieldMap::new(),
        }
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Assign one field.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Borrow the field map.
    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }
}

impl Entity for RecordEntity {
    fn id(&self) -> &EntityId {
        &self.id
    }

    fn class_tag(&self) -> &str {
        &self.class_tag
    }

    fn get_data(&self) -> FieldMap {
        self.fields.clone()
    }

    fn set(&mut self, data: FieldMap) {
        self.fields.extend(data);
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        self.fields.get(name).cloned()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Runtime value of one entity field.
#[derive(Clone, Default)]
pub enum FieldValue {
    /// Absent value.
    #[default]
    Null,
    /// Boolean primitive.
    Bool(bool),
    /// Numeric primitive.
    Number(f64),
    /// String primitive.
    Text(String),
    /// Link to a single entity.
    Entity(EntityRef),
    /// Ordered links.
    EntityArray(Vec<EntityRef>),
    /// Presence map keyed by each linked entity's own id.
    EntityMap(BTreeMap<EntityId, EntityRef>),
    /// Links addressed by arbitrary string keys.
    KeyEntityMap(BTreeMap<String, EntityRef>),
    /// Shared material record.
    Material(Rc<MaterialData>),
    /// Shared state record.
    State(Rc<StateData>),
    /// Plain JSON-shaped data: arrays, records, opaque payloads.
    Data(serde_json::Value),
}

impl FieldValue {
    /// Whether the value is a primitive (null, bool, number, string).
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::Text(_)
        )
    }

    /// Whether the value is `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Build an `EntityMap` value keyed by each entity's id.
    #[must_use]
    pub fn entity_map<I: IntoIterator<Item = EntityRef>>(entities: I) -> Self {
        Self::EntityMap(entities.into_iter().map(|e| (id_of(&e), e)).collect())
    }

    /// The single linked entity, if this is an `Entity` value.
    #[must_use]
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Self::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Every entity handle this value links to, in storage order.
    #[must_use]
    pub fn linked_entities(&self) -> Vec<EntityRef> {
        match self {
            Self::Entity(e) => vec![e.clone()],
            Self::EntityArray(list) => list.clone(),
            Self::EntityMap(map) => map.values().cloned().collect(),
            Self::KeyEntityMap(map) => map.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this value holds at least one entity handle.
    #[must_use]
    pub fn links_entities(&self) -> bool {
        matches!(
            self,
            Self::Entity(_) | Self::EntityArray(_) | Self::EntityMap(_) | Self::KeyEntityMap(_)
        )
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<EntityRef> for FieldValue {
    fn from(value: EntityRef) -> Self {
        Self::Entity(value)
    }
}

fn same_entities<'a, I>(a: I, b: I) -> bool
where
    I: ExactSizeIterator<Item = &'a EntityRef>,
{
    a.len() == b.len() && a.zip(b).all(|(x, y)| Rc::ptr_eq(x, y))
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => Rc::ptr_eq(a, b),
            (Self::EntityArray(a), Self::EntityArray(b)) => same_entities(a.iter(), b.iter()),
            (Self::EntityMap(a), Self::EntityMap(b)) => {
                a.keys().eq(b.keys()) && same_entities(a.values(), b.values())
            }
            (Self::KeyEntityMap(a), Self::KeyEntityMap(b)) => {
                a.keys().eq(b.keys()) && same_entities(a.values(), b.values())
            }
            (Self::Material(a), Self::Material(b)) => a == b,
            (Self::State(a), Self::State(b)) => a == b,
            (Self::Data(a), Self::Data(b)) => a == b,
            _ => false,
        }
    }
}

/// Debug output names linked entities by id only, so cyclic graphs print.
impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn label(entity: &EntityRef) -> String {
            entity
                .try_borrow()
                .map(|e| e.id().to_string())
                .unwrap_or_else(|_| "<borrowed>".to_owned())
        }

        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::Text(s) => write!(f, "Text({s:?})"),
            Self::Entity(e) => write!(f, "Entity({})", label(e)),
            Self::EntityArray(list) => f
                .debug_tuple("EntityArray")
                .field(&list.iter().map(label).collect::<Vec<_>>())
                .finish(),
            Self::EntityMap(map) => f
                .debug_tuple("EntityMap")
                .field(&map.keys().collect::<Vec<_>>())
                .finish(),
            Self::KeyEntityMap(map) => f
                .debug_tuple("KeyEntityMap")
                .field(
                    &map.iter()
                        .map(|(k, e)| (k.as_str(), label(e)))
                        .collect::<Vec<_>>(),
                )
                .finish(),
            Self::Material(m) => write!(f, "Material({})", m.id),
            Self::State(s) => write!(f, "State({})", s.id),
            Self::Data(v) => write!(f, "Data({v})"),
        }
    }
}
