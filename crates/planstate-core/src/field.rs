#![forbid(unsafe_code)]

//! Typed field codec.
//!
//! [`FieldValueWrapper`] turns one runtime [`FieldValue`] into a JSON-shaped
//! stored value and back. The [`FieldValueType`] tag chosen by the entity's
//! IO decides how the conversion happens:
//!
//! | Tag | Stored as | Restored by |
//! |---|---|---|
//! | `Generic` | primitive or copied JSON | copy |
//! | `Entity` | id | [`FieldValueWrapper::load_entity`] |
//! | `EntityArray` | ordered id list | resolve each id, keep order |
//! | `EntityMap` | id list (ids are the map keys) | resolve each id, key by id |
//! | `KeyEntityMap` | `{key: id}` | resolve each id, keep keys |
//! | `MaterialDataField` / `StateField` | side-table id | side-table loader |
//! | `MaterialData` / `State` / `Metadata` | verbatim payload | copy |
//!
//! # Invariants
//!
//! - Primitives pass through unchanged whatever the tag.
//! - Unresolvable ids are dropped from collections and become `Null` for
//!   single links; both leave a warning in the context.
//! - A stored `null` always loads as [`FieldValue::Null`].

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::TransactionContext;
use crate::entity::{EntityId, EntityRef, FieldValue, id_of};
use crate::side_table::{MaterialData, StateData};
use crate::warning::{SerializationWarning, WarningKind};

/// How a field's runtime value is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldValueType {
    /// Primitives and plain data.
    #[default]
    Generic,
    /// Single entity link.
    Entity,
    /// Ordered entity links.
    EntityArray,
    /// Entity presence map keyed by id.
    EntityMap,
    /// Entity links under string keys.
    KeyEntityMap,
    /// Link into the material side table.
    MaterialDataField,
    /// Link into the state side table.
    StateField,
    /// Inline material payload.
    MaterialData,
    /// Inline state payload.
    State,
    /// Opaque metadata payload.
    Metadata,
}

impl FieldValueType {
    /// Whether values of this type are stored as entity ids.
    #[must_use]
    pub fn is_entity_link(self) -> bool {
        matches!(
            self,
            Self::Entity | Self::EntityArray | Self::EntityMap | Self::KeyEntityMap
        )
    }

    /// Tag for a value whose field has no declaration: entity links keep
    /// their link tag, everything else is `Generic`.
    #[must_use]
    pub fn inferred(value: &FieldValue) -> Self {
        match value {
            FieldValue::Entity(_) => Self::Entity,
            FieldValue::EntityArray(_) => Self::EntityArray,
            FieldValue::EntityMap(_) => Self::EntityMap,
            FieldValue::KeyEntityMap(_) => Self::KeyEntityMap,
            _ => Self::Generic,
        }
    }
}

/// A stored field value together with its type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueWrapper {
    /// Type tag.
    #[serde(rename = "type")]
    pub value_type: FieldValueType,
    /// JSON-shaped stored value.
    pub value: Value,
}

impl FieldValueWrapper {
    /// Wrap an already stored value.
    #[must_use]
    pub fn new(value_type: FieldValueType, value: Value) -> Self {
        Self { value_type, value }
    }

    /// Convert a runtime value to its stored form.
    ///
    /// Side objects referenced through `MaterialDataField`/`StateField` are
    /// dumped into `ctx` as a side effect. Values that do not fit the tag are
    /// reported to `ctx` and stored as `null`.
    pub fn dump_value(
        value: &FieldValue,
        value_type: FieldValueType,
        ctx: &mut TransactionContext<'_>,
    ) -> Self {
        let stored = match value {
            FieldValue::Null => match value_type {
                FieldValueType::EntityArray | FieldValueType::EntityMap => {
                    Value::Array(Vec::new())
                }
                FieldValueType::KeyEntityMap => Value::Object(serde_json::Map::new()),
                _ => Value::Null,
            },
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => number_value(*n, ctx),
            FieldValue::Text(s) => Value::String(s.clone()),
            other => dump_compound(other, value_type, ctx),
        };

        if value_type == FieldValueType::Entity && !value.is_null() && value.is_primitive() {
            ctx.warn(SerializationWarning::new(
                WarningKind::ContractViolation,
                "Entity-typed field holds a primitive value",
            ));
        }

        Self::new(value_type, stored)
    }

    /// Convert the stored form back to a runtime value.
    pub fn load_value(&self, ctx: &mut TransactionContext<'_>) -> FieldValue {
        if self.value.is_null() {
            return FieldValue::Null;
        }

        match (self.value_type, &self.value) {
            (FieldValueType::Entity, Value::String(id)) => {
                Self::load_entity(&EntityId::from(id.as_str()), ctx)
                    .map_or(FieldValue::Null, FieldValue::Entity)
            }
            (FieldValueType::EntityArray, Value::Array(ids)) => {
                FieldValue::EntityArray(load_id_list(ids, ctx))
            }
            (FieldValueType::EntityMap, Value::Array(ids)) => {
                let entities = load_id_list(ids, ctx);
                FieldValue::EntityMap(entities.into_iter().map(|e| (id_of(&e), e)).collect())
            }
            (FieldValueType::KeyEntityMap, Value::Object(map)) => {
                let mut out = BTreeMap::new();
                for (key, id) in map {
                    let Some(id) = id.as_str() else {
                        ctx.warn(SerializationWarning::new(
                            WarningKind::ContractViolation,
                            format!("key '{key}' does not hold an id"),
                        ));
                        continue;
                    };
                    if let Some(entity) = Self::load_entity(&EntityId::from(id), ctx) {
                        out.insert(key.clone(), entity);
                    }
                }
                FieldValue::KeyEntityMap(out)
            }
            (FieldValueType::MaterialDataField, Value::String(id)) => ctx
                .load_material(id)
                .map_or(FieldValue::Null, FieldValue::Material),
            (FieldValueType::StateField, Value::String(id)) => ctx
                .load_state(id)
                .map_or(FieldValue::Null, FieldValue::State),
            (FieldValueType::MaterialData, stored @ Value::Object(_)) => {
                match serde_json::from_value::<MaterialData>(stored.clone()) {
                    Ok(material) => FieldValue::Material(Rc::new(material)),
                    Err(_) => FieldValue::Data(stored.clone()),
                }
            }
            (FieldValueType::State, stored @ Value::Object(_)) => {
                match serde_json::from_value::<StateData>(stored.clone()) {
                    Ok(state) => FieldValue::State(Rc::new(state)),
                    Err(_) => FieldValue::Data(stored.clone()),
                }
            }
            (_, stored) => plain_value(stored),
        }
    }

    /// Resolve one entity id inside a transaction.
    ///
    /// 1. An in-progress restoration marker for `id` wins: the marker is
    ///    asked to restore (it does so at most once) and the entity is then
    ///    looked up, so cyclic references never re-enter a fresh load.
    /// 2. Otherwise an entity already present in the context or the live
    ///    document is reused.
    /// 3. Otherwise the entity is reconstructed from the raw record in `ctx`.
    /// 4. Otherwise a warning is recorded and `None` returned.
    pub fn load_entity(id: &EntityId, ctx: &mut TransactionContext<'_>) -> Option<EntityRef> {
        if let Some(marker) = ctx.txn_state(id) {
            let record = ctx.record(id);
            marker.restore(ctx, record.as_deref());
            return ctx.get_entity_by_id(id);
        }

        if let Some(entity) = ctx.get_entity_by_id(id) {
            return Some(entity);
        }

        if let Some(entity) = ctx.load_from_dump_by_id(id) {
            return Some(entity);
        }

        ctx.warn(SerializationWarning::new(
            WarningKind::UnresolvedReference,
            format!("entity {id} is neither live nor in the dump"),
        ));
        None
    }
}

fn number_value(n: f64, ctx: &mut TransactionContext<'_>) -> Value {
    if let Some(number) = serde_json::Number::from_f64(n) {
        return Value::Number(number);
    }
    ctx.warn(SerializationWarning::new(
        WarningKind::ContractViolation,
        format!("{n} has no JSON form, stored as null"),
    ));
    Value::Null
}

fn plain_value(stored: &Value) -> FieldValue {
    match stored {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => n.as_f64().map_or(FieldValue::Null, FieldValue::Number),
        Value::String(s) => FieldValue::Text(s.clone()),
        compound => FieldValue::Data(compound.clone()),
    }
}

fn load_id_list(ids: &[Value], ctx: &mut TransactionContext<'_>) -> Vec<EntityRef> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(id) = id.as_str() else {
            ctx.warn(SerializationWarning::new(
                WarningKind::ContractViolation,
                format!("{id} is not an entity id"),
            ));
            continue;
        };
        if let Some(entity) = FieldValueWrapper::load_entity(&EntityId::from(id), ctx) {
            out.push(entity);
        }
    }
    out
}

fn id_value(entity: &EntityRef) -> Value {
    Value::String(id_of(entity).as_str().to_owned())
}

fn dump_compound(
    value: &FieldValue,
    value_type: FieldValueType,
    ctx: &mut TransactionContext<'_>,
) -> Value {
    use FieldValueType as T;

    match (value_type, value) {
        (T::Entity, FieldValue::Entity(e)) => id_value(e),
        (T::EntityArray, FieldValue::EntityArray(list)) => {
            Value::Array(list.iter().map(id_value).collect())
        }
        (T::EntityMap, FieldValue::EntityMap(map)) => Value::Array(
            map.keys()
                .map(|id| Value::String(id.as_str().to_owned()))
                .collect(),
        ),
        (T::KeyEntityMap, FieldValue::KeyEntityMap(map)) => Value::Object(
            map.iter()
                .map(|(key, e)| (key.clone(), id_value(e)))
                .collect(),
        ),
        (T::MaterialDataField, FieldValue::Material(m)) => {
            ctx.dump_material(m);
            Value::String(m.id.clone())
        }
        (T::StateField, FieldValue::State(s)) => {
            ctx.dump_state(s);
            Value::String(s.id.clone())
        }
        (T::MaterialData, FieldValue::Material(m)) => {
            serde_json::to_value(m.as_ref()).unwrap_or(Value::Null)
        }
        (T::State, FieldValue::State(s)) => {
            serde_json::to_value(s.as_ref()).unwrap_or(Value::Null)
        }
        (T::Generic | T::MaterialData | T::State | T::Metadata, FieldValue::Data(v)) => v.clone(),
        (declared, other) => {
            ctx.warn(SerializationWarning::new(
                WarningKind::ContractViolation,
                format!("{declared:?} field cannot hold {other:?}"),
            ));
            Value::Null
        }
    }
}
