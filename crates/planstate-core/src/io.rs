#![forbid(unsafe_code)]

//! Per-class dump/load strategies.
//!
//! Every class tag has exactly one [`EntityIo`] service, held by the
//! [`EntityRegistry`](crate::registry::EntityRegistry). IO services are
//! stateless; the same instance handles every entity of its class.
//!
//! [`BaseIo`] writes the identity part of a record. [`SchemaIo`] builds on it
//! and stores one typed field per [`FieldSpec`], running every value through
//! the field codec.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::TransactionContext;
use crate::entity::{Entity, EntityId, EntityRef, FieldMap, FieldValue};
use crate::field::{FieldValueType, FieldValueWrapper};
use crate::warning::{SerializationWarning, WarningKind};

/// Dumped form of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity id.
    pub id: EntityId,
    /// Class tag used to pick the factory on reconstruction.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Stored fields.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValueWrapper>,
}

impl EntityRecord {
    /// Record with identity only.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: Some(class.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, field: FieldValueWrapper) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Stored field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValueWrapper> {
        self.fields.get(name)
    }

    /// Copy of this record restricted to `names` (identity is kept).
    #[must_use]
    pub fn project<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Self {
        let fields = names
            .into_iter()
            .filter_map(|n| self.fields.get(n).map(|f| (n.to_owned(), f.clone())))
            .collect();
        Self {
            id: self.id.clone(),
            class: self.class.clone(),
            fields,
        }
    }
}

/// Knobs for a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpOptions {
    /// Also dump every entity reachable through reference-typed fields.
    pub deep: bool,
    /// Include `Metadata`-typed fields.
    pub include_metadata: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            deep: false,
            include_metadata: true,
        }
    }
}

impl DumpOptions {
    /// Shallow dump with metadata.
    #[must_use]
    pub fn shallow() -> Self {
        Self::default()
    }

    /// Dump the whole reachable graph.
    #[must_use]
    pub fn deep() -> Self {
        Self {
            deep: true,
            ..Self::default()
        }
    }

    /// Builder: toggle metadata.
    #[must_use]
    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }
}

/// Post-processing hook run on the records an IO produced for one entity.
pub type DumpCallback<'a> = &'a mut dyn FnMut(&mut Vec<EntityRecord>, &dyn Entity);

/// Dump/load strategy for one class of entities.
pub trait EntityIo {
    /// Produce the records for `entity`. The first record is the entity's
    /// own; deep dumps append the records of linked entities.
    fn dump(
        &self,
        entity: &EntityRef,
        ctx: &mut TransactionContext<'_>,
        options: &DumpOptions,
        callback: Option<DumpCallback<'_>>,
    ) -> Vec<EntityRecord>;

    /// Apply `record` to `entity`, resolving references through `ctx`.
    ///
    /// Must not hold a borrow of `entity` while resolving references.
    fn load(&self, entity: &EntityRef, record: &EntityRecord, ctx: &mut TransactionContext<'_>);

    /// Codec tag for a single field, when the IO declares one.
    fn field_type(&self, _name: &str) -> Option<FieldValueType> {
        None
    }
}

/// IO writing identity only.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseIo;

impl EntityIo for BaseIo {
    fn dump(
        &self,
        entity: &EntityRef,
        _ctx: &mut TransactionContext<'_>,
        _options: &DumpOptions,
        callback: Option<DumpCallback<'_>>,
    ) -> Vec<EntityRecord> {
        let entity = entity.borrow();
        let mut records = vec![EntityRecord::new(entity.id().clone(), entity.class_tag())];
        if let Some(callback) = callback {
            callback(&mut records, &*entity);
        }
        records
    }

    fn load(&self, entity: &EntityRef, record: &EntityRecord, ctx: &mut TransactionContext<'_>) {
        let id = entity.borrow().id().clone();
        if id != record.id {
            ctx.warn(SerializationWarning::new(
                WarningKind::ContractViolation,
                format!("record {} applied to entity {id}", record.id),
            ));
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Codec tag.
    pub value_type: FieldValueType,
}

/// IO driven by a list of typed field declarations.
///
/// Undeclared fields found on the entity keep their link tag when they hold
/// entity links and are stored as `Generic` otherwise.
#[derive(Clone, Default)]
pub struct SchemaIo {
    base: BaseIo,
    fields: Vec<FieldSpec>,
}

impl fmt::Debug for SchemaIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaIo")
            .field("fields", &self.fields.len())
            .finish()
    }
}

impl SchemaIo {
    /// IO with no declared fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: declare a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value_type: FieldValueType) -> Self {
        let name = name.into();
        self.fields.retain(|f| f.name != name);
        self.fields.push(FieldSpec { name, value_type });
        self
    }

    /// Declared fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn declared(&self, name: &str) -> Option<FieldValueType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value_type)
    }
}

impl EntityIo for SchemaIo {
    fn dump(
        &self,
        entity: &EntityRef,
        ctx: &mut TransactionContext<'_>,
        options: &DumpOptions,
        callback: Option<DumpCallback<'_>>,
    ) -> Vec<EntityRecord> {
        let mut records = self.base.dump(entity, ctx, options, None);
        let data = entity.borrow().get_data();
        let mut linked = Vec::new();

        for (name, value) in &data {
            let value_type = self
                .declared(name)
                .unwrap_or_else(|| FieldValueType::inferred(value));
            if value_type == FieldValueType::Metadata && !options.include_metadata {
                continue;
            }
            ctx.enter_field(name);
            let stored = FieldValueWrapper::dump_value(value, value_type, ctx);
            ctx.leave_field();
            if options.deep && value_type.is_entity_link() {
                linked.extend(value.linked_entities());
            }
            records[0].fields.insert(name.clone(), stored);
        }

        // Declared but absent fields are stored as their empty form.
        for spec in &self.fields {
            if records[0].fields.contains_key(&spec.name)
                || (spec.value_type == FieldValueType::Metadata && !options.include_metadata)
            {
                continue;
            }
            let stored = FieldValueWrapper::dump_value(&FieldValue::Null, spec.value_type, ctx);
            records[0].fields.insert(spec.name.clone(), stored);
        }

        for target in linked {
            records.extend(ctx.dump_entity(&target, options));
        }

        if let Some(callback) = callback {
            callback(&mut records, &*entity.borrow());
        }
        records
    }

    fn load(&self, entity: &EntityRef, record: &EntityRecord, ctx: &mut TransactionContext<'_>) {
        self.base.load(entity, record, ctx);

        let mut patch = FieldMap::new();
        for (name, stored) in &record.fields {
            ctx.enter_field(name);
            let value = stored.load_value(ctx);
            ctx.leave_field();
            patch.insert(name.clone(), value);
        }

        match entity.try_borrow_mut() {
            Ok(mut target) => target.set(patch),
            Err(_) => ctx.warn(SerializationWarning::new(
                WarningKind::ContractViolation,
                "entity is borrowed while being loaded",
            )),
        }
    }

    fn field_type(&self, name: &str) -> Option<FieldValueType> {
        self.declared(name)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::document::Document;
    use crate::entity::{RecordEntity, entity_ref};
    use crate::registry::EntityRegistry;

    fn wall_io() -> SchemaIo {
        SchemaIo::new()
            .field("host", FieldValueType::Entity)
            .field("openings", FieldValueType::EntityArray)
            .field("notes", FieldValueType::Metadata)
    }

    fn document() -> Document {
        Document::new(Rc::new(EntityRegistry::new().register_class(
            "Wall",
            |id| entity_ref(RecordEntity::new(id.clone(), "Wall")),
            wall_io(),
        )))
    }

    #[test]
    fn record_serializes_class_as_c() {
        let record = EntityRecord::new("1", "Wall")
            .with_field("h", FieldValueWrapper::new(FieldValueType::Generic, json!(3)));
        let text = serde_json::to_value(&record).unwrap();
        assert_eq!(
            text,
            json!({"id": "1", "c": "Wall", "fields": {"h": {"type": "Generic", "value": 3}}})
        );
    }

    #[test]
    fn metadata_skipped_on_request() {
        let doc = document();
        let wall = entity_ref(
            RecordEntity::new("1", "Wall").with_field("notes", FieldValue::Data(json!({"a": 1}))),
        );
        let mut ctx = TransactionContext::new(&doc);
        let records = wall_io().dump(
            &wall,
            &mut ctx,
            &DumpOptions::shallow().with_metadata(false),
            None,
        );
        assert!(records[0].field("notes").is_none());
        assert!(records[0].field("openings").is_some());
    }

    #[test]
    fn absent_collections_dump_empty() {
        let doc = document();
        let wall = entity_ref(RecordEntity::new("1", "Wall"));
        let mut ctx = TransactionContext::new(&doc);
        let records = wall_io().dump(&wall, &mut ctx, &DumpOptions::default(), None);
        assert_eq!(records[0].field("openings").unwrap().value, json!([]));
        assert_eq!(records[0].field("host").unwrap().value, json!(null));
    }

    #[test]
    fn deep_dump_follows_links_once() {
        let doc = document();
        let a = entity_ref(RecordEntity::new("a", "Wall"));
        let b = entity_ref(RecordEntity::new("b", "Wall").with_field("host", a.clone().into()));
        a.borrow_mut()
            .as_any_mut()
            .downcast_mut::<RecordEntity>()
            .unwrap()
            .set_field("host", b.clone().into());

        let mut ctx = TransactionContext::new(&doc);
        let records = ctx.dump_entity(&a, &DumpOptions::deep());
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn undeclared_links_keep_link_tag() {
        let doc = document();
        let door = entity_ref(RecordEntity::new("d", "Wall"));
        let wall = entity_ref(
            RecordEntity::new("1", "Wall")
                .with_field("doors", FieldValue::EntityArray(vec![door.clone()]))
                .with_field("label", FieldValue::Text("north".into())),
        );
        let mut ctx = TransactionContext::new(&doc);
        let records = ctx.dump_entity(&wall, &DumpOptions::deep());

        let doors = records[0].field("doors").unwrap();
        assert_eq!(doors.value_type, FieldValueType::EntityArray);
        assert_eq!(doors.value, json!(["d"]));
        assert_eq!(
            records[0].field("label").unwrap().value_type,
            FieldValueType::Generic
        );
        assert_eq!(records.len(), 2);
        assert!(ctx.warnings().is_empty());
    }

    #[test]
    fn callback_can_rewrite_records() {
        let doc = document();
        let wall = entity_ref(RecordEntity::new("1", "Wall"));
        let mut ctx = TransactionContext::new(&doc);
        let mut seen = Vec::new();
        let mut hook = |records: &mut Vec<EntityRecord>, entity: &dyn Entity| {
            seen.push(entity.id().clone());
            records[0]
                .fields
                .insert("tag".into(), FieldValueWrapper::new(FieldValueType::Generic, json!("x")));
        };
        let records = ctx.dump_entity_with(&wall, &DumpOptions::default(), Some(&mut hook));
        assert_eq!(records[0].field("tag").unwrap().value, json!("x"));
        assert_eq!(seen, [EntityId::from("1")]);
    }

    #[test]
    fn load_applies_only_stored_fields() {
        let doc = document();
        let wall = entity_ref(RecordEntity::new("1", "Wall").with_field("height", 2.5.into()));
        let record = EntityRecord::new("1", "Wall").with_field(
            "name",
            FieldValueWrapper::new(FieldValueType::Generic, json!("south")),
        );
        let mut ctx = TransactionContext::new(&doc);
        wall_io().load(&wall, &record, &mut ctx);

        let wall = wall.borrow();
        assert_eq!(wall.field("height"), Some(FieldValue::Number(2.5)));
        assert_eq!(wall.field("name"), Some(FieldValue::Text("south".into())));
    }

    #[test]
    fn project_keeps_identity() {
        let record = EntityRecord::new("1", "Wall")
            .with_field("a", FieldValueWrapper::new(FieldValueType::Generic, json!(1)))
            .with_field("b", FieldValueWrapper::new(FieldValueType::Generic, json!(2)));
        let projected = record.project(["b", "missing"]);
        assert_eq!(projected.class.as_deref(), Some("Wall"));
        assert_eq!(projected.fields.len(), 1);
        assert!(projected.field("b").is_some());
    }
}
