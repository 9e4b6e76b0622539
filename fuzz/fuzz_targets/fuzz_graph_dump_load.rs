#![no_main]

use std::rc::Rc;

use libfuzzer_sys::fuzz_target;
use planstate_core::{
    Document, DumpOptions, EntityRegistry, FieldValueType, GraphDump, RecordEntity, SchemaIo,
    entity_ref, id_of,
};

fn document() -> Document {
    let registry = EntityRegistry::new()
        .register_class(
            "Wall",
            |id| entity_ref(RecordEntity::new(id.clone(), "Wall")),
            SchemaIo::new()
                .field("height", FieldValueType::Generic)
                .field("openings", FieldValueType::EntityArray)
                .field("rooms", FieldValueType::EntityMap),
        )
        .register_class(
            "Door",
            |id| entity_ref(RecordEntity::new(id.clone(), "Door")),
            SchemaIo::new()
                .field("host", FieldValueType::Entity)
                .field("sides", FieldValueType::KeyEntityMap)
                .field("material", FieldValueType::MaterialDataField)
                .field("state", FieldValueType::StateField),
        );
    Document::new(Rc::new(registry))
}

fuzz_target!(|data: &[u8]| {
    let Ok(dump) = serde_json::from_slice::<GraphDump>(data) else {
        return;
    };
    let doc = document();
    let report = doc.load(&dump);

    // Every created entity is live and was built from a record in the dump.
    for entity in &report.created {
        let id = id_of(entity);
        assert!(doc.contains(&id), "created entity {id} not inserted");
        assert!(dump.records.contains_key(&id), "entity {id} has no record");
    }

    // Loading the same dump again reuses the live entities.
    let again = doc.load(&dump);
    assert!(again.created.is_empty(), "second load created entities");

    // Whatever was loaded can be dumped again without panicking.
    let _ = doc.dump(&report.loaded, &DumpOptions::deep());
});
