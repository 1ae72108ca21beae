//! End-to-end behaviour of `MemoryStore` through the `ObjectStore` seam.

use cmload_schema::{Cardinality, ClassId, FieldId, ObjectId};
use cmload_store::{
    MemoryStore, MultilingualWrite, NewObject, ObjectStore, OwnerAssignment, ReferenceWrite,
    ScalarValue, ScalarWrite,
};
use uuid::Uuid;

fn populated() -> (MemoryStore, Uuid) {
    let mut store = MemoryStore::new();
    let guid = Uuid::new_v4();
    store
        .create_objects(&[
            NewObject {
                id: ObjectId::new(1),
                class: ClassId::new(100),
                guid,
            },
            NewObject {
                id: ObjectId::new(2),
                class: ClassId::new(101),
                guid: Uuid::new_v4(),
            },
            NewObject {
                id: ObjectId::new(3),
                class: ClassId::new(101),
                guid: Uuid::new_v4(),
            },
        ])
        .unwrap();
    store
        .set_owners(&[
            OwnerAssignment {
                child: ObjectId::new(2),
                owner: ObjectId::new(1),
                field: FieldId::new(100002),
                kind: Cardinality::Sequence,
                ord: Some(1),
            },
            OwnerAssignment {
                child: ObjectId::new(3),
                owner: ObjectId::new(1),
                field: FieldId::new(100002),
                kind: Cardinality::Sequence,
                ord: Some(2),
            },
        ])
        .unwrap();
    store
        .set_scalar_field(&ScalarWrite {
            object: ObjectId::new(1),
            field: FieldId::new(100001),
            value: ScalarValue::Integer(5),
        })
        .unwrap();
    (store, guid)
}

#[test]
fn snapshot_round_trips_through_a_file() {
    let (store, guid) = populated();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.bin");
    store.save(&path).unwrap();

    let loaded = MemoryStore::load(&path).unwrap();
    assert_eq!(loaded.object_count(), 3);
    assert_eq!(loaded.lookup_guid(&guid), Some(ObjectId::new(1)));
    assert_eq!(
        loaded.owned_objects(ObjectId::new(1), FieldId::new(100002)),
        vec![ObjectId::new(2), ObjectId::new(3)]
    );
    assert_eq!(
        loaded
            .scalar(ObjectId::new(1), FieldId::new(100001))
            .and_then(|v| v.as_integer()),
        Some(5)
    );
    // Counters are per-process and do not travel with the snapshot.
    assert_eq!(loaded.stats().creates, 0);
}

#[test]
fn open_missing_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::open(&dir.path().join("absent.bin")).unwrap();
    assert_eq!(store.object_count(), 0);
    assert_eq!(store.max_object_id(), ObjectId::new(0));
}

#[test]
fn corrupt_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.bin");
    std::fs::write(&path, b"not a snapshot").unwrap();
    assert!(MemoryStore::load(&path).is_err());
}

#[test]
fn empty_multilingual_text_removes_the_alternative() {
    let (mut store, _) = populated();
    let ws = ObjectId::new(3);
    let write = |text: &str| MultilingualWrite {
        object: ObjectId::new(2),
        field: FieldId::new(101001),
        ws,
        text: text.to_string(),
        fmt: None,
    };
    store.set_multilingual_field(&write("bolt")).unwrap();
    assert_eq!(
        store
            .multilingual(ObjectId::new(2), FieldId::new(101001), ws)
            .map(|t| t.text),
        Some("bolt".to_string())
    );
    store.set_multilingual_field(&write("")).unwrap();
    assert!(store
        .multilingual_all(ObjectId::new(2), FieldId::new(101001))
        .is_empty());
}

#[test]
fn reference_sequences_keep_explicit_order() {
    let (mut store, _) = populated();
    let field = FieldId::new(100009);
    let rows = [
        ReferenceWrite {
            source: ObjectId::new(1),
            field,
            target: ObjectId::new(3),
            ord: Some(2),
        },
        ReferenceWrite {
            source: ObjectId::new(1),
            field,
            target: ObjectId::new(2),
            ord: Some(1),
        },
    ];
    let statuses = store
        .insert_references(Cardinality::Sequence, &rows)
        .unwrap();
    assert!(statuses.iter().all(|s| s.is_ok()));
    let targets: Vec<ObjectId> = store
        .references(ObjectId::new(1), field)
        .into_iter()
        .map(|r| r.target)
        .collect();
    assert_eq!(targets, vec![ObjectId::new(2), ObjectId::new(3)]);

    let clash = store
        .insert_references(Cardinality::Sequence, &rows[..1])
        .unwrap();
    assert!(!clash[0].is_ok());
}

#[test]
fn clear_field_and_remove_reference() {
    let (mut store, _) = populated();
    let field = FieldId::new(100010);
    store
        .insert_references(
            Cardinality::Collection,
            &[
                ReferenceWrite {
                    source: ObjectId::new(1),
                    field,
                    target: ObjectId::new(2),
                    ord: None,
                },
                ReferenceWrite {
                    source: ObjectId::new(1),
                    field,
                    target: ObjectId::new(2),
                    ord: None,
                },
            ],
        )
        .unwrap();
    assert_eq!(store.references(ObjectId::new(1), field).len(), 1);
    assert!(store
        .remove_reference(ObjectId::new(1), field, ObjectId::new(2))
        .unwrap());
    assert!(!store
        .remove_reference(ObjectId::new(1), field, ObjectId::new(2))
        .unwrap());

    store
        .clear_field(ObjectId::new(1), FieldId::new(100001))
        .unwrap();
    assert!(store
        .scalar(ObjectId::new(1), FieldId::new(100001))
        .is_none());
    assert_eq!(store.stats().field_clears, 1);
}

#[test]
fn writes_against_missing_objects_fail_per_row() {
    let (mut store, _) = populated();
    let statuses = store
        .set_scalar_fields(&[
            ScalarWrite {
                object: ObjectId::new(42),
                field: FieldId::new(100001),
                value: ScalarValue::Integer(1),
            },
            ScalarWrite {
                object: ObjectId::new(1),
                field: FieldId::new(100001),
                value: ScalarValue::Integer(7),
            },
        ])
        .unwrap();
    assert!(!statuses[0].is_ok());
    assert!(statuses[1].is_ok());
}
