//! End-to-end create / insert / query round-trips through the public
//! engine surface, including the literal scenarios:
//!
//! 1. Create schema and entity, insert two rows, `SELECT id` returns them
//!    in insertion order.
//! 2. Delete one of three rows, `COUNT(*)` reports two.
//!
//! Plus the checksum round-trip property over the committed column files.

use haredb::{
    AtomicPredicate, BooleanPredicate, ColumnDef, ComparisonOperator, Engine, EngineConfig,
    Projection, Query, QuerySource, Type, TxMode, Value,
};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> Engine {
    Engine::open(dir.path(), EngineConfig::default()).expect("failed to open engine")
}

fn create_test_entity(engine: &Engine) {
    let tx = engine.begin(TxMode::ReadWrite);
    let catalogue_tx = engine.catalogue().begin_tx(&tx).unwrap();
    let schema = catalogue_tx.create_schema("warren").unwrap();
    let schema_tx = schema.begin_tx(&tx).unwrap();
    schema_tx
        .create_entity(
            "test",
            &[
                ColumnDef::new("id", Type::String),
                ColumnDef::new("feat", Type::FloatVector(2)),
            ],
        )
        .unwrap();
    schema_tx.commit().unwrap();
    catalogue_tx.commit().unwrap();
    tx.commit().unwrap();
}

fn insert_row(engine: &Engine, id: &str, feat: [f32; 2]) {
    let tx = engine.begin(TxMode::ReadWrite);
    let (count, entity_tx) = engine
        .insert(
            &tx,
            "warren",
            "test",
            vec![vec![
                ("id".to_string(), Value::String(id.to_string())),
                ("feat".to_string(), Value::FloatVector(feat.to_vec())),
            ]],
        )
        .unwrap();
    assert_eq!(count, 1);
    entity_tx.commit().unwrap();
    tx.commit().unwrap();
}

fn select_ids(engine: &Engine) -> Vec<String> {
    let tx = engine.begin(TxMode::ReadOnly);
    let query = Query::from(QuerySource::entity("warren", "test"))
        .project(Projection::select(&["id"]));
    let stream = engine.query(&tx, &query).unwrap();
    let mut ids = Vec::new();
    for record in stream {
        let record = record.unwrap();
        match record.get("id") {
            Some(Some(Value::String(s))) => ids.push(s.clone()),
            other => panic!("unexpected id cell: {:?}", other),
        }
    }
    tx.commit().unwrap();
    ids
}

#[test]
fn create_insert_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_test_entity(&engine);

    insert_row(&engine, "a", [1.0, 0.0]);
    insert_row(&engine, "b", [0.0, 1.0]);

    assert_eq!(select_ids(&engine), vec!["a", "b"], "insertion order");
}

#[test]
fn delete_then_count() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_test_entity(&engine);

    insert_row(&engine, "a", [1.0, 0.0]);
    insert_row(&engine, "b", [0.0, 1.0]);
    insert_row(&engine, "c", [2.0, 2.0]);

    let tx = engine.begin(TxMode::ReadWrite);
    let (deleted, entity_tx) = engine
        .delete_where(
            &tx,
            "warren",
            "test",
            BooleanPredicate::Atomic(AtomicPredicate::new(
                "id",
                ComparisonOperator::Equal,
                vec![Value::String("c".into())],
            )),
        )
        .unwrap();
    assert_eq!(deleted, 1);
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin(TxMode::ReadOnly);
    let query =
        Query::from(QuerySource::entity("warren", "test")).project(Projection::count());
    let records: Vec<_> = engine
        .query(&tx, &query)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].get("count(*)"),
        Some(&Some(Value::Long(2))),
        "deleted tuples are excluded from COUNT(*)"
    );
    tx.commit().unwrap();
}

#[test]
fn data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        create_test_entity(&engine);
        insert_row(&engine, "a", [1.0, 0.0]);
        insert_row(&engine, "b", [0.0, 1.0]);
        engine.close().unwrap();
    }

    let engine = open_engine(&dir);
    assert_eq!(select_ids(&engine), vec!["a", "b"]);
}

#[test]
fn committed_column_files_validate() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_test_entity(&engine);
    insert_row(&engine, "a", [1.0, 0.0]);

    let entity = engine
        .catalogue()
        .schema("warren")
        .unwrap()
        .entity("test")
        .unwrap();
    for handle in entity.columns() {
        assert!(
            handle.file().read().validate().unwrap(),
            "checksum round-trip failed for column {}",
            handle.name()
        );
    }
}

#[test]
fn filtered_select_and_limit() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_test_entity(&engine);
    for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
        insert_row(&engine, id, [i as f32, 0.0]);
    }

    let tx = engine.begin(TxMode::ReadOnly);
    let query = Query::from(QuerySource::entity("warren", "test"))
        .filtered(BooleanPredicate::Atomic(
            AtomicPredicate::new(
                "id",
                ComparisonOperator::In,
                vec![
                    Value::String("b".into()),
                    Value::String("c".into()),
                    Value::String("d".into()),
                ],
            ),
        ))
        .project(Projection::select(&["id"]))
        .limit(2);
    let records: Vec<_> = engine
        .query(&tx, &query)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("id"), Some(&Some(Value::String("b".into()))));
    assert_eq!(records[1].get("id"), Some(&Some(Value::String("c".into()))));
    tx.commit().unwrap();
}

#[test]
fn rollback_of_create_entity_restores_schema_dir() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_test_entity(&engine);

    let schema_dir = dir.path().join("warren");
    let index_db_before = std::fs::read(schema_dir.join("index.db")).unwrap();
    let entries_before: Vec<String> = std::fs::read_dir(&schema_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();

    let tx = engine.begin(TxMode::ReadWrite);
    let schema = engine.catalogue().schema("warren").unwrap();
    let schema_tx = schema.begin_tx(&tx).unwrap();
    schema_tx
        .create_entity("doomed", &[ColumnDef::new("x", Type::Int)])
        .unwrap();
    schema_tx.rollback().unwrap();
    tx.rollback().unwrap();

    let index_db_after = std::fs::read(schema_dir.join("index.db")).unwrap();
    assert_eq!(index_db_before, index_db_after, "index.db bit-for-bit equal");
    let mut entries_after: Vec<String> = std::fs::read_dir(&schema_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries_after.retain(|e| !entries_before.contains(e));
    assert!(
        entries_after.is_empty(),
        "entity folder left behind: {:?}",
        entries_after
    );
}

#[test]
fn aggregates_over_numeric_column() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let tx = engine.begin(TxMode::ReadWrite);
    let catalogue_tx = engine.catalogue().begin_tx(&tx).unwrap();
    let schema = catalogue_tx.create_schema("warren").unwrap();
    let schema_tx = schema.begin_tx(&tx).unwrap();
    schema_tx
        .create_entity("measurements", &[ColumnDef::new("v", Type::Double)])
        .unwrap();
    schema_tx.commit().unwrap();
    catalogue_tx.commit().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin(TxMode::ReadWrite);
    let rows = [1.0, 2.0, 3.0, 10.0]
        .iter()
        .map(|v| vec![("v".to_string(), Value::Double(*v))])
        .collect();
    let (_, entity_tx) = engine.insert(&tx, "warren", "measurements", rows).unwrap();
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    let expectations = [
        (haredb::ProjectionOp::Sum, 16.0),
        (haredb::ProjectionOp::Mean, 4.0),
        (haredb::ProjectionOp::Min, 1.0),
        (haredb::ProjectionOp::Max, 10.0),
    ];
    for (op, expected) in expectations {
        let tx = engine.begin(TxMode::ReadOnly);
        let query = Query::from(QuerySource::entity("warren", "measurements"))
            .project(Projection::aggregate(op, "v"));
        let records: Vec<_> = engine
            .query(&tx, &query)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        match records[0].values().first() {
            Some(Some(Value::Double(actual))) => {
                assert!((actual - expected).abs() < 1e-9, "{:?}: {}", op, actual)
            }
            other => panic!("{:?} produced {:?}", op, other),
        }
        tx.commit().unwrap();
    }
}
