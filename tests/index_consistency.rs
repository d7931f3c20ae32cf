//! Index behavior through the engine: unique-hash rejection (the literal
//! duplicate-key scenario), index-versus-scan answer equivalence, the
//! VA-file accelerated kNN path, and the dirty-index / optimize cycle.

use haredb::index::IndexKind;
use haredb::{
    AtomicPredicate, BooleanPredicate, ColumnDef, ComparisonOperator, DbError, Distance, Engine,
    EngineConfig, KnnPredicate, Projection, Query, QuerySource, Type, TxMode, Value,
};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> Engine {
    Engine::open(dir.path(), EngineConfig::default()).unwrap()
}

fn create_entity(engine: &Engine) {
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

fn create_index(engine: &Engine, name: &str, kind: IndexKind, column: &str) {
    let tx = engine.begin(TxMode::ReadWrite);
    let entity = engine
        .catalogue()
        .schema("warren")
        .unwrap()
        .entity("test")
        .unwrap();
    let entity_tx = entity.begin_tx(&tx).unwrap();
    entity_tx.create_index(name, kind, column).unwrap();
    entity_tx.commit().unwrap();
    tx.commit().unwrap();
}

fn insert_row(engine: &Engine, id: &str, feat: [f32; 2]) -> eyre::Result<()> {
    let tx = engine.begin(TxMode::ReadWrite);
    match engine.insert(
        &tx,
        "warren",
        "test",
        vec![vec![
            ("id".to_string(), Value::String(id.to_string())),
            ("feat".to_string(), Value::FloatVector(feat.to_vec())),
        ]],
    ) {
        Ok((_, entity_tx)) => {
            entity_tx.commit()?;
            tx.commit()?;
            Ok(())
        }
        // The engine already rolled the statement and transaction back.
        Err(e) => Err(e),
    }
}

fn insert_batch(engine: &Engine, rows: Vec<(String, [f32; 2])>) {
    let tx = engine.begin(TxMode::ReadWrite);
    let rows = rows
        .into_iter()
        .map(|(id, feat)| {
            vec![
                ("id".to_string(), Value::String(id)),
                ("feat".to_string(), Value::FloatVector(feat.to_vec())),
            ]
        })
        .collect();
    let (_, entity_tx) = engine.insert(&tx, "warren", "test", rows).unwrap();
    entity_tx.commit().unwrap();
    tx.commit().unwrap();
}

fn count_rows(engine: &Engine) -> i64 {
    let tx = engine.begin(TxMode::ReadOnly);
    let query =
        Query::from(QuerySource::entity("warren", "test")).project(Projection::count());
    let records: Vec<_> = engine
        .query(&tx, &query)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    tx.commit().unwrap();
    match records[0].values().first() {
        Some(Some(Value::Long(n))) => *n,
        other => panic!("unexpected count cell: {:?}", other),
    }
}

fn ids_query(predicate: BooleanPredicate) -> Query {
    Query::from(QuerySource::entity("warren", "test"))
        .filtered(predicate)
        .project(Projection::select(&["id"]))
}

fn ids_matching(engine: &Engine, predicate: BooleanPredicate, bypass_cache: bool) -> Vec<String> {
    let tx = engine.begin(TxMode::ReadOnly);
    let mut ids: Vec<String> = engine
        .query_with_options(&tx, &ids_query(predicate), bypass_cache)
        .unwrap()
        .map(|r| match r.unwrap().get("id") {
            Some(Some(Value::String(s))) => s.clone(),
            other => panic!("unexpected id cell: {:?}", other),
        })
        .collect();
    tx.commit().unwrap();
    ids.sort();
    ids
}

#[test]
fn duplicate_key_rejected_and_count_unchanged() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_entity(&engine);
    create_index(&engine, "id_idx", IndexKind::UniqueHash, "id");

    insert_row(&engine, "a", [1.0, 0.0]).unwrap();
    let err = insert_row(&engine, "a", [0.0, 1.0]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::TxValidation(..))
    ));

    assert_eq!(count_rows(&engine), 1, "count unchanged after rollback");
    // The index itself also rolled back: a fresh distinct insert works.
    insert_row(&engine, "b", [0.0, 1.0]).unwrap();
    assert_eq!(count_rows(&engine), 2);
}

#[test]
fn hash_index_answers_match_linear_scan() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_entity(&engine);

    // Enough rows that probing beats scanning once the index exists.
    let rows: Vec<(String, [f32; 2])> = (0..512)
        .map(|i| (format!("key{:03}", i), [i as f32, 0.0]))
        .collect();
    insert_batch(&engine, rows);

    let predicate = BooleanPredicate::Atomic(AtomicPredicate::new(
        "id",
        ComparisonOperator::In,
        vec![
            Value::String("key003".into()),
            Value::String("key017".into()),
            Value::String("no-such-key".into()),
        ],
    ));

    // Without an index: linear scan.
    let scanned = ids_matching(&engine, predicate.clone(), true);

    create_index(&engine, "id_idx", IndexKind::UniqueHash, "id");
    let plan = engine.plan(&ids_query(predicate.clone()), true).unwrap();
    assert!(
        format!("{:?}", plan).contains("IndexedFilter"),
        "hash probe must beat the scan at this size: {:?}",
        plan
    );
    let indexed = ids_matching(&engine, predicate, true);

    assert_eq!(scanned, vec!["key003", "key017"]);
    assert_eq!(scanned, indexed, "index and scan agree on the tuple set");
}

#[test]
fn hash_index_stays_consistent_through_updates_and_deletes() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_entity(&engine);
    create_index(&engine, "id_idx", IndexKind::UniqueHash, "id");

    for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
        insert_row(&engine, key, [i as f32, 0.0]).unwrap();
    }

    // Delete one, rename another.
    let tx = engine.begin(TxMode::ReadWrite);
    let (deleted, entity_tx) = engine
        .delete_where(
            &tx,
            "warren",
            "test",
            BooleanPredicate::Atomic(AtomicPredicate::new(
                "id",
                ComparisonOperator::Equal,
                vec![Value::String("b".into())],
            )),
        )
        .unwrap();
    assert_eq!(deleted, 1);
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin(TxMode::ReadWrite);
    let (updated, entity_tx) = engine
        .update_where(
            &tx,
            "warren",
            "test",
            BooleanPredicate::Atomic(AtomicPredicate::new(
                "id",
                ComparisonOperator::Equal,
                vec![Value::String("c".into())],
            )),
            vec![("id".to_string(), Some(Value::String("renamed".into())))],
        )
        .unwrap();
    assert_eq!(updated, 1);
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    for (key, expected) in [
        ("a", vec!["a".to_string()]),
        ("b", vec![]),
        ("c", vec![]),
        ("renamed", vec!["renamed".to_string()]),
    ] {
        let predicate = BooleanPredicate::Atomic(AtomicPredicate::new(
            "id",
            ComparisonOperator::Equal,
            vec![Value::String(key.into())],
        ));
        assert_eq!(
            ids_matching(&engine, predicate, true),
            expected,
            "key {}",
            key
        );
    }
}

fn knn_query_for(k: usize) -> Query {
    Query::from(QuerySource::entity("warren", "test"))
        .knn(KnnPredicate::new(
            "feat",
            k,
            Distance::L2,
            vec![vec![0.3, 0.4]],
        ))
        .project(Projection::select(&["id"]))
}

fn knn_ids(engine: &Engine, k: usize, bypass_cache: bool) -> Vec<String> {
    let tx = engine.begin(TxMode::ReadOnly);
    let ids = engine
        .query_with_options(&tx, &knn_query_for(k), bypass_cache)
        .unwrap()
        .map(|r| match r.unwrap().get("id") {
            Some(Some(Value::String(s))) => s.clone(),
            other => panic!("unexpected id cell: {:?}", other),
        })
        .collect();
    tx.commit().unwrap();
    ids
}

#[test]
fn va_file_knn_matches_fullscan() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_entity(&engine);

    let mut state = 0xB1A5u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f32 / (1u64 << 53) as f32
    };
    let rows: Vec<(String, [f32; 2])> = (0..200)
        .map(|i| (format!("v{}", i), [next(), next()]))
        .collect();
    insert_batch(&engine, rows);

    // Baseline before the index exists: always a fullscan.
    let fullscan = knn_ids(&engine, 10, true);

    create_index(&engine, "feat_idx", IndexKind::VaFile, "feat");
    let entity = engine
        .catalogue()
        .schema("warren")
        .unwrap()
        .entity("test")
        .unwrap();
    let index = entity.index("feat_idx").unwrap();
    assert!(
        !index.lock().is_dirty(),
        "creation rebuilds and trains the VA-file"
    );

    let plan = engine.plan(&knn_query_for(10), true).unwrap();
    assert!(
        format!("{:?}", plan).contains("KnnIndexed"),
        "the VA-file scan must win the cost race: {:?}",
        plan
    );
    let indexed = knn_ids(&engine, 10, true);
    assert_eq!(fullscan, indexed, "VA-SSA returns the exact neighbor set");
}

#[test]
fn out_of_range_insert_dirties_index_and_optimize_heals_it() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    create_entity(&engine);

    let rows: Vec<(String, [f32; 2])> = (0..20)
        .map(|i| (format!("v{}", i), [i as f32 / 20.0, 0.5]))
        .collect();
    insert_batch(&engine, rows);
    create_index(&engine, "feat_idx", IndexKind::VaFile, "feat");

    // Far outside the trained quantization range.
    insert_row(&engine, "outlier", [1000.0, -1000.0]).unwrap();

    let entity = engine
        .catalogue()
        .schema("warren")
        .unwrap()
        .entity("test")
        .unwrap();
    assert!(entity.index("feat_idx").unwrap().lock().is_dirty());

    // A dirty index is out of the running; the fullscan still sees the
    // outlier.
    let plan = engine.plan(&knn_query_for(21), true).unwrap();
    assert!(!format!("{:?}", plan).contains("KnnIndexed"));
    let ids = knn_ids(&engine, 21, true);
    assert!(ids.contains(&"outlier".to_string()));

    // OptimizeEntity retrains the index.
    let tx = engine.begin(TxMode::ReadWrite);
    let (rebuilt, entity_tx) = engine.optimize(&tx, "warren", "test").unwrap();
    assert_eq!(rebuilt, 1);
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    assert!(!entity.index("feat_idx").unwrap().lock().is_dirty());
    let ids = knn_ids(&engine, 21, true);
    assert!(ids.contains(&"outlier".to_string()));
}

#[test]
fn text_index_match_emits_scores() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    let tx = engine.begin(TxMode::ReadWrite);
    let catalogue_tx = engine.catalogue().begin_tx(&tx).unwrap();
    let schema = catalogue_tx.create_schema("warren").unwrap();
    let schema_tx = schema.begin_tx(&tx).unwrap();
    schema_tx
        .create_entity(
            "notes",
            &[
                ColumnDef::new("body", Type::String),
                ColumnDef::new("rank", Type::Int),
            ],
        )
        .unwrap();
    schema_tx.commit().unwrap();
    catalogue_tx.commit().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin(TxMode::ReadWrite);
    let rows = vec![
        vec![
            ("body".to_string(), Value::String("quick brown hare".into())),
            ("rank".to_string(), Value::Int(1)),
        ],
        vec![
            ("body".to_string(), Value::String("brown tortoise".into())),
            ("rank".to_string(), Value::Int(2)),
        ],
        vec![
            ("body".to_string(), Value::String("white rabbit".into())),
            ("rank".to_string(), Value::Int(3)),
        ],
    ];
    let (_, entity_tx) = engine.insert(&tx, "warren", "notes", rows).unwrap();
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    let tx = engine.begin(TxMode::ReadWrite);
    let entity = engine
        .catalogue()
        .schema("warren")
        .unwrap()
        .entity("notes")
        .unwrap();
    let entity_tx = entity.begin_tx(&tx).unwrap();
    entity_tx
        .create_index("body_idx", IndexKind::InvertedText, "body")
        .unwrap();
    entity_tx.commit().unwrap();
    tx.commit().unwrap();

    // Projecting the score column rules out every plan without the text
    // index underneath.
    let tx = engine.begin(TxMode::ReadOnly);
    let query = Query::from(QuerySource::entity("warren", "notes"))
        .filtered(BooleanPredicate::Atomic(AtomicPredicate::new(
            "body",
            ComparisonOperator::Match,
            vec![Value::String("quick brown".into())],
        )))
        .project(Projection::select(&["body", "score"]));
    let records: Vec<_> = engine
        .query_with_options(&tx, &query, true)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    tx.commit().unwrap();

    assert_eq!(records.len(), 2);
    let full = records
        .iter()
        .find(|r| matches!(r.get("body"), Some(Some(Value::String(s))) if s.contains("hare")))
        .expect("full match present");
    assert_eq!(full.get("score"), Some(&Some(Value::Double(1.0))));
    let partial = records
        .iter()
        .find(|r| matches!(r.get("body"), Some(Some(Value::String(s))) if s.contains("tortoise")))
        .expect("partial match present");
    assert_eq!(partial.get("score"), Some(&Some(Value::Double(0.5))));
}
