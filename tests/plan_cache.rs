//! Planner behavior: plan-cache identity on repeated queries, the bypass
//! flag, and the planner-idempotence property (replanning a selected
//! plan's logical form finds a tree of identical total cost).

use haredb::query::{bind, Projection, ProjectionOp};
use haredb::{
    AtomicPredicate, BooleanPredicate, ColumnDef, ComparisonOperator, Distance, Engine,
    EngineConfig, KnnPredicate, Query, QuerySource, Type, TxMode, Value,
};
use std::sync::Arc;
use tempfile::TempDir;

fn engine_with_data(dir: &TempDir) -> Engine {
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
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

    let tx = engine.begin(TxMode::ReadWrite);
    let rows = (0..16)
        .map(|i| {
            vec![
                ("id".to_string(), Value::String(format!("k{}", i))),
                (
                    "feat".to_string(),
                    Value::FloatVector(vec![i as f32, (16 - i) as f32]),
                ),
            ]
        })
        .collect();
    let (_, entity_tx) = engine.insert(&tx, "warren", "test", rows).unwrap();
    entity_tx.commit().unwrap();
    tx.commit().unwrap();
    engine
}

fn sample_query() -> Query {
    Query::from(QuerySource::entity("warren", "test"))
        .filtered(BooleanPredicate::Atomic(AtomicPredicate::new(
            "id",
            ComparisonOperator::Equal,
            vec![Value::String("k3".into())],
        )))
        .project(Projection::select(&["id"]))
}

#[test]
fn repeated_query_returns_identical_plan_object() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_data(&dir);

    let first = engine.plan(&sample_query(), false).unwrap();
    let second = engine.plan(&sample_query(), false).unwrap();
    assert!(
        Arc::ptr_eq(&first, &second),
        "cache hit must return the installed plan object"
    );
}

#[test]
fn bypass_flag_produces_a_fresh_plan() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_data(&dir);

    let cached = engine.plan(&sample_query(), false).unwrap();
    let fresh = engine.plan(&sample_query(), true).unwrap();
    assert!(
        !Arc::ptr_eq(&cached, &fresh),
        "bypass must not consult the cache"
    );
    assert_eq!(*cached, *fresh, "both selections agree structurally");
}

#[test]
fn different_bind_values_hit_different_cache_slots() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_data(&dir);

    let q1 = sample_query();
    let mut q2 = sample_query();
    q2.filter = Some(BooleanPredicate::Atomic(AtomicPredicate::new(
        "id",
        ComparisonOperator::Equal,
        vec![Value::String("k9".into())],
    )));

    let p1 = engine.plan(&q1, false).unwrap();
    let p2 = engine.plan(&q2, false).unwrap();
    assert!(!Arc::ptr_eq(&p1, &p2));
}

#[test]
fn planner_is_idempotent_on_total_cost() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_data(&dir);
    let entity = engine
        .catalogue()
        .schema("warren")
        .unwrap()
        .entity("test")
        .unwrap();

    let queries = [
        sample_query(),
        Query::from(QuerySource::entity("warren", "test"))
            .knn(KnnPredicate::new(
                "feat",
                3,
                Distance::L2,
                vec![vec![1.0, 1.0]],
            ))
            .project(Projection::select(&["id"])),
        Query::from(QuerySource::entity("warren", "test")).project(Projection {
            op: ProjectionOp::Count,
            columns: Vec::new(),
        }),
    ];

    for query in queries {
        let selected = engine.plan(&query, true).unwrap();
        let cost = selected.total_cost(&entity).total();

        let relogical = selected.to_logical();
        let candidates = engine.planner().plan(&relogical, &entity).unwrap();
        assert!(
            candidates
                .iter()
                .any(|c| (c.total_cost(&entity).total() - cost).abs() < 1e-6),
            "replanning must reach a tree with the same total cost"
        );
    }
}

#[test]
fn binder_rejects_unknown_objects_without_state_changes() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with_data(&dir);

    let bad_schema = Query::from(QuerySource::entity("burrow", "test"));
    let err = bind(&bad_schema, engine.catalogue()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<haredb::DbError>(),
        Some(haredb::DbError::SchemaDoesNotExist(_))
    ));

    let bad_entity = Query::from(QuerySource::entity("warren", "nest"));
    let err = bind(&bad_entity, engine.catalogue()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<haredb::DbError>(),
        Some(haredb::DbError::EntityDoesNotExist(_))
    ));

    let bad_column = Query::from(QuerySource::entity("warren", "test"))
        .project(Projection::select(&["missing"]));
    let err = bind(&bad_column, engine.catalogue()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<haredb::DbError>(),
        Some(haredb::DbError::ColumnDoesNotExist(_))
    ));

    let bad_knn = Query::from(QuerySource::entity("warren", "test")).knn(KnnPredicate::new(
        "id",
        1,
        Distance::L2,
        vec![vec![1.0, 0.0]],
    ));
    let err = bind(&bad_knn, engine.catalogue()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<haredb::DbError>(),
        Some(haredb::DbError::QueryBind(_))
    ));
}
