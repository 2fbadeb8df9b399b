use std::sync::Arc;

use kura_db::{
    copy_db_resources, init_db_with_schemas, within_tx, CachedTransaction, CacheStats, Db, DbError, FileDb,
    IsolationLevel, Paginator, Resource, ResourceState, SqlDb, Transaction, TxOptions, ViewOptions,
};
use kura_filter::{matches, Filter};
use kura_schema::{Manager, Schema};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn manager() -> Arc<Manager> {
    let mut m = Manager::new();
    m.load_value(
        &json!({"schemas": [
            {"id": "network", "plural": "networks",
             "schema": {"properties": {"name": {"type": "string"}, "tenant_id": {"type": "string"}}}},
            {"id": "subnet", "plural": "subnets", "parent": "network",
             "schema": {"properties": {"network_id": {"type": "string", "relation": "network",
                                                      "relation_property": "network"},
                                       "cidr": {"type": "string"}}}},
            {"id": "service", "plural": "services", "metadata": {"state_versioning": true},
             "schema": {"properties": {"name": {"type": "string"}}}},
            {"id": "thing", "plural": "things",
             "schema": {"properties": {"a": {"type": "integer"}, "b": {"type": "boolean"},
                                       "c": {"type": "string"}, "tags": {"type": "array"}}}}
        ]}),
        std::path::Path::new("."),
    )
    .unwrap();
    Arc::new(m)
}

async fn setup() -> (TempDir, Arc<Manager>, SqlDb) {
    let dir = tempfile::tempdir().unwrap();
    let m = manager();
    let path = dir.path().join("test.db");
    let db = SqlDb::connect(Arc::clone(&m), path.to_str().unwrap(), 4).await.unwrap();
    init_db_with_schemas(&db, &m, true, false, false).await.unwrap();
    (dir, m, db)
}

fn data(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

#[tokio::test]
async fn state_versioning_tracks_updates() {
    let (_dir, m, db) = setup().await;
    let service = m.schema("service").unwrap();
    let by_id = Filter::eq("id", json!("s1"));

    let tx = db.begin().await.unwrap();
    let mut res = Resource::new(Arc::clone(&service), data(json!({"id": "s1", "name": "svc"})));
    tx.create(&res).await.unwrap();
    let state = tx.state_fetch(&service, &by_id).await.unwrap();
    assert_eq!((state.config_version, state.state_version), (1, 0));

    res.data_mut().insert("name".into(), json!("renamed"));
    tx.update(&res).await.unwrap();
    assert_eq!(tx.state_fetch(&service, &by_id).await.unwrap().config_version, 2);

    let new_state = ResourceState {
        state_version: 5,
        state: "active".into(),
        ..Default::default()
    };
    tx.state_update(&res, Some(&new_state)).await.unwrap();
    let state = tx.state_fetch(&service, &by_id).await.unwrap();
    assert_eq!(state.config_version, 2);
    assert_eq!(state.state_version, 5);
    assert_eq!(state.state, "active");
    assert_eq!(state.error, "");
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn sql_and_memory_filters_agree() {
    let (_dir, m, db) = setup().await;
    let thing = m.schema("thing").unwrap();
    let tx = db.begin().await.unwrap();
    let rows = [
        json!({"id": "t1", "a": 1, "b": false, "c": "x", "tags": ["p"]}),
        json!({"id": "t2", "a": 2, "b": false, "c": "x", "tags": []}),
        json!({"id": "t3", "a": 1, "b": true, "c": null, "tags": null}),
        json!({"id": "t4", "a": 3, "b": true, "c": "1.0", "tags": null}),
    ];
    for row in &rows {
        tx.create(&Resource::new(Arc::clone(&thing), data(row.clone()))).await.unwrap();
    }

    let filters = [
        json!({"__and__": [
            {"__or__": [{"property": "a", "type": "eq", "value": 1}, {"__bool__": false}]},
            {"__or__": [{"property": "c", "type": "eq", "value": ["z", "y", "x"]}, {"__bool__": true}]}
        ]}),
        json!({"__or__": []}),
        json!({"__and__": []}),
        json!({"__bool__": true}),
        json!({"property": "b", "type": "eq", "value": "false"}),
        json!({"property": "c", "type": "neq", "value": "x"}),
        json!({"property": "c", "type": "eq", "value": {"__substring__": "X"}}),
        json!({"a": [2, 3]}),
        json!({"c": 1}),
        json!({"c": "1.0"}),
        json!({"a": "3"}),
        json!({"property": "b", "type": "eq", "value": {"__substring__": "tru"}}),
        json!({"property": "b", "type": "eq", "value": {"__substring__": "1"}}),
    ];
    for raw in filters {
        let filter = Filter::from_value(&raw).unwrap();
        let (found, _) = tx.list(&thing, &filter, None, None).await.unwrap();
        let mut sql_ids: Vec<String> = found.iter().map(|r| r.id().to_string()).collect();
        sql_ids.sort();
        let mut mem_ids: Vec<String> = rows
            .iter()
            .filter(|r| matches(&filter, r.as_object().unwrap()))
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        mem_ids.sort();
        assert_eq!(sql_ids, mem_ids, "filter {raw}");
    }

    let t1 = tx.fetch(&thing, &Filter::eq("id", json!("t1")), None).await.unwrap();
    assert_eq!(t1.get("a"), Some(&json!(1)));
    assert_eq!(t1.get("b"), Some(&json!(false)));
    assert_eq!(t1.get("tags"), Some(&json!(["p"])));
    tx.close().await.unwrap();
}

#[tokio::test]
async fn pagination_counts_total() {
    let (_dir, m, db) = setup().await;
    let network = m.schema("network").unwrap();
    let tx = db.begin().await.unwrap();
    for i in 0..5 {
        tx.create(&Resource::new(
            Arc::clone(&network),
            data(json!({"id": format!("n{i}"), "name": format!("net{i}"), "tenant_id": "t"})),
        ))
        .await
        .unwrap();
    }
    let pg = Paginator::new(&network, "name", "desc", 2, 1).unwrap();
    let (rows, total) = tx.list(&network, &Filter::all(), None, Some(&pg)).await.unwrap();
    assert_eq!(total, 5);
    let names: Vec<&Value> = rows.iter().map(|r| r.get("name").unwrap()).collect();
    assert_eq!(names, vec![&json!("net3"), &json!("net2")]);

    let unlimited = Paginator::new(&network, "id", "asc", 0, 0).unwrap();
    assert_eq!(tx.list(&network, &Filter::all(), None, Some(&unlimited)).await.unwrap().0.len(), 5);
    let beyond = Paginator::new(&network, "id", "asc", 0, 10).unwrap();
    let (rows, total) = tx.list(&network, &Filter::all(), None, Some(&beyond)).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 5);
    tx.close().await.unwrap();
}

#[tokio::test]
async fn joins_nest_related_rows_and_fk_is_enforced() {
    let (_dir, m, db) = setup().await;
    let network = m.schema("network").unwrap();
    let subnet = m.schema("subnet").unwrap();
    let tx = db.begin().await.unwrap();
    tx.create(&Resource::new(Arc::clone(&network), data(json!({"id": "n1", "name": "net", "tenant_id": "t"}))))
        .await
        .unwrap();
    tx.create(&Resource::new(Arc::clone(&subnet), data(json!({"id": "s1", "network_id": "n1", "cidr": "10.0.0.0/24"}))))
        .await
        .unwrap();

    let s1 = tx.fetch(&subnet, &Filter::eq("network_id", json!("n1")), None).await.unwrap();
    assert_eq!(s1.get("network").unwrap()["name"], json!("net"));

    let plain = ViewOptions {
        join: false,
        ..Default::default()
    };
    let s1 = tx.fetch(&subnet, &Filter::all(), Some(&plain)).await.unwrap();
    assert!(s1.get("network").is_none());

    let orphan = Resource::new(Arc::clone(&subnet), data(json!({"id": "s2", "network_id": "missing"})));
    assert!(matches!(tx.create(&orphan).await, Err(DbError::ForeignKey(_))));
    assert!(matches!(tx.delete(&network, "missing").await, Err(DbError::NotFound(_))));
    tx.close().await.unwrap();
}

#[tokio::test]
async fn close_rolls_back_and_commit_twice_fails() {
    let (_dir, m, db) = setup().await;
    let network = m.schema("network").unwrap();
    let tx = db.begin().await.unwrap();
    tx.create(&Resource::new(Arc::clone(&network), data(json!({"id": "n1", "tenant_id": "t"}))))
        .await
        .unwrap();
    tx.close().await.unwrap();
    assert!(tx.closed());
    tx.close().await.unwrap();
    assert!(matches!(tx.commit().await, Err(DbError::Closed)));

    let tx = db.begin().await.unwrap();
    assert!(tx.list(&network, &Filter::all(), None, None).await.unwrap().0.is_empty());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn cached_transaction_counts_hits_and_misses() {
    let (_dir, m, db) = setup().await;
    let network = m.schema("network").unwrap();
    let tx = db.begin_tx(&TxOptions::new(IsolationLevel::Serializable)).await.unwrap();
    let cached = CachedTransaction::new(tx);

    cached.list(&network, &Filter::all(), None, None).await.unwrap();
    cached.list(&network, &Filter::all(), None, None).await.unwrap();
    assert_eq!(cached.stats().await, CacheStats { hit: 1, miss: 1, ..Default::default() });

    cached
        .create(&Resource::new(Arc::clone(&network), data(json!({"id": "n1", "tenant_id": "t"}))))
        .await
        .unwrap();
    let (rows, _) = cached.list(&network, &Filter::all(), None, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    let stats = cached.stats().await;
    assert_eq!((stats.hit, stats.miss), (1, 2));

    use kura_schema::LockPolicy;
    cached
        .lock_list(&network, &Filter::all(), None, None, LockPolicy::LockRelatedResources)
        .await
        .unwrap();
    cached
        .lock_list(&network, &Filter::all(), None, None, LockPolicy::SkipRelatedResources)
        .await
        .unwrap();
    let stats = cached.stats().await;
    assert_eq!((stats.not_locked, stats.hit_lock), (1, 1));
    assert!(kura_db::metrics::cache_count("network", "miss") >= 2);
    cached.close().await.unwrap();
}

#[tokio::test]
async fn cached_transaction_writes_force_next_list_to_miss() {
    let (_dir, m, db) = setup().await;
    let service = m.schema("service").unwrap();
    let tx = db.begin_tx(&TxOptions::new(IsolationLevel::Serializable)).await.unwrap();
    let cached = CachedTransaction::new(tx);
    let mut res = Resource::new(Arc::clone(&service), data(json!({"id": "s1", "name": "svc"})));
    cached.create(&res).await.unwrap();

    cached.list(&service, &Filter::all(), None, None).await.unwrap();
    cached.list(&service, &Filter::all(), None, None).await.unwrap();
    assert_eq!(cached.stats().await.miss, 1);

    res.data_mut().insert("name".into(), json!("renamed"));
    cached.update(&res).await.unwrap();
    let (rows, _) = cached.list(&service, &Filter::all(), None, None).await.unwrap();
    assert_eq!(rows[0].data()["name"], json!("renamed"));
    assert_eq!(cached.stats().await.miss, 2, "update");

    let state = ResourceState {
        state_version: 1,
        state: "up".into(),
        ..Default::default()
    };
    cached.state_update(&res, Some(&state)).await.unwrap();
    cached.list(&service, &Filter::all(), None, None).await.unwrap();
    assert_eq!(cached.stats().await.miss, 3, "state_update");

    cached.query(&service, "SELECT * FROM services", &[]).await.unwrap();
    cached.list(&service, &Filter::all(), None, None).await.unwrap();
    assert_eq!(cached.stats().await.miss, 4, "query");

    cached.delete(&service, "s1").await.unwrap();
    let (rows, total) = cached.list(&service, &Filter::all(), None, None).await.unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
    assert_eq!(cached.stats().await.miss, 5, "delete");

    // only the warm-up read was served from cache
    assert_eq!(cached.stats().await.hit, 1);
    cached.close().await.unwrap();
}

#[tokio::test]
async fn within_tx_commits_on_success() {
    let (_dir, m, db) = setup().await;
    let network = m.schema("network").unwrap();
    let schema = Arc::clone(&network);
    let created: Result<(), DbError> = within_tx(&db, &TxOptions::default(), |tx| {
        let schema = Arc::clone(&schema);
        async move {
            tx.create(&Resource::new(schema, data(json!({"id": "n1", "tenant_id": "t"})))).await
        }
    })
    .await;
    created.unwrap();

    let failed: Result<(), DbError> = within_tx(&db, &TxOptions::default(), |tx| {
        let schema = Arc::clone(&schema);
        async move {
            tx.create(&Resource::new(schema, data(json!({"id": "n2", "tenant_id": "t"})))).await?;
            Err(DbError::Other("abort".into()))
        }
    })
    .await;
    assert!(failed.is_err());

    let tx = db.begin().await.unwrap();
    let (rows, _) = tx.list(&network, &Filter::all(), None, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    tx.close().await.unwrap();
}

#[tokio::test]
async fn copy_moves_rows_between_backends() {
    let (dir, m, db) = setup().await;
    let network = m.schema("network").unwrap();
    let subnet = m.schema("subnet").unwrap();
    let tx = db.begin().await.unwrap();
    tx.create(&Resource::new(Arc::clone(&network), data(json!({"id": "n1", "name": "a", "tenant_id": "t"}))))
        .await
        .unwrap();
    tx.create(&Resource::new(Arc::clone(&subnet), data(json!({"id": "s1", "network_id": "n1"}))))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let file = FileDb::new(dir.path().join("copy.yaml"));
    init_db_with_schemas(&file, &m, false, false, false).await.unwrap();
    assert_eq!(copy_db_resources(&db, &file, &m, false).await.unwrap(), 2);
    assert_eq!(copy_db_resources(&db, &file, &m, false).await.unwrap(), 0);

    let tx = file.begin().await.unwrap();
    let s1 = tx.fetch(&subnet, &Filter::eq("id", json!("s1")), None).await.unwrap();
    assert_eq!(s1.get("network_id"), Some(&json!("n1")));
    tx.close().await.unwrap();
}

#[tokio::test]
async fn register_twice_reports_existing_table() {
    let (_dir, m, db) = setup().await;
    let network: Arc<Schema> = m.schema("network").unwrap();
    assert!(matches!(db.register_table(&network, false, false).await, Err(DbError::TableExists(_))));
    db.register_table(&network, false, true).await.unwrap();
    init_db_with_schemas(&db, &m, false, false, false).await.unwrap();
}
