mod common;

use dbdeploy_core::prelude::*;
use dbdeploy_pg::PgDeploymentHistoryStore;
use serial_test::serial;
use sqlx::PgPool;

const SCHEMA: &str = "dbdeploy_it_history";

async fn teardown(pool: &PgPool) {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {SCHEMA} CASCADE"))
        .execute(pool)
        .await
        .expect("Failed to drop history schema");
}

fn record(id: &str, context_key: &str) -> DeploymentHistoryRecord {
    DeploymentHistoryRecord {
        deployment_id: id.to_string(),
        context_key: context_key.to_string(),
        assembly_file_name: "bundle.json".to_string(),
        binaries: vec![0, 1, 2, 255],
        hashes: b"abc *bundle.json\n".to_vec(),
        deployer_version: "0.1.0".to_string(),
    }
}

#[tokio::test]
#[serial]
async fn test_setup_creates_schema_and_table_once() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;
    let store = PgDeploymentHistoryStore::new(pool.clone());

    assert!(!store.table_exists(SCHEMA).await.expect("Should check table"));
    store.setup(SCHEMA).await.expect("Should set up table");
    store.setup(SCHEMA).await.expect("Should set up table again");
    assert!(store.table_exists(SCHEMA).await.expect("Should check table"));

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_latest_picks_greatest_deployment_id() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;
    let store = PgDeploymentHistoryStore::new(pool.clone());
    store.setup(SCHEMA).await.expect("Should set up table");

    for (id, context) in [
        ("20240101000000_a", "Orders"),
        ("20240301000000_c", "Billing"),
        ("20240201000000_b", "Orders"),
    ] {
        assert_eq!(
            store
                .insert(SCHEMA, &record(id, context))
                .await
                .expect("Should insert"),
            1
        );
    }

    let latest = store
        .latest(SCHEMA, "Orders")
        .await
        .expect("Should read latest")
        .expect("Orders has history");
    assert_eq!(latest, record("20240201000000_b", "Orders"));

    let entries = store.entries(SCHEMA, None).await.expect("Should list");
    let ids: Vec<&str> = entries.iter().map(|e| e.deployment_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["20240301000000_c", "20240201000000_b", "20240101000000_a"]
    );
    assert_eq!(
        store
            .entries(SCHEMA, Some("Billing"))
            .await
            .expect("Should list")
            .len(),
        1
    );
    assert!(store
        .by_id(SCHEMA, "20240101000000_a")
        .await
        .expect("Should read by id")
        .is_some());

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_archive_round_trip_through_postgres() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;
    let store = PgDeploymentHistoryStore::new(pool.clone());
    let history = DeploymentHistory::new(&store);

    let bundle_dir = tempfile::tempdir().expect("Failed to create temp dir");
    std::fs::create_dir_all(bundle_dir.path().join("scripts")).unwrap();
    std::fs::write(bundle_dir.path().join("bundle.json"), r#"{ "name": "Orders" }"#).unwrap();
    std::fs::write(bundle_dir.path().join("scripts/001_up.sql"), "SELECT 1;").unwrap();

    assert!(history
        .extract_current("Orders", SCHEMA, bundle_dir.path())
        .await
        .expect("Should look up history")
        .is_none());

    history.setup(SCHEMA).await.expect("Should set up table");
    let id = history
        .create("Orders", "0.1.0", &bundle_dir.path().join("bundle.json"), SCHEMA)
        .await
        .expect("Should archive bundle");

    let extract_root = tempfile::tempdir().expect("Failed to create temp dir");
    let manifest = history
        .extract_current("Orders", SCHEMA, extract_root.path())
        .await
        .expect("Should extract")
        .expect("History row should exist");
    assert_eq!(manifest, extract_root.path().join(&id).join("bundle.json"));
    assert_eq!(
        std::fs::read_to_string(extract_root.path().join(&id).join("scripts/001_up.sql")).unwrap(),
        "SELECT 1;"
    );

    teardown(&pool).await;
}
