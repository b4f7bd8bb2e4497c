mod common;

use std::path::{Path, PathBuf};

use dbdeploy_core::prelude::*;
use dbdeploy_pg::PgDeploymentTarget;
use serial_test::serial;
use sqlx::PgPool;

const DATABASE: &str = "dbdeploy_it_target";
const CONFIGURATION_TYPE: &str = "Orders.Migrations.Configuration";
const CONTEXT_TYPE: &str = "Orders.OrdersContext";
const SEEDER_TYPE: &str = "Orders.Seeder";
const SCHEMA: &str = "orders";

async fn teardown(pool: &PgPool) {
    sqlx::query(&format!("DROP DATABASE IF EXISTS {DATABASE} WITH (FORCE)"))
        .execute(pool)
        .await
        .expect("Failed to drop target database");
    sqlx::query("DROP ROLE IF EXISTS dbdeploy_it_svc")
        .execute(pool)
        .await
        .expect("Failed to drop service role");
}

fn endpoint() -> DatabaseEndpoint {
    DatabaseEndpoint::new("localhost", DATABASE)
}

fn pg_target() -> PgDeploymentTarget {
    PgDeploymentTarget::new(endpoint(), common::connect_options())
}

fn context() -> ContextKeySchema {
    ContextKeySchema {
        context_key: CONFIGURATION_TYPE.to_string(),
        schema_name: SCHEMA.to_string(),
    }
}

fn write_bundle(dir: &Path, ids: &[&str]) -> PathBuf {
    std::fs::create_dir_all(dir.join("scripts")).unwrap();
    let migrations: Vec<_> = ids
        .iter()
        .map(|id| {
            std::fs::write(
                dir.join(format!("scripts/{id}_up.sql")),
                format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}; CREATE TABLE {SCHEMA}.t_{id} (id int);"),
            )
            .unwrap();
            std::fs::write(
                dir.join(format!("scripts/{id}_down.sql")),
                format!("DROP TABLE {SCHEMA}.t_{id};"),
            )
            .unwrap();
            serde_json::json!({
                "id": id,
                "namespace": "Orders.Migrations",
                "defaultSchema": SCHEMA,
                "up": format!("scripts/{id}_up.sql"),
                "down": format!("scripts/{id}_down.sql"),
            })
        })
        .collect();
    std::fs::write(
        dir.join("scripts/seed.sql"),
        format!(
            "CREATE TABLE IF NOT EXISTS {SCHEMA}.status (id int PRIMARY KEY); \
             INSERT INTO {SCHEMA}.status VALUES (1) ON CONFLICT DO NOTHING;"
        ),
    )
    .unwrap();

    let manifest = serde_json::json!({
        "name": "Orders",
        "configurations": [{
            "type": CONFIGURATION_TYPE,
            "contextType": CONTEXT_TYPE,
            "migrationsNamespace": "Orders.Migrations",
            "migrations": migrations,
        }],
        "seeders": [{ "type": SEEDER_TYPE, "scripts": ["scripts/seed.sql"] }],
    });
    let path = dir.join("bundle.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    path
}

fn config(bundle: &Path, extract_root: &Path) -> DeploymentManagerConfig {
    let mut config = DeploymentManagerConfig::new(bundle, endpoint());
    config.deployment_history_extract_path = Some(extract_root.to_path_buf());
    config.run_server_migrations_in_transaction = true;
    config.migration_config = Some(MigrationConfigurationInfo {
        type_name: CONFIGURATION_TYPE.to_string(),
        context_type: None,
    });
    config.initializer_config = Some(InitializerConfigurationInfo {
        type_name: format!("CreateSecureSeededDatabaseIfNotExists<{CONTEXT_TYPE}, {SEEDER_TYPE}>"),
        disable_forced_seeding: false,
        service_account: Some(ServiceAccountInfo {
            name: Some("dbdeploy_it_svc".to_string()),
            domain: None,
            database_user: Some("dbdeploy_it_svc".to_string()),
            database_user_password: Some("it's secret".to_string()),
            account_type: Some("Sql".to_string()),
        }),
    });
    config
}

async fn deploy(config: DeploymentManagerConfig) -> DeploymentReport {
    let target = pg_target();
    let mut manager = DeploymentManager::new(config, target.clone()).expect("Valid configuration");
    let report = manager.deploy().await.expect("Deployment should succeed");
    target.pool().close().await;
    report
}

#[tokio::test]
#[serial]
async fn test_deploy_creates_migrates_and_reverts() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;
    let workspace = tempfile::tempdir().expect("Failed to create temp dir");
    let extract = workspace.path().join("extract");

    let v2 = write_bundle(&workspace.path().join("v2"), &["001", "002"]);
    let report = deploy(config(&v2, &extract)).await;
    assert!(report.initialized);

    let target = pg_target();
    assert!(target.database_exists().await.expect("Should check database"));
    assert_eq!(
        target
            .applied_migrations(&context())
            .await
            .expect("Should list migrations"),
        vec!["001".to_string(), "002".to_string()]
    );
    let seeded: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {SCHEMA}.status"))
        .fetch_one(target.pool())
        .await
        .expect("Seed table should exist");
    assert_eq!(seeded, 1);
    target.pool().close().await;

    let v1 = write_bundle(&workspace.path().join("v1"), &["001"]);
    let report = deploy(config(&v1, &extract)).await;
    assert_eq!(
        report.migration,
        Some((MigrationSource::Deployed, "001".to_string()))
    );

    let target = pg_target();
    assert_eq!(
        target
            .applied_migrations(&context())
            .await
            .expect("Should list migrations"),
        vec!["001".to_string()]
    );
    let remaining: bool = sqlx::query_scalar(&format!("SELECT to_regclass('{SCHEMA}.t_002') IS NULL"))
        .fetch_one(target.pool())
        .await
        .expect("Should query catalog");
    assert!(remaining);
    target.pool().close().await;

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_failed_step_rolls_back_scope() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;
    let workspace = tempfile::tempdir().expect("Failed to create temp dir");
    let extract = workspace.path().join("extract");

    let v1 = write_bundle(&workspace.path().join("v1"), &["001"]);
    deploy(config(&v1, &extract)).await;

    let v2_dir = workspace.path().join("v2");
    let v2 = write_bundle(&v2_dir, &["001", "002", "003"]);
    std::fs::write(v2_dir.join("scripts/003_up.sql"), "SELECT * FROM missing_table;").unwrap();

    let target = pg_target();
    let mut manager =
        DeploymentManager::new(config(&v2, &extract), target.clone()).expect("Valid configuration");
    assert!(manager.deploy().await.is_err());

    assert_eq!(
        target
            .applied_migrations(&context())
            .await
            .expect("Should list migrations"),
        vec!["001".to_string()]
    );
    let entries = DeploymentHistory::new(target.history())
        .list(SCHEMA, None)
        .await
        .expect("Should list history");
    assert_eq!(entries.len(), 1);
    target.pool().close().await;

    teardown(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_failed_step_without_scope_applies_nothing() {
    let pool = common::get_pg_pool().await;
    teardown(&pool).await;
    let workspace = tempfile::tempdir().expect("Failed to create temp dir");
    let extract = workspace.path().join("extract");

    let v1 = write_bundle(&workspace.path().join("v1"), &["001"]);
    deploy(config(&v1, &extract)).await;

    let v2_dir = workspace.path().join("v2");
    let v2 = write_bundle(&v2_dir, &["001", "002", "003"]);
    std::fs::write(v2_dir.join("scripts/003_up.sql"), "SELECT * FROM missing_table;").unwrap();

    let mut config = config(&v2, &extract);
    config.run_server_migrations_in_transaction = false;
    let target = pg_target();
    let mut manager = DeploymentManager::new(config, target.clone()).expect("Valid configuration");
    assert!(manager.deploy().await.is_err());

    assert_eq!(
        target
            .applied_migrations(&context())
            .await
            .expect("Should list migrations"),
        vec!["001".to_string()]
    );
    let dropped: bool = sqlx::query_scalar(&format!("SELECT to_regclass('{SCHEMA}.t_002') IS NULL"))
        .fetch_one(target.pool())
        .await
        .expect("Should query catalog");
    assert!(dropped);
    target.pool().close().await;

    teardown(&pool).await;
}
