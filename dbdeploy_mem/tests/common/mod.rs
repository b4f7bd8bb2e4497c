#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use dbdeploy_core::prelude::*;
use dbdeploy_mem::InMemoryDeploymentTarget;
use serde_json::json;

pub const CONFIGURATION_TYPE: &str = "Orders.Migrations.Configuration";
pub const CONTEXT_TYPE: &str = "Orders.OrdersContext";
pub const SEEDER_TYPE: &str = "Orders.Seeder";
pub const NAMESPACE: &str = "Orders.Migrations";
pub const SCHEMA: &str = "orders";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Writes a bundle with the given migration ids under `dir` and returns the
/// manifest path.
pub fn write_bundle(dir: &Path, migration_ids: &[&str]) -> PathBuf {
    fs::create_dir_all(dir.join("scripts")).unwrap();

    let migrations: Vec<_> = migration_ids
        .iter()
        .map(|id| {
            let up = format!("scripts/{id}_up.sql");
            let down = format!("scripts/{id}_down.sql");
            fs::write(dir.join(&up), format!("CREATE TABLE t_{id} (id int);")).unwrap();
            fs::write(dir.join(&down), format!("DROP TABLE t_{id};")).unwrap();
            json!({
                "id": id,
                "namespace": NAMESPACE,
                "defaultSchema": SCHEMA,
                "up": up,
                "down": down,
            })
        })
        .collect();

    fs::write(dir.join("scripts/seed.sql"), "INSERT INTO status VALUES (1);").unwrap();

    let manifest = json!({
        "name": "Orders",
        "configurations": [{
            "type": CONFIGURATION_TYPE,
            "contextType": CONTEXT_TYPE,
            "migrationsNamespace": NAMESPACE,
            "migrations": migrations,
        }],
        "seeders": [{
            "type": SEEDER_TYPE,
            "scripts": ["scripts/seed.sql"],
        }],
    });
    let path = dir.join("bundle.json");
    fs::write(&path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    path
}

/// Writes a bundle that declares no migration configuration at all.
pub fn write_empty_bundle(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join("bundle.json");
    fs::write(&path, r#"{ "name": "Empty" }"#).unwrap();
    path
}

pub fn endpoint() -> DatabaseEndpoint {
    DatabaseEndpoint::new("localhost", "orders_db")
}

pub fn context() -> ContextKeySchema {
    ContextKeySchema {
        context_key: CONFIGURATION_TYPE.to_string(),
        schema_name: SCHEMA.to_string(),
    }
}

pub fn service_account() -> ServiceAccountInfo {
    ServiceAccountInfo {
        name: Some("orders_svc".to_string()),
        domain: None,
        database_user: Some("orders_user".to_string()),
        database_user_password: Some("secret".to_string()),
        account_type: Some("Sql".to_string()),
    }
}

pub fn config(bundle: &Path, extract_root: &Path) -> DeploymentManagerConfig {
    let mut config = DeploymentManagerConfig::new(bundle, endpoint());
    config.deployment_history_extract_path = Some(extract_root.to_path_buf());
    config.migration_config = Some(MigrationConfigurationInfo {
        type_name: CONFIGURATION_TYPE.to_string(),
        context_type: None,
    });
    config.initializer_config = Some(InitializerConfigurationInfo {
        type_name: format!("CreateSecureSeededDatabaseIfNotExists<{CONTEXT_TYPE}, {SEEDER_TYPE}>"),
        disable_forced_seeding: false,
        service_account: Some(service_account()),
    });
    config
}

pub async fn deploy(
    target: &InMemoryDeploymentTarget,
    config: DeploymentManagerConfig,
) -> Result<DeploymentReport, DeployError> {
    let mut manager = DeploymentManager::new(config, target.clone())?;
    manager.deploy().await
}
