//! Deploys two versions of a bundle to an in-memory database and rolls the
//! second one back using the archived snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use dbdeploy::prelude::*;

const CONFIGURATION: &str = "Catalog.Migrations.Configuration";

fn write_bundle(dir: &Path, ids: &[&str]) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir.join("scripts"))?;
    let mut migrations = Vec::new();
    for id in ids {
        fs::write(dir.join(format!("scripts/{id}_up.sql")), format!("CREATE TABLE t_{id} (id int);"))?;
        fs::write(dir.join(format!("scripts/{id}_down.sql")), format!("DROP TABLE t_{id};"))?;
        migrations.push(serde_json::json!({
            "id": id,
            "namespace": "Catalog.Migrations",
            "defaultSchema": "catalog",
            "up": format!("scripts/{id}_up.sql"),
            "down": format!("scripts/{id}_down.sql"),
        }));
    }
    let manifest = serde_json::json!({
        "name": "Catalog",
        "configurations": [{
            "type": CONFIGURATION,
            "contextType": "Catalog.CatalogContext",
            "migrationsNamespace": "Catalog.Migrations",
            "migrations": migrations,
        }],
    });
    let path = dir.join("bundle.json");
    fs::write(&path, manifest.to_string())?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempfile::tempdir()?;
    let endpoint = DatabaseEndpoint::new("localhost", "catalog");
    let target = InMemoryDeploymentTarget::with_existing_database(endpoint.clone()).await;

    for (version, ids) in [("v1", &["001"][..]), ("v2", &["001", "002"][..]), ("v1-again", &["001"][..])] {
        let bundle = write_bundle(&workspace.path().join(version), ids)?;
        let mut config = DeploymentManagerConfig::new(bundle, endpoint.clone());
        config.mode = DeploymentMode::MigrationOnly;
        config.run_server_migrations_in_transaction = true;
        config.deployment_history_extract_path = Some(workspace.path().join("extract"));
        config.migration_config = Some(MigrationConfigurationInfo {
            type_name: CONFIGURATION.to_string(),
            context_type: None,
        });

        let mut manager = DeploymentManager::new(config, target.clone())?;
        let report = manager.deploy().await?;
        println!(
            "{version}: {:?} in {} steps, archived as {:?}",
            report.migration, report.migration_steps, report.deployment_id
        );
    }

    for step in target.executed_steps().await {
        println!("{step:?}");
    }
    Ok(())
}
