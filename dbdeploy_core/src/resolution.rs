//! Migration resolution.
//!
//! Decides, from the target bundle and the bundle currently deployed, which
//! migrator has to run and to which migration. Downward moves run the
//! deployed bundle's migrator because only it knows the down scripts of the
//! migrations being removed.

use std::sync::Arc;

use crate::bundle::{BundleError, ContextKeySchema, MigrationBundle, MigrationSource};
use crate::migrator::{BundleMigrations, INITIAL_DATABASE};

/// Errors raised while resolving the pending migration.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// The target dropped a configuration the deployed bundle does not have.
    #[error("Deployed migration missing required migration configuration {0}")]
    DeployedConfigurationMissing(String),

    /// The selected bundle has no migrations for the configuration.
    #[error("The {origin} bundle does not contain migration configuration {configuration_type}")]
    MissingMigrator {
        /// Which bundle.
        origin: MigrationSource,
        /// The configuration type.
        configuration_type: String,
    },
}

/// Migration metadata of one bundle for one configuration type.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    /// Where the bundle comes from.
    pub source: MigrationSource,
    /// The bundle.
    pub bundle: Arc<MigrationBundle>,
    /// The configuration type looked up.
    pub configuration_type: String,
    /// Context key and schema, `None` when the configuration is absent.
    pub context_key_schema: Option<ContextKeySchema>,
    /// The migrations, `None` when the configuration is absent.
    pub migrations: Option<BundleMigrations>,
}

impl MigrationInfo {
    /// Collects the metadata of `configuration_type` in `bundle`.
    pub fn new(
        bundle: Arc<MigrationBundle>,
        configuration_type: &str,
    ) -> Result<Self, BundleError> {
        let context_key_schema = bundle.context_key_schema(configuration_type)?;
        let migrations = BundleMigrations::new(bundle.clone(), configuration_type);
        Ok(Self {
            source: bundle.source(),
            bundle,
            configuration_type: configuration_type.to_string(),
            context_key_schema,
            migrations,
        })
    }

    /// The greatest migration id of the bundle for this configuration.
    pub fn last_migration(&self) -> Option<String> {
        self.migrations.as_ref().and_then(BundleMigrations::latest)
    }

    fn context_type(&self) -> Option<&str> {
        self.migrations
            .as_ref()
            .map(|migrations| migrations.configuration().context_type.as_str())
    }
}

/// The migrator to run and where to stop.
#[derive(Debug, Clone)]
pub struct MigrationExecution {
    /// Bundle metadata whose migrator runs.
    pub migration: MigrationInfo,
    /// Target id; `None` is the latest, `"0"` reverts everything.
    pub target_migration_id: Option<String>,
}

impl MigrationExecution {
    /// The migrations to run.
    pub fn migrations(&self) -> Result<&BundleMigrations, ResolutionError> {
        self.migration
            .migrations
            .as_ref()
            .ok_or_else(|| ResolutionError::MissingMigrator {
                origin: self.migration.source,
                configuration_type: self.migration.configuration_type.clone(),
            })
    }

    /// Human readable target.
    pub fn target_label(&self) -> &str {
        self.target_migration_id.as_deref().unwrap_or("LATEST")
    }
}

/// Picks the migration to execute, if any.
pub fn resolve(
    target: &MigrationInfo,
    deployed: Option<&MigrationInfo>,
) -> Result<Option<MigrationExecution>, ResolutionError> {
    if target.migrations.is_none() {
        let Some(deployed) = deployed else {
            log::warn!(
                "Migration configuration {} not found in target bundle and nothing is deployed; no migration will be performed",
                target.configuration_type
            );
            return Ok(None);
        };
        if deployed.migrations.is_none() {
            return Err(ResolutionError::DeployedConfigurationMissing(
                deployed.configuration_type.clone(),
            ));
        }
        log::info!(
            "Migration configuration {} was removed from the target bundle; reverting all of its migrations",
            target.configuration_type
        );
        return Ok(Some(MigrationExecution {
            migration: deployed.clone(),
            target_migration_id: Some(INITIAL_DATABASE.to_string()),
        }));
    }

    let matching_deployed = deployed.filter(|deployed| {
        deployed.migrations.is_some()
            && deployed.configuration_type == target.configuration_type
            && deployed.context_type() == target.context_type()
    });

    let Some(deployed) = matching_deployed else {
        log::debug!(
            "No deployed migrations for {}; advancing the target to its latest migration",
            target.configuration_type
        );
        return Ok(Some(MigrationExecution {
            migration: target.clone(),
            target_migration_id: None,
        }));
    };

    let Some(target_last) = target.last_migration() else {
        log::info!(
            "Target bundle declares no migrations for {}; nothing to migrate",
            target.configuration_type
        );
        return Ok(None);
    };
    let deployed_last = deployed.last_migration();

    match deployed_last.as_deref() {
        Some(last) if last == target_last => {
            log::info!("Database is already at migration {target_last}");
            Ok(None)
        }
        Some(last) if last > target_last.as_str() => {
            log::info!("Migrating downward from {last} to {target_last}");
            Ok(Some(MigrationExecution {
                migration: deployed.clone(),
                target_migration_id: Some(target_last),
            }))
        }
        _ => {
            log::info!(
                "Migrating upward from {} to {}",
                deployed_last.as_deref().unwrap_or(INITIAL_DATABASE),
                target_last
            );
            Ok(Some(MigrationExecution {
                migration: target.clone(),
                target_migration_id: Some(target_last),
            }))
        }
    }
}
