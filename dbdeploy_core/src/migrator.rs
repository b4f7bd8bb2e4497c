//! Migrators over bundle configurations.
//!
//! [`BundleMigrations`] is the database-independent view of one
//! configuration (the ids it knows about). [`Migrator`] binds it to a
//! [`DeploymentTarget`] and moves the database to a requested migration,
//! upward with up scripts or downward with down scripts.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::bundle::{
    context_key_schema_of, BundleError, ContextKeySchema, MigrationBundle,
    MigrationConfiguration, MigrationDefinition,
};
use crate::loader::BundleLoader;
use crate::target::DeploymentTarget;
use crate::BoxError;

/// Target id meaning "before the first migration".
pub const INITIAL_DATABASE: &str = "0";

/// Direction of a migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    /// Apply the up script.
    Up,
    /// Apply the down script.
    Down,
}

/// A resolved step, ready for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    /// The migration id.
    pub id: String,
    /// Direction of the step.
    pub direction: MigrationDirection,
    /// The SQL to run.
    pub sql: String,
}

/// Errors raised by migrators.
#[derive(Debug, thiserror::Error)]
pub enum MigratorError {
    /// The deployment target failed.
    #[error("Deployment target error: {0}")]
    Target(#[source] BoxError),

    /// A script could not be read or the bundle is inconsistent.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The requested target migration is not part of the bundle.
    #[error("The target migration '{0}' was not found in the migrations assembly")]
    UnknownMigration(String),

    /// An applied migration must be reverted but the bundle does not know it.
    #[error(
        "Applied migration '{0}' is not part of the bundle and cannot be reverted; deploy with the bundle that introduced it"
    )]
    MissingMigration(String),
}

/// The migrations of one configuration in a bundle.
#[derive(Debug, Clone)]
pub struct BundleMigrations {
    bundle: Arc<MigrationBundle>,
    configuration: MigrationConfiguration,
}

impl BundleMigrations {
    /// `None` when the bundle does not contain `configuration_type`.
    pub fn new(bundle: Arc<MigrationBundle>, configuration_type: &str) -> Option<Self> {
        let configuration = bundle.configuration(configuration_type)?.clone();
        Some(Self {
            bundle,
            configuration,
        })
    }

    /// The bundle.
    pub fn bundle(&self) -> &Arc<MigrationBundle> {
        &self.bundle
    }

    /// The configuration.
    pub fn configuration(&self) -> &MigrationConfiguration {
        &self.configuration
    }

    /// Context key and schema of the configuration.
    pub fn context_key_schema(&self) -> Result<ContextKeySchema, BundleError> {
        context_key_schema_of(self.configuration())
    }

    /// Ids known to the bundle, ascending.
    pub fn local_migrations(&self) -> Vec<String> {
        self.configuration()
            .ordered_migrations()
            .into_iter()
            .map(|migration| migration.id.clone())
            .collect()
    }

    /// The greatest id, `None` for an empty configuration.
    pub fn latest(&self) -> Option<String> {
        self.local_migrations().pop()
    }

    fn definition(&self, id: &str) -> Option<&MigrationDefinition> {
        self.configuration()
            .ordered_migrations()
            .into_iter()
            .find(|migration| migration.id == id)
    }
}

/// Computes the ordered `(id, direction)` plan moving `applied` to `target`.
///
/// `None` targets the latest local migration, [`INITIAL_DATABASE`] reverts
/// everything. Applied migrations above the target are reverted newest
/// first, then missing local migrations up to the target are applied oldest
/// first.
pub fn plan_update(
    local: &[String],
    applied: &[String],
    target: Option<&str>,
) -> Result<Vec<(String, MigrationDirection)>, MigratorError> {
    let target = match target {
        None => match local.last() {
            Some(latest) => Some(latest.as_str()),
            None => return Ok(Vec::new()),
        },
        Some(INITIAL_DATABASE) => None,
        Some(id) => {
            if !local.iter().any(|local_id| local_id == id) {
                return Err(MigratorError::UnknownMigration(id.to_string()));
            }
            Some(id)
        }
    };

    let applied_set: BTreeSet<&str> = applied.iter().map(String::as_str).collect();
    let mut plan = Vec::new();

    for id in applied_set.iter().rev() {
        if target.is_none_or(|target| *id > target) {
            plan.push((id.to_string(), MigrationDirection::Down));
        }
    }

    if let Some(target) = target {
        for id in local {
            if id.as_str() <= target && !applied_set.contains(id.as_str()) {
                plan.push((id.clone(), MigrationDirection::Up));
            }
        }
    }

    Ok(plan)
}

/// A migrator bound to a database.
#[derive(Debug)]
pub struct Migrator<'a, T: DeploymentTarget> {
    migrations: BundleMigrations,
    loader: &'a BundleLoader,
    target: &'a T,
    context: ContextKeySchema,
}

impl<'a, T: DeploymentTarget> Migrator<'a, T> {
    /// Binds `migrations` to `target`; scripts are read through `loader`.
    pub fn new(
        migrations: BundleMigrations,
        loader: &'a BundleLoader,
        target: &'a T,
    ) -> Result<Self, MigratorError> {
        let context = migrations.context_key_schema()?;
        Ok(Self {
            migrations,
            loader,
            target,
            context,
        })
    }

    /// The context this migrator updates.
    pub fn context(&self) -> &ContextKeySchema {
        &self.context
    }

    /// Ids known to the bundle, ascending.
    pub fn local_migrations(&self) -> Vec<String> {
        self.migrations.local_migrations()
    }

    /// Ids applied to the database, ascending.
    pub async fn database_migrations(&self) -> Result<Vec<String>, MigratorError> {
        self.target
            .applied_migrations(&self.context)
            .await
            .map_err(|e| MigratorError::Target(Box::new(e)))
    }

    /// Local ids not yet applied, ascending.
    pub async fn pending_migrations(&self) -> Result<Vec<String>, MigratorError> {
        let applied: BTreeSet<String> = self.database_migrations().await?.into_iter().collect();
        Ok(self
            .local_migrations()
            .into_iter()
            .filter(|id| !applied.contains(id))
            .collect())
    }

    /// Moves the database to `target_migration` (`None` for latest).
    ///
    /// Returns the number of executed steps.
    pub async fn update(
        &self,
        target_migration: Option<&str>,
        scope: Option<&mut T::Scope>,
    ) -> Result<usize, MigratorError> {
        let applied = self.database_migrations().await?;
        let plan = plan_update(&self.local_migrations(), &applied, target_migration)?;
        if plan.is_empty() {
            log::info!(
                "Context {} is already at {}",
                self.context.context_key,
                target_migration.unwrap_or("latest")
            );
            return Ok(0);
        }

        let source = self.migrations.bundle().source();
        let mut steps = Vec::with_capacity(plan.len());
        for (id, direction) in plan {
            let definition = self
                .migrations
                .definition(&id)
                .ok_or_else(|| MigratorError::MissingMigration(id.clone()))?;
            let script = match direction {
                MigrationDirection::Up => &definition.up,
                MigrationDirection::Down => &definition.down,
            };
            let sql = self.loader.read_script(source, script)?;
            log::debug!("Planned {:?} step for migration {}", direction, id);
            steps.push(MigrationStep { id, direction, sql });
        }

        log::info!(
            "Applying {} migration steps to context {} in schema {}",
            steps.len(),
            self.context.context_key,
            self.context.schema_name
        );
        self.target
            .apply_migrations(&self.context, &steps, scope)
            .await
            .map_err(|e| MigratorError::Target(Box::new(e)))?;
        Ok(steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn plan(
        local: &[&str],
        applied: &[&str],
        target: Option<&str>,
    ) -> Vec<(String, MigrationDirection)> {
        plan_update(&ids(local), &ids(applied), target).unwrap()
    }

    #[test]
    fn latest_applies_pending_in_order() {
        assert_eq!(
            plan(&["001", "002", "003"], &["001"], None),
            vec![
                ("002".to_string(), MigrationDirection::Up),
                ("003".to_string(), MigrationDirection::Up),
            ]
        );
    }

    #[test]
    fn up_to_date_database_needs_no_steps() {
        assert!(plan(&["001", "002"], &["001", "002"], None).is_empty());
        assert!(plan(&[], &[], None).is_empty());
    }

    #[test]
    fn downward_target_reverts_newest_first() {
        assert_eq!(
            plan(&["001", "002", "003"], &["001", "002", "003"], Some("001")),
            vec![
                ("003".to_string(), MigrationDirection::Down),
                ("002".to_string(), MigrationDirection::Down),
            ]
        );
    }

    #[test]
    fn initial_database_reverts_everything() {
        assert_eq!(
            plan(&["001", "002"], &["001", "002"], Some(INITIAL_DATABASE)),
            vec![
                ("002".to_string(), MigrationDirection::Down),
                ("001".to_string(), MigrationDirection::Down),
            ]
        );
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = plan_update(&ids(&["001"]), &[], Some("009")).unwrap_err();
        assert!(matches!(err, MigratorError::UnknownMigration(id) if id == "009"));
    }

    #[test]
    fn empty_bundle_leaves_database_untouched() {
        assert!(plan(&[], &["001"], None).is_empty());
    }

    #[test]
    fn missing_intermediate_migration_is_applied() {
        assert_eq!(
            plan(&["001", "002", "003"], &["001", "003"], None),
            vec![("002".to_string(), MigrationDirection::Up)]
        );
    }
}
