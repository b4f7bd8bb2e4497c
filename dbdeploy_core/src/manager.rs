//! The deployment manager.
//!
//! One [`DeploymentManager::deploy`] call:
//!
//! 1. loads the target bundle and, when migrating, the deployed one (from an
//!    explicit override or from the database's deployment history);
//! 2. resolves the pending migration;
//! 3. initializes the database if no version of the context was ever
//!    deployed;
//! 4. applies the pending migration, optionally inside one transaction
//!    scope, and archives the target bundle in the deployment history;
//! 5. seeds, unless initialization already did.
//!
//! History rows are written on their own connection, outside the migration
//! scope. A failed scope commit after a successful history write leaves an
//! orphaned history row behind.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bundle::{BundleError, ContextKeySchema, MigrationBundle, MigrationSource};
use crate::config::{ConfigError, DeploymentManagerConfig, DeploymentMode};
use crate::history::{DeploymentHistory, HistoryError};
use crate::initializer::{
    DatabaseInitializer, InitializerDescriptor, InitializerError, InitializerRegistry,
    ServiceAccount,
};
use crate::loader::BundleLoader;
use crate::migrator::{BundleMigrations, Migrator, MigratorError};
use crate::resolution::{self, MigrationExecution, MigrationInfo, ResolutionError};
use crate::target::DeploymentTarget;
use crate::BoxError;

/// Errors raised by a deployment.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The target bundle could not be loaded.
    #[error("Unable to load target bundle {path}: {source}")]
    TargetBundle {
        /// Manifest path.
        path: PathBuf,
        /// The load error.
        #[source]
        source: BundleError,
    },

    /// A bundle is inconsistent.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The initializer could not be resolved.
    #[error(transparent)]
    Initializer(#[from] InitializerError),

    /// Migration resolution failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A migrator failed.
    #[error(transparent)]
    Migrator(#[from] MigratorError),

    /// The deployment history failed.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// The deployment target failed.
    #[error("Deployment target error: {0}")]
    Target(#[source] BoxError),

    /// The seeder named by the initializer is not declared by the bundle.
    #[error("Seeder {0} is not declared by the target bundle")]
    UnknownSeeder(String),
}

impl DeployError {
    fn target<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        DeployError::Target(Box::new(error))
    }
}

/// What a deployment did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentReport {
    /// The initializer ran.
    pub initialized: bool,
    /// Source and target of the executed migration.
    pub migration: Option<(MigrationSource, String)>,
    /// Number of executed migration steps.
    pub migration_steps: usize,
    /// Id of the archived history row.
    pub deployment_id: Option<String>,
    /// Seeding ran after migration.
    pub seeded: bool,
}

/// Orchestrates deployments against one target.
pub struct DeploymentManager<T: DeploymentTarget> {
    config: DeploymentManagerConfig,
    target: T,
    loader: BundleLoader,
    initializer: Option<Box<dyn DatabaseInitializer>>,
    deployer_version: String,
    target_bundle: Option<Arc<MigrationBundle>>,
}

impl<T: DeploymentTarget> std::fmt::Debug for DeploymentManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("config", &self.config)
            .field("initializer", &self.initializer)
            .field("deployer_version", &self.deployer_version)
            .finish()
    }
}

impl<T: DeploymentTarget> DeploymentManager<T> {
    /// Validates `config` and resolves its initializer with the built-in
    /// registry.
    pub fn new(config: DeploymentManagerConfig, target: T) -> Result<Self, DeployError> {
        Self::with_registry(config, target, &InitializerRegistry::default())
    }

    /// As [`DeploymentManager::new`] with a custom initializer registry.
    pub fn with_registry(
        config: DeploymentManagerConfig,
        target: T,
        registry: &InitializerRegistry,
    ) -> Result<Self, DeployError> {
        config.validate()?;
        let initializer = Self::resolve_initializer(&config, registry)?;
        Ok(Self {
            config,
            target,
            loader: BundleLoader::new(),
            initializer,
            deployer_version: env!("CARGO_PKG_VERSION").to_string(),
            target_bundle: None,
        })
    }

    /// Overrides the version recorded in history rows.
    pub fn with_deployer_version(mut self, version: impl Into<String>) -> Self {
        self.deployer_version = version.into();
        self
    }

    /// The deployment target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// The configuration.
    pub fn config(&self) -> &DeploymentManagerConfig {
        &self.config
    }

    /// Runs the deployment.
    pub async fn deploy(&mut self) -> Result<DeploymentReport, DeployError> {
        let mode = self.config.mode;
        log::info!(
            "Deploying {} to {} in mode {}",
            self.config.target_bundle_path.display(),
            self.config.database,
            mode
        );
        self.load_target_bundle()?;

        let perform_initialization = mode.performs_initialization();
        let pending = if mode.performs_migration() {
            self.pending_migration().await?
        } else {
            None
        };

        let mut report = DeploymentReport {
            initialized: perform_initialization && self.handle_initialization().await?,
            ..Default::default()
        };

        let history_context = match &pending {
            Some(execution) => Some(execution.migrations()?.context_key_schema()?),
            None if perform_initialization => self.initializer_context()?,
            None => None,
        };
        if let Some(context) = &history_context {
            DeploymentHistory::new(self.target.history())
                .setup(&context.schema_name)
                .await?;
        }

        let mut scope = if self.config.run_server_migrations_in_transaction {
            log::debug!("Opening transaction scope for server migrations");
            Some(self.target.begin().await.map_err(DeployError::target)?)
        } else {
            None
        };

        if let Some(execution) = &pending {
            report.migration_steps = self.handle_migration(execution, scope.as_mut()).await?;
            report.migration = Some((
                execution.migration.source,
                execution.target_label().to_string(),
            ));
            if let Some(context) = &history_context {
                report.deployment_id = Some(self.archive_deployment(context).await?);
            }
        } else if report.initialized {
            if let Some(context) = &history_context {
                report.deployment_id = Some(self.archive_deployment(context).await?);
            }
        }

        if let Some(scope) = scope {
            self.target
                .commit(scope)
                .await
                .map_err(DeployError::target)?;
            log::debug!("Committed transaction scope");
        }

        if !report.initialized {
            report.seeded = self.handle_seeding().await?;
        }

        log::info!("Deployment of {} complete", self.config.database);
        Ok(report)
    }

    /// Resolves the migration the next deployment would run.
    pub async fn pending_migration(&mut self) -> Result<Option<MigrationExecution>, DeployError> {
        let target_bundle = self.load_target_bundle()?;
        let Some(configuration_type) = self
            .config
            .migration_config
            .as_ref()
            .map(|info| info.type_name.clone())
        else {
            return Ok(None);
        };

        let target = MigrationInfo::new(target_bundle, &configuration_type)?;
        let deployed = match self.load_deployed_bundle(&target).await? {
            Some(bundle) => Some(MigrationInfo::new(bundle, &configuration_type)?),
            None => None,
        };
        Ok(resolution::resolve(&target, deployed.as_ref())?)
    }

    fn resolve_initializer(
        config: &DeploymentManagerConfig,
        registry: &InitializerRegistry,
    ) -> Result<Option<Box<dyn DatabaseInitializer>>, DeployError> {
        let Some(info) = &config.initializer_config else {
            return Ok(None);
        };
        let descriptor: InitializerDescriptor = info.type_name.parse()?;
        let mut initializer = registry.construct(&descriptor)?;

        if initializer.is_secure() {
            match &info.service_account {
                Some(account_info) => {
                    let account = ServiceAccount::try_from(account_info)?;
                    if account.account_type.is_none() {
                        log::warn!(
                            "Service account for {} has no account type; it will not be provisioned",
                            descriptor
                        );
                    }
                    initializer.set_service_account(account);
                }
                None => log::warn!(
                    "Initializer {} provisions a service account but none is configured",
                    descriptor
                ),
            }
        }
        Ok(Some(initializer))
    }

    fn load_target_bundle(&mut self) -> Result<Arc<MigrationBundle>, DeployError> {
        if let Some(bundle) = &self.target_bundle {
            return Ok(bundle.clone());
        }
        let path = self.config.target_bundle_path.clone();
        let bundle = self
            .loader
            .load(MigrationSource::Target, &path)
            .map_err(|source| DeployError::TargetBundle { path, source })?;
        self.target_bundle = Some(bundle.clone());
        Ok(bundle)
    }

    async fn load_deployed_bundle(
        &mut self,
        target: &MigrationInfo,
    ) -> Result<Option<Arc<MigrationBundle>>, DeployError> {
        if let Some(path) = self.config.deployed_bundle_override_path.clone() {
            log::info!(
                "Using deployed bundle override {}; deployment history is bypassed",
                path.display()
            );
            return Ok(Some(self.loader.load(MigrationSource::Deployed, &path)?));
        }

        if matches!(
            self.config.mode,
            DeploymentMode::InitializeOnly | DeploymentMode::SeedOnly
        ) {
            return Ok(None);
        }

        let Some(context) = &target.context_key_schema else {
            log::warn!(
                "Migration configuration {} is not part of the target bundle; a deployed bundle override is required to migrate downward past its introduction",
                target.configuration_type
            );
            return Ok(None);
        };

        if !self
            .target
            .database_exists()
            .await
            .map_err(DeployError::target)?
        {
            log::info!("Database {} does not exist yet", self.config.database);
            return Ok(None);
        }

        let extracted = DeploymentHistory::new(self.target.history())
            .extract_current(
                &context.context_key,
                &context.schema_name,
                &self.config.extract_path(),
            )
            .await?;
        match extracted {
            Some(path) => Ok(Some(self.loader.load(MigrationSource::Deployed, &path)?)),
            None => {
                log::warn!(
                    "No deployment history found for context {} in schema {}",
                    context.context_key,
                    context.schema_name
                );
                Ok(None)
            }
        }
    }

    /// Context of the target bundle configuration the initializer applies to.
    fn initializer_context(&mut self) -> Result<Option<ContextKeySchema>, DeployError> {
        let Some(context_type) = self
            .initializer
            .as_ref()
            .map(|initializer| initializer.context_type().to_string())
        else {
            return Ok(None);
        };
        let bundle = self.load_target_bundle()?;
        let configuration = bundle.configuration_for_context(&context_type)?;
        Ok(Some(crate::bundle::context_key_schema_of(configuration)?))
    }

    async fn any_version_deployed(&self, context: &ContextKeySchema) -> Result<bool, DeployError> {
        if !self
            .target
            .database_exists()
            .await
            .map_err(DeployError::target)?
        {
            return Ok(false);
        }
        self.target
            .has_model_metadata(context)
            .await
            .map_err(DeployError::target)
    }

    async fn handle_initialization(&mut self) -> Result<bool, DeployError> {
        let Some(context) = self.initializer_context()? else {
            log::debug!("No database initializer configured");
            return Ok(false);
        };
        if self.any_version_deployed(&context).await? {
            log::debug!(
                "Context {} has been deployed before; skipping initialization",
                context.context_key
            );
            return Ok(false);
        }

        log::info!(
            "Context {} has yet to be deployed; running initializer",
            context.context_key
        );
        self.run_initializer(&context).await?;
        Ok(true)
    }

    async fn run_initializer(&mut self, context: &ContextKeySchema) -> Result<(), DeployError> {
        let Some(initializer) = self.initializer.as_ref() else {
            return Ok(());
        };
        let context_type = initializer.context_type().to_string();
        let account = initializer.service_account().cloned();
        let seeder = initializer.seeder_type().map(str::to_string);

        if self
            .target
            .create_database()
            .await
            .map_err(DeployError::target)?
        {
            log::info!("Created database {}", self.config.database);
        }

        let bundle = self.load_target_bundle()?;
        let configuration_type = bundle.configuration_for_context(&context_type)?.type_name.clone();
        if let Some(migrations) = BundleMigrations::new(bundle, &configuration_type) {
            let migrator = Migrator::new(migrations, &self.loader, &self.target)?;
            migrator.update(None, None).await?;
        }

        if let Some(account) = account {
            if account.is_complete() {
                log::info!(
                    "Provisioning service account {}",
                    account.login_name().unwrap_or_default()
                );
                self.target
                    .provision_service_account(&account, &context.schema_name)
                    .await
                    .map_err(DeployError::target)?;
            } else {
                log::warn!("Service account is missing required fields; skipping provisioning");
            }
        }

        if let Some(seeder) = seeder {
            self.seed(&seeder).await?;
        }
        Ok(())
    }

    async fn handle_migration(
        &self,
        execution: &MigrationExecution,
        scope: Option<&mut T::Scope>,
    ) -> Result<usize, DeployError> {
        let migrations = execution.migrations()?.clone();
        log::info!(
            "Migrating with the {} bundle to {}",
            execution.migration.source,
            execution.target_label()
        );
        let migrator = Migrator::new(migrations, &self.loader, &self.target)?;
        Ok(migrator
            .update(execution.target_migration_id.as_deref(), scope)
            .await?)
    }

    async fn archive_deployment(&self, context: &ContextKeySchema) -> Result<String, DeployError> {
        let bundle_path = self
            .target_bundle
            .as_ref()
            .map(|bundle| bundle.path().to_path_buf())
            .unwrap_or_else(|| self.config.target_bundle_path.clone());
        Ok(DeploymentHistory::new(self.target.history())
            .create(
                &context.context_key,
                &self.deployer_version,
                &bundle_path,
                &context.schema_name,
            )
            .await?)
    }

    async fn handle_seeding(&self) -> Result<bool, DeployError> {
        let Some(initializer) = &self.initializer else {
            log::debug!("Seeding skipped as no initializer is available");
            return Ok(false);
        };

        let mut disabled = self
            .config
            .initializer_config
            .as_ref()
            .is_some_and(|info| info.disable_forced_seeding);
        if disabled && self.config.mode == DeploymentMode::SeedOnly {
            log::info!("Seed-only deployment overrides disabled forced seeding");
            disabled = false;
        }
        if disabled {
            log::info!("Forced seeding is disabled");
            return Ok(false);
        }

        match initializer.seeder_type() {
            Some(seeder) => {
                let seeder = seeder.to_string();
                self.seed(&seeder).await?;
                Ok(true)
            }
            None => {
                log::info!("No seed data specified by the initializer");
                Ok(false)
            }
        }
    }

    async fn seed(&self, seeder_type: &str) -> Result<(), DeployError> {
        let bundle = self
            .target_bundle
            .as_ref()
            .ok_or(BundleError::NotLoaded(MigrationSource::Target))?;
        let seeder = bundle
            .seeder(seeder_type)
            .ok_or_else(|| DeployError::UnknownSeeder(seeder_type.to_string()))?;

        log::info!("Running seeder {} ({} scripts)", seeder_type, seeder.scripts.len());
        for script in &seeder.scripts {
            let sql = self.loader.read_script(MigrationSource::Target, script)?;
            log::debug!("Executing seed script {}", script.display());
            self.target
                .execute_script(&sql)
                .await
                .map_err(DeployError::target)?;
        }
        Ok(())
    }
}
