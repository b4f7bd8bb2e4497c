//! # dbdeploy core
//!
//! Deployment orchestration on top of versioned schema migrations. A target
//! bundle (a directory with a JSON manifest of migrations and seed scripts) is
//! compared against the bundle archived inside the database by the previous
//! deployment, the delta is applied upward or downward, and a new snapshot of
//! the bundle is archived for the next run.
//!
//! Storage concerns live behind the [`DeploymentTarget`],
//! [`DeploymentHistoryStore`] and [`ShardMapStore`] traits, implemented by the
//! `dbdeploy_mem` and `dbdeploy_pg` crates.

#![deny(missing_docs)]

pub mod archive;
pub mod bundle;
pub mod config;
pub mod hash;
pub mod history;
pub mod initializer;
pub mod loader;
pub mod manager;
pub mod migrator;
pub mod resolution;
pub mod sharding;
pub mod target;

/// Boxed error used to carry backend failures through the core error enums.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use history::DeploymentHistoryStore;
pub use sharding::ShardMapStore;
pub use target::DeploymentTarget;

pub mod prelude {
    //! The prelude module for the `dbdeploy_core` crate.
    pub use super::bundle::{
        BundleError, ContextKeySchema, MigrationBundle, MigrationSource, DEFAULT_SCHEMA,
    };
    pub use super::config::{
        AuthenticationMode, ConfigError, DatabaseEndpoint, DeploymentConfiguration,
        DeploymentConfigurationStore, DeploymentManagerConfig, DeploymentMode,
        InMemoryConfigurationStore, InitializerConfigurationInfo, JsonFileConfigurationStore,
        MigrationConfigurationInfo, ServiceAccountInfo,
    };
    pub use super::history::{
        DeploymentHistory, DeploymentHistoryEntry, DeploymentHistoryRecord,
        DeploymentHistoryStore, HistoryError, DEPLOYMENT_HISTORY_TABLE,
    };
    pub use super::initializer::{
        DatabaseInitializer, InitializerDescriptor, InitializerError, InitializerRegistry,
        ServiceAccount, ServiceAccountType,
    };
    pub use super::loader::{BundleLoader, LoaderContext};
    pub use super::manager::{DeployError, DeploymentManager, DeploymentReport};
    pub use super::migrator::{
        BundleMigrations, MigrationDirection, MigrationStep, Migrator, MigratorError,
        INITIAL_DATABASE,
    };
    pub use super::resolution::{MigrationExecution, MigrationInfo, ResolutionError};
    pub use super::sharding::{
        int32_ranges, Int32Range, MappingOutcome, PointMapping, RangeMapping, ShardKey,
        ShardKeyType, ShardKeyValue, ShardLocation, ShardMapError, ShardMapInfo, ShardMapKind,
        ShardMapManagementService, ShardMapStore, ShardRange, UnknownShardKeyType,
    };
    pub use super::target::{ConnectionInfoBuilder, DeploymentTarget};
    pub use super::BoxError;
}
