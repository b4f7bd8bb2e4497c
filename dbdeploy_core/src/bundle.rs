//! Migration bundles.
//!
//! A bundle is a directory holding a JSON manifest (the "assembly file") and
//! the SQL scripts it references. The manifest declares one or more migration
//! configurations, each an ordered list of migrations with explicit up and
//! down scripts, and the seeders available to initializers.
//!
//! ```json
//! {
//!   "name": "clinical",
//!   "configurations": [{
//!     "type": "Clinical.Migrations.Configuration",
//!     "contextType": "Clinical.Context",
//!     "migrationsNamespace": "Clinical.Migrations",
//!     "migrations": [{
//!       "id": "201901011200000_Initial",
//!       "namespace": "Clinical.Migrations",
//!       "defaultSchema": "clinical",
//!       "up": "sql/001_initial.up.sql",
//!       "down": "sql/001_initial.down.sql"
//!     }]
//!   }],
//!   "seeders": [{ "type": "Clinical.Seed", "scripts": ["seed/reference.sql"] }]
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Schema used when a migration declares none.
pub const DEFAULT_SCHEMA: &str = "public";

/// Where a bundle comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationSource {
    /// The bundle being deployed.
    Target,
    /// The bundle currently live in the database.
    Deployed,
}

impl fmt::Display for MigrationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationSource::Target => write!(f, "target"),
            MigrationSource::Deployed => write!(f, "deployed"),
        }
    }
}

/// Errors raised while reading or interpreting a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The manifest or a script could not be read.
    #[error("Unable to read {path}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid JSON for a bundle.
    #[error("Unable to parse bundle manifest {path}: {source}")]
    Parse {
        /// The manifest path.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A configuration declares the same migration id twice.
    #[error("Migration {id} is declared more than once in configuration {configuration_type}")]
    DuplicateMigration {
        /// The configuration type.
        configuration_type: String,
        /// The repeated id.
        id: String,
    },

    /// The migrations of a context target more than one schema.
    #[error(
        "Migration configuration {configuration_type} targets more than one default schema ({}), which is not supported",
        .schemas.join(", ")
    )]
    MultipleSchemas {
        /// The configuration type.
        configuration_type: String,
        /// The distinct schemas found.
        schemas: Vec<String>,
    },

    /// No configuration of the bundle migrates the given context type.
    #[error("No migration configuration for context {0} in bundle")]
    NoConfigurationForContext(String),

    /// Several configurations migrate the given context type.
    #[error("More than one migration configuration for context {0} in bundle")]
    AmbiguousConfigurationForContext(String),

    /// A script was requested from a bundle source that has not been loaded.
    #[error("No {0} bundle has been loaded")]
    NotLoaded(MigrationSource),
}

/// The parsed bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    /// Bundle name, informational.
    pub name: String,
    /// Migration configurations.
    #[serde(default)]
    pub configurations: Vec<MigrationConfiguration>,
    /// Seeders available to seeded initializers.
    #[serde(default)]
    pub seeders: Vec<SeederDefinition>,
}

/// One migration configuration: a linear history for one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfiguration {
    /// Configuration type name, the lookup key.
    #[serde(rename = "type")]
    pub type_name: String,
    /// The context type the configuration migrates.
    pub context_type: String,
    /// History key of the context. Defaults to the configuration type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_key: Option<String>,
    /// Namespace owning this configuration's migrations.
    pub migrations_namespace: String,
    /// Migrations, in any order.
    #[serde(default)]
    pub migrations: Vec<MigrationDefinition>,
}

impl MigrationConfiguration {
    /// The effective context key.
    pub fn context_key(&self) -> &str {
        self.context_key.as_deref().unwrap_or(&self.type_name)
    }

    /// Migrations of this configuration's namespace, ordered by id.
    pub fn ordered_migrations(&self) -> Vec<&MigrationDefinition> {
        let mut migrations: Vec<&MigrationDefinition> = self
            .migrations
            .iter()
            .filter(|migration| migration.namespace == self.migrations_namespace)
            .collect();
        migrations.sort_by(|a, b| a.id.cmp(&b.id));
        migrations
    }
}

/// A single migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationDefinition {
    /// Sortable id; ordering of ids is migration order.
    pub id: String,
    /// Namespace the migration belongs to.
    pub namespace: String,
    /// Schema the migration writes to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
    /// Upward script, relative to the bundle root.
    pub up: PathBuf,
    /// Downward script, relative to the bundle root.
    pub down: PathBuf,
}

/// A seeder: idempotent scripts run in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeederDefinition {
    /// Seeder type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Scripts relative to the bundle root.
    #[serde(default)]
    pub scripts: Vec<PathBuf>,
}

/// A context's history key and the schema holding its tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKeySchema {
    /// The context key.
    pub context_key: String,
    /// The schema name.
    pub schema_name: String,
}

/// A loaded bundle.
#[derive(Debug, Clone)]
pub struct MigrationBundle {
    source: MigrationSource,
    path: PathBuf,
    manifest: BundleManifest,
}

impl MigrationBundle {
    /// Reads and validates the manifest at `path`.
    pub fn open(source: MigrationSource, path: &Path) -> Result<Self, BundleError> {
        let text = std::fs::read_to_string(path).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: BundleManifest =
            serde_json::from_str(&text).map_err(|source| BundleError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_manifest(source, path.to_path_buf(), manifest)
    }

    /// Builds a bundle from an already parsed manifest.
    pub fn from_manifest(
        source: MigrationSource,
        path: PathBuf,
        manifest: BundleManifest,
    ) -> Result<Self, BundleError> {
        for configuration in &manifest.configurations {
            let mut seen = BTreeSet::new();
            for migration in &configuration.migrations {
                if !seen.insert(migration.id.as_str()) {
                    return Err(BundleError::DuplicateMigration {
                        configuration_type: configuration.type_name.clone(),
                        id: migration.id.clone(),
                    });
                }
            }
        }
        Ok(Self {
            source,
            path,
            manifest,
        })
    }

    /// Where the bundle was loaded from.
    pub fn source(&self) -> MigrationSource {
        self.source
    }

    /// Path of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory containing the manifest; scripts resolve against it.
    pub fn root(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    /// The manifest.
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Looks up a configuration by type name.
    pub fn configuration(&self, type_name: &str) -> Option<&MigrationConfiguration> {
        self.manifest
            .configurations
            .iter()
            .find(|configuration| configuration.type_name == type_name)
    }

    /// The single configuration migrating `context_type`.
    pub fn configuration_for_context(
        &self,
        context_type: &str,
    ) -> Result<&MigrationConfiguration, BundleError> {
        let mut matching = self
            .manifest
            .configurations
            .iter()
            .filter(|configuration| configuration.context_type == context_type);
        let first = matching
            .next()
            .ok_or_else(|| BundleError::NoConfigurationForContext(context_type.to_string()))?;
        if matching.next().is_some() {
            return Err(BundleError::AmbiguousConfigurationForContext(
                context_type.to_string(),
            ));
        }
        Ok(first)
    }

    /// Looks up a seeder by type name.
    pub fn seeder(&self, type_name: &str) -> Option<&SeederDefinition> {
        self.manifest
            .seeders
            .iter()
            .find(|seeder| seeder.type_name == type_name)
    }

    /// Context key and schema of a configuration, `None` when the bundle does
    /// not contain it.
    pub fn context_key_schema(
        &self,
        configuration_type: &str,
    ) -> Result<Option<ContextKeySchema>, BundleError> {
        self.configuration(configuration_type)
            .map(context_key_schema_of)
            .transpose()
    }
}

/// Derives the context key and schema of a configuration.
///
/// All migrations of the configuration's namespace must share one default
/// schema; no migrations means the default schema.
pub fn context_key_schema_of(
    configuration: &MigrationConfiguration,
) -> Result<ContextKeySchema, BundleError> {
    let schemas: BTreeSet<&str> = configuration
        .ordered_migrations()
        .into_iter()
        .map(|migration| migration.default_schema.as_deref().unwrap_or(DEFAULT_SCHEMA))
        .collect();

    if schemas.len() > 1 {
        return Err(BundleError::MultipleSchemas {
            configuration_type: configuration.type_name.clone(),
            schemas: schemas.into_iter().map(str::to_string).collect(),
        });
    }

    Ok(ContextKeySchema {
        context_key: configuration.context_key().to_string(),
        schema_name: schemas
            .into_iter()
            .next()
            .unwrap_or(DEFAULT_SCHEMA)
            .to_string(),
    })
}
