//! Deployment configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Errors raised while reading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("Unable to access configuration file {path}: {source}")]
    Io {
        /// The configuration file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for a configuration.
    #[error("Unable to parse configuration file {path}: {source}")]
    Parse {
        /// The configuration file.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },

    /// An endpoint string is not `server|database`.
    #[error("Invalid database endpoint '{0}', expected 'server|database'")]
    InvalidEndpoint(String),

    /// Unknown deployment mode.
    #[error("Unknown deployment mode '{0}'")]
    InvalidMode(String),

    /// Unknown authentication mode.
    #[error("Unknown authentication mode '{0}'")]
    InvalidAuthenticationMode(String),

    /// SQL authentication requires a login and password.
    #[error("SQL authentication requires both a login and a password")]
    MissingCredentials,

    /// The mode needs a migration configuration.
    #[error("Deployment mode {0} requires a migration configuration type")]
    MissingMigrationConfiguration(DeploymentMode),

    /// The mode needs an initializer.
    #[error("Deployment mode {0} requires a database initializer type")]
    MissingInitializerConfiguration(DeploymentMode),
}

/// What a deployment is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeploymentMode {
    /// Initialize a new database or migrate an existing one.
    #[default]
    InitializeOrMigrate,
    /// Only initialize; existing databases are left alone.
    InitializeOnly,
    /// Only migrate; never initialize.
    MigrationOnly,
    /// Only run seeders.
    SeedOnly,
}

impl DeploymentMode {
    /// Whether the mode may run the initializer.
    pub fn performs_initialization(self) -> bool {
        matches!(
            self,
            DeploymentMode::InitializeOnly | DeploymentMode::InitializeOrMigrate
        )
    }

    /// Whether the mode may migrate.
    pub fn performs_migration(self) -> bool {
        !matches!(self, DeploymentMode::InitializeOnly | DeploymentMode::SeedOnly)
    }

    /// Whether the mode needs a migration configuration.
    pub fn requires_migration_configuration(self) -> bool {
        self != DeploymentMode::InitializeOnly
    }

    /// Whether the mode needs an initializer.
    pub fn requires_initializer(self) -> bool {
        self != DeploymentMode::MigrationOnly
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeploymentMode::InitializeOrMigrate => "InitializeOrMigrate",
            DeploymentMode::InitializeOnly => "InitializeOnly",
            DeploymentMode::MigrationOnly => "MigrationOnly",
            DeploymentMode::SeedOnly => "SeedOnly",
        };
        f.write_str(name)
    }
}

impl FromStr for DeploymentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "initializeormigrate" => Ok(DeploymentMode::InitializeOrMigrate),
            "initializeonly" => Ok(DeploymentMode::InitializeOnly),
            "migrationonly" => Ok(DeploymentMode::MigrationOnly),
            "seedonly" => Ok(DeploymentMode::SeedOnly),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// How the deployer authenticates against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthenticationMode {
    /// Ambient credentials of the running process.
    #[default]
    Integrated,
    /// Explicit login and password.
    Sql,
}

impl FromStr for AuthenticationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "integrated" => Ok(AuthenticationMode::Integrated),
            "sql" => Ok(AuthenticationMode::Sql),
            _ => Err(ConfigError::InvalidAuthenticationMode(s.to_string())),
        }
    }
}

/// A server and database pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEndpoint {
    /// Server host, optionally with `:port`.
    pub server_name: String,
    /// Database name.
    pub database_name: String,
}

impl DatabaseEndpoint {
    /// Creates an endpoint.
    pub fn new(server_name: impl Into<String>, database_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            database_name: database_name.into(),
        }
    }
}

impl fmt::Display for DatabaseEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.server_name, self.database_name)
    }
}

impl FromStr for DatabaseEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());
        let (server, database) = s.split_once('|').ok_or_else(invalid)?;
        let (server, database) = (server.trim(), database.trim());
        if server.is_empty() || database.is_empty() || database.contains('|') {
            return Err(invalid());
        }
        Ok(DatabaseEndpoint::new(server, database))
    }
}

/// Persistent deployment configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfiguration {
    /// Which migration configuration to deploy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_configuration: Option<MigrationConfigurationInfo>,
    /// Which initializer to use for new databases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer_configuration: Option<InitializerConfigurationInfo>,
}

/// Migration configuration selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConfigurationInfo {
    /// Configuration type name in the bundle.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Context type, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
}

/// Initializer selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializerConfigurationInfo {
    /// Initializer descriptor, e.g. `CreateDatabaseIfNotExists<Ctx>`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Skip seeding on migrations of existing databases.
    #[serde(default)]
    pub disable_forced_seeding: bool,
    /// Account provisioned by secure initializers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountInfo>,
}

/// Service account as configured; validated when assigned to an initializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountInfo {
    /// Login name.
    #[serde(default)]
    pub name: Option<String>,
    /// Domain of a Windows account.
    #[serde(default)]
    pub domain: Option<String>,
    /// Database user mapped to the login.
    #[serde(default)]
    pub database_user: Option<String>,
    /// Password of a SQL account.
    #[serde(default)]
    pub database_user_password: Option<String>,
    /// `Sql` or `Windows`.
    #[serde(default)]
    pub account_type: Option<String>,
}

/// Source of a [`DeploymentConfiguration`].
pub trait DeploymentConfigurationStore {
    /// Reads the configuration.
    fn load(&self) -> Result<DeploymentConfiguration, ConfigError>;
    /// Replaces the configuration.
    fn save(&mut self, configuration: &DeploymentConfiguration) -> Result<(), ConfigError>;
}

/// Configuration kept in a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileConfigurationStore {
    path: PathBuf,
}

impl JsonFileConfigurationStore {
    /// A store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeploymentConfigurationStore for JsonFileConfigurationStore {
    fn load(&self) -> Result<DeploymentConfiguration, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&mut self, configuration: &DeploymentConfiguration) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(configuration).map_err(|source| {
            ConfigError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        std::fs::write(&self.path, text).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Configuration held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigurationStore {
    configuration: DeploymentConfiguration,
}

impl InMemoryConfigurationStore {
    /// A store holding `configuration`.
    pub fn new(configuration: DeploymentConfiguration) -> Self {
        Self { configuration }
    }
}

impl DeploymentConfigurationStore for InMemoryConfigurationStore {
    fn load(&self) -> Result<DeploymentConfiguration, ConfigError> {
        Ok(self.configuration.clone())
    }

    fn save(&mut self, configuration: &DeploymentConfiguration) -> Result<(), ConfigError> {
        self.configuration = configuration.clone();
        Ok(())
    }
}

/// Everything a [`crate::manager::DeploymentManager`] needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentManagerConfig {
    /// What the deployment may do.
    pub mode: DeploymentMode,
    /// Manifest of the bundle to deploy.
    pub target_bundle_path: PathBuf,
    /// Manifest of the bundle to treat as deployed, bypassing history.
    pub deployed_bundle_override_path: Option<PathBuf>,
    /// The database to deploy to.
    pub database: DatabaseEndpoint,
    /// How to authenticate.
    pub auth_mode: AuthenticationMode,
    /// Login for SQL authentication.
    pub sql_login: Option<String>,
    /// Password for SQL authentication.
    pub sql_password: Option<String>,
    /// Wrap migration and history archival in one transaction scope.
    pub run_server_migrations_in_transaction: bool,
    /// Where deployed snapshots are extracted; the OS temp dir by default.
    pub deployment_history_extract_path: Option<PathBuf>,
    /// Migration configuration selection.
    pub migration_config: Option<MigrationConfigurationInfo>,
    /// Initializer selection.
    pub initializer_config: Option<InitializerConfigurationInfo>,
}

impl DeploymentManagerConfig {
    /// A configuration with defaults for everything but the bundle and
    /// database.
    pub fn new(target_bundle_path: impl Into<PathBuf>, database: DatabaseEndpoint) -> Self {
        Self {
            mode: DeploymentMode::default(),
            target_bundle_path: target_bundle_path.into(),
            deployed_bundle_override_path: None,
            database,
            auth_mode: AuthenticationMode::default(),
            sql_login: None,
            sql_password: None,
            run_server_migrations_in_transaction: false,
            deployment_history_extract_path: None,
            migration_config: None,
            initializer_config: None,
        }
    }

    /// Fills migration and initializer selections from a configuration
    /// store. Explicit selections win over stored ones.
    pub fn apply_configuration(&mut self, configuration: DeploymentConfiguration) {
        if self.migration_config.is_none() {
            self.migration_config = configuration.migration_configuration;
        }
        if self.initializer_config.is_none() {
            self.initializer_config = configuration.initializer_configuration;
        }
    }

    /// The directory deployed snapshots are extracted to.
    pub fn extract_path(&self) -> PathBuf {
        self.deployment_history_extract_path
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Checks that the mode has everything it needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth_mode == AuthenticationMode::Sql
            && (self.sql_login.is_none() || self.sql_password.is_none())
        {
            return Err(ConfigError::MissingCredentials);
        }
        if self.mode.requires_migration_configuration() && self.migration_config.is_none() {
            return Err(ConfigError::MissingMigrationConfiguration(self.mode));
        }
        if self.mode.requires_initializer() && self.initializer_config.is_none() {
            return Err(ConfigError::MissingInitializerConfiguration(self.mode));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn initializer() -> InitializerConfigurationInfo {
        InitializerConfigurationInfo {
            type_name: "CreateDatabaseIfNotExists<Ctx>".to_string(),
            disable_forced_seeding: false,
            service_account: None,
        }
    }

    fn migration() -> MigrationConfigurationInfo {
        MigrationConfigurationInfo {
            type_name: "Config".to_string(),
            context_type: None,
        }
    }

    #[test]
    fn endpoint_parses_server_and_database() {
        let endpoint: DatabaseEndpoint = "localhost:5432|clinical".parse().unwrap();
        assert_eq!(endpoint, DatabaseEndpoint::new("localhost:5432", "clinical"));
        assert_eq!(endpoint.to_string(), "localhost:5432|clinical");
    }

    #[test]
    fn malformed_endpoints_are_rejected() {
        for value in ["localhost", "|db", "server|", "a|b|c"] {
            assert!(
                matches!(value.parse::<DatabaseEndpoint>(), Err(ConfigError::InvalidEndpoint(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!(
            "seed-only".parse::<DeploymentMode>().unwrap(),
            DeploymentMode::SeedOnly
        );
        assert_eq!(
            "InitializeOrMigrate".parse::<DeploymentMode>().unwrap(),
            DeploymentMode::InitializeOrMigrate
        );
        assert!("sometimes".parse::<DeploymentMode>().is_err());
    }

    #[test]
    fn mode_capabilities() {
        use DeploymentMode::*;
        assert!(InitializeOrMigrate.performs_initialization() && InitializeOrMigrate.performs_migration());
        assert!(InitializeOnly.performs_initialization() && !InitializeOnly.performs_migration());
        assert!(!MigrationOnly.performs_initialization() && MigrationOnly.performs_migration());
        assert!(!SeedOnly.performs_initialization() && !SeedOnly.performs_migration());
        assert!(!MigrationOnly.requires_initializer());
        assert!(!InitializeOnly.requires_migration_configuration());
        assert!(SeedOnly.requires_migration_configuration());
    }

    #[test]
    fn validation_follows_mode_requirements() {
        let endpoint = DatabaseEndpoint::new("s", "d");
        let mut config = DeploymentManagerConfig::new("bundle.json", endpoint);

        config.mode = DeploymentMode::MigrationOnly;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingMigrationConfiguration(_))
        ));
        config.migration_config = Some(migration());
        assert!(config.validate().is_ok());

        config.mode = DeploymentMode::SeedOnly;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingInitializerConfiguration(_))
        ));
        config.initializer_config = Some(initializer());
        assert!(config.validate().is_ok());

        config.mode = DeploymentMode::InitializeOnly;
        config.migration_config = None;
        assert!(config.validate().is_ok());

        config.auth_mode = AuthenticationMode::Sql;
        assert!(matches!(config.validate(), Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn configuration_file_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonFileConfigurationStore::new(dir.path().join("deploy.json"));
        let configuration = DeploymentConfiguration {
            migration_configuration: Some(migration()),
            initializer_configuration: Some(InitializerConfigurationInfo {
                service_account: Some(ServiceAccountInfo {
                    name: Some("svc".to_string()),
                    account_type: Some("Sql".to_string()),
                    ..Default::default()
                }),
                ..initializer()
            }),
        };
        store.save(&configuration).unwrap();
        assert_eq!(store.load().unwrap(), configuration);
    }

    #[test]
    fn configuration_file_uses_camel_case() {
        let configuration: DeploymentConfiguration = serde_json::from_str(
            r#"{
                "migrationConfiguration": { "type": "Clinical.Configuration" },
                "initializerConfiguration": {
                    "type": "CreateSecureDatabaseIfNotExists<Clinical.Context>",
                    "disableForcedSeeding": true,
                    "serviceAccount": { "name": "svc", "databaseUser": "svc_user", "accountType": "Windows", "domain": "CORP" }
                }
            }"#,
        )
        .unwrap();
        let initializer = configuration.initializer_configuration.unwrap();
        assert!(initializer.disable_forced_seeding);
        assert_eq!(
            initializer.service_account.unwrap().database_user.as_deref(),
            Some("svc_user")
        );
    }

    #[test]
    fn explicit_selection_wins_over_stored_configuration() {
        let mut config = DeploymentManagerConfig::new("b.json", DatabaseEndpoint::new("s", "d"));
        config.migration_config = Some(MigrationConfigurationInfo {
            type_name: "Explicit".to_string(),
            context_type: None,
        });
        config.apply_configuration(DeploymentConfiguration {
            migration_configuration: Some(migration()),
            initializer_configuration: Some(initializer()),
        });
        assert_eq!(config.migration_config.unwrap().type_name, "Explicit");
        assert!(config.initializer_config.is_some());
    }
}
