//! Command line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use dbdeploy::prelude::*;

/// Deploys migration bundles to databases and manages shard maps.
#[derive(Debug, Parser)]
#[command(version, about, arg_required_else_help(true))]
pub struct Cli {
    /// Use verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize, migrate and seed a database
    Deploy(DeployArgs),
    /// Inspect the deployment history of a database
    #[command(subcommand)]
    History(HistoryCommand),
    /// Manage shard maps
    #[command(subcommand)]
    Shard(ShardCommand),
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Deployment mode: InitializeOrMigrate, InitializeOnly, MigrationOnly or SeedOnly
    #[arg(short, long, default_value_t = DeploymentMode::InitializeOrMigrate)]
    pub mode: DeploymentMode,

    /// Manifest of the bundle to deploy
    #[arg(long = "target-bundle", short = 't')]
    pub target_bundle: PathBuf,

    /// Manifest to treat as deployed instead of the one in deployment history
    #[arg(long = "deployed-bundle")]
    pub deployed_bundle: Option<PathBuf>,

    /// Database to deploy to, as server|database
    #[arg(short, long)]
    pub database: DatabaseEndpoint,

    /// Authentication mode: Integrated or Sql
    #[arg(long = "auth-mode", default_value = "integrated")]
    pub auth_mode: AuthenticationMode,

    /// Login for Sql authentication
    #[arg(long = "sql-login")]
    pub sql_login: Option<String>,

    /// Password for Sql authentication
    #[arg(long = "sql-password")]
    pub sql_password: Option<String>,

    /// Wrap migrations and history archival in one transaction
    #[arg(long = "server-transaction")]
    pub server_transaction: bool,

    /// Skip seeding after a migration
    #[arg(long = "disable-forced-seeding")]
    pub disable_forced_seeding: bool,

    /// Migration configuration type in the bundle
    #[arg(long = "migration-configuration")]
    pub migration_configuration: Option<String>,

    /// Initializer type, e.g. CreateDatabaseIfNotExists<Context>
    #[arg(long = "initializer")]
    pub initializer: Option<String>,

    /// Service account name passed to secure initializers
    #[arg(long = "service-account")]
    pub service_account: Option<String>,

    /// Service account type: Sql or Windows
    #[arg(long = "service-account-type", requires = "service_account")]
    pub service_account_type: Option<String>,

    /// Service account domain
    #[arg(long = "service-account-domain", requires = "service_account")]
    pub service_account_domain: Option<String>,

    /// Database user mapped to the service account
    #[arg(long = "service-account-user", requires = "service_account")]
    pub service_account_user: Option<String>,

    /// Password of the service account's database user
    #[arg(long = "service-account-password", requires = "service_account")]
    pub service_account_password: Option<String>,

    /// JSON deployment configuration file; replaces the type arguments above
    #[arg(
        long = "config-file",
        conflicts_with_all = ["migration_configuration", "initializer", "service_account"]
    )]
    pub config_file: Option<PathBuf>,

    /// Directory deployed bundles are extracted to; the temp dir by default
    #[arg(long = "extract-path")]
    pub extract_path: Option<PathBuf>,
}

impl DeployArgs {
    /// The configuration the type arguments describe.
    pub fn configuration(&self) -> DeploymentConfiguration {
        DeploymentConfiguration {
            migration_configuration: self.migration_configuration.as_ref().map(|type_name| {
                MigrationConfigurationInfo {
                    type_name: type_name.clone(),
                    context_type: None,
                }
            }),
            initializer_configuration: self.initializer.as_ref().map(|type_name| {
                InitializerConfigurationInfo {
                    type_name: type_name.clone(),
                    disable_forced_seeding: self.disable_forced_seeding,
                    service_account: self.service_account.as_ref().map(|name| {
                        ServiceAccountInfo {
                            name: Some(name.clone()),
                            domain: self.service_account_domain.clone(),
                            database_user: self.service_account_user.clone(),
                            database_user_password: self.service_account_password.clone(),
                            account_type: self.service_account_type.clone(),
                        }
                    }),
                }
            }),
        }
    }

    /// Builds the manager configuration. Selections come from `configuration`.
    pub fn manager_config(&self, configuration: DeploymentConfiguration) -> DeploymentManagerConfig {
        let mut config =
            DeploymentManagerConfig::new(absolute(&self.target_bundle), self.database.clone());
        config.mode = self.mode;
        config.deployed_bundle_override_path = self.deployed_bundle.as_deref().map(absolute);
        config.auth_mode = self.auth_mode;
        config.sql_login = self.sql_login.clone();
        config.sql_password = self.sql_password.clone();
        config.run_server_migrations_in_transaction = self.server_transaction;
        config.deployment_history_extract_path = self.extract_path.clone();
        config.apply_configuration(configuration);
        config
    }
}

fn absolute(path: &std::path::Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Server, database and credentials of an existing database.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Server name, optionally with :port
    #[arg(short, long)]
    pub server: String,

    /// Database name
    #[arg(short, long)]
    pub database: String,

    /// Login; integrated authentication when absent
    #[arg(short, long, requires = "password")]
    pub login: Option<String>,

    /// Login password
    #[arg(short, long, requires = "login")]
    pub password: Option<String>,
}

impl ConnectionArgs {
    /// The endpoint.
    pub fn endpoint(&self) -> DatabaseEndpoint {
        DatabaseEndpoint::new(&self.server, &self.database)
    }

    /// Sql authentication when a login is given.
    pub fn auth_mode(&self) -> AuthenticationMode {
        if self.login.is_some() {
            AuthenticationMode::Sql
        } else {
            AuthenticationMode::Integrated
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// Extract an archived bundle
    Extract(ExtractArgs),
    /// List archived deployments, newest first
    List(ListArgs),
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Schema holding the deployment history
    #[arg(long)]
    pub schema: String,

    /// Directory to extract to
    #[arg(long = "target-dir")]
    pub target_dir: PathBuf,

    /// Deployment id to extract
    #[arg(long)]
    pub id: String,

    /// Skip checksum verification of the extracted files
    #[arg(long = "no-verify")]
    pub no_verify: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Schema holding the deployment history
    #[arg(long)]
    pub schema: String,

    /// Only deployments of this context key
    #[arg(long = "context-key")]
    pub context_key: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ShardCommand {
    /// Set up the shard map manager
    Deploy(ManagerArgs),
    /// Create a list shard map
    CreateListMap(CreateMapArgs),
    /// Create a range shard map
    CreateRangeMap(CreateMapArgs),
    /// Map a key of a list shard map to a shard
    AddListMapShard(AddListMapShardArgs),
    /// Map a key range of a range shard map to a shard
    AddRangeMapShard(AddRangeMapShardArgs),
    /// Spread the whole int32 key space of a range shard map over shards
    AddInt32RangeMapShards(AddInt32RangeMapShardsArgs),
}

#[derive(Debug, Args)]
pub struct ManagerArgs {
    /// Connection string of the shard map manager database
    #[arg(long = "connection-string", short = 'c')]
    pub connection_string: String,
}

#[derive(Debug, Args)]
pub struct CreateMapArgs {
    #[command(flatten)]
    pub manager: ManagerArgs,

    /// Name of the shard map
    #[arg(long = "map-name", short = 'm')]
    pub map_name: String,

    /// Key type: int32, int64 or guid
    #[arg(long = "key-type", short = 'k')]
    pub key_type: ShardKeyType,
}

#[derive(Debug, Args)]
pub struct ShardArgs {
    /// Server of the shard database
    #[arg(long = "shard-server")]
    pub server: String,

    /// Name of the shard database
    #[arg(long = "shard-database")]
    pub database: String,
}

#[derive(Debug, Args)]
pub struct AddListMapShardArgs {
    #[command(flatten)]
    pub manager: ManagerArgs,

    /// Name of the list shard map
    #[arg(long = "map-name", short = 'm')]
    pub map_name: String,

    /// Shard key as Type|Value
    #[arg(long = "shard-key", value_parser = parse_shard_key)]
    pub key: ShardKeyValue,

    #[command(flatten)]
    pub shard: ShardArgs,
}

#[derive(Debug, Args)]
pub struct AddRangeMapShardArgs {
    #[command(flatten)]
    pub manager: ManagerArgs,

    /// Name of the range shard map
    #[arg(long = "map-name", short = 'm')]
    pub map_name: String,

    /// Shard key range as Type|Low,High; leave High empty for no upper bound
    #[arg(long = "shard-key-range", value_parser = parse_shard_key_range)]
    pub range: ShardKeyRange,

    #[command(flatten)]
    pub shard: ShardArgs,
}

#[derive(Debug, Args)]
pub struct AddInt32RangeMapShardsArgs {
    #[command(flatten)]
    pub manager: ManagerArgs,

    /// Name of the range shard map
    #[arg(long = "map-name", short = 'm')]
    pub map_name: String,

    /// Shard locations as server|database,server|database,...
    #[arg(long = "shard-locations", value_parser = parse_shard_locations)]
    pub locations: ShardLocations,
}

/// A parsed `Type|Low,High` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardKeyRange {
    pub key_type: ShardKeyType,
    pub low: ShardKeyValue,
    pub high: Option<ShardKeyValue>,
}

/// A parsed `server|database,...` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLocations(pub Vec<ShardLocation>);

fn split_key_type(value: &str, format: &str) -> Result<(ShardKeyType, String), String> {
    let (key_type, rest) = value
        .split_once('|')
        .ok_or_else(|| format!("'{value}' is not in the expected format of {format}"))?;
    let key_type = key_type.trim().parse().map_err(|e: UnknownShardKeyType| e.to_string())?;
    Ok((key_type, rest.to_string()))
}

/// Parses `Type|Value`.
pub fn parse_shard_key(value: &str) -> Result<ShardKeyValue, String> {
    let (key_type, key) = split_key_type(value, "Type|Value")?;
    ShardKeyValue::parse(key_type, &key).map_err(|e| e.to_string())
}

/// Parses `Type|Low,High` or `Type|Low,`.
pub fn parse_shard_key_range(value: &str) -> Result<ShardKeyRange, String> {
    let (key_type, bounds) = split_key_type(value, "Type|Low,High")?;
    let (low, high) = bounds
        .split_once(',')
        .ok_or_else(|| format!("'{value}' is not in the expected format of Type|Low,High"))?;
    let low = ShardKeyValue::parse(key_type, low).map_err(|e| e.to_string())?;
    let high = match high.trim() {
        "" => None,
        high => Some(ShardKeyValue::parse(key_type, high).map_err(|e| e.to_string())?),
    };
    if let Some(high) = high {
        if high <= low {
            return Err(format!(
                "Shard key range low value {low} is not less than high value {high}"
            ));
        }
    }
    Ok(ShardKeyRange {
        key_type,
        low,
        high,
    })
}

/// Parses `server|database,server|database,...`.
pub fn parse_shard_locations(value: &str) -> Result<ShardLocations, String> {
    value
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (server, database) = pair
                .split_once('|')
                .filter(|(server, database)| {
                    !server.trim().is_empty()
                        && !database.trim().is_empty()
                        && !database.contains('|')
                })
                .ok_or_else(|| {
                    format!("Shard location '{pair}' is not in the expected format of Server|Database")
                })?;
            Ok(ShardLocation::new(server.trim(), database.trim()))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(ShardLocations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("dbdeploy").chain(args.iter().copied()))
    }

    #[test]
    fn deploy_arguments_map_to_manager_config() {
        let cli = parse(&[
            "deploy",
            "-t",
            "/bundles/v2/bundle.json",
            "-d",
            "db1:5432|orders",
            "--mode",
            "MigrationOnly",
            "--migration-configuration",
            "Orders.Migrations.Configuration",
            "--server-transaction",
        ])
        .expect("Arguments should parse");
        let Command::Deploy(args) = cli.command else {
            panic!("Expected deploy");
        };

        let config = args.manager_config(args.configuration());
        assert_eq!(config.mode, DeploymentMode::MigrationOnly);
        assert_eq!(config.database, DatabaseEndpoint::new("db1:5432", "orders"));
        assert!(config.run_server_migrations_in_transaction);
        assert_eq!(
            config.migration_config.clone().map(|info| info.type_name),
            Some("Orders.Migrations.Configuration".to_string())
        );
        assert!(config.initializer_config.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn service_account_arguments_reach_the_initializer() {
        let cli = parse(&[
            "deploy",
            "-t",
            "bundle.json",
            "-d",
            "srv|db",
            "--initializer",
            "CreateSecureDatabaseIfNotExists<Ctx>",
            "--service-account",
            "svc",
            "--service-account-type",
            "Sql",
            "--service-account-password",
            "secret",
            "--disable-forced-seeding",
        ])
        .expect("Arguments should parse");
        let Command::Deploy(args) = cli.command else {
            panic!("Expected deploy");
        };

        let initializer = args
            .configuration()
            .initializer_configuration
            .expect("Initializer should be set");
        assert!(initializer.disable_forced_seeding);
        let account = initializer.service_account.expect("Account should be set");
        assert_eq!(account.name.as_deref(), Some("svc"));
        assert_eq!(account.account_type.as_deref(), Some("Sql"));
        assert_eq!(account.database_user_password.as_deref(), Some("secret"));
    }

    #[test]
    fn malformed_database_endpoint_is_rejected() {
        assert!(parse(&["deploy", "-t", "bundle.json", "-d", "no-separator"]).is_err());
    }

    #[test]
    fn config_file_excludes_type_arguments() {
        assert!(parse(&[
            "deploy",
            "-t",
            "bundle.json",
            "-d",
            "srv|db",
            "--config-file",
            "deploy.json",
            "--initializer",
            "CreateDatabaseIfNotExists<Ctx>",
        ])
        .is_err());
    }

    #[test]
    fn history_login_requires_password() {
        assert!(parse(&[
            "history", "list", "-s", "srv", "-d", "db", "-l", "admin", "--schema", "orders"
        ])
        .is_err());

        let cli = parse(&[
            "history", "extract", "-s", "srv", "-d", "db", "-l", "admin", "-p", "pw", "--schema",
            "orders", "--target-dir", "out", "--id", "20240101000000_x", "--no-verify",
        ])
        .expect("Arguments should parse");
        let Command::History(HistoryCommand::Extract(args)) = cli.command else {
            panic!("Expected history extract");
        };
        assert_eq!(args.connection.auth_mode(), AuthenticationMode::Sql);
        assert!(args.no_verify);
    }

    #[test]
    fn shard_key_arguments() {
        assert_eq!(parse_shard_key("int32|42"), Ok(ShardKeyValue::Int32(42)));
        assert_eq!(parse_shard_key("Int64| -7 "), Ok(ShardKeyValue::Int64(-7)));
        assert!(parse_shard_key("42").is_err());
        assert!(parse_shard_key("decimal|42").is_err());
        assert!(parse_shard_key("int32|forty-two").is_err());
    }

    #[test]
    fn shard_key_range_arguments() {
        assert_eq!(
            parse_shard_key_range("int32|0,100"),
            Ok(ShardKeyRange {
                key_type: ShardKeyType::Int32,
                low: ShardKeyValue::Int32(0),
                high: Some(ShardKeyValue::Int32(100)),
            })
        );
        assert_eq!(
            parse_shard_key_range("int64|100,").map(|range| range.high),
            Ok(None)
        );
        assert!(parse_shard_key_range("int32|100,0").is_err());
        assert!(parse_shard_key_range("int32|5,5").is_err());
        assert!(parse_shard_key_range("int32|5").is_err());
    }

    #[test]
    fn shard_location_arguments() {
        assert_eq!(
            parse_shard_locations("srv1|shard1, srv2|shard2"),
            Ok(ShardLocations(vec![
                ShardLocation::new("srv1", "shard1"),
                ShardLocation::new("srv2", "shard2"),
            ]))
        );
        assert!(parse_shard_locations("srv1|shard1,srv2").is_err());
        assert!(parse_shard_locations("srv1|a|b").is_err());
    }

    #[test]
    fn verbose_is_global() {
        let cli = parse(&[
            "shard",
            "create-list-map",
            "-c",
            "postgres://localhost/smm",
            "-m",
            "tenants",
            "-k",
            "guid",
            "--verbose",
        ])
        .expect("Arguments should parse");
        assert!(cli.verbose);
        let Command::Shard(ShardCommand::CreateListMap(args)) = cli.command else {
            panic!("Expected shard create-list-map");
        };
        assert_eq!(args.key_type, ShardKeyType::Guid);
    }
}
