//! Subcommand implementations.

use anyhow::{bail, Context};
use dbdeploy::prelude::*;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::args::{
    AddInt32RangeMapShardsArgs, AddListMapShardArgs, AddRangeMapShardArgs, ConnectionArgs,
    CreateMapArgs, DeployArgs, HistoryCommand, ManagerArgs, ShardCommand,
};

pub async fn deploy(args: DeployArgs) -> anyhow::Result<()> {
    let configuration = match &args.config_file {
        Some(path) => JsonFileConfigurationStore::new(path).load()?,
        None => InMemoryConfigurationStore::new(args.configuration()).load()?,
    };
    let config = args.manager_config(configuration);
    config.validate()?;

    let options = PgConnectionInfoBuilder.connect_options(
        &config.database,
        config.auth_mode,
        config.sql_login.as_deref(),
        config.sql_password.as_deref(),
    );
    let target = PgDeploymentTarget::new(config.database.clone(), options);
    let mut manager = DeploymentManager::new(config, target.clone())?
        .with_deployer_version(env!("CARGO_PKG_VERSION"));

    let report = manager.deploy().await;
    target.pool().close().await;
    let report = report?;

    if report.initialized {
        println!("Initialized {}", manager.config().database);
    }
    if let Some((source, migration)) = &report.migration {
        println!(
            "Migrated to {migration} from the {source} bundle in {} steps",
            report.migration_steps
        );
    }
    if let Some(id) = &report.deployment_id {
        println!("Archived deployment {id}");
    }
    if report.seeded {
        println!("Seeded {}", manager.config().database);
    }
    Ok(())
}

async fn connect(connection: &ConnectionArgs) -> anyhow::Result<PgPool> {
    let endpoint = connection.endpoint();
    let options = PgConnectionInfoBuilder.connect_options(
        &endpoint,
        connection.auth_mode(),
        connection.login.as_deref(),
        connection.password.as_deref(),
    );
    PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("Unable to connect to {endpoint}"))
}

pub async fn history(command: HistoryCommand) -> anyhow::Result<()> {
    match command {
        HistoryCommand::Extract(args) => {
            let store = PgDeploymentHistoryStore::new(connect(&args.connection).await?);
            let history = DeploymentHistory::new(&store);
            let Some(manifest) = history
                .extract(&args.id, &args.schema, &args.target_dir, !args.no_verify)
                .await?
            else {
                bail!("Deployment {} not found in schema {}", args.id, args.schema);
            };
            println!("Extracted deployment {} to {}", args.id, manifest.display());
        }
        HistoryCommand::List(args) => {
            let store = PgDeploymentHistoryStore::new(connect(&args.connection).await?);
            let entries = DeploymentHistory::new(&store)
                .list(&args.schema, args.context_key.as_deref())
                .await?;
            for entry in entries {
                println!(
                    "{}\t{}\t{}\t{}",
                    entry.deployment_id,
                    entry.context_key,
                    entry.assembly_file_name,
                    entry.deployer_version
                );
            }
        }
    }
    Ok(())
}

async fn service(manager: &ManagerArgs) -> anyhow::Result<ShardMapManagementService<PgShardMapStore>> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&manager.connection_string)
        .await
        .context("Unable to connect to the shard map manager database")?;
    Ok(ShardMapManagementService::new(PgShardMapStore::new(pool)))
}

fn report(what: &str, outcome: MappingOutcome) {
    match outcome {
        MappingOutcome::Created => println!("Created {what}"),
        MappingOutcome::Unchanged => println!("{what} already exists"),
    }
}

fn typed<K: ShardKey>(value: ShardKeyValue) -> Result<K, ShardMapError> {
    K::from_value(value).ok_or_else(|| ShardMapError::InvalidKey {
        key_type: K::KEY_TYPE,
        value: value.to_string(),
    })
}

pub async fn shard(command: ShardCommand) -> anyhow::Result<()> {
    match command {
        ShardCommand::Deploy(args) => {
            let outcome = service(&args).await?.deploy().await?;
            report("shard map manager", outcome);
        }
        ShardCommand::CreateListMap(args) => create_map(args, ShardMapKind::List).await?,
        ShardCommand::CreateRangeMap(args) => create_map(args, ShardMapKind::Range).await?,
        ShardCommand::AddListMapShard(args) => add_list_map_shard(args).await?,
        ShardCommand::AddRangeMapShard(args) => add_range_map_shard(args).await?,
        ShardCommand::AddInt32RangeMapShards(args) => add_int32_range_map_shards(args).await?,
    }
    Ok(())
}

async fn create_map(args: CreateMapArgs, kind: ShardMapKind) -> anyhow::Result<()> {
    let service = service(&args.manager).await?;
    let name = args.map_name.as_str();
    let outcome = match (kind, args.key_type) {
        (ShardMapKind::List, ShardKeyType::Int32) => service.create_list_shard_map::<i32>(name).await?,
        (ShardMapKind::List, ShardKeyType::Int64) => service.create_list_shard_map::<i64>(name).await?,
        (ShardMapKind::List, ShardKeyType::Guid) => {
            service.create_list_shard_map::<uuid::Uuid>(name).await?
        }
        (ShardMapKind::Range, ShardKeyType::Int32) => service.create_range_shard_map::<i32>(name).await?,
        (ShardMapKind::Range, ShardKeyType::Int64) => service.create_range_shard_map::<i64>(name).await?,
        (ShardMapKind::Range, ShardKeyType::Guid) => {
            service.create_range_shard_map::<uuid::Uuid>(name).await?
        }
    };
    report(&format!("{kind} shard map {name}"), outcome);
    Ok(())
}

async fn add_list_map_shard(args: AddListMapShardArgs) -> anyhow::Result<()> {
    let service = service(&args.manager).await?;
    let (map, server, database) = (&args.map_name, &args.shard.server, &args.shard.database);
    let outcome = match args.key {
        ShardKeyValue::Int32(key) => service.add_list_map_shard(map, key, server, database).await?,
        ShardKeyValue::Int64(key) => service.add_list_map_shard(map, key, server, database).await?,
        ShardKeyValue::Guid(key) => service.add_list_map_shard(map, key, server, database).await?,
    };
    report(&format!("mapping of key {} in {map}", args.key), outcome);
    Ok(())
}

async fn add_range<K: ShardKey>(
    service: &ShardMapManagementService<PgShardMapStore>,
    args: &AddRangeMapShardArgs,
) -> Result<MappingOutcome, ShardMapError> {
    let low = typed::<K>(args.range.low)?;
    let high = args.range.high.map(typed::<K>).transpose()?;
    service
        .add_range_map_shard(
            &args.map_name,
            low,
            high,
            &args.shard.server,
            &args.shard.database,
        )
        .await
}

async fn add_range_map_shard(args: AddRangeMapShardArgs) -> anyhow::Result<()> {
    let service = service(&args.manager).await?;
    let outcome = match args.range.key_type {
        ShardKeyType::Int32 => add_range::<i32>(&service, &args).await?,
        ShardKeyType::Int64 => add_range::<i64>(&service, &args).await?,
        ShardKeyType::Guid => add_range::<uuid::Uuid>(&service, &args).await?,
    };
    let high = args
        .range
        .high
        .map(|high| high.to_string())
        .unwrap_or_else(|| "max".to_string());
    report(
        &format!("mapping of range [{}, {high}) in {}", args.range.low, args.map_name),
        outcome,
    );
    Ok(())
}

async fn add_int32_range_map_shards(args: AddInt32RangeMapShardsArgs) -> anyhow::Result<()> {
    let service = service(&args.manager).await?;
    let outcomes = service
        .add_int32_range_map_shards(&args.map_name, &args.locations.0)
        .await?;
    let created = outcomes
        .iter()
        .filter(|outcome| **outcome == MappingOutcome::Created)
        .count();
    println!(
        "Mapped {} int32 ranges in {} ({created} new)",
        outcomes.len(),
        args.map_name
    );
    Ok(())
}
