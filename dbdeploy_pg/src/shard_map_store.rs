use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use dbdeploy_core::prelude::*;

use crate::migrations::{ManagerSchema, MigrationError};

/// Errors returned by the [`PgShardMapStore`].
#[derive(Debug, thiserror::Error)]
pub enum PgShardMapStoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Installing the manager schema failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// No map with the given name.
    #[error("Shard map {0} does not exist")]
    MapMissing(String),

    /// A stored row holds an unknown kind, key type or key encoding.
    #[error("Corrupt shard map row: {0}")]
    CorruptRow(String),
}

/// Shard maps stored in the `shard_map_manager` schema.
#[derive(Debug, Clone)]
pub struct PgShardMapStore {
    pool: PgPool,
}

impl PgShardMapStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn key_type(&self, map: &str) -> Result<ShardKeyType, PgShardMapStoreError> {
        self.shard_map(map)
            .await?
            .map(|info| info.key_type)
            .ok_or_else(|| PgShardMapStoreError::MapMissing(map.to_string()))
    }
}

fn parse_kind(kind: &str) -> Result<ShardMapKind, PgShardMapStoreError> {
    match kind {
        "list" => Ok(ShardMapKind::List),
        "range" => Ok(ShardMapKind::Range),
        other => Err(PgShardMapStoreError::CorruptRow(format!(
            "unknown shard map kind '{other}'"
        ))),
    }
}

fn decode_key(key_type: ShardKeyType, bytes: &[u8]) -> Result<ShardKeyValue, PgShardMapStoreError> {
    ShardKeyValue::from_bytes(key_type, bytes).ok_or_else(|| {
        PgShardMapStoreError::CorruptRow(format!("{} bytes do not encode a {key_type} key", bytes.len()))
    })
}

fn location_from_row(row: &PgRow) -> Result<ShardLocation, sqlx::Error> {
    Ok(ShardLocation::new(
        row.try_get::<String, _>("server_name")?,
        row.try_get::<String, _>("database_name")?,
    ))
}

fn range_from_row(key_type: ShardKeyType, row: &PgRow) -> Result<RangeMapping, PgShardMapStoreError> {
    let low: Vec<u8> = row.try_get("low_key")?;
    let high: Option<Vec<u8>> = row.try_get("high_key")?;
    Ok(RangeMapping {
        low: decode_key(key_type, &low)?,
        high: high
            .as_deref()
            .map(|bytes| decode_key(key_type, bytes))
            .transpose()?,
        location: location_from_row(row)?,
    })
}

#[async_trait]
impl ShardMapStore for PgShardMapStore {
    type Error = PgShardMapStoreError;

    async fn manager_exists(&self) -> Result<bool, Self::Error> {
        let schema = ManagerSchema::new(self.pool.clone());
        Ok(schema.is_installed().await? && schema.pending().await?.is_empty())
    }

    async fn create_manager(&self) -> Result<(), Self::Error> {
        let applied = ManagerSchema::new(self.pool.clone()).install().await?;
        log::debug!("Applied {applied} shard map manager migrations");
        Ok(())
    }

    async fn shard_map(&self, name: &str) -> Result<Option<ShardMapInfo>, Self::Error> {
        let row = sqlx::query(
            r#"SELECT name, kind, key_type FROM shard_map_manager.shard_maps WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: String = row.try_get("kind")?;
        let key_type: String = row.try_get("key_type")?;
        Ok(Some(ShardMapInfo {
            name: row.try_get("name")?,
            kind: parse_kind(&kind)?,
            key_type: key_type
                .parse()
                .map_err(|e: UnknownShardKeyType| PgShardMapStoreError::CorruptRow(e.to_string()))?,
        }))
    }

    async fn create_shard_map(&self, info: &ShardMapInfo) -> Result<(), Self::Error> {
        sqlx::query(
            r#"INSERT INTO shard_map_manager.shard_maps (name, kind, key_type) VALUES ($1, $2, $3)"#,
        )
        .bind(&info.name)
        .bind(info.kind.to_string())
        .bind(info.key_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn shard_exists(&self, map: &str, location: &ShardLocation) -> Result<bool, Self::Error> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM shard_map_manager.shards
                WHERE map_name = $1 AND server_name = $2 AND database_name = $3
            )
            "#,
        )
        .bind(map)
        .bind(&location.server)
        .bind(&location.database)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_shard(&self, map: &str, location: &ShardLocation) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO shard_map_manager.shards (map_name, server_name, database_name)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(map)
        .bind(&location.server)
        .bind(&location.database)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn point_mapping(
        &self,
        map: &str,
        key: &ShardKeyValue,
    ) -> Result<Option<PointMapping>, Self::Error> {
        let row = sqlx::query(
            r#"
            SELECT server_name, database_name FROM shard_map_manager.point_mappings
            WHERE map_name = $1 AND shard_key = $2
            "#,
        )
        .bind(map)
        .bind(key.to_bytes())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .as_ref()
            .map(location_from_row)
            .transpose()?
            .map(|location| PointMapping {
                key: *key,
                location,
            }))
    }

    async fn create_point_mapping(
        &self,
        map: &str,
        key: &ShardKeyValue,
        location: &ShardLocation,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO shard_map_manager.point_mappings (map_name, shard_key, server_name, database_name)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(map)
        .bind(key.to_bytes())
        .bind(&location.server)
        .bind(&location.database)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn intersecting_range_mappings(
        &self,
        map: &str,
        low: &ShardKeyValue,
        high: Option<&ShardKeyValue>,
    ) -> Result<Vec<RangeMapping>, Self::Error> {
        let key_type = self.key_type(map).await?;
        let rows = sqlx::query(
            r#"
            SELECT low_key, high_key, server_name, database_name
            FROM shard_map_manager.range_mappings
            WHERE map_name = $1
              AND (high_key IS NULL OR $2 < high_key)
              AND ($3::bytea IS NULL OR low_key < $3)
            ORDER BY low_key
            "#,
        )
        .bind(map)
        .bind(low.to_bytes())
        .bind(high.map(ShardKeyValue::to_bytes))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| range_from_row(key_type, row)).collect()
    }

    async fn create_range_mapping(
        &self,
        map: &str,
        low: &ShardKeyValue,
        high: Option<&ShardKeyValue>,
        location: &ShardLocation,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO shard_map_manager.range_mappings (map_name, low_key, high_key, server_name, database_name)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(map)
        .bind(low.to_bytes())
        .bind(high.map(ShardKeyValue::to_bytes))
        .bind(&location.server)
        .bind(&location.database)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn point_mappings(&self, map: &str) -> Result<Vec<PointMapping>, Self::Error> {
        let key_type = self.key_type(map).await?;
        let rows = sqlx::query(
            r#"
            SELECT shard_key, server_name, database_name
            FROM shard_map_manager.point_mappings
            WHERE map_name = $1
            ORDER BY shard_key
            "#,
        )
        .bind(map)
        .fetch_all(&self.pool)
        .await?;

        let mut mappings = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: Vec<u8> = row.try_get("shard_key")?;
            mappings.push(PointMapping {
                key: decode_key(key_type, &key)?,
                location: location_from_row(row)?,
            });
        }
        Ok(mappings)
    }

    async fn range_mappings(&self, map: &str) -> Result<Vec<RangeMapping>, Self::Error> {
        let key_type = self.key_type(map).await?;
        let rows = sqlx::query(
            r#"
            SELECT low_key, high_key, server_name, database_name
            FROM shard_map_manager.range_mappings
            WHERE map_name = $1
            ORDER BY low_key
            "#,
        )
        .bind(map)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| range_from_row(key_type, row)).collect()
    }
}
