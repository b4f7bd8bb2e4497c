use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use dbdeploy_core::prelude::*;

use crate::quote_ident;

/// Errors returned by the [`PgDeploymentHistoryStore`].
#[derive(Debug, thiserror::Error)]
pub enum PgHistoryStoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Deployment history kept in `<schema>."__DeploymentHistory"`.
///
/// Every operation runs on its own pooled connection, never inside a
/// deployment scope.
#[derive(Debug, Clone)]
pub struct PgDeploymentHistoryStore {
    pool: PgPool,
}

impl PgDeploymentHistoryStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn history_table(schema: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(schema),
        quote_ident(DEPLOYMENT_HISTORY_TABLE)
    )
}

fn record_from_row(row: &PgRow) -> Result<DeploymentHistoryRecord, sqlx::Error> {
    Ok(DeploymentHistoryRecord {
        deployment_id: row.try_get("DeploymentId")?,
        context_key: row.try_get("ContextKey")?,
        assembly_file_name: row.try_get("AssemblyFileName")?,
        binaries: row.try_get("Binaries")?,
        hashes: row.try_get("Hashes")?,
        deployer_version: row.try_get("DeployerVersion")?,
    })
}

#[async_trait]
impl DeploymentHistoryStore for PgDeploymentHistoryStore {
    type Error = PgHistoryStoreError;

    async fn setup(&self, schema: &str) -> Result<(), Self::Error> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                "DeploymentId" VARCHAR(150) PRIMARY KEY,
                "ContextKey" VARCHAR(300) NOT NULL,
                "AssemblyFileName" VARCHAR(260) NOT NULL,
                "Binaries" BYTEA NOT NULL,
                "Hashes" BYTEA NOT NULL,
                "DeployerVersion" VARCHAR(32) NOT NULL
            )
            "#,
            history_table(schema)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn table_exists(&self, schema: &str) -> Result<bool, Self::Error> {
        let exists: bool = sqlx::query_scalar(r#"SELECT to_regclass($1) IS NOT NULL"#)
            .bind(history_table(schema))
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn insert(
        &self,
        schema: &str,
        record: &DeploymentHistoryRecord,
    ) -> Result<u64, Self::Error> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} ("DeploymentId", "ContextKey", "AssemblyFileName", "Binaries", "Hashes", "DeployerVersion")
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            history_table(schema)
        ))
        .bind(&record.deployment_id)
        .bind(&record.context_key)
        .bind(&record.assembly_file_name)
        .bind(&record.binaries)
        .bind(&record.hashes)
        .bind(&record.deployer_version)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn latest(
        &self,
        schema: &str,
        context_key: &str,
    ) -> Result<Option<DeploymentHistoryRecord>, Self::Error> {
        let row = sqlx::query(&format!(
            r#"
            SELECT * FROM {}
            WHERE "ContextKey" = $1
            ORDER BY "DeploymentId" COLLATE "C" DESC
            LIMIT 1
            "#,
            history_table(schema)
        ))
        .bind(context_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn by_id(
        &self,
        schema: &str,
        deployment_id: &str,
    ) -> Result<Option<DeploymentHistoryRecord>, Self::Error> {
        let row = sqlx::query(&format!(
            r#"SELECT * FROM {} WHERE "DeploymentId" = $1"#,
            history_table(schema)
        ))
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    async fn entries(
        &self,
        schema: &str,
        context_key: Option<&str>,
    ) -> Result<Vec<DeploymentHistoryEntry>, Self::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT "DeploymentId", "ContextKey", "AssemblyFileName", "DeployerVersion"
            FROM {}
            WHERE $1::text IS NULL OR "ContextKey" = $1
            ORDER BY "DeploymentId" COLLATE "C" DESC
            "#,
            history_table(schema)
        ))
        .bind(context_key)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(DeploymentHistoryEntry {
                deployment_id: row.try_get("DeploymentId")?,
                context_key: row.try_get("ContextKey")?,
                assembly_file_name: row.try_get("AssemblyFileName")?,
                deployer_version: row.try_get("DeployerVersion")?,
            });
        }
        Ok(entries)
    }
}
