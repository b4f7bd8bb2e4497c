//! The shard map manager's own schema.
//!
//! Its tables live in the `shard_map_manager` schema and are created by a short
//! list of versioned [`SchemaMigration`]s. Every applied version is recorded in
//! `shard_map_manager._migrations` together with a checksum of its statements,
//! so a migration edited after it shipped is reported instead of skipped.
//!
//! ```rust,ignore
//! use dbdeploy_pg::migrations::ManagerSchema;
//!
//! let schema = ManagerSchema::new(pool);
//! if !schema.pending().await?.is_empty() {
//!     schema.install().await?;
//! }
//! ```
//!
//! New migrations go in a new `mXXX_description.rs` file and are appended to
//! `MIGRATIONS`.

mod m001_create_shard_maps;
mod m002_create_mappings;

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

/// Schema holding the shard map manager's tables.
pub const SHARD_MAP_MANAGER_SCHEMA: &str = "shard_map_manager";

const MIGRATIONS: &[SchemaMigration] = &[
    m001_create_shard_maps::CREATE_SHARD_MAPS,
    m002_create_mappings::CREATE_MAPPINGS,
];

/// Errors raised while inspecting or installing the manager schema.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An applied migration no longer matches its definition.
    #[error("Shard map manager migration {version} ({name}) changed after it was applied: recorded checksum {recorded}, current {current}")]
    ChecksumMismatch {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: String,
        /// Checksum stored when it was applied.
        recorded: String,
        /// Checksum of the current definition.
        current: String,
    },

    /// The database records a version this build does not know.
    #[error("Shard map manager migration {0} is applied but unknown to this version of dbdeploy")]
    UnknownVersion(i64),

    /// A statement of a migration failed; the migration was rolled back.
    #[error("Shard map manager migration {version} ({name}) failed: {reason}")]
    Failed {
        /// Version of the migration.
        version: i64,
        /// Name of the migration.
        name: &'static str,
        /// The database error.
        reason: String,
    },
}

/// One versioned change to the manager schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaMigration {
    /// Sequential version, starting at 1.
    pub version: i64,
    /// Short name, e.g. `create_shard_maps`.
    pub name: &'static str,
    /// Statements run in order, in one transaction.
    pub statements: &'static [&'static str],
}

impl SchemaMigration {
    /// Hex SHA-256 over version, name and statements.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.name.as_bytes());
        for statement in self.statements {
            hasher.update([0u8]);
            hasher.update(statement.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    async fn apply(&self, pool: &PgPool) -> Result<(), MigrationError> {
        let failed = |e: sqlx::Error| MigrationError::Failed {
            version: self.version,
            name: self.name,
            reason: e.to_string(),
        };

        let mut tx = pool.begin().await?;
        for statement in self.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(failed)?;
        }
        sqlx::query(
            r#"INSERT INTO shard_map_manager._migrations (version, name, checksum) VALUES ($1, $2, $3)"#,
        )
        .bind(self.version)
        .bind(self.name)
        .bind(self.checksum())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// A migration recorded in `shard_map_manager._migrations`.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    /// Version of the migration.
    pub version: i64,
    /// Name it was applied under.
    pub name: String,
    /// When it was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// Checksum of its definition at the time.
    pub checksum: String,
}

/// Inspects and installs the manager schema of one database.
#[derive(Debug, Clone)]
pub struct ManagerSchema {
    pool: PgPool,
}

impl ManagerSchema {
    /// Works on the database behind `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Version of the newest migration this build knows.
    pub fn latest_version() -> i64 {
        MIGRATIONS.last().map_or(0, |migration| migration.version)
    }

    /// Whether the tracking table exists. Never creates anything.
    pub async fn is_installed(&self) -> Result<bool, MigrationError> {
        let exists: bool = sqlx::query_scalar(r#"SELECT to_regclass($1) IS NOT NULL"#)
            .bind(format!("{SHARD_MAP_MANAGER_SCHEMA}._migrations"))
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Applied migrations by version; empty when not installed.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        if !self.is_installed().await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"SELECT version, name, applied_at, checksum FROM shard_map_manager._migrations ORDER BY version"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(MigrationRecord {
                version: row.try_get("version")?,
                name: row.try_get("name")?,
                applied_at: row.try_get("applied_at")?,
                checksum: row.try_get("checksum")?,
            });
        }
        Ok(records)
    }

    /// Highest applied version, 0 when nothing is applied.
    pub async fn version(&self) -> Result<i64, MigrationError> {
        Ok(self
            .applied()
            .await?
            .last()
            .map_or(0, |record| record.version))
    }

    /// Migrations still to apply, in order. Fails when an applied migration
    /// was changed or is unknown.
    pub async fn pending(&self) -> Result<Vec<SchemaMigration>, MigrationError> {
        let applied = verified_versions(&self.applied().await?)?;
        Ok(MIGRATIONS
            .iter()
            .filter(|migration| !applied.contains(&migration.version))
            .copied()
            .collect())
    }

    /// Creates the schema and tracking table if needed and applies every
    /// pending migration, each in its own transaction.
    ///
    /// Returns how many migrations were applied.
    pub async fn install(&self) -> Result<usize, MigrationError> {
        sqlx::query(r#"CREATE SCHEMA IF NOT EXISTS shard_map_manager"#)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS shard_map_manager._migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let pending = self.pending().await?;
        for migration in &pending {
            log::info!(
                "Applying shard map manager migration {} ({})",
                migration.version,
                migration.name
            );
            migration.apply(&self.pool).await?;
        }
        Ok(pending.len())
    }
}

fn verified_versions(applied: &[MigrationRecord]) -> Result<HashSet<i64>, MigrationError> {
    let mut versions = HashSet::with_capacity(applied.len());
    for record in applied {
        let migration = MIGRATIONS
            .iter()
            .find(|migration| migration.version == record.version)
            .ok_or(MigrationError::UnknownVersion(record.version))?;
        let current = migration.checksum();
        if current != record.checksum {
            return Err(MigrationError::ChecksumMismatch {
                version: record.version,
                name: record.name.clone(),
                recorded: record.checksum.clone(),
                current,
            });
        }
        versions.insert(record.version);
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(migration: &SchemaMigration, checksum: String) -> MigrationRecord {
        MigrationRecord {
            version: migration.version,
            name: migration.name.to_string(),
            applied_at: chrono::Utc::now(),
            checksum,
        }
    }

    #[test]
    fn versions_are_sequential_from_one() {
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, index as i64 + 1, "{}", migration.name);
        }
        assert_eq!(ManagerSchema::latest_version(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn checksum_covers_statements() {
        let edited = SchemaMigration {
            statements: &["SELECT 1"],
            ..m001_create_shard_maps::CREATE_SHARD_MAPS
        };
        assert_ne!(edited.checksum(), m001_create_shard_maps::CREATE_SHARD_MAPS.checksum());
        assert_eq!(edited.checksum(), edited.checksum());
    }

    #[test]
    fn matching_records_are_verified() {
        let applied: Vec<_> = MIGRATIONS
            .iter()
            .map(|migration| record(migration, migration.checksum()))
            .collect();
        let versions = verified_versions(&applied).expect("Records should verify");
        assert_eq!(versions.len(), MIGRATIONS.len());
    }

    #[test]
    fn edited_and_unknown_records_are_rejected() {
        let edited = [record(&MIGRATIONS[0], "0".repeat(64))];
        assert!(matches!(
            verified_versions(&edited),
            Err(MigrationError::ChecksumMismatch { version: 1, .. })
        ));

        let unknown = [MigrationRecord {
            version: 99,
            ..record(&MIGRATIONS[0], String::new())
        }];
        assert!(matches!(
            verified_versions(&unknown),
            Err(MigrationError::UnknownVersion(99))
        ));
    }
}
