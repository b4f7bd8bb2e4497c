use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use dbdeploy_core::prelude::*;

use crate::connection::MAINTENANCE_DATABASE;
use crate::{quote_ident, quote_literal, PgDeploymentHistoryStore};

/// Name of the per-schema table recording applied migrations.
pub const MIGRATION_HISTORY_TABLE: &str = "__MigrationHistory";

/// Errors returned by the [`PgDeploymentTarget`].
#[derive(Debug, thiserror::Error)]
pub enum PgTargetError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration step failed to execute.
    #[error("Migration {id} ({direction:?}) failed: {reason}")]
    MigrationFailed {
        /// The migration id.
        id: String,
        /// Direction of the failed step.
        direction: MigrationDirection,
        /// The reason for the failure.
        reason: String,
    },

    /// The service account lacks a database user.
    #[error("Service account has no database user")]
    IncompleteAccount,
}

/// An open transaction on the target database.
///
/// Dropping it without [`DeploymentTarget::commit`] rolls back.
pub struct PgScope {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgScope").finish_non_exhaustive()
    }
}

/// A postgres database being deployed to.
///
/// Connections are established lazily, so a target can be built for a
/// database that does not exist yet. Server-level statements go through the
/// maintenance database.
#[derive(Debug, Clone)]
pub struct PgDeploymentTarget {
    endpoint: DatabaseEndpoint,
    pool: PgPool,
    maintenance: PgPool,
    history: PgDeploymentHistoryStore,
}

impl PgDeploymentTarget {
    /// Creates a target from connection options. The database name of
    /// `options` is replaced by the endpoint's.
    pub fn new(endpoint: DatabaseEndpoint, options: PgConnectOptions) -> Self {
        log::debug!("Creating a new PgDeploymentTarget for {endpoint}");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(options.clone().database(&endpoint.database_name));
        let maintenance = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(options.database(MAINTENANCE_DATABASE));
        Self {
            endpoint,
            history: PgDeploymentHistoryStore::new(pool.clone()),
            pool,
            maintenance,
        }
    }

    /// The pool of the target database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn migration_table_exists(&self, schema: &str) -> Result<bool, PgTargetError> {
        let exists: bool = sqlx::query_scalar(r#"SELECT to_regclass($1) IS NOT NULL"#)
            .bind(migration_table(schema))
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

fn migration_table(schema: &str) -> String {
    format!(
        "{}.{}",
        quote_ident(schema),
        quote_ident(MIGRATION_HISTORY_TABLE)
    )
}

async fn ensure_migration_table(
    conn: &mut PgConnection,
    schema: &str,
) -> Result<(), PgTargetError> {
    sqlx::query(&format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        quote_ident(schema)
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            "MigrationId" VARCHAR(150) NOT NULL,
            "ContextKey" VARCHAR(300) NOT NULL,
            "AppliedAt" TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            "ProductVersion" VARCHAR(32) NOT NULL,
            PRIMARY KEY ("MigrationId", "ContextKey")
        )
        "#,
        migration_table(schema)
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn apply_step(
    conn: &mut PgConnection,
    context: &ContextKeySchema,
    step: &MigrationStep,
) -> Result<(), PgTargetError> {
    log::debug!(
        "Running {:?} step of migration {} for {}",
        step.direction,
        step.id,
        context.context_key
    );
    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&step.sql))
        .await
        .map_err(|e| PgTargetError::MigrationFailed {
            id: step.id.clone(),
            direction: step.direction,
            reason: e.to_string(),
        })?;

    let table = migration_table(&context.schema_name);
    match step.direction {
        MigrationDirection::Up => {
            sqlx::query(&format!(
                r#"INSERT INTO {table} ("MigrationId", "ContextKey", "ProductVersion") VALUES ($1, $2, $3)"#
            ))
            .bind(&step.id)
            .bind(&context.context_key)
            .bind(env!("CARGO_PKG_VERSION"))
            .execute(&mut *conn)
            .await?;
        }
        MigrationDirection::Down => {
            sqlx::query(&format!(
                r#"DELETE FROM {table} WHERE "MigrationId" = $1 AND "ContextKey" = $2"#
            ))
            .bind(&step.id)
            .bind(&context.context_key)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl DeploymentTarget for PgDeploymentTarget {
    type Scope = PgScope;
    type Error = PgTargetError;
    type History = PgDeploymentHistoryStore;

    fn endpoint(&self) -> &DatabaseEndpoint {
        &self.endpoint
    }

    fn history(&self) -> &Self::History {
        &self.history
    }

    async fn database_exists(&self) -> Result<bool, Self::Error> {
        let exists: bool =
            sqlx::query_scalar(r#"SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)"#)
                .bind(&self.endpoint.database_name)
                .fetch_one(&self.maintenance)
                .await?;
        Ok(exists)
    }

    async fn create_database(&self) -> Result<bool, Self::Error> {
        if self.database_exists().await? {
            return Ok(false);
        }
        sqlx::query(&format!(
            "CREATE DATABASE {}",
            quote_ident(&self.endpoint.database_name)
        ))
        .execute(&self.maintenance)
        .await?;
        Ok(true)
    }

    async fn has_model_metadata(&self, context: &ContextKeySchema) -> Result<bool, Self::Error> {
        if !self.migration_table_exists(&context.schema_name).await? {
            return Ok(false);
        }
        let present: bool = sqlx::query_scalar(&format!(
            r#"SELECT EXISTS (SELECT 1 FROM {} WHERE "ContextKey" = $1)"#,
            migration_table(&context.schema_name)
        ))
        .bind(&context.context_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(present)
    }

    async fn applied_migrations(
        &self,
        context: &ContextKeySchema,
    ) -> Result<Vec<String>, Self::Error> {
        if !self.database_exists().await?
            || !self.migration_table_exists(&context.schema_name).await?
        {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = sqlx::query_scalar(&format!(
            r#"SELECT "MigrationId" FROM {} WHERE "ContextKey" = $1 ORDER BY "MigrationId" COLLATE "C" ASC"#,
            migration_table(&context.schema_name)
        ))
        .bind(&context.context_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn begin(&self) -> Result<Self::Scope, Self::Error> {
        Ok(PgScope {
            tx: self.pool.begin().await?,
        })
    }

    async fn commit(&self, scope: Self::Scope) -> Result<(), Self::Error> {
        scope.tx.commit().await?;
        Ok(())
    }

    async fn apply_migrations(
        &self,
        context: &ContextKeySchema,
        steps: &[MigrationStep],
        scope: Option<&mut Self::Scope>,
    ) -> Result<(), Self::Error> {
        match scope {
            Some(scope) => {
                ensure_migration_table(&mut scope.tx, &context.schema_name).await?;
                for step in steps {
                    apply_step(&mut scope.tx, context, step).await?;
                }
            }
            None => {
                let mut tx = self.pool.begin().await?;
                ensure_migration_table(&mut tx, &context.schema_name).await?;
                for step in steps {
                    apply_step(&mut tx, context, step).await?;
                }
                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn execute_script(&self, sql: &str) -> Result<(), Self::Error> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn provision_service_account(
        &self,
        account: &ServiceAccount,
        schema: &str,
    ) -> Result<(), Self::Error> {
        let user = account
            .database_user
            .as_deref()
            .ok_or(PgTargetError::IncompleteAccount)?;
        let role = quote_ident(user);
        let schema = quote_ident(schema);

        let create_role = match (account.account_type, &account.database_user_password) {
            (Some(ServiceAccountType::Sql), Some(password)) => {
                format!("CREATE ROLE {role} LOGIN PASSWORD {}", quote_literal(password))
            }
            // External logins authenticate through the server's ident mapping.
            _ => format!("CREATE ROLE {role} LOGIN"),
        };

        let script = format!(
            r#"
            DO $dbdeploy$
            BEGIN
                IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = {name}) THEN
                    {create_role};
                END IF;
            END
            $dbdeploy$;
            CREATE SCHEMA IF NOT EXISTS {schema};
            GRANT CONNECT ON DATABASE {database} TO {role};
            GRANT USAGE ON SCHEMA {schema} TO {role};
            GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {schema} TO {role};
            GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA {schema} TO {role};
            GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {schema} TO {role};
            ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {role};
            ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} GRANT EXECUTE ON FUNCTIONS TO {role};
            "#,
            name = quote_literal(user),
            database = quote_ident(&self.endpoint.database_name),
        );
        sqlx::raw_sql(&script).execute(&self.pool).await?;
        log::info!(
            "Granted {} access to schema {} as role {}",
            account.login_name().unwrap_or_default(),
            schema,
            role
        );
        Ok(())
    }
}
