//! The database a deployment is applied to.

use async_trait::async_trait;

use crate::bundle::ContextKeySchema;
use crate::config::{AuthenticationMode, DatabaseEndpoint};
use crate::history::DeploymentHistoryStore;
use crate::initializer::ServiceAccount;
use crate::migrator::MigrationStep;

/// A deployment target database.
///
/// The manager drives everything through this trait: existence checks,
/// creation, migration bookkeeping, step execution, seeding scripts and
/// service-account provisioning. The history store is reached through
/// [`DeploymentTarget::history`] and never shares the migration scope.
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    /// An open transaction scope. Dropping it without
    /// [`DeploymentTarget::commit`] rolls the scope back.
    type Scope: Send;
    /// The error returned by the target.
    type Error: std::error::Error + Send + Sync + 'static;
    /// The history store living in the same database.
    type History: DeploymentHistoryStore;

    /// The endpoint this target points at.
    fn endpoint(&self) -> &DatabaseEndpoint;

    /// The deployment history store of this database.
    fn history(&self) -> &Self::History;

    /// Whether the database exists.
    async fn database_exists(&self) -> Result<bool, Self::Error>;

    /// Creates the database if needed. Returns `true` when it was created.
    async fn create_database(&self) -> Result<bool, Self::Error>;

    /// Whether migration metadata for the context is present, i.e. at least
    /// one migration of the context has been applied.
    async fn has_model_metadata(&self, context: &ContextKeySchema) -> Result<bool, Self::Error>;

    /// Ids of the context's applied migrations, ascending.
    async fn applied_migrations(
        &self,
        context: &ContextKeySchema,
    ) -> Result<Vec<String>, Self::Error>;

    /// Opens a transaction scope.
    async fn begin(&self) -> Result<Self::Scope, Self::Error>;

    /// Commits a scope.
    async fn commit(&self, scope: Self::Scope) -> Result<(), Self::Error>;

    /// Applies `steps` in order and records them in the context's migration
    /// metadata.
    ///
    /// With a scope every step runs inside it and nothing is committed.
    /// Without one the steps run in a single transaction that commits after
    /// the last step, so a failing step leaves none of them applied.
    async fn apply_migrations(
        &self,
        context: &ContextKeySchema,
        steps: &[MigrationStep],
        scope: Option<&mut Self::Scope>,
    ) -> Result<(), Self::Error>;

    /// Executes an idempotent script outside any scope.
    async fn execute_script(&self, sql: &str) -> Result<(), Self::Error>;

    /// Creates the service account's login and database user if needed and
    /// grants it read, write and execute rights on `schema`.
    async fn provision_service_account(
        &self,
        account: &ServiceAccount,
        schema: &str,
    ) -> Result<(), Self::Error>;
}

/// Builds backend connection strings from endpoint and credentials.
pub trait ConnectionInfoBuilder {
    /// The connection string for `endpoint`.
    fn build_connection_string(
        &self,
        endpoint: &DatabaseEndpoint,
        auth_mode: AuthenticationMode,
        login: Option<&str>,
        password: Option<&str>,
    ) -> String;
}
