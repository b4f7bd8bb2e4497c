use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use dbdeploy_core::prelude::*;

use crate::InMemoryDeploymentHistoryStore;

/// A migration step as the in-memory database recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStep {
    /// Context the step ran for.
    pub context_key: String,
    /// Migration id.
    pub id: String,
    /// Up or down.
    pub direction: MigrationDirection,
}

/// A provisioned service account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedAccount {
    /// Login name of the account.
    pub login: String,
    /// Database user mapped to the login.
    pub database_user: String,
    /// Schema the grants apply to.
    pub schema: String,
}

#[derive(Debug, Default)]
struct DatabaseState {
    exists: bool,
    applied: HashMap<ContextKeySchema, BTreeSet<String>>,
    executed_steps: Vec<ExecutedStep>,
    executed_scripts: Vec<String>,
    accounts: Vec<ProvisionedAccount>,
    failing_migration: Option<String>,
    fail_commit: bool,
}

/// Errors returned by the [`InMemoryDeploymentTarget`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryTargetError {
    /// The database has not been created.
    #[error("Database {0} does not exist")]
    DatabaseMissing(String),
    /// A step was configured to fail.
    #[error("Migration {0} failed")]
    MigrationFailed(String),
    /// The commit was configured to fail.
    #[error("Commit failed")]
    CommitFailed,
    /// An up step for a migration that is already applied.
    #[error("Migration {0} is already applied")]
    AlreadyApplied(String),
    /// A down step for a migration that is not applied.
    #[error("Migration {0} is not applied")]
    NotApplied(String),
    /// The account lacks a login or user name.
    #[error("Service account is incomplete")]
    IncompleteAccount,
}

/// An open scope of the [`InMemoryDeploymentTarget`].
///
/// Holds the target's scope lock for its whole lifetime, so at most one scope
/// is open at a time. Steps applied inside the scope are buffered and become
/// visible on commit; dropping the scope discards them.
#[derive(Debug)]
pub struct InMemoryScope {
    _lock: OwnedMutexGuard<()>,
    buffered: Vec<(ContextKeySchema, Vec<MigrationStep>)>,
}

impl InMemoryScope {
    /// Number of buffered steps.
    pub fn buffered_steps(&self) -> usize {
        self.buffered.iter().map(|(_, steps)| steps.len()).sum()
    }
}

/// An in-memory deployment target.
///
/// Clones share the same database, so a test can keep a handle to inspect
/// the state after handing the target to a manager.
#[derive(Debug, Clone)]
pub struct InMemoryDeploymentTarget {
    endpoint: DatabaseEndpoint,
    state: Arc<Mutex<DatabaseState>>,
    scope_lock: Arc<Mutex<()>>,
    history: InMemoryDeploymentHistoryStore,
}

impl InMemoryDeploymentTarget {
    /// A target whose database does not exist yet.
    pub fn new(endpoint: DatabaseEndpoint) -> Self {
        log::debug!("Creating a new InMemoryDeploymentTarget for {endpoint}");
        Self {
            endpoint,
            state: Arc::new(Mutex::new(DatabaseState::default())),
            scope_lock: Arc::new(Mutex::new(())),
            history: InMemoryDeploymentHistoryStore::new(),
        }
    }

    /// A target whose database already exists, empty.
    pub async fn with_existing_database(endpoint: DatabaseEndpoint) -> Self {
        let target = Self::new(endpoint);
        target.state.lock().await.exists = true;
        target
    }

    /// Makes every later step for migration `id` fail.
    pub async fn fail_migration(&self, id: impl Into<String>) {
        self.state.lock().await.failing_migration = Some(id.into());
    }

    /// Makes the next scope commit fail.
    pub async fn fail_next_commit(&self) {
        self.state.lock().await.fail_commit = true;
    }

    /// Stops injecting failures.
    pub async fn clear_failure(&self) {
        let mut state = self.state.lock().await;
        state.failing_migration = None;
        state.fail_commit = false;
    }

    /// Whether the database exists.
    pub async fn exists(&self) -> bool {
        self.state.lock().await.exists
    }

    /// Committed migrations of the context, ascending.
    pub async fn applied(&self, context: &ContextKeySchema) -> Vec<String> {
        self.state
            .lock()
            .await
            .applied
            .get(context)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every committed step, in execution order.
    pub async fn executed_steps(&self) -> Vec<ExecutedStep> {
        self.state.lock().await.executed_steps.clone()
    }

    /// Every executed seed script, in execution order.
    pub async fn executed_scripts(&self) -> Vec<String> {
        self.state.lock().await.executed_scripts.clone()
    }

    /// Provisioned service accounts.
    pub async fn provisioned_accounts(&self) -> Vec<ProvisionedAccount> {
        self.state.lock().await.accounts.clone()
    }
}

/// Checks `steps` against the applied set and returns it with the steps
/// applied, without touching the state.
fn simulate(
    applied: &BTreeSet<String>,
    steps: &[MigrationStep],
    failing: Option<&str>,
) -> Result<BTreeSet<String>, InMemoryTargetError> {
    let mut applied = applied.clone();
    for step in steps {
        simulate_step(&mut applied, step, failing)?;
    }
    Ok(applied)
}

fn simulate_step(
    applied: &mut BTreeSet<String>,
    step: &MigrationStep,
    failing: Option<&str>,
) -> Result<(), InMemoryTargetError> {
    if failing == Some(step.id.as_str()) {
        return Err(InMemoryTargetError::MigrationFailed(step.id.clone()));
    }
    match step.direction {
        MigrationDirection::Up => {
            if !applied.insert(step.id.clone()) {
                return Err(InMemoryTargetError::AlreadyApplied(step.id.clone()));
            }
        }
        MigrationDirection::Down => {
            if !applied.remove(&step.id) {
                return Err(InMemoryTargetError::NotApplied(step.id.clone()));
            }
        }
    }
    Ok(())
}

fn record_steps(state: &mut DatabaseState, context: &ContextKeySchema, steps: &[MigrationStep]) {
    state
        .executed_steps
        .extend(steps.iter().map(|step| ExecutedStep {
            context_key: context.context_key.clone(),
            id: step.id.clone(),
            direction: step.direction,
        }));
}

#[async_trait]
impl DeploymentTarget for InMemoryDeploymentTarget {
    type Scope = InMemoryScope;
    type Error = InMemoryTargetError;
    type History = InMemoryDeploymentHistoryStore;

    fn endpoint(&self) -> &DatabaseEndpoint {
        &self.endpoint
    }

    fn history(&self) -> &Self::History {
        &self.history
    }

    async fn database_exists(&self) -> Result<bool, Self::Error> {
        Ok(self.state.lock().await.exists)
    }

    async fn create_database(&self) -> Result<bool, Self::Error> {
        let mut state = self.state.lock().await;
        if state.exists {
            return Ok(false);
        }
        state.exists = true;
        log::debug!("Created in-memory database {}", self.endpoint);
        Ok(true)
    }

    async fn has_model_metadata(&self, context: &ContextKeySchema) -> Result<bool, Self::Error> {
        let state = self.state.lock().await;
        Ok(state.exists && state.applied.get(context).is_some_and(|ids| !ids.is_empty()))
    }

    async fn applied_migrations(
        &self,
        context: &ContextKeySchema,
    ) -> Result<Vec<String>, Self::Error> {
        Ok(self.applied(context).await)
    }

    async fn begin(&self) -> Result<Self::Scope, Self::Error> {
        let lock = self.scope_lock.clone().lock_owned().await;
        log::debug!("Opened in-memory scope on {}", self.endpoint);
        Ok(InMemoryScope {
            _lock: lock,
            buffered: Vec::new(),
        })
    }

    async fn commit(&self, scope: Self::Scope) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_commit) {
            return Err(InMemoryTargetError::CommitFailed);
        }

        let mut committed = HashMap::new();
        for (context, steps) in &scope.buffered {
            let current = committed
                .get(context)
                .or_else(|| state.applied.get(context))
                .cloned()
                .unwrap_or_default();
            committed.insert(context.clone(), simulate(&current, steps, None)?);
        }

        for (context, steps) in &scope.buffered {
            record_steps(&mut state, context, steps);
        }
        state.applied.extend(committed);
        log::debug!("Committed {} buffered steps", scope.buffered_steps());
        Ok(())
    }

    async fn apply_migrations(
        &self,
        context: &ContextKeySchema,
        steps: &[MigrationStep],
        scope: Option<&mut Self::Scope>,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if !state.exists {
            return Err(InMemoryTargetError::DatabaseMissing(
                self.endpoint.database_name.clone(),
            ));
        }
        let failing = state.failing_migration.clone();

        match scope {
            Some(scope) => {
                // Validate against committed state plus what the scope already holds.
                let mut view = state.applied.get(context).cloned().unwrap_or_default();
                for (buffered_context, buffered) in &scope.buffered {
                    if buffered_context == context {
                        view = simulate(&view, buffered, None)?;
                    }
                }
                simulate(&view, steps, failing.as_deref())?;
                scope.buffered.push((context.clone(), steps.to_vec()));
            }
            None => {
                let current = state.applied.get(context).cloned().unwrap_or_default();
                let applied = simulate(&current, steps, failing.as_deref())?;
                record_steps(&mut state, context, steps);
                state.applied.insert(context.clone(), applied);
            }
        }
        Ok(())
    }

    async fn execute_script(&self, sql: &str) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if !state.exists {
            return Err(InMemoryTargetError::DatabaseMissing(
                self.endpoint.database_name.clone(),
            ));
        }
        state.executed_scripts.push(sql.to_string());
        Ok(())
    }

    async fn provision_service_account(
        &self,
        account: &ServiceAccount,
        schema: &str,
    ) -> Result<(), Self::Error> {
        let login = account
            .login_name()
            .ok_or(InMemoryTargetError::IncompleteAccount)?;
        let database_user = account
            .database_user
            .clone()
            .ok_or(InMemoryTargetError::IncompleteAccount)?;

        let mut state = self.state.lock().await;
        let provisioned = ProvisionedAccount {
            login,
            database_user,
            schema: schema.to_string(),
        };
        if !state.accounts.contains(&provisioned) {
            state.accounts.push(provisioned);
        }
        Ok(())
    }
}
