use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use dbdeploy_core::prelude::*;

#[derive(Debug, Default)]
struct HistoryData {
    // schema -> deployment id -> record
    tables: HashMap<String, BTreeMap<String, DeploymentHistoryRecord>>,
    reject_inserts: bool,
}

/// Errors returned by the [`InMemoryDeploymentHistoryStore`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryHistoryStoreError {
    /// The history table of the schema has not been set up.
    #[error("Table {0}.__DeploymentHistory does not exist")]
    TableMissing(String),
    /// A row with the same deployment id exists.
    #[error("Deployment {0} already exists")]
    DuplicateDeployment(String),
}

/// An in-memory deployment history, one table per schema.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeploymentHistoryStore {
    data: Arc<Mutex<HistoryData>>,
}

impl InMemoryDeploymentHistoryStore {
    /// An empty store.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryDeploymentHistoryStore");
        Self::default()
    }

    /// When set, inserts succeed without affecting any row.
    pub async fn reject_inserts(&self, reject: bool) {
        self.data.lock().await.reject_inserts = reject;
    }

    /// Number of rows in `schema`.
    pub async fn len(&self, schema: &str) -> usize {
        self.data
            .lock()
            .await
            .tables
            .get(schema)
            .map_or(0, BTreeMap::len)
    }

    /// Whether `schema` holds no rows.
    pub async fn is_empty(&self, schema: &str) -> bool {
        self.len(schema).await == 0
    }
}

#[async_trait]
impl DeploymentHistoryStore for InMemoryDeploymentHistoryStore {
    type Error = InMemoryHistoryStoreError;

    async fn setup(&self, schema: &str) -> Result<(), Self::Error> {
        self.data
            .lock()
            .await
            .tables
            .entry(schema.to_string())
            .or_default();
        Ok(())
    }

    async fn table_exists(&self, schema: &str) -> Result<bool, Self::Error> {
        Ok(self.data.lock().await.tables.contains_key(schema))
    }

    async fn insert(
        &self,
        schema: &str,
        record: &DeploymentHistoryRecord,
    ) -> Result<u64, Self::Error> {
        let mut data = self.data.lock().await;
        if data.reject_inserts {
            return Ok(0);
        }
        let table = data
            .tables
            .get_mut(schema)
            .ok_or_else(|| InMemoryHistoryStoreError::TableMissing(schema.to_string()))?;
        if table.contains_key(&record.deployment_id) {
            return Err(InMemoryHistoryStoreError::DuplicateDeployment(
                record.deployment_id.clone(),
            ));
        }
        table.insert(record.deployment_id.clone(), record.clone());
        log::debug!(
            "Stored deployment {} for context {}",
            record.deployment_id,
            record.context_key
        );
        Ok(1)
    }

    async fn latest(
        &self,
        schema: &str,
        context_key: &str,
    ) -> Result<Option<DeploymentHistoryRecord>, Self::Error> {
        let data = self.data.lock().await;
        let table = data
            .tables
            .get(schema)
            .ok_or_else(|| InMemoryHistoryStoreError::TableMissing(schema.to_string()))?;
        Ok(table
            .values()
            .rev()
            .find(|record| record.context_key == context_key)
            .cloned())
    }

    async fn by_id(
        &self,
        schema: &str,
        deployment_id: &str,
    ) -> Result<Option<DeploymentHistoryRecord>, Self::Error> {
        let data = self.data.lock().await;
        let table = data
            .tables
            .get(schema)
            .ok_or_else(|| InMemoryHistoryStoreError::TableMissing(schema.to_string()))?;
        Ok(table.get(deployment_id).cloned())
    }

    async fn entries(
        &self,
        schema: &str,
        context_key: Option<&str>,
    ) -> Result<Vec<DeploymentHistoryEntry>, Self::Error> {
        let data = self.data.lock().await;
        let Some(table) = data.tables.get(schema) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .rev()
            .filter(|record| context_key.is_none_or(|key| record.context_key == key))
            .map(DeploymentHistoryEntry::from)
            .collect())
    }
}
