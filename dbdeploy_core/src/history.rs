//! The deployment history archive.
//!
//! Every successful deployment stores a zipped snapshot of the bundle it
//! deployed, together with the checksum manifest of that snapshot, in the
//! `__DeploymentHistory` table of the context's schema. The next deployment
//! extracts the latest snapshot to learn which migrations are live and, when
//! migrating downward, to obtain the down scripts that are no longer part of
//! the new bundle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::archive::{self, ArchiveError};
use crate::hash::{self, HashError};
use crate::BoxError;

/// Name of the table holding deployment snapshots.
pub const DEPLOYMENT_HISTORY_TABLE: &str = "__DeploymentHistory";

/// A persisted deployment snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentHistoryRecord {
    /// `<UTC yyyyMMddHHmmss>_<uuid>`; lexicographic order is deployment order.
    pub deployment_id: String,
    /// The migration context the snapshot belongs to.
    pub context_key: String,
    /// File name of the bundle manifest inside the snapshot.
    pub assembly_file_name: String,
    /// Zipped bundle directory.
    pub binaries: Vec<u8>,
    /// Checksum manifest of the zipped files.
    pub hashes: Vec<u8>,
    /// Version of the deployer that wrote the row.
    pub deployer_version: String,
}

/// A history row without its payload, used for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentHistoryEntry {
    /// The deployment id.
    pub deployment_id: String,
    /// The migration context.
    pub context_key: String,
    /// File name of the bundle manifest.
    pub assembly_file_name: String,
    /// Version of the deployer that wrote the row.
    pub deployer_version: String,
}

impl From<&DeploymentHistoryRecord> for DeploymentHistoryEntry {
    fn from(record: &DeploymentHistoryRecord) -> Self {
        Self {
            deployment_id: record.deployment_id.clone(),
            context_key: record.context_key.clone(),
            assembly_file_name: record.assembly_file_name.clone(),
            deployer_version: record.deployer_version.clone(),
        }
    }
}

/// Generates a new, time-ordered deployment id.
///
/// The suffix is a version 7 UUID, so ids generated within the same second
/// by one process still sort in generation order.
pub fn new_deployment_id() -> String {
    format!(
        "{}_{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        Uuid::now_v7().simple()
    )
}

/// Storage of deployment history rows.
///
/// Implementations never enrol these operations in a caller's migration
/// transaction.
#[async_trait]
pub trait DeploymentHistoryStore: Send + Sync {
    /// The error returned by the store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the history table in `schema` if it does not exist.
    async fn setup(&self, schema: &str) -> Result<(), Self::Error>;

    /// Whether the history table exists in `schema`.
    async fn table_exists(&self, schema: &str) -> Result<bool, Self::Error>;

    /// Inserts a row and returns the number of affected rows.
    async fn insert(&self, schema: &str, record: &DeploymentHistoryRecord)
    -> Result<u64, Self::Error>;

    /// The row with the greatest deployment id for `context_key`.
    async fn latest(
        &self,
        schema: &str,
        context_key: &str,
    ) -> Result<Option<DeploymentHistoryRecord>, Self::Error>;

    /// The row with the given deployment id.
    async fn by_id(
        &self,
        schema: &str,
        deployment_id: &str,
    ) -> Result<Option<DeploymentHistoryRecord>, Self::Error>;

    /// All rows, optionally restricted to one context, newest first.
    async fn entries(
        &self,
        schema: &str,
        context_key: Option<&str>,
    ) -> Result<Vec<DeploymentHistoryEntry>, Self::Error>;
}

/// Errors raised by the deployment history archive.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The backing store failed.
    #[error("Deployment history store error: {0}")]
    Store(#[source] BoxError),

    /// Zipping or unzipping failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The extracted snapshot failed verification.
    #[error(transparent)]
    Hash(#[from] HashError),

    /// The insert did not affect exactly one row.
    #[error("Failed to INSERT __DeploymentHistory, result: {0}")]
    InsertFailed(u64),

    /// The bundle path has no file name or parent directory.
    #[error("Invalid bundle path {0}")]
    InvalidBundlePath(PathBuf),

    /// The stored hash manifest is not UTF-8.
    #[error("Stored checksum manifest for deployment {0} is not valid UTF-8")]
    InvalidManifest(String),
}

impl HistoryError {
    fn store<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        HistoryError::Store(Box::new(error))
    }
}

/// Archive operations on top of a [`DeploymentHistoryStore`].
#[derive(Debug)]
pub struct DeploymentHistory<'a, S: DeploymentHistoryStore> {
    store: &'a S,
}

impl<'a, S: DeploymentHistoryStore> DeploymentHistory<'a, S> {
    /// Wraps a store.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Idempotently creates the history table in `schema`.
    pub async fn setup(&self, schema: &str) -> Result<(), HistoryError> {
        log::debug!("Ensuring {schema}.{DEPLOYMENT_HISTORY_TABLE} exists");
        self.store.setup(schema).await.map_err(HistoryError::store)
    }

    /// Archives the directory containing `bundle_path` as a new deployment.
    ///
    /// Returns the id of the inserted row.
    pub async fn create(
        &self,
        context_key: &str,
        deployer_version: &str,
        bundle_path: &Path,
        schema: &str,
    ) -> Result<String, HistoryError> {
        let invalid = || HistoryError::InvalidBundlePath(bundle_path.to_path_buf());
        let assembly_file_name = bundle_path
            .file_name()
            .ok_or_else(invalid)?
            .to_string_lossy()
            .into_owned();
        let root = bundle_path.parent().ok_or_else(invalid)?;

        let archive = archive::zip_directory(root)?;
        let record = DeploymentHistoryRecord {
            deployment_id: new_deployment_id(),
            context_key: context_key.to_string(),
            assembly_file_name,
            binaries: archive.binaries,
            hashes: archive.hashes,
            deployer_version: deployer_version.to_string(),
        };

        let affected = self
            .store
            .insert(schema, &record)
            .await
            .map_err(HistoryError::store)?;
        if affected != 1 {
            return Err(HistoryError::InsertFailed(affected));
        }

        log::info!(
            "Archived deployment {} for context {} ({} files)",
            record.deployment_id,
            context_key,
            archive.file_count
        );
        Ok(record.deployment_id)
    }

    /// Extracts the latest snapshot of `context_key` below
    /// `extract_root/<deployment_id>` and verifies it.
    ///
    /// Returns the path of the extracted bundle manifest, or `None` when the
    /// history table does not exist or holds no row for the context.
    pub async fn extract_current(
        &self,
        context_key: &str,
        schema: &str,
        extract_root: &Path,
    ) -> Result<Option<PathBuf>, HistoryError> {
        if !self
            .store
            .table_exists(schema)
            .await
            .map_err(HistoryError::store)?
        {
            log::debug!("{schema}.{DEPLOYMENT_HISTORY_TABLE} does not exist");
            return Ok(None);
        }

        let Some(record) = self
            .store
            .latest(schema, context_key)
            .await
            .map_err(HistoryError::store)?
        else {
            log::debug!("No deployment history for context {context_key}");
            return Ok(None);
        };

        let directory = extract_root.join(&record.deployment_id);
        if directory.exists() {
            // Left over from an earlier, interrupted run.
            std::fs::remove_dir_all(&directory).map_err(|source| ArchiveError::Io {
                path: directory.clone(),
                source,
            })?;
        }
        Self::restore(&record, &directory, true)?;
        log::info!(
            "Extracted deployment {} of context {} to {}",
            record.deployment_id,
            context_key,
            directory.display()
        );
        Ok(Some(directory.join(&record.assembly_file_name)))
    }

    /// Extracts the snapshot with `deployment_id` directly into `target_dir`.
    ///
    /// Returns the path of the extracted bundle manifest, or `None` when there
    /// is no such deployment.
    pub async fn extract(
        &self,
        deployment_id: &str,
        schema: &str,
        target_dir: &Path,
        verify: bool,
    ) -> Result<Option<PathBuf>, HistoryError> {
        if !self
            .store
            .table_exists(schema)
            .await
            .map_err(HistoryError::store)?
        {
            return Ok(None);
        }

        let Some(record) = self
            .store
            .by_id(schema, deployment_id)
            .await
            .map_err(HistoryError::store)?
        else {
            log::debug!("Deployment {deployment_id} not found in {schema}");
            return Ok(None);
        };

        Self::restore(&record, target_dir, verify)?;
        Ok(Some(target_dir.join(&record.assembly_file_name)))
    }

    /// History rows of `schema`, newest first.
    pub async fn list(
        &self,
        schema: &str,
        context_key: Option<&str>,
    ) -> Result<Vec<DeploymentHistoryEntry>, HistoryError> {
        if !self
            .store
            .table_exists(schema)
            .await
            .map_err(HistoryError::store)?
        {
            return Ok(Vec::new());
        }
        self.store
            .entries(schema, context_key)
            .await
            .map_err(HistoryError::store)
    }

    fn restore(
        record: &DeploymentHistoryRecord,
        directory: &Path,
        verify: bool,
    ) -> Result<(), HistoryError> {
        archive::unzip(&record.binaries, directory)?;
        if verify {
            let manifest = std::str::from_utf8(&record.hashes)
                .map_err(|_| HistoryError::InvalidManifest(record.deployment_id.clone()))?;
            hash::verify_manifest(directory, manifest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_id_has_timestamp_and_uuid() {
        let id = new_deployment_id();
        let (timestamp, suffix) = id.split_once('_').unwrap();
        assert_eq!(timestamp.len(), 14);
        assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn deployment_ids_sort_by_time() {
        let earlier = format!("20240101000000_{}", Uuid::new_v4().simple());
        let later = new_deployment_id();
        assert!(earlier < later);
    }

    #[test]
    fn deployment_ids_within_a_second_keep_generation_order() {
        let ids: Vec<String> = (0..100).map(|_| new_deployment_id()).collect();
        for pair in ids.windows(2) {
            if pair[0][..14] == pair[1][..14] {
                assert!(pair[0] < pair[1]);
            }
        }
    }

    #[test]
    fn insert_failure_message_names_the_table() {
        assert_eq!(
            HistoryError::InsertFailed(0).to_string(),
            "Failed to INSERT __DeploymentHistory, result: 0"
        );
    }
}
