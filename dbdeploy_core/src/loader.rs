//! Bundle loading and dependent-file resolution.
//!
//! The loader remembers the root directory of the target and deployed bundles
//! in a [`LoaderContext`]. Scripts referenced by a bundle are resolved against
//! the root of the bundle's own origin, so a deployed snapshot extracted to a
//! temporary directory never picks up files from the target bundle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bundle::{BundleError, MigrationBundle, MigrationSource};

/// Base directories of the loaded bundles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderContext {
    /// Root of the target bundle.
    pub target_base_path: Option<PathBuf>,
    /// Root of the deployed bundle.
    pub deployed_base_path: Option<PathBuf>,
}

impl LoaderContext {
    /// Base directory recorded for `source`.
    pub fn base_path(&self, source: MigrationSource) -> Option<&Path> {
        match source {
            MigrationSource::Target => self.target_base_path.as_deref(),
            MigrationSource::Deployed => self.deployed_base_path.as_deref(),
        }
    }

    fn set_base_path(&mut self, source: MigrationSource, path: PathBuf) {
        match source {
            MigrationSource::Target => self.target_base_path = Some(path),
            MigrationSource::Deployed => self.deployed_base_path = Some(path),
        }
    }
}

/// Loads bundles and reads the files they reference.
#[derive(Debug, Default)]
pub struct BundleLoader {
    context: LoaderContext,
}

impl BundleLoader {
    /// Creates a loader with an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current context.
    pub fn context(&self) -> &LoaderContext {
        &self.context
    }

    /// Loads the bundle whose manifest is at `path` and records its root.
    pub fn load(
        &mut self,
        source: MigrationSource,
        path: &Path,
    ) -> Result<Arc<MigrationBundle>, BundleError> {
        let path = std::path::absolute(path).map_err(|source| BundleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loading {} bundle from {}", source, path.display());

        let bundle = MigrationBundle::open(source, &path)?;
        self.context
            .set_base_path(source, bundle.root().to_path_buf());
        log::info!(
            "Loaded {} bundle '{}' from {}",
            source,
            bundle.manifest().name,
            path.display()
        );
        Ok(Arc::new(bundle))
    }

    /// Resolves `relative` against the root of `source`'s bundle.
    pub fn resolve(&self, source: MigrationSource, relative: &Path) -> Result<PathBuf, BundleError> {
        let base = self
            .context
            .base_path(source)
            .ok_or(BundleError::NotLoaded(source))?;
        Ok(base.join(relative))
    }

    /// Reads a script of `source`'s bundle.
    pub fn read_script(&self, source: MigrationSource, relative: &Path) -> Result<String, BundleError> {
        let path = self.resolve(source, relative)?;
        log::trace!("Reading script {}", path.display());
        std::fs::read_to_string(&path).map_err(|source| BundleError::Io { path, source })
    }
}
