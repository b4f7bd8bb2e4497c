//! # dbdeploy memory backend
//!
//! In-memory implementations of dbdeploy's storage traits, primarily for
//! testing deployments without a database server.
//!
//! ```ignore
//! use dbdeploy_core::prelude::*;
//! use dbdeploy_mem::InMemoryDeploymentTarget;
//!
//! let endpoint = DatabaseEndpoint::new("localhost", "orders");
//! let target = InMemoryDeploymentTarget::new(endpoint.clone());
//! let config = DeploymentManagerConfig::new("bundle/bundle.json", endpoint);
//! let mut manager = DeploymentManager::new(config, target.clone())?;
//! manager.deploy().await?;
//!
//! assert!(target.exists().await);
//! ```
//!
//! [`InMemoryDeploymentTarget`] buffers scoped migrations until the scope is
//! committed; dropping an [`InMemoryScope`] discards them.

#![deny(missing_docs)]

mod history_store;
mod shard_map_store;
mod target;

pub use history_store::*;
pub use shard_map_store::*;
pub use target::*;
