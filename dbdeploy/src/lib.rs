//! # dbdeploy
//!
//! Database deployments driven by versioned migration bundles, with the
//! deployed bundle archived inside the target database, plus shard map
//! management. Backends are selected with the `in-memory` and `postgres`
//! features.

#![deny(missing_docs)]

#[cfg(feature = "in-memory")]
/// In-memory backends for tests and development.
pub mod mem {
    //! Contains the in-memory deployment target and stores.
    pub use dbdeploy_mem::*;
}

#[cfg(feature = "postgres")]
/// Postgres backends.
pub mod pg {
    //! Contains the postgres deployment target and stores.
    pub use dbdeploy_pg::*;
}

pub mod prelude {
    //! The prelude module for the `dbdeploy` crate.
    pub use dbdeploy_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::*;
    #[cfg(feature = "postgres")]
    pub use super::pg::{
        PgConnectionInfoBuilder, PgDeploymentHistoryStore, PgDeploymentTarget, PgShardMapStore,
    };
}
