//! # dbdeploy postgres backend
//!
//! Postgres implementations of the deployment target, the deployment history
//! store and the shard map store.

#![deny(missing_docs)]

/// Connection options and connection strings for deployment endpoints
pub mod connection;

/// The deployment history store for postgres
pub mod history_store;

/// Schema migrations of the shard map manager
pub mod migrations;

/// The shard map store for postgres
pub mod shard_map_store;

/// The deployment target for postgres
pub mod target;

pub use connection::*;
pub use history_store::*;
pub use migrations::{ManagerSchema, MigrationError, MigrationRecord, SchemaMigration};
pub use shard_map_store::*;
pub use target::*;

/// Quotes an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for interpolation into SQL text.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_and_literals_are_escaped() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
