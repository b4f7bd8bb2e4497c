//! Point and range mappings.
//!
//! Keys are stored in their order-preserving byte encoding, so `bytea`
//! comparison orders them like the keys themselves. A NULL `high_key` extends
//! a range to the maximum key.

use super::SchemaMigration;

pub(super) const CREATE_MAPPINGS: SchemaMigration = SchemaMigration {
    version: 2,
    name: "create_mappings",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS shard_map_manager.point_mappings (
            map_name VARCHAR(255) NOT NULL,
            shard_key BYTEA NOT NULL,
            server_name VARCHAR(255) NOT NULL,
            database_name VARCHAR(255) NOT NULL,
            PRIMARY KEY (map_name, shard_key),
            FOREIGN KEY (map_name, server_name, database_name)
                REFERENCES shard_map_manager.shards (map_name, server_name, database_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS shard_map_manager.range_mappings (
            map_name VARCHAR(255) NOT NULL,
            low_key BYTEA NOT NULL,
            high_key BYTEA,
            server_name VARCHAR(255) NOT NULL,
            database_name VARCHAR(255) NOT NULL,
            PRIMARY KEY (map_name, low_key),
            CHECK (high_key IS NULL OR low_key < high_key),
            FOREIGN KEY (map_name, server_name, database_name)
                REFERENCES shard_map_manager.shards (map_name, server_name, database_name)
        )
        "#,
    ],
};
