//! Shard maps and the shards registered with them.

use super::SchemaMigration;

pub(super) const CREATE_SHARD_MAPS: SchemaMigration = SchemaMigration {
    version: 1,
    name: "create_shard_maps",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS shard_map_manager.shard_maps (
            name VARCHAR(255) PRIMARY KEY,
            kind VARCHAR(16) NOT NULL CHECK (kind IN ('list', 'range')),
            key_type VARCHAR(16) NOT NULL CHECK (key_type IN ('int32', 'int64', 'guid')),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS shard_map_manager.shards (
            map_name VARCHAR(255) NOT NULL REFERENCES shard_map_manager.shard_maps (name),
            server_name VARCHAR(255) NOT NULL,
            database_name VARCHAR(255) NOT NULL,
            PRIMARY KEY (map_name, server_name, database_name)
        )
        "#,
    ],
};
