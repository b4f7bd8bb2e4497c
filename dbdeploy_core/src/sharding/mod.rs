//! Shard map management.
//!
//! A shard map assigns keys to shard databases, either one key at a time
//! (list maps) or by half-open key ranges (range maps). The
//! [`ShardMapManagementService`] makes every operation idempotent: re-applying
//! an existing mapping is a no-op, while conflicting mappings and range
//! changes are rejected without touching the map.

mod int32;
mod key;

pub use int32::{int32_ranges, Int32Range};
pub use key::{ShardKey, ShardKeyType, ShardKeyValue, UnknownShardKeyType};

use std::fmt;

use async_trait::async_trait;

use crate::BoxError;

/// Kind of shard map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardMapKind {
    /// Point mappings.
    List,
    /// Range mappings.
    Range,
}

impl fmt::Display for ShardMapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardMapKind::List => write!(f, "list"),
            ShardMapKind::Range => write!(f, "range"),
        }
    }
}

/// A shard map's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardMapInfo {
    /// Map name.
    pub name: String,
    /// List or range.
    pub kind: ShardMapKind,
    /// Key type of the map.
    pub key_type: ShardKeyType,
}

/// A shard database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardLocation {
    /// Server name.
    pub server: String,
    /// Database name.
    pub database: String,
}

impl ShardLocation {
    /// Creates a location.
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on server {}", self.database, self.server)
    }
}

/// A half-open key range `[low, high)`; no high bound extends to the key
/// type's maximum value, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardRange<K> {
    low: K,
    high: Option<K>,
}

impl<K: ShardKey> ShardRange<K> {
    /// `[low, high)`; `low` must be below `high`.
    pub fn new(low: K, high: Option<K>) -> Result<Self, ShardMapError> {
        if let Some(high) = high {
            if low >= high {
                return Err(ShardMapError::InvalidRange {
                    low: low.to_string(),
                    high: high.to_string(),
                });
            }
        }
        Ok(Self { low, high })
    }

    /// The inclusive low bound.
    pub fn low(&self) -> K {
        self.low
    }

    /// The exclusive high bound, `None` when unbounded.
    pub fn high(&self) -> Option<K> {
        self.high
    }

    /// Whether `key` falls in the range.
    pub fn contains(&self, key: K) -> bool {
        key >= self.low && self.high.is_none_or(|high| key < high)
    }

    /// Whether the two ranges share at least one key.
    pub fn intersects(&self, other: &Self) -> bool {
        self.high.is_none_or(|high| other.low < high)
            && other.high.is_none_or(|high| self.low < high)
    }
}

impl<K: ShardKey> fmt::Display for ShardRange<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.high {
            Some(high) => write!(f, "[{}, {})", self.low, high),
            None => write!(f, "[{}, +inf)", self.low),
        }
    }
}

/// A stored point mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointMapping {
    /// The key.
    pub key: ShardKeyValue,
    /// Where the key lives.
    pub location: ShardLocation,
}

/// A stored range mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeMapping {
    /// Inclusive low bound.
    pub low: ShardKeyValue,
    /// Exclusive high bound, `None` when unbounded.
    pub high: Option<ShardKeyValue>,
    /// Where the range lives.
    pub location: ShardLocation,
}

/// Result of an idempotent mapping operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    /// The mapping (or map) was created.
    Created,
    /// It already existed as requested.
    Unchanged,
}

/// Errors raised by shard map management.
#[derive(Debug, thiserror::Error)]
pub enum ShardMapError {
    /// The backing store failed.
    #[error("Shard map store error: {0}")]
    Store(#[source] BoxError),

    /// The shard map manager has not been deployed.
    #[error("The shard map manager has not been deployed")]
    ManagerNotDeployed,

    /// No map with the given name.
    #[error("Shard map {0} does not exist")]
    ShardMapNotFound(String),

    /// A map exists with a different kind or key type.
    #[error("Shard map {name} already exists as a {actual_kind} map of {actual_key} keys, not a {expected_kind} map of {expected_key} keys")]
    ShardMapMismatch {
        /// Map name.
        name: String,
        /// Requested kind.
        expected_kind: ShardMapKind,
        /// Requested key type.
        expected_key: ShardKeyType,
        /// Stored kind.
        actual_kind: ShardMapKind,
        /// Stored key type.
        actual_key: ShardKeyType,
    },

    /// A range whose low bound is not below its high bound.
    #[error("Invalid range: low {low} must be less than high {high}")]
    InvalidRange {
        /// Low bound.
        low: String,
        /// High bound.
        high: String,
    },

    /// The key is mapped to a different shard.
    #[error("Key {key} in list shard map {map} is already mapped to database {database} on server {server}!")]
    KeyAlreadyMapped {
        /// The key.
        key: String,
        /// Map name.
        map: String,
        /// Mapped database.
        database: String,
        /// Mapped server.
        server: String,
    },

    /// The range intersects mappings of several shards.
    #[error("Range {range} in range shard map {map} is already mapped across multiple shards!")]
    RangeMappedAcrossShards {
        /// The requested range.
        range: String,
        /// Map name.
        map: String,
    },

    /// The range intersects a mapping of a different shard.
    #[error("All or part of range {range} in range shard map {map} is already mapped to database {database} on server {server}!")]
    RangeAlreadyMapped {
        /// The requested range.
        range: String,
        /// Map name.
        map: String,
        /// Mapped database.
        database: String,
        /// Mapped server.
        server: String,
    },

    /// The shard is mapped to a different range.
    #[error("Range can not be changed to {range} for database {database} on server {server} in range shard map {map}, it is currently mapped to {existing}. Changing an existing shard mapping range is not supported by this service.")]
    RangeChangeNotSupported {
        /// The requested range.
        range: String,
        /// The existing range.
        existing: String,
        /// Map name.
        map: String,
        /// Mapped database.
        database: String,
        /// Mapped server.
        server: String,
    },

    /// A key that does not parse as the map's key type.
    #[error("'{value}' is not a valid {key_type} shard key")]
    InvalidKey {
        /// Expected key type.
        key_type: ShardKeyType,
        /// The rejected text.
        value: String,
    },

    /// A shard count below one.
    #[error("Number of shards must be at least 1, got {0}")]
    InvalidShardCount(i64),

    /// Generated ranges do not partition the key space.
    #[error("Generated ranges are inconsistent: {0}")]
    InconsistentRanges(String),
}

/// Storage of shard maps, shards and mappings.
#[async_trait]
pub trait ShardMapStore: Send + Sync {
    /// The error returned by the store.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether the manager's storage has been set up.
    async fn manager_exists(&self) -> Result<bool, Self::Error>;

    /// Sets up the manager's storage.
    async fn create_manager(&self) -> Result<(), Self::Error>;

    /// The map called `name`.
    async fn shard_map(&self, name: &str) -> Result<Option<ShardMapInfo>, Self::Error>;

    /// Creates a map.
    async fn create_shard_map(&self, info: &ShardMapInfo) -> Result<(), Self::Error>;

    /// Whether `location` is a shard of `map`.
    async fn shard_exists(&self, map: &str, location: &ShardLocation) -> Result<bool, Self::Error>;

    /// Adds `location` as a shard of `map`.
    async fn create_shard(&self, map: &str, location: &ShardLocation) -> Result<(), Self::Error>;

    /// The point mapping of `key`.
    async fn point_mapping(
        &self,
        map: &str,
        key: &ShardKeyValue,
    ) -> Result<Option<PointMapping>, Self::Error>;

    /// Maps `key` to `location`.
    async fn create_point_mapping(
        &self,
        map: &str,
        key: &ShardKeyValue,
        location: &ShardLocation,
    ) -> Result<(), Self::Error>;

    /// Range mappings sharing at least one key with `[low, high)`.
    async fn intersecting_range_mappings(
        &self,
        map: &str,
        low: &ShardKeyValue,
        high: Option<&ShardKeyValue>,
    ) -> Result<Vec<RangeMapping>, Self::Error>;

    /// Maps `[low, high)` to `location`.
    async fn create_range_mapping(
        &self,
        map: &str,
        low: &ShardKeyValue,
        high: Option<&ShardKeyValue>,
        location: &ShardLocation,
    ) -> Result<(), Self::Error>;

    /// All point mappings of `map`, by key.
    async fn point_mappings(&self, map: &str) -> Result<Vec<PointMapping>, Self::Error>;

    /// All range mappings of `map`, by low bound.
    async fn range_mappings(&self, map: &str) -> Result<Vec<RangeMapping>, Self::Error>;
}

/// Idempotent shard map operations over a [`ShardMapStore`].
#[derive(Debug, Clone)]
pub struct ShardMapManagementService<S: ShardMapStore> {
    store: S,
}

impl<S: ShardMapStore> ShardMapManagementService<S> {
    /// Wraps a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Sets up the shard map manager if needed.
    pub async fn deploy(&self) -> Result<MappingOutcome, ShardMapError> {
        if self.store.manager_exists().await.map_err(store_error)? {
            log::debug!("Shard map manager already deployed");
            return Ok(MappingOutcome::Unchanged);
        }
        self.store.create_manager().await.map_err(store_error)?;
        log::info!("Deployed shard map manager");
        Ok(MappingOutcome::Created)
    }

    /// Creates the list map `name` if it does not exist.
    pub async fn create_list_shard_map<K: ShardKey>(
        &self,
        name: &str,
    ) -> Result<MappingOutcome, ShardMapError> {
        self.create_shard_map(name, ShardMapKind::List, K::KEY_TYPE)
            .await
    }

    /// Creates the range map `name` if it does not exist.
    pub async fn create_range_shard_map<K: ShardKey>(
        &self,
        name: &str,
    ) -> Result<MappingOutcome, ShardMapError> {
        self.create_shard_map(name, ShardMapKind::Range, K::KEY_TYPE)
            .await
    }

    /// Maps `key` to the shard `database` on `server`, creating the shard if
    /// needed.
    pub async fn add_list_map_shard<K: ShardKey>(
        &self,
        map: &str,
        key: K,
        server: &str,
        database: &str,
    ) -> Result<MappingOutcome, ShardMapError> {
        self.require_map(map, ShardMapKind::List, K::KEY_TYPE)
            .await?;
        let location = ShardLocation::new(server, database);
        let value = key.to_value();

        if let Some(existing) = self
            .store
            .point_mapping(map, &value)
            .await
            .map_err(store_error)?
        {
            if existing.location != location {
                return Err(ShardMapError::KeyAlreadyMapped {
                    key: key.to_string(),
                    map: map.to_string(),
                    database: existing.location.database,
                    server: existing.location.server,
                });
            }
            log::debug!("Key {key} in {map} is already mapped to {location}");
            return Ok(MappingOutcome::Unchanged);
        }

        self.ensure_shard(map, &location).await?;
        self.store
            .create_point_mapping(map, &value, &location)
            .await
            .map_err(store_error)?;
        log::info!("Mapped key {key} in list shard map {map} to database {location}");
        Ok(MappingOutcome::Created)
    }

    /// Maps `[low, high)` to the shard `database` on `server`, creating the
    /// shard if needed. `None` for `high` extends the range to the maximum
    /// key.
    pub async fn add_range_map_shard<K: ShardKey>(
        &self,
        map: &str,
        low: K,
        high: Option<K>,
        server: &str,
        database: &str,
    ) -> Result<MappingOutcome, ShardMapError> {
        let range = ShardRange::new(low, high)?;
        self.require_map(map, ShardMapKind::Range, K::KEY_TYPE)
            .await?;
        let location = ShardLocation::new(server, database);
        let low_value = low.to_value();
        let high_value = high.map(ShardKey::to_value);

        let existing = self
            .store
            .intersecting_range_mappings(map, &low_value, high_value.as_ref())
            .await
            .map_err(store_error)?;

        if existing.len() > 1 {
            return Err(ShardMapError::RangeMappedAcrossShards {
                range: range.to_string(),
                map: map.to_string(),
            });
        }

        if let Some(mapping) = existing.into_iter().next() {
            if mapping.location != location {
                return Err(ShardMapError::RangeAlreadyMapped {
                    range: range.to_string(),
                    map: map.to_string(),
                    database: mapping.location.database,
                    server: mapping.location.server,
                });
            }
            if mapping.low != low_value || mapping.high != high_value {
                return Err(ShardMapError::RangeChangeNotSupported {
                    range: range.to_string(),
                    existing: describe_range(&mapping),
                    map: map.to_string(),
                    database: mapping.location.database,
                    server: mapping.location.server,
                });
            }
            log::debug!("Range {range} in {map} is already mapped to {location}");
            return Ok(MappingOutcome::Unchanged);
        }

        self.ensure_shard(map, &location).await?;
        self.store
            .create_range_mapping(map, &low_value, high_value.as_ref(), &location)
            .await
            .map_err(store_error)?;
        log::info!("Mapped range {range} in range shard map {map} to database {location}");
        Ok(MappingOutcome::Created)
    }

    /// Partitions the whole `i32` key space of `map` across `locations`, in
    /// order. The last range is added unbounded so the maximum key is
    /// covered.
    pub async fn add_int32_range_map_shards(
        &self,
        map: &str,
        locations: &[ShardLocation],
    ) -> Result<Vec<MappingOutcome>, ShardMapError> {
        let count = i32::try_from(locations.len())
            .map_err(|_| ShardMapError::InvalidShardCount(locations.len() as i64))?;
        let ranges = int32_ranges(count)?;

        if ranges.len() != locations.len() {
            return Err(ShardMapError::InconsistentRanges(format!(
                "{} ranges generated for {} shards",
                ranges.len(),
                locations.len()
            )));
        }
        if ranges.first().map(|range| range.low) != Some(i32::MIN) {
            return Err(ShardMapError::InconsistentRanges(
                "first range does not start at the minimum key".to_string(),
            ));
        }
        if ranges.last().map(|range| range.high) != Some(i32::MAX) {
            return Err(ShardMapError::InconsistentRanges(
                "last range does not end at the maximum key".to_string(),
            ));
        }

        let mut outcomes = Vec::with_capacity(ranges.len());
        let last = ranges.len() - 1;
        for (index, (range, location)) in ranges.iter().zip(locations).enumerate() {
            let high = if index == last { None } else { Some(range.high) };
            let outcome = self
                .add_range_map_shard(map, range.low, high, &location.server, &location.database)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn create_shard_map(
        &self,
        name: &str,
        kind: ShardMapKind,
        key_type: ShardKeyType,
    ) -> Result<MappingOutcome, ShardMapError> {
        if !self.store.manager_exists().await.map_err(store_error)? {
            return Err(ShardMapError::ManagerNotDeployed);
        }
        if let Some(existing) = self.store.shard_map(name).await.map_err(store_error)? {
            check_map(&existing, kind, key_type)?;
            log::debug!("Shard map {name} already exists");
            return Ok(MappingOutcome::Unchanged);
        }
        self.store
            .create_shard_map(&ShardMapInfo {
                name: name.to_string(),
                kind,
                key_type,
            })
            .await
            .map_err(store_error)?;
        log::info!("Created {kind} shard map {name} ({key_type} keys)");
        Ok(MappingOutcome::Created)
    }

    async fn require_map(
        &self,
        name: &str,
        kind: ShardMapKind,
        key_type: ShardKeyType,
    ) -> Result<(), ShardMapError> {
        if !self.store.manager_exists().await.map_err(store_error)? {
            return Err(ShardMapError::ManagerNotDeployed);
        }
        let existing = self
            .store
            .shard_map(name)
            .await
            .map_err(store_error)?
            .ok_or_else(|| ShardMapError::ShardMapNotFound(name.to_string()))?;
        check_map(&existing, kind, key_type)
    }

    async fn ensure_shard(&self, map: &str, location: &ShardLocation) -> Result<(), ShardMapError> {
        if !self
            .store
            .shard_exists(map, location)
            .await
            .map_err(store_error)?
        {
            self.store
                .create_shard(map, location)
                .await
                .map_err(store_error)?;
            log::info!("Added shard {location} to shard map {map}");
        }
        Ok(())
    }
}

fn check_map(
    existing: &ShardMapInfo,
    kind: ShardMapKind,
    key_type: ShardKeyType,
) -> Result<(), ShardMapError> {
    if existing.kind != kind || existing.key_type != key_type {
        return Err(ShardMapError::ShardMapMismatch {
            name: existing.name.clone(),
            expected_kind: kind,
            expected_key: key_type,
            actual_kind: existing.kind,
            actual_key: existing.key_type,
        });
    }
    Ok(())
}

fn describe_range(mapping: &RangeMapping) -> String {
    match &mapping.high {
        Some(high) => format!("[{}, {})", mapping.low, high),
        None => format!("[{}, +inf)", mapping.low),
    }
}

fn store_error<E: std::error::Error + Send + Sync + 'static>(error: E) -> ShardMapError {
    ShardMapError::Store(Box::new(error))
}
