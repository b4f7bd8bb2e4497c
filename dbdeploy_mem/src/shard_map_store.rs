use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use dbdeploy_core::prelude::*;

#[derive(Debug)]
struct ShardMapData {
    info: ShardMapInfo,
    shards: BTreeSet<ShardLocation>,
    points: BTreeMap<ShardKeyValue, ShardLocation>,
    // low bound -> mapping
    ranges: BTreeMap<ShardKeyValue, RangeMapping>,
}

#[derive(Debug, Default)]
struct ManagerData {
    deployed: bool,
    maps: HashMap<String, ShardMapData>,
}

/// Errors returned by the [`InMemoryShardMapStore`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryShardMapStoreError {
    /// The manager has not been created.
    #[error("Shard map manager does not exist")]
    ManagerMissing,
    /// No map with the given name.
    #[error("Shard map {0} does not exist")]
    MapMissing(String),
    /// A map with the given name exists.
    #[error("Shard map {0} already exists")]
    MapExists(String),
    /// The location is not a shard of the map.
    #[error("{location} is not a shard of {map}")]
    ShardMissing {
        /// Map name.
        map: String,
        /// The location.
        location: ShardLocation,
    },
    /// The mapping overlaps an existing one.
    #[error("Mapping overlaps an existing mapping in {0}")]
    Overlap(String),
}

/// An in-memory shard map manager.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShardMapStore {
    data: Arc<Mutex<ManagerData>>,
}

impl InMemoryShardMapStore {
    /// A store without a deployed manager.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryShardMapStore");
        Self::default()
    }

    /// Shards of `map`, ordered.
    pub async fn shards(&self, map: &str) -> Vec<ShardLocation> {
        self.data
            .lock()
            .await
            .maps
            .get(map)
            .map(|data| data.shards.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn map_mut<'a>(
    manager: &'a mut ManagerData,
    name: &str,
) -> Result<&'a mut ShardMapData, InMemoryShardMapStoreError> {
    if !manager.deployed {
        return Err(InMemoryShardMapStoreError::ManagerMissing);
    }
    manager
        .maps
        .get_mut(name)
        .ok_or_else(|| InMemoryShardMapStoreError::MapMissing(name.to_string()))
}

fn map_ref<'a>(
    manager: &'a ManagerData,
    name: &str,
) -> Result<&'a ShardMapData, InMemoryShardMapStoreError> {
    if !manager.deployed {
        return Err(InMemoryShardMapStoreError::ManagerMissing);
    }
    manager
        .maps
        .get(name)
        .ok_or_else(|| InMemoryShardMapStoreError::MapMissing(name.to_string()))
}

fn intersects(
    mapping: &RangeMapping,
    low: &ShardKeyValue,
    high: Option<&ShardKeyValue>,
) -> bool {
    mapping.high.as_ref().is_none_or(|mapped_high| low < mapped_high)
        && high.is_none_or(|high| &mapping.low < high)
}

#[async_trait]
impl ShardMapStore for InMemoryShardMapStore {
    type Error = InMemoryShardMapStoreError;

    async fn manager_exists(&self) -> Result<bool, Self::Error> {
        Ok(self.data.lock().await.deployed)
    }

    async fn create_manager(&self) -> Result<(), Self::Error> {
        self.data.lock().await.deployed = true;
        Ok(())
    }

    async fn shard_map(&self, name: &str) -> Result<Option<ShardMapInfo>, Self::Error> {
        let data = self.data.lock().await;
        if !data.deployed {
            return Err(InMemoryShardMapStoreError::ManagerMissing);
        }
        Ok(data.maps.get(name).map(|map| map.info.clone()))
    }

    async fn create_shard_map(&self, info: &ShardMapInfo) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        if !data.deployed {
            return Err(InMemoryShardMapStoreError::ManagerMissing);
        }
        if data.maps.contains_key(&info.name) {
            return Err(InMemoryShardMapStoreError::MapExists(info.name.clone()));
        }
        data.maps.insert(
            info.name.clone(),
            ShardMapData {
                info: info.clone(),
                shards: BTreeSet::new(),
                points: BTreeMap::new(),
                ranges: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn shard_exists(&self, map: &str, location: &ShardLocation) -> Result<bool, Self::Error> {
        let data = self.data.lock().await;
        Ok(map_ref(&data, map)?.shards.contains(location))
    }

    async fn create_shard(&self, map: &str, location: &ShardLocation) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        map_mut(&mut data, map)?.shards.insert(location.clone());
        Ok(())
    }

    async fn point_mapping(
        &self,
        map: &str,
        key: &ShardKeyValue,
    ) -> Result<Option<PointMapping>, Self::Error> {
        let data = self.data.lock().await;
        Ok(map_ref(&data, map)?
            .points
            .get(key)
            .map(|location| PointMapping {
                key: *key,
                location: location.clone(),
            }))
    }

    async fn create_point_mapping(
        &self,
        map: &str,
        key: &ShardKeyValue,
        location: &ShardLocation,
    ) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        let shard_map = map_mut(&mut data, map)?;
        if !shard_map.shards.contains(location) {
            return Err(InMemoryShardMapStoreError::ShardMissing {
                map: map.to_string(),
                location: location.clone(),
            });
        }
        if shard_map.points.contains_key(key) {
            return Err(InMemoryShardMapStoreError::Overlap(map.to_string()));
        }
        shard_map.points.insert(*key, location.clone());
        Ok(())
    }

    async fn intersecting_range_mappings(
        &self,
        map: &str,
        low: &ShardKeyValue,
        high: Option<&ShardKeyValue>,
    ) -> Result<Vec<RangeMapping>, Self::Error> {
        let data = self.data.lock().await;
        Ok(map_ref(&data, map)?
            .ranges
            .values()
            .filter(|mapping| intersects(mapping, low, high))
            .cloned()
            .collect())
    }

    async fn create_range_mapping(
        &self,
        map: &str,
        low: &ShardKeyValue,
        high: Option<&ShardKeyValue>,
        location: &ShardLocation,
    ) -> Result<(), Self::Error> {
        let mut data = self.data.lock().await;
        let shard_map = map_mut(&mut data, map)?;
        if !shard_map.shards.contains(location) {
            return Err(InMemoryShardMapStoreError::ShardMissing {
                map: map.to_string(),
                location: location.clone(),
            });
        }
        if shard_map
            .ranges
            .values()
            .any(|mapping| intersects(mapping, low, high))
        {
            return Err(InMemoryShardMapStoreError::Overlap(map.to_string()));
        }
        shard_map.ranges.insert(
            *low,
            RangeMapping {
                low: *low,
                high: high.copied(),
                location: location.clone(),
            },
        );
        Ok(())
    }

    async fn point_mappings(&self, map: &str) -> Result<Vec<PointMapping>, Self::Error> {
        let data = self.data.lock().await;
        Ok(map_ref(&data, map)?
            .points
            .iter()
            .map(|(key, location)| PointMapping {
                key: *key,
                location: location.clone(),
            })
            .collect())
    }

    async fn range_mappings(&self, map: &str) -> Result<Vec<RangeMapping>, Self::Error> {
        let data = self.data.lock().await;
        Ok(map_ref(&data, map)?.ranges.values().cloned().collect())
    }
}
