use dbdeploy_core::prelude::*;
use dbdeploy_mem::InMemoryShardMapStore;
use uuid::Uuid;

async fn service() -> ShardMapManagementService<InMemoryShardMapStore> {
    let _ = env_logger::builder().is_test(true).try_init();
    let service = ShardMapManagementService::new(InMemoryShardMapStore::new());
    assert_eq!(service.deploy().await.unwrap(), MappingOutcome::Created);
    service
}

#[tokio::test]
async fn deploy_is_idempotent() {
    let service = service().await;
    assert_eq!(service.deploy().await.unwrap(), MappingOutcome::Unchanged);
}

#[tokio::test]
async fn maps_require_a_deployed_manager() {
    let service = ShardMapManagementService::new(InMemoryShardMapStore::new());
    assert!(matches!(
        service.create_list_shard_map::<i32>("tenants").await,
        Err(ShardMapError::ManagerNotDeployed)
    ));
}

#[tokio::test]
async fn creating_a_map_twice_is_unchanged() {
    let service = service().await;
    assert_eq!(
        service.create_list_shard_map::<i64>("tenants").await.unwrap(),
        MappingOutcome::Created
    );
    assert_eq!(
        service.create_list_shard_map::<i64>("tenants").await.unwrap(),
        MappingOutcome::Unchanged
    );
}

#[tokio::test]
async fn map_of_another_kind_or_key_is_rejected() {
    let service = service().await;
    service.create_list_shard_map::<i32>("tenants").await.unwrap();

    assert!(matches!(
        service.create_range_shard_map::<i32>("tenants").await,
        Err(ShardMapError::ShardMapMismatch { .. })
    ));
    assert!(matches!(
        service.create_list_shard_map::<Uuid>("tenants").await,
        Err(ShardMapError::ShardMapMismatch { .. })
    ));
    assert!(matches!(
        service
            .add_list_map_shard("tenants", 7i64, "srv", "shard1")
            .await,
        Err(ShardMapError::ShardMapMismatch { .. })
    ));
}

#[tokio::test]
async fn list_mapping_is_idempotent_and_conflicts_preserve_state() {
    let service = service().await;
    service.create_list_shard_map::<i32>("tenants").await.unwrap();

    assert_eq!(
        service
            .add_list_map_shard("tenants", 7, "srv", "shard1")
            .await
            .unwrap(),
        MappingOutcome::Created
    );
    assert_eq!(
        service
            .add_list_map_shard("tenants", 7, "srv", "shard1")
            .await
            .unwrap(),
        MappingOutcome::Unchanged
    );

    let err = service
        .add_list_map_shard("tenants", 7, "srv", "shard2")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Key 7 in list shard map tenants is already mapped to database shard1 on server srv!"
    );

    let mappings = service.store().point_mappings("tenants").await.unwrap();
    assert_eq!(
        mappings,
        vec![PointMapping {
            key: ShardKeyValue::Int32(7),
            location: ShardLocation::new("srv", "shard1"),
        }]
    );
    assert_eq!(
        service.store().shards("tenants").await,
        vec![ShardLocation::new("srv", "shard1")]
    );
}

#[tokio::test]
async fn guid_keys_map_to_shards() {
    let service = service().await;
    service.create_list_shard_map::<Uuid>("customers").await.unwrap();
    let key = Uuid::new_v4();

    service
        .add_list_map_shard("customers", key, "srv", "shard1")
        .await
        .unwrap();

    let mapping = service
        .store()
        .point_mapping("customers", &ShardKeyValue::Guid(key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.location, ShardLocation::new("srv", "shard1"));
}

#[tokio::test]
async fn mapping_into_a_missing_map_fails() {
    let service = service().await;
    assert!(matches!(
        service.add_range_map_shard("missing", 0i32, None, "srv", "db").await,
        Err(ShardMapError::ShardMapNotFound(name)) if name == "missing"
    ));
}

#[tokio::test]
async fn range_mapping_is_idempotent() {
    let service = service().await;
    service.create_range_shard_map::<i32>("ranges").await.unwrap();

    assert_eq!(
        service
            .add_range_map_shard("ranges", 0, Some(100), "srv", "shard1")
            .await
            .unwrap(),
        MappingOutcome::Created
    );
    assert_eq!(
        service
            .add_range_map_shard("ranges", 0, Some(100), "srv", "shard1")
            .await
            .unwrap(),
        MappingOutcome::Unchanged
    );
    assert_eq!(
        service
            .add_range_map_shard("ranges", 100, Some(200), "srv", "shard2")
            .await
            .unwrap(),
        MappingOutcome::Created
    );
}

#[tokio::test]
async fn existing_ranges_cannot_change() {
    let service = service().await;
    service.create_range_shard_map::<i32>("ranges").await.unwrap();
    service
        .add_range_map_shard("ranges", 0, Some(100), "srv", "shard1")
        .await
        .unwrap();

    let existing = vec![RangeMapping {
        low: ShardKeyValue::Int32(0),
        high: Some(ShardKeyValue::Int32(100)),
        location: ShardLocation::new("srv", "shard1"),
    }];
    // Shrink, expand, shift and open up the mapped range.
    for (low, high) in [(0, Some(50)), (0, Some(200)), (50, Some(150)), (0, None)] {
        let err = service
            .add_range_map_shard("ranges", low, high, "srv", "shard1")
            .await
            .unwrap_err();
        assert!(
            matches!(err, ShardMapError::RangeChangeNotSupported { .. }),
            "[{low}, {high:?}): {err}"
        );
        assert!(
            err.to_string()
                .contains("Changing an existing shard mapping range is not supported"),
            "{err}"
        );
        assert_eq!(service.store().range_mappings("ranges").await.unwrap(), existing);
    }

    let other_shard = service
        .add_range_map_shard("ranges", 50, Some(150), "srv", "shard2")
        .await
        .unwrap_err();
    assert_eq!(
        other_shard.to_string(),
        "All or part of range [50, 150) in range shard map ranges is already mapped to database shard1 on server srv!"
    );

    assert_eq!(service.store().range_mappings("ranges").await.unwrap(), existing);
}

#[tokio::test]
async fn range_spanning_several_shards_is_rejected() {
    let service = service().await;
    service.create_range_shard_map::<i64>("ranges").await.unwrap();
    service
        .add_range_map_shard("ranges", 0i64, Some(10), "srv", "shard1")
        .await
        .unwrap();
    service
        .add_range_map_shard("ranges", 10i64, Some(20), "srv", "shard2")
        .await
        .unwrap();

    assert!(matches!(
        service
            .add_range_map_shard("ranges", 5i64, None, "srv", "shard3")
            .await,
        Err(ShardMapError::RangeMappedAcrossShards { .. })
    ));
    assert_eq!(
        service.store().range_mappings("ranges").await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn inverted_range_is_rejected_before_touching_the_store() {
    let service = ShardMapManagementService::new(InMemoryShardMapStore::new());
    assert!(matches!(
        service
            .add_range_map_shard("ranges", 10i32, Some(10), "srv", "db")
            .await,
        Err(ShardMapError::InvalidRange { .. })
    ));
}

#[tokio::test]
async fn int32_shards_partition_the_whole_key_space() {
    let service = service().await;
    service.create_range_shard_map::<i32>("ranges").await.unwrap();
    let locations: Vec<ShardLocation> = (0..4)
        .map(|index| ShardLocation::new("srv", format!("shard{index}")))
        .collect();

    let outcomes = service
        .add_int32_range_map_shards("ranges", &locations)
        .await
        .unwrap();
    assert_eq!(outcomes, vec![MappingOutcome::Created; 4]);

    let mappings = service.store().range_mappings("ranges").await.unwrap();
    assert_eq!(mappings.len(), 4);
    assert_eq!(mappings[0].low, ShardKeyValue::Int32(i32::MIN));
    assert_eq!(mappings[3].high, None);
    for pair in mappings.windows(2) {
        assert_eq!(pair[0].high, Some(pair[1].low));
    }

    let again = service
        .add_int32_range_map_shards("ranges", &locations)
        .await
        .unwrap();
    assert_eq!(again, vec![MappingOutcome::Unchanged; 4]);

    let max_key = service
        .store()
        .intersecting_range_mappings(
            "ranges",
            &ShardKeyValue::Int32(i32::MAX),
            None,
        )
        .await
        .unwrap();
    assert_eq!(max_key.len(), 1);
    assert_eq!(max_key[0].location, locations[3]);
}

#[tokio::test]
async fn int32_shards_need_at_least_one_location() {
    let service = service().await;
    service.create_range_shard_map::<i32>("ranges").await.unwrap();
    assert!(matches!(
        service.add_int32_range_map_shards("ranges", &[]).await,
        Err(ShardMapError::InvalidShardCount(0))
    ));
}
