//! Spreads the int32 key space of a range shard map over three shards and
//! shows that re-applying the same layout is a no-op.

use dbdeploy::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = ShardMapManagementService::new(InMemoryShardMapStore::new());
    service.deploy().await?;
    service.create_range_shard_map::<i32>("customers").await?;

    let locations = [
        ShardLocation::new("srv1", "customers_0"),
        ShardLocation::new("srv1", "customers_1"),
        ShardLocation::new("srv2", "customers_2"),
    ];
    let first = service.add_int32_range_map_shards("customers", &locations).await?;
    let second = service.add_int32_range_map_shards("customers", &locations).await?;
    println!("first run: {first:?}");
    println!("second run: {second:?}");

    for mapping in service.store().range_mappings("customers").await? {
        let high = mapping
            .high
            .map(|high| high.to_string())
            .unwrap_or_else(|| "max".to_string());
        println!("[{}, {high}) -> {}", mapping.low, mapping.location);
    }

    match service
        .add_range_map_shard("customers", 0, Some(10), "srv3", "elsewhere")
        .await
    {
        Err(e) => println!("rejected: {e}"),
        Ok(outcome) => println!("unexpected: {outcome:?}"),
    }
    Ok(())
}
