use super::ShardMapError;

/// A contiguous slice of the `i32` key space. `high` is exclusive except for
/// the last range of a partition, which ends at `i32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Int32Range {
    /// Low bound.
    pub low: i32,
    /// High bound.
    pub high: i32,
}

/// Splits the `i32` key space into `num_shards` contiguous ranges of
/// `ceil((2^32 - 1) / num_shards)` keys, the last one ending at `i32::MAX`.
pub fn int32_ranges(num_shards: i32) -> Result<Vec<Int32Range>, ShardMapError> {
    if num_shards < 1 {
        return Err(ShardMapError::InvalidShardCount(i64::from(num_shards)));
    }

    let shards = i64::from(num_shards);
    let range_size = (u64::from(u32::MAX).div_ceil(num_shards as u64)) as i64;
    let max = i64::from(i32::MAX);

    let mut ranges = Vec::with_capacity(num_shards as usize);
    let mut low = i64::from(i32::MIN);
    for _ in 1..shards {
        let high = low + range_size;
        if high >= max {
            return Err(ShardMapError::InconsistentRanges(format!(
                "{num_shards} shards exhaust the key space before the last shard"
            )));
        }
        ranges.push(to_range(low, high)?);
        low = high;
    }
    ranges.push(to_range(low, (low + range_size).min(max))?);

    Ok(ranges)
}

fn to_range(low: i64, high: i64) -> Result<Int32Range, ShardMapError> {
    let convert = |value: i64| {
        i32::try_from(value)
            .map_err(|_| ShardMapError::InconsistentRanges(format!("{value} is outside i32")))
    };
    Ok(Int32Range {
        low: convert(low)?,
        high: convert(high)?,
    })
}
