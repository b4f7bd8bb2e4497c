use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::ShardMapError;

/// Key type of a shard map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardKeyType {
    /// 32-bit signed integers.
    Int32,
    /// 64-bit signed integers.
    Int64,
    /// UUIDs.
    Guid,
}

impl ShardKeyType {
    /// Stable name used by stores.
    pub fn as_str(self) -> &'static str {
        match self {
            ShardKeyType::Int32 => "int32",
            ShardKeyType::Int64 => "int64",
            ShardKeyType::Guid => "guid",
        }
    }
}

impl fmt::Display for ShardKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`ShardKeyType`].
#[derive(Debug, thiserror::Error)]
#[error("Unknown shard key type '{0}', expected int32, int64 or guid")]
pub struct UnknownShardKeyType(pub String);

impl FromStr for ShardKeyType {
    type Err = UnknownShardKeyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int32" | "int" | "i32" => Ok(ShardKeyType::Int32),
            "int64" | "long" | "i64" => Ok(ShardKeyType::Int64),
            "guid" | "uuid" => Ok(ShardKeyType::Guid),
            _ => Err(UnknownShardKeyType(s.to_string())),
        }
    }
}

/// A key of any supported type.
///
/// Values of the same type order like the underlying key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardKeyValue {
    /// An `i32` key.
    Int32(i32),
    /// An `i64` key.
    Int64(i64),
    /// A UUID key.
    Guid(Uuid),
}

impl ShardKeyValue {
    /// The key's type.
    pub fn key_type(&self) -> ShardKeyType {
        match self {
            ShardKeyValue::Int32(_) => ShardKeyType::Int32,
            ShardKeyValue::Int64(_) => ShardKeyType::Int64,
            ShardKeyValue::Guid(_) => ShardKeyType::Guid,
        }
    }

    /// Big-endian encoding with the sign bit flipped, so byte-wise order
    /// equals key order.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ShardKeyValue::Int32(value) => ((*value as u32) ^ (1 << 31)).to_be_bytes().to_vec(),
            ShardKeyValue::Int64(value) => ((*value as u64) ^ (1 << 63)).to_be_bytes().to_vec(),
            ShardKeyValue::Guid(value) => value.as_bytes().to_vec(),
        }
    }

    /// Decodes [`ShardKeyValue::to_bytes`] output. `None` on a length
    /// mismatch.
    pub fn from_bytes(key_type: ShardKeyType, bytes: &[u8]) -> Option<Self> {
        match key_type {
            ShardKeyType::Int32 => {
                let raw = u32::from_be_bytes(bytes.try_into().ok()?);
                Some(ShardKeyValue::Int32((raw ^ (1 << 31)) as i32))
            }
            ShardKeyType::Int64 => {
                let raw = u64::from_be_bytes(bytes.try_into().ok()?);
                Some(ShardKeyValue::Int64((raw ^ (1 << 63)) as i64))
            }
            ShardKeyType::Guid => Uuid::from_slice(bytes).ok().map(ShardKeyValue::Guid),
        }
    }

    /// Parses a key of `key_type` from text.
    pub fn parse(key_type: ShardKeyType, text: &str) -> Result<Self, ShardMapError> {
        let invalid = || ShardMapError::InvalidKey {
            key_type,
            value: text.to_string(),
        };
        let text = text.trim();
        match key_type {
            ShardKeyType::Int32 => text.parse().map(ShardKeyValue::Int32).map_err(|_| invalid()),
            ShardKeyType::Int64 => text.parse().map(ShardKeyValue::Int64).map_err(|_| invalid()),
            ShardKeyType::Guid => Uuid::parse_str(text)
                .map(ShardKeyValue::Guid)
                .map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for ShardKeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKeyValue::Int32(value) => write!(f, "{value}"),
            ShardKeyValue::Int64(value) => write!(f, "{value}"),
            ShardKeyValue::Guid(value) => write!(f, "{value}"),
        }
    }
}

/// A type usable as a shard key.
pub trait ShardKey: Copy + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// The key type tag.
    const KEY_TYPE: ShardKeyType;

    /// Wraps the key.
    fn to_value(self) -> ShardKeyValue;

    /// Unwraps a key of this type.
    fn from_value(value: ShardKeyValue) -> Option<Self>;
}

impl ShardKey for i32 {
    const KEY_TYPE: ShardKeyType = ShardKeyType::Int32;

    fn to_value(self) -> ShardKeyValue {
        ShardKeyValue::Int32(self)
    }

    fn from_value(value: ShardKeyValue) -> Option<Self> {
        match value {
            ShardKeyValue::Int32(value) => Some(value),
            _ => None,
        }
    }
}

impl ShardKey for i64 {
    const KEY_TYPE: ShardKeyType = ShardKeyType::Int64;

    fn to_value(self) -> ShardKeyValue {
        ShardKeyValue::Int64(self)
    }

    fn from_value(value: ShardKeyValue) -> Option<Self> {
        match value {
            ShardKeyValue::Int64(value) => Some(value),
            _ => None,
        }
    }
}

impl ShardKey for Uuid {
    const KEY_TYPE: ShardKeyType = ShardKeyType::Guid;

    fn to_value(self) -> ShardKeyValue {
        ShardKeyValue::Guid(self)
    }

    fn from_value(value: ShardKeyValue) -> Option<Self> {
        match value {
            ShardKeyValue::Guid(value) => Some(value),
            _ => None,
        }
    }
}
