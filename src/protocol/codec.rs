// src/protocol/codec.rs

use bson::Bson;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Encode a value as a BSON document.
///
/// The top-level value must serialize to a document (a struct or a map);
/// scalars and sequences are rejected with [`RpcError::Codec`](crate::RpcError::Codec).
pub fn encode<T>(value: &T) -> Result<Bytes>
where
    T: Serialize,
{
    // ---
    let bytes = bson::to_vec(value)?;
    Ok(Bytes::from(bytes))
}

/// Decode a BSON document into `T`.
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: DeserializeOwned,
{
    // ---
    Ok(bson::from_slice(bytes)?)
}

/// Convert any serializable value into a loose [`Bson`] value.
pub fn encode_value<T>(value: &T) -> Result<Bson>
where
    T: Serialize,
{
    Ok(bson::to_bson(value)?)
}

/// Convert a loose [`Bson`] value into `T`.
pub fn decode_value<T>(value: Bson) -> Result<T>
where
    T: DeserializeOwned,
{
    Ok(bson::from_bson(value)?)
}
