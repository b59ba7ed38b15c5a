use bson::Bson;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Result, RpcError};

fn null() -> Bson {
    Bson::Null
}

/// Read `success` by truthiness, the way loosely typed workers write it:
/// `1`, `"yes"` or a document count as true; `0`, `""` and `null` as false.
fn truthy<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    // ---
    let value = Bson::deserialize(deserializer)?;
    Ok(match value {
        Bson::Boolean(b) => b,
        Bson::Int32(n) => n != 0,
        Bson::Int64(n) => n != 0,
        Bson::Double(n) => n != 0.0 && !n.is_nan(),
        Bson::String(s) => !s.is_empty(),
        Bson::Null | Bson::Undefined => false,
        _ => true,
    })
}

/// Reply document produced by a worker.
///
/// `success` tells whether the worker handled the request; `result` is the
/// handler's return value on success or the worker's error detail otherwise.
/// A missing `success` field counts as a failure; other values are read by
/// truthiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, deserialize_with = "truthy")]
    pub success: bool,

    #[serde(default = "null")]
    pub result: Bson,
}

impl Reply {
    pub fn ok(result: Bson) -> Self {
        Self {
            success: true,
            result,
        }
    }

    pub fn failed(result: Bson) -> Self {
        Self {
            success: false,
            result,
        }
    }

    /// Split the reply into the caller-facing outcome.
    pub fn into_outcome(self) -> Result<Bson> {
        // ---
        if self.success {
            Ok(self.result)
        } else {
            Err(RpcError::Remote(self.result))
        }
    }
}
