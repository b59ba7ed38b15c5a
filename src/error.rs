use bson::Bson;
use thiserror::Error;

/// Errors produced by RPC calls, workers and channel providers.
///
/// A failed [`RpcClient::call`](crate::RpcClient::call) falls into one of three
/// classes callers usually want to tell apart:
///
/// - [`RpcError::Timeout`]: no matching reply arrived in time,
/// - [`RpcError::Remote`]: the worker answered with `success: false`,
/// - everything else: a local failure (transport, codec, configuration).
#[derive(Error, Debug)]
pub enum RpcError {
    /// No matching reply arrived within the configured time-to-live.
    #[error("request timed out")]
    Timeout,

    /// The worker reported a failure; carries the worker's `result` payload.
    #[error("remote worker reported failure: {0}")]
    Remote(Bson),

    /// The channel provider failed (declare, publish, consume, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The channel or its connection is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// Application data could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A correlated reply was not a `{success, result}` document.
    #[error("invalid reply: {0}")]
    InvalidReply(String),

    /// Configuration could not be parsed or names an unsupported broker.
    #[error("configuration error: {0}")]
    Config(String),

    /// The caller stopped waiting before the call settled.
    #[error("call abandoned before completion")]
    Abandoned,
}

impl RpcError {
    /// `true` for [`RpcError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout)
    }

    /// `true` when the failure was reported by the remote worker.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    /// The worker's failure payload, if this is a remote failure.
    pub fn remote_payload(&self) -> Option<&Bson> {
        match self {
            RpcError::Remote(payload) => Some(payload),
            _ => None,
        }
    }
}

impl From<bson::ser::Error> for RpcError {
    fn from(err: bson::ser::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<bson::de::Error> for RpcError {
    fn from(err: bson::de::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
