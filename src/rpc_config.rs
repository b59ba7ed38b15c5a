//! Client configuration.
//!
//! Holds the broker location and the per-route call settings. Route settings
//! use the same JSON shape services already keep next to their code:
//!
//! ```json
//! {
//!     "math.add": { "timeToLive": 5000 },
//!     "log.event": {}
//! }
//! ```
//!
//! `timeToLive` is in milliseconds; `0` or absent means calls on that route
//! wait for their reply indefinitely (unless a default is configured).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Settings for a single route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Maximum wait for a reply, in milliseconds.
    #[serde(rename = "timeToLive", default, skip_serializing_if = "Option::is_none")]
    pub time_to_live_ms: Option<u64>,
}

impl RouteConfig {
    /// Configured time-to-live; `None` when unset or zero.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Connection and routing configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Broker URI.
    ///
    /// `None` or `memory://` selects the in-process broker; `amqp://` and
    /// `amqps://` select the AMQP provider (feature `transport_lapin`).
    pub uri: Option<String>,

    /// Name used in logs and as the AMQP connection name.
    pub connection_name: String,

    /// Per-route settings keyed by route name.
    pub routes: HashMap<String, RouteConfig>,

    /// Time-to-live for routes without their own setting.
    pub default_time_to_live: Option<Duration>,

    /// Interval between broker reconnect attempts.
    ///
    /// Default: 1 second
    pub reconnect_delay: Duration,
}

impl RpcConfig {
    /// Config for the in-process broker.
    pub fn memory(connection_name: impl Into<String>) -> Self {
        Self {
            uri: None,
            connection_name: connection_name.into(),
            routes: HashMap::new(),
            default_time_to_live: None,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Config for a broker at `uri`.
    pub fn with_broker(uri: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::memory(connection_name)
        }
    }

    /// Set the time-to-live of one route.
    pub fn with_route_ttl(mut self, route: impl Into<String>, ttl: Duration) -> Self {
        let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.routes.insert(
            route.into(),
            RouteConfig {
                time_to_live_ms: Some(ms),
            },
        );
        self
    }

    /// Set the time-to-live used by routes without their own entry.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_time_to_live = Some(ttl);
        self
    }

    /// Set the broker reconnect interval.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Merge route settings from a JSON object keyed by route name.
    ///
    /// Entries already present are replaced.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if `json` is not such an object.
    pub fn with_routes_json(mut self, json: &str) -> Result<Self> {
        // ---
        let routes: HashMap<String, RouteConfig> = serde_json::from_str(json)
            .map_err(|e| RpcError::Config(format!("invalid route config: {e}")))?;
        self.routes.extend(routes);
        Ok(self)
    }

    /// Merge route settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Config`] if the file cannot be read or parsed.
    pub fn load_routes(self, path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("cannot read {}: {e}", path.display())))?;
        self.with_routes_json(&json)
    }

    /// Time-to-live for calls on `route`.
    ///
    /// A route entry wins over the default, including an explicit `0`
    /// which disables the timeout for that route.
    pub fn time_to_live(&self, route: &str) -> Option<Duration> {
        // ---
        match self.routes.get(route) {
            Some(route_config) if route_config.time_to_live_ms.is_some() => {
                route_config.time_to_live()
            }
            _ => self.default_time_to_live.filter(|ttl| !ttl.is_zero()),
        }
    }
}
