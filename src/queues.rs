//! Queue declaration policy for routes.
//!
//! A route's work queue is named after the route and declared durable so
//! requests outlive worker restarts. Reply queues are broker-named, exclusive
//! to the declaring channel and removed with it.

use crate::{log_debug, Channel, QueueOptions, Result};

/// Assert the durable work queue for `route` and return its name.
pub async fn assert_worker_queue(channel: &dyn Channel, route: &str) -> Result<String> {
    // ---
    let name = channel.assert_queue(route, QueueOptions::worker()).await?;
    log_debug!("asserted worker queue {name}");
    Ok(name)
}

/// Assert a fresh reply queue for a call on `route` and return its name.
pub async fn assert_reply_queue(channel: &dyn Channel, route: &str) -> Result<String> {
    // ---
    let name = channel.assert_queue("", QueueOptions::reply()).await?;
    log_debug!("asserted reply queue {name} for route {route}");
    Ok(name)
}
