//! Keep-alive resolution
//!
//! Server-pushed values win over configured ones; zero counts as unset.

use std::time::Duration;

use shared_protocol::{Configuration, RemoteOptions};
use tokio::time::Instant;

fn positive(value: Option<Duration>) -> Option<Duration> {
    value.filter(|d| !d.is_zero())
}

/// Ping period, `None` when keep-alive pings are disabled
pub fn keep_alive_interval(
    pushed: Option<&RemoteOptions>,
    configuration: &Configuration,
) -> Option<Duration> {
    positive(pushed.and_then(|o| o.keep_alive_interval))
        .or_else(|| positive(configuration.keep_alive_interval))
}

/// Silence tolerated before the session is considered dead
pub fn keep_alive_timeout(
    pushed: Option<&RemoteOptions>,
    configuration: &Configuration,
    default: Duration,
) -> Duration {
    positive(pushed.and_then(|o| o.keep_alive_timeout))
        .or_else(|| positive(configuration.keep_alive_timeout))
        .unwrap_or(default)
}

/// Period of client-initiated renegotiation
pub fn renegotiation_interval(
    pushed: Option<&RemoteOptions>,
    configuration: &Configuration,
) -> Option<Duration> {
    positive(pushed.and_then(|o| o.renegotiates_after))
        .or_else(|| positive(configuration.renegotiates_after))
}

/// True only if strictly more than `timeout` passed since the last inbound packet
pub fn is_ping_timed_out(last_received: Option<Instant>, now: Instant, timeout: Duration) -> bool {
    match last_received {
        Some(last) => now.saturating_duration_since(last) > timeout,
        None => false,
    }
}
