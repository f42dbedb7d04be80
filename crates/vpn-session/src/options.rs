//! Session tuning knobs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and sizing of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Outbound link writes queued before packets are dropped
    pub max_packets: usize,
    /// Default bound of the exit notification on shutdown
    pub write_timeout: Duration,
    pub min_data_count_interval: Duration,
    pub negotiation_timeout: Duration,
    pub hard_reset_timeout: Duration,
    /// Negotiator scheduler tick
    pub tick_interval: Duration,
    pub retx_interval: Duration,
    pub push_request_interval: Duration,
    /// Liveness check period while keep-alive pings are disabled
    pub ping_timeout_check_interval: Duration,
    /// Keep-alive timeout when neither server nor configuration set one
    pub ping_timeout: Duration,
    /// Overall deadline of a renegotiation
    pub soft_negotiation_timeout: Duration,
    /// How long a retired key generation stays usable
    pub transition_window: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_packets: 100,
            write_timeout: Duration::from_secs(5),
            min_data_count_interval: Duration::from_secs(3),
            negotiation_timeout: Duration::from_secs(30),
            hard_reset_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(200),
            retx_interval: Duration::from_millis(100),
            push_request_interval: Duration::from_secs(2),
            ping_timeout_check_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(120),
            soft_negotiation_timeout: Duration::from_secs(120),
            transition_window: Duration::from_secs(60),
        }
    }
}

/// Whether negotiations send the local options string
///
/// Owned by the caller and shared with every session built from it. A session
/// clears it when the server rejects credentials sent along with local options,
/// so the next session retries without them.
#[derive(Debug, Clone)]
pub struct LocalOptionsFlag(Arc<AtomicBool>);

impl LocalOptionsFlag {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

impl Default for LocalOptionsFlag {
    fn default() -> Self {
        Self::new(true)
    }
}
