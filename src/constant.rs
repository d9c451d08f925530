//! Core timing and sizing constants shared across subsystems.

use std::time::Duration;

/// Budget for a single component start before the task monitor complains.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for a single component close during shutdown.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default TCP connect / probe timeout.
pub const TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for a single DNS exchange attempt.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

pub const TCP_KEEPALIVE_INITIAL: Duration = Duration::from_secs(10 * 60);
pub const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(75);

/// Interval between URL-test passes when the group does not configure one.
pub const DEFAULT_URLTEST_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Minimum interval between HTTP subscription downloads.
pub const DEFAULT_DOWNLOAD_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Providers and lazy group tickers fire on this cadence.
pub const PROVIDER_TICK_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_HEALTHCHECK_URL: &str = "https://www.gstatic.com/generate_204";

/// Latency difference treated as noise when picking a URL-test winner.
pub const DEFAULT_URLTEST_TOLERANCE: u16 = 50;

/// Attempts for a single dial before the last error is surfaced.
pub const DIAL_RETRY_ATTEMPTS: usize = 4;

/// Parallel retry chains launched when concurrent dial is enabled.
pub const CONCURRENT_DIAL_FANOUT: usize = 3;

/// Upper bound on in-flight health-check probes per provider or group.
pub const HEALTHCHECK_CONCURRENCY: usize = 10;

/// Tag of the sentinel outbound installed before any configured outbound.
pub const OUTBOUNDLESS_TAG: &str = "OUTBOUNDLESS";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn default_user_agent() -> String {
    format!("routebox {}", VERSION)
}
