//! Latency probe through an outbound.

use crate::common::http::{fetch, FetchRequest};
use crate::constant::{default_user_agent, DEFAULT_HEALTHCHECK_URL, TCP_TIMEOUT};
use crate::outbound::Outbound;
use crate::Result;
use std::time::{Duration, Instant};

/// GET `link` through `detour` and report the elapsed milliseconds. Any
/// HTTP status counts as reachable; transport errors and the timeout do not.
pub async fn url_test(detour: &dyn Outbound, link: &str, timeout: Duration) -> Result<u16> {
    let link = if link.is_empty() {
        DEFAULT_HEALTHCHECK_URL
    } else {
        link
    };
    let request = FetchRequest::new(link, &default_user_agent())?;
    let start = Instant::now();
    let timeout = if timeout.is_zero() { TCP_TIMEOUT } else { timeout };
    let _ = tokio::time::timeout(timeout, fetch(detour, &request))
        .await
        .map_err(crate::Error::from)??;
    Ok(start.elapsed().as_millis().min(u128::from(u16::MAX)) as u16)
}
