//! Background health probing
//!
//! Each pass snapshots the pool, fetches the configured test URL
//! through every upstream with a bounded total timeout, records the
//! outcome, and finally evicts entries that failed too often.

use super::{ProxyPool, Upstream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Total budget for one probe request (connect + exchange).
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodic prober loop. Runs until the task is aborted.
pub async fn run(pool: Arc<ProxyPool>) {
    let mut ticker = tokio::time::interval(pool.check_interval());
    // interval fires immediately once; the first real pass should wait
    // a full period, matching a plain ticker.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        check_all(&pool).await;
    }
}

/// One full probing pass over the pool.
pub async fn check_all(pool: &ProxyPool) {
    let entries = pool.snapshot();
    for upstream in &entries {
        let working = probe(pool.test_url(), upstream).await;
        pool.record_probe(upstream, working);
    }

    let removed = pool.cleanup();
    if removed > 0 {
        info!("Health check removed {} dead upstreams", removed);
    }
}

/// Fetch the test URL through the given upstream. Any 2xx counts as
/// working.
async fn probe(test_url: &str, upstream: &Upstream) -> bool {
    let proxy = match reqwest::Proxy::all(upstream.url_with_credentials()) {
        Ok(proxy) => proxy,
        Err(e) => {
            warn!("Invalid upstream address {}: {}", upstream.url, e);
            return false;
        }
    };

    let client = match reqwest::Client::builder()
        .proxy(proxy)
        .timeout(PROBE_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build probe client for {}: {}", upstream.url, e);
            return false;
        }
    };

    match client.get(test_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!("Probe successful for {}", upstream.url);
            true
        }
        Ok(resp) => {
            info!("Probe failed for {}: status code {}", upstream.url, resp.status());
            false
        }
        Err(e) => {
            info!("Probe failed for {}: {}", upstream.url, e);
            false
        }
    }
}
