//! Proxy-list loading and file watching
//!
//! Loading is an upsert pass: entries found in a file replace pool
//! entries with the same origin and new origins are appended. A reload
//! therefore never removes anything; entries that disappeared from
//! the file stay in the pool until the failure cleanup evicts them.

use super::{parse_line, ProxyPool, UpstreamKind};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// How often the watcher polls list files for modification.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Load one list file into the pool, stamping every entry with `kind`
/// and prefixing the matching scheme where the line carried none.
/// Fails only if the file cannot be read.
pub async fn load_file(pool: &ProxyPool, path: &Path, kind: UpstreamKind) -> Result<usize> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::config(format!(
            "failed to open proxy list {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut loaded = 0;
    for line in content.lines() {
        match parse_line(line) {
            Ok(None) => {}
            Ok(Some(mut upstream)) => {
                if !upstream.url.contains("://") {
                    upstream.url = format!("{}://{}", kind.scheme(), upstream.url);
                }
                upstream.kind = kind;
                upstream.is_working = true;
                pool.add(upstream);
                loaded += 1;
            }
            Err(e) => warn!("Skipping line in {}: {}", path.display(), e),
        }
    }

    info!(
        "Loaded {} {} upstreams from {}",
        loaded,
        kind,
        path.display()
    );
    Ok(loaded)
}

/// Startup load across both list files. A missing file is tolerated
/// with a warning; an empty pool afterwards is fatal.
pub async fn load_all(pool: &ProxyPool, http_path: &Path, socks5_path: &Path) -> Result<()> {
    for (path, kind) in [
        (http_path, UpstreamKind::Http),
        (socks5_path, UpstreamKind::Socks5),
    ] {
        if let Err(e) = load_file(pool, path, kind).await {
            warn!("{}", e);
        }
    }

    if pool.count() == 0 {
        return Err(Error::config(
            "no valid upstreams found in any proxy list file",
        ));
    }
    Ok(())
}

/// Poll the list files for modification-time changes and re-load a
/// file whenever it changed. Runs until the task is aborted.
pub async fn watch(pool: Arc<ProxyPool>, paths: Vec<(PathBuf, UpstreamKind)>) {
    let mut last_modified: HashMap<PathBuf, SystemTime> = HashMap::new();
    for (path, _) in &paths {
        if let Ok(modified) = modification_time(path).await {
            last_modified.insert(path.clone(), modified);
        }
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;

        for (path, kind) in &paths {
            let Ok(modified) = modification_time(path).await else {
                continue;
            };

            let changed = last_modified.get(path) != Some(&modified);
            if changed {
                info!("Proxy list {} changed, reloading", path.display());
                if let Err(e) = load_file(&pool, path, *kind).await {
                    warn!("Error reloading upstreams: {}", e);
                }
                last_modified.insert(path.clone(), modified);
            }
        }
    }
}

async fn modification_time(path: &Path) -> std::io::Result<SystemTime> {
    tokio::fs::metadata(path).await?.modified()
}
