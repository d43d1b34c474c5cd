//! hoprelay - CLI entry point

use clap::Parser;
use hoprelay::inbound::Listener;
use hoprelay::pool::{self, PoolConfig, ProxyPool, UpstreamKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hoprelay")]
#[command(about = "Multi-protocol forwarding proxy with a file-backed upstream pool")]
struct Args {
    /// HTTP upstream list file
    #[arg(long = "http-list", default_value = "proxy_http.txt")]
    http_list: PathBuf,

    /// SOCKS5 upstream list file
    #[arg(long = "socks5-list", default_value = "proxy_sockets5.txt")]
    socks5_list: PathBuf,

    /// Listen address
    #[arg(short = 'l', long = "listen", default_value = "0.0.0.0:8081")]
    listen: String,

    /// URL fetched through each upstream by the health prober
    #[arg(long = "test-url", default_value = "http://ip4.me/api")]
    test_url: String,

    /// Additional upstream attempts per request
    #[arg(long = "max-retries", default_value_t = 3)]
    max_retries: u32,

    /// Consecutive failures before an upstream is dropped
    #[arg(long = "max-fails", default_value_t = 5)]
    max_fails: u32,

    /// Seconds between health-check passes
    #[arg(long = "check-interval", default_value_t = 300)]
    check_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hoprelay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("Starting proxy server");

    let pool = Arc::new(ProxyPool::new(PoolConfig {
        test_url: args.test_url,
        max_retries: args.max_retries,
        max_fails: args.max_fails,
        check_interval: Duration::from_secs(args.check_interval),
    }));

    if let Err(e) = pool::load_all(&pool, &args.http_list, &args.socks5_list).await {
        error!("Failed to load upstreams: {}", e);
        std::process::exit(1);
    }
    info!("{} upstreams in pool", pool.count());

    let listener = match Listener::bind(&normalize_listen_addr(&args.listen), pool.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to start proxy server: {}", e);
            std::process::exit(1);
        }
    };

    let watcher = tokio::spawn(pool::watch(
        pool.clone(),
        vec![
            (args.http_list, UpstreamKind::Http),
            (args.socks5_list, UpstreamKind::Socks5),
        ],
    ));
    let prober = tokio::spawn(pool::health::run(pool.clone()));
    let server = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, shutting down");

    server.abort();
    watcher.abort();
    prober.abort();

    info!("Server stopped");
    Ok(())
}

/// Accept Go-style `":8081"` listen addresses by expanding them to all
/// interfaces.
fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}
