//! Simple example of using socks-proxy-pool.

use reqwest_middleware::ClientBuilder;
use socks_proxy_pool::{PoolConfig, ProxyPool, ProxyPoolMiddleware};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let config = PoolConfig::builder()
        .validation_timeout(Duration::from_secs(5))
        .stale_after(Duration::from_secs(10 * 60))
        .max_workers(50)
        .remove_after(3)
        .dispatch_retries(2)
        .autoscale(true)
        .build();
    let pool = ProxyPool::new(config)?;

    // free proxy lists, one `host:port` per line
    for source in [
        "https://cdn.jsdelivr.net/gh/dpangestuw/Free-Proxy@main/socks5_proxies.txt",
        "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/socks5/data.txt",
    ] {
        match pool.load_from_source(source).await {
            Ok(added) => println!("{} new endpoints from {}", added, source),
            Err(e) => eprintln!("Failed to load {}: {}", source, e),
        }
    }
    pool.start()?;

    let proxy = pool.get_any(tokio::time::sleep(Duration::from_secs(60))).await?;
    println!("First live proxy: {} (exit {:?})", proxy.url(), proxy.external_ip);

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(ProxyPoolMiddleware::new(pool.clone()))
        .build();

    println!("Sending request...");
    let response = client.get("https://api.ipify.org").send().await?;
    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);

    let stats = pool.stats();
    println!(
        "Validated {} (socks5 {}, socks4 {}, socks4a {}), bad {}, evicted {}, backlog {}",
        stats.total_validated(),
        stats.valid5,
        stats.valid4,
        stats.valid4a,
        stats.bad,
        stats.evicted,
        pool.backlog()
    );
    Ok(())
}
