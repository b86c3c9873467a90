use anyhow::Context;
use cache_replication::config::{CacheSettings, ReplicationConfig};
use cache_replication::group::GossipGroup;
use cache_replication::node::ReplicationNode;
use cache_replication::node::handlers::router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        eprintln!(
            "Usage: {} [--config <file>] [--bind <addr:port>] [--seed <addr:port>]... [--http <addr:port>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:45588", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:45589 --seed 127.0.0.1:45588",
            args[0]
        );
        std::process::exit(1);
    }

    let mut config_path = PathBuf::from("cache-replication.json");
    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut http_addr: Option<SocketAddr> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config", Some(value)) => {
                config_path = PathBuf::from(value);
                i += 2;
            }
            ("--bind", Some(value)) => {
                bind_addr = Some(value.parse().context("invalid --bind address")?);
                i += 2;
            }
            ("--seed", Some(value)) => {
                seed_nodes.push(value.parse().context("invalid --seed address")?);
                i += 2;
            }
            ("--http", Some(value)) => {
                http_addr = Some(value.parse().context("invalid --http address")?);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    // 1. Configuration:
    let mut config = ReplicationConfig::load_or_default(&config_path);
    if bind_addr.is_some() {
        config.group.bind = bind_addr;
    }
    config.group.seeds.extend(seed_nodes);
    if config.caches.is_empty() {
        config.caches.push(CacheSettings::new("default"));
    }

    let group_addr = config.group.bind_addr();
    tracing::info!("Starting '{}' member on {}", config.cluster_name, group_addr);
    if config.group.seeds.is_empty() {
        tracing::info!("No seeds given, relying on multicast discovery");
    } else {
        tracing::info!("Seed nodes: {:?}", config.group.seeds);
    }

    // 2. Group membership (UDP gossip):
    let group = GossipGroup::new(&config.group).await?;
    tracing::info!("Node ID: {}", group.local_node.id);

    // 3. Replication:
    let join_timeout = config.group.join_timeout();
    let expects_peers = !config.group.seeds.is_empty() || group.announce_addr().is_some();
    let node = ReplicationNode::start(config, group.clone())?;
    group.start();

    if expects_peers && !group.wait_for_members(2, join_timeout).await {
        tracing::warn!("No peer seen within {:?}, bootstrapping alone", join_timeout);
    }

    // 4. Bootstrap configured caches:
    let outcomes = node.bootstrap_caches().await;
    tracing::info!("Bootstrap on start finished for {} cache(s)", outcomes.len());

    // 5. Spawn stats reporter:
    let stats_group = group.clone();
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            interval.tick().await;
            let alive = stats_group.get_alive_members();
            tracing::info!(
                "Cluster stats: {} alive nodes, {} queued events",
                alive.len(),
                stats_node.transport().pending_events()
            );
            for member in alive {
                tracing::info!("  - {} addr={} (inc={})", member.id, member.addr, member.incarnation);
            }
        }
    });

    // 6. Start HTTP server:
    let http_addr =
        http_addr.unwrap_or_else(|| SocketAddr::new(group_addr.ip(), group_addr.port().saturating_add(1000)));
    let app = router(node.clone());

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Tear down replication, then leave the group:
    node.dispose().await;
    group.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
