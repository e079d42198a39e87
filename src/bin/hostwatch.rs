use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hostwatch::{
    config::LinkConfig, registry::ConnectionRegistry, repository::JsonFileRepository,
    store::MetricsStore, transport::WebSocketConnector,
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hostwatch")]
#[command(about = "Keep live connections to host monitoring agents", long_about = None)]
struct Args {
    /// Path to config file (default: ~/.config/hostwatch/config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the host list (overrides the config file)
    #[arg(short = 'f', long, value_name = "FILE")]
    hosts: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = filter::Targets::new().with_targets(vec![("hostwatch", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let mut config = LinkConfig::load(args.config.as_deref())?;
    if let Some(hosts) = args.hosts {
        config.hosts_file = Some(hosts);
    }

    let hosts_path = config.hosts_path();
    info!("reading hosts from {}", hosts_path.display());

    let summary_interval = Duration::from_secs(config.summary_interval_secs.max(1));
    let registry = ConnectionRegistry::load(
        MetricsStore::with_capacity(config.event_capacity),
        Arc::new(WebSocketConnector::new()),
        Arc::new(JsonFileRepository::new(hosts_path)),
        config,
    )
    .await?;

    if registry.hosts().await.is_empty() {
        warn!("no hosts configured");
    }

    let mut ticker = tokio::time::interval(summary_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_summary(&registry).await,

            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("failed to listen for Ctrl-C: {e}");
                }
                info!("shutting down");
                break;
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}

async fn log_summary(registry: &ConnectionRegistry) {
    for target in registry.hosts().await {
        let name = target.display_name();
        let online = registry.is_online(&target.id).await;
        let points = registry
            .get_history_buffer(&target.id)
            .await
            .map(|points| points.len())
            .unwrap_or_default();

        match registry.get_snapshot(&target.id).await {
            Some(snapshot) => info!(
                "{name}: {} | cpu {:.1}% | memory {:.1}% | disk {:.1}% | {points} history points",
                if online { "online" } else { "offline" },
                snapshot.cpu.usage_percent,
                snapshot.memory_percent(),
                snapshot.disk.percent,
            ),
            None => info!(
                "{name}: {} | no data yet",
                if online { "online" } else { "offline" }
            ),
        }
    }
}
