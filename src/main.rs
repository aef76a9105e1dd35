use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pixy_coordinator::config::Config;
use pixy_coordinator::coordinator::{Coordinator, GroupIdentity};
use pixy_coordinator::store::{Store, ZkStore};

#[derive(Parser, Debug)]
#[command(name = "pixy-coordinator")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, env = "PIXY_CONFIG")]
    config: PathBuf,

    /// Overrides `RUST_LOG`'s default if neither is set.
    #[arg(long, env = "PIXY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::parse(&args.config)?;

    let store: Arc<dyn Store> = Arc::new(
        ZkStore::connect(&config.zk_connect_string(), config.zookeeper.session_timeout).await?,
    );

    let identity = GroupIdentity {
        cluster: config.cluster.clone(),
        group: config.group.clone(),
        member_id: config.member_id.clone(),
    };

    let mut coordinator = Coordinator::spawn_with_safe_claim_retries(
        identity,
        store,
        config.retry_backoff,
        config.rebalance_delay,
        config.safe_claim_retries,
    );

    tracing::info!(
        cluster = %config.cluster,
        group = %config.group,
        member_id = %config.member_id,
        "coordinator started"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
        maybe_snapshot = drain_subscriptions(&mut coordinator) => {
            // The channel closing on its own means the actor exited
            // unexpectedly (e.g. a poisoned internal state); surface it.
            if let Some(err) = maybe_snapshot {
                tracing::error!(error = %err, "coordinator exited unexpectedly");
            }
        }
    }

    coordinator.stop().await;

    Ok(())
}

/// Logs every emitted snapshot until the channel closes, returning an
/// error description if that happens before a shutdown was requested.
async fn drain_subscriptions(coordinator: &mut Coordinator) -> Option<String> {
    loop {
        match coordinator.subscriptions().recv().await {
            Some(snapshot) => {
                tracing::info!(member_count = snapshot.len(), "group snapshot updated");
            }
            None => return Some("subscriptions channel closed".to_string()),
        }
    }
}
