use std::sync::Arc;

use tracing::info;

use slotkeeper::auth::ApiKeys;
use slotkeeper::compactor;
use slotkeeper::config::{ServiceConfig, SystemClock};
use slotkeeper::engine::Engine;
use slotkeeper::notify::NotifyHub;
use slotkeeper::payment::{self, Reconciler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env();
    slotkeeper::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::open(
        config.wal_path(),
        config.policy.clone(),
        Arc::new(SystemClock),
        notify,
    )?;

    info!("slotkeeper started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lead_time: {}s, cancel_cutoff: {}s", config.policy.lead_time, config.policy.cancel_cutoff);
    info!("  payment_timeout: {:?}", config.policy.payment_timeout);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let api_keys = ApiKeys::parse(&config.api_keys);
    if api_keys.is_empty() {
        tracing::warn!("no webhook API keys configured, webhook confirmations will be refused");
    }
    let mut reconciler = Reconciler::new(engine.clone(), api_keys);
    if let Some(contract) = &config.payment_contract {
        reconciler = reconciler.with_contract(contract.clone());
    }
    let reconciler = Arc::new(reconciler);

    match config.feed_addr.clone() {
        Some(addr) => {
            info!("  payment feed: {addr}");
            tokio::spawn(payment::follow_feed(
                reconciler,
                addr,
                config.feed_queue,
                config.feed_workers,
            ));
        }
        None => info!("  payment feed: disabled"),
    }

    // Run until SIGTERM/ctrl-c. Every acknowledged transition is already durable.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("slotkeeper stopped");
    Ok(())
}
