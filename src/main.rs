mod aggregate;
mod analyze;
mod cluster;
mod config;
mod db;
mod metrics;
mod models;

use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // Force logging to stdout with INFO level for visibility
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stdout)           // force logs to stdout
        .with_target(false)                     // cleaner logs (no module names unless needed)
        .init();

    info!("Token concentration analyzer starting...");

    // Load configuration
    let cfg = config::load()?;
    info!("Loaded config:");
    info!("  Ledgers: {:?}", cfg.ledgers);
    info!("  Snapshot dates: {:?}", cfg.snapshot_dates);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Metrics: {:?}", cfg.metrics);
    info!("  Clustering sources: {:?}", cfg.clustering_sources);

    // Run DB migrations once at startup
    let mut conn = db::connect(&cfg.db_path)?;
    db::run_migrations(&conn)?;

    // Mapping pass: import address-to-entity information per ledger, either
    // on request or because the ledger has no mapped addresses yet.
    for ledger in &cfg.ledgers {
        let needs_map = cfg.force_map || db::mapped_address_count(&conn, ledger)? == 0;
        if !needs_map {
            info!("Mapping already present for {}, skipping import", ledger);
            continue;
        }
        if let Err(e) = cluster::apply_mapping(&cfg, &mut conn, ledger) {
            error!("Mapping import failed for {}: {:?}", ledger, e);
        }
    }
    drop(conn);

    // Analysis pass: every (ledger, date) snapshot, then the output csv.
    analyze::run(Arc::new(cfg)).await?;

    info!("Token concentration analyzer stopped.");
    Ok(())
}
