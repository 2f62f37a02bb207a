use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use questline_engine::{
    ChangeBus, EngineConfig, EngineReplica, MigrationRunner, QuestCatalog, SqliteStore, StateStore,
};

fn usage() -> ! {
    eprintln!("Usage: questline-engine [migrate] [--config <path>]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("questline_engine=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut migrate = false;
    let mut config_path: Option<PathBuf> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "migrate" => migrate = true,
            "--config" => match iter.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => usage(),
            },
            _ => usage(),
        }
    }

    let cfg = match EngineConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn StateStore> = match SqliteStore::new(&cfg.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open store at {}: {}", cfg.database_url, e);
            std::process::exit(1);
        }
    };

    if migrate {
        // One-shot schema upgrade, run out-of-band from request serving
        match MigrationRunner::new(store).run().await {
            Ok(report) => {
                info!(
                    "Migration finished: {} migrated, {} skipped, {} failed (backup {})",
                    report.migrated,
                    report.skipped,
                    report.failed.len(),
                    report.backup_id
                );
                for failure in &report.failed {
                    warn!("  {}: {}", failure.player_id, failure.reason);
                }
                if !report.failed.is_empty() {
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("Migration failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let catalog = match QuestCatalog::load_from_directory(&cfg.quest_data_dir) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!("Failed to load quest catalog: {}", e);
            std::process::exit(1);
        }
    };
    if catalog.is_empty() {
        warn!("Quest catalog is empty; players will have nothing to start");
    }

    let bus = Arc::new(ChangeBus::new(cfg.bus_capacity));
    let replica = EngineReplica::new(cfg, store, bus, catalog);
    info!("Engine replica {} starting", replica.replica_id());

    let tasks = replica.start();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    replica.shutdown().await;
    for task in tasks {
        task.abort();
    }
    info!("Engine replica {} stopped", replica.replica_id());
}
