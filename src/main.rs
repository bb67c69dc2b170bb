//! Settlement Core - service entry point
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌────────────┐    ┌──────────┐
//! │  Config  │───▶│ Postgres  │───▶│ Settlement │───▶│ /metrics │
//! │  (YAML)  │    │ (ledger)  │    │  Service   │    │ /health  │
//! └──────────┘    └───────────┘    └────────────┘    └──────────┘
//! ```
//!
//! Usage: `settlement_core [--env|-e <name>]` loads `config/<name>.yaml`.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;

use settlement_core::config::AppConfig;
use settlement_core::db::Database;
use settlement_core::deposit::DepositStore;
use settlement_core::events::{SettlementNotifier, TracingNotifier};
use settlement_core::http;
use settlement_core::logging::init_logging;
use settlement_core::payout::PayoutStore;
use settlement_core::persistence::{MemoryStore, PgSettlementStore};
use settlement_core::service::SettlementService;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config =
        AppConfig::load(&env).with_context(|| format!("loading config/{}.yaml", env))?;
    let _log_guard = init_logging(&config);

    tracing::info!(env = %env, "Starting settlement core");

    let (deposit_store, payout_store): (Arc<dyn DepositStore>, Arc<dyn PayoutStore>) =
        match &config.postgres_url {
            Some(url) => {
                let db = Database::connect(url)
                    .await
                    .context("connecting to PostgreSQL")?;
                if config.init_schema {
                    db.init_schema().await.context("initializing schema")?;
                }
                let store = Arc::new(PgSettlementStore::new(db.pool().clone()));
                (store.clone(), store)
            }
            None => {
                tracing::warn!("postgres_url not set, using in-memory store (state is lost on exit)");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store)
            }
        };

    let notifier: Arc<dyn SettlementNotifier> = Arc::new(TracingNotifier);
    let service = Arc::new(
        SettlementService::from_app_config(&config, deposit_store, payout_store, notifier)
            .context("building settlement service")?,
    );
    service.start().await.context("starting settlement service")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics_server = if config.metrics.enabled {
        let addr = format!("{}:{}", config.metrics.host, config.metrics.port);
        let service = service.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = http::serve(service, &addr, shutdown_rx).await {
                tracing::error!(addr = %addr, error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    service.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(server) = metrics_server {
        let _ = server.await;
    }

    tracing::info!("Settlement core exited cleanly");
    Ok(())
}
