//! Process entrypoint: connects to Postgres, wires every leaf crate's
//! Postgres-backed implementation into a [`Core`], starts the background
//! orchestrator (journal drain, Merkle anchor, vault sweep), and serves the
//! axum router. `dotenvy` + `tracing_subscriber` init, a plain
//! `PgPool::connect`, an env-var-driven port, permissive CORS, graceful
//! shutdown on ctrl-c.

use ledgercore_anchor::postgres::PgAnchorStore;
use ledgercore_core::{Config, Core, NoopSink};
use ledgercore_entity::postgres::PgEntityStore;
use ledgercore_entity::EntityRegistry;
use ledgercore_journal::postgres::PgJournal;
use ledgercore_ledger::postgres::PgLedger;
use ledgercore_orchestrator::{Orchestrator, TenantDirectory};
use ledgercore_server::{descriptors, router, AppState};
use ledgercore_vault::Vault;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ledgercore_server=info".parse().unwrap()),
        )
        .init();

    let config = Config::from_env();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://ledgercore@localhost:5432/ledgercore_dev".to_string());

    info!("connecting to PostgreSQL");
    let pool = PgPoolOptions::new().max_connections(config.tenant_parallelism as u32).connect(&database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("PostgreSQL connected and migrated");

    let mut registry = EntityRegistry::new();
    descriptors::register(&mut registry);
    let registry = Arc::new(registry);

    let tenants = Arc::new(ledgercore_core::PgTenantStore::new(pool.clone()));
    let tenant_directory: Arc<dyn TenantDirectory> = tenants.clone();
    let entities = Arc::new(PgEntityStore::new(pool.clone()));
    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let journal = Arc::new(PgJournal::with_max_retries(pool.clone(), config.journal_max_retries));
    let vault = Arc::new(Vault::new(config.vault_master_secret.clone()));
    let anchors = Arc::new(PgAnchorStore::new(pool.clone()));

    let core = Arc::new(Core::new(
        tenants,
        registry,
        entities,
        ledger,
        journal,
        vault,
        anchors,
        Arc::new(NoopSink),
        Arc::new(NoopSink),
        config,
    ));

    let mut orchestrator = Orchestrator::new();
    ledgercore_core::start_background(&mut orchestrator, &core, tenant_directory);
    info!("background schedules started: journal drain, merkle anchor, vault sweep");

    let app = router(AppState::new(core));

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{port}");
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    orchestrator.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    info!("shutdown signal received");
}
