use std::sync::Arc;

use salvo::conn::TcpListener;
use salvo::{Listener, Router};
use klinik_app::app::api::routes;
use klinik_app::app::catalogue::{ensure_admin_catalogue, ensure_superuser};
use klinik_core::config::load_config;
use klinik_db::db::connection::create_pool;
use klinik_db::db::migrate::run_migrations;
use klinik_db::store::pg::PgStore;
use klinik_service::authz::casbin::{CasbinEngine, init_casbin};
use klinik_service::cache::MemoryKv;
use klinik_service::context::{AuthzContext, AuthzContextHandler};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (filter_layer, filter_handle) = reload::Layer::new(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    // casbin logs through the `log` facade
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!(error = %e, "log bridge already installed");
    }

    tracing::info!("Starting Klinik RBAC server");

    let config = load_config()?;

    tracing::info!(config = ?config, "Configuration loaded");

    if let Ok(filter) = EnvFilter::try_new(config.logging.level.as_str()) {
        if let Err(e) = filter_handle.modify(|current| *current = filter) {
            tracing::warn!(error = %e, "Failed to update log filter from config");
        }
    } else {
        tracing::warn!(level = %config.logging.level, "Invalid log level in config, keeping debug");
    }

    run_migrations(&config.database.url).await?;

    let pool = create_pool(
        &config.database.url,
        u32::from(config.database.max_connections),
    )
    .await?;

    tracing::info!("Database connection pool created.");

    let enforcer = init_casbin(pool.clone()).await?;
    let store = Arc::new(PgStore::new(pool));

    ensure_admin_catalogue(store.as_ref()).await?;
    if let Some(bootstrap) = &config.bootstrap {
        ensure_superuser(store.as_ref(), bootstrap).await?;
    } else {
        tracing::debug!("No bootstrap account configured");
    }

    let context = AuthzContext::build(
        store,
        Arc::new(CasbinEngine::from_enforcer(enforcer)),
        Arc::new(MemoryKv::new()),
        &config.jwt,
        &config.authz,
    )
    .await?;

    let bind_addr = config.server.bind_addr();
    let acceptor = TcpListener::new(bind_addr.clone()).bind().await;

    let router = Router::new()
        .hoop(AuthzContextHandler {
            context: Arc::new(context),
        })
        .push(routes());

    tracing::info!("Server listening on {bind_addr}");

    salvo::Server::new(acceptor).serve(router).await;

    Ok(())
}
