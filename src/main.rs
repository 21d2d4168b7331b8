use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use biotiles::config::AppConfig;
use biotiles::handlers::AppState;
use biotiles::metastore::Metastore;
use biotiles::search_backend::SearchBackendAdapter;
use biotiles::tile_store::SqliteTileStore;
use biotiles::build_router;
use tracing::info;
use tracing_subscriber::EnvFilter;

const MAX_CONCURRENT_REQUESTS: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("biotiles=debug".parse()?))
        .init();

    info!("Starting biotiles");

    let config = AppConfig::from_env()?;

    let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:biotiles.db".to_string());
    let store = SqliteTileStore::connect(&database_url, config.salt_modulus).await?;

    // No coordination-service client is wired up yet, so the Watched
    // variant (exercised directly in metastore.rs's tests) has nothing to
    // poll here; Static always backs the production router.
    if config.metastore_quorum.is_some() {
        info!("metastore_quorum is configured but the Watched backend is not yet wired up; using Static");
    }
    let metastore = Metastore::static_from_config(&config.tiles_table, &config.points_table);

    let search_backend =
        SearchBackendAdapter::new(config.search_backend_url.clone(), config.request_timeout)?;

    let state = AppState {
        store: Arc::new(store),
        metastore: Arc::new(metastore),
        search_backend: Arc::new(search_backend),
        tile_size: config.tile_size,
        buffer_size: config.buffer_size,
    };

    let app = build_router(state, MAX_CONCURRENT_REQUESTS, config.request_timeout);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
