//! Packager server: the package routes over a PostgreSQL metadata store.
//!
//! Run from repo root: `cargo run -p packager-server`

use app_packager::{
    ensure_database_exists, ensure_sys_tables, router, AppState, Packager, PackagerSettings, PgMetadataStore,
    StorageRegistry,
};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("app_packager=info,packager_server=info")),
        )
        .init();

    let settings = Arc::new(PackagerSettings::from_env()?);
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/packager".into());
    ensure_database_exists(&database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    ensure_sys_tables(&pool).await?;

    let store = Arc::new(PgMetadataStore::new(pool, settings.envelope()));
    let storage = Arc::new(StorageRegistry::new(settings.clone()));
    let backends = storage.load(store.as_ref()).await?;
    tracing::info!(backends, "storage services loaded");

    let packager = Packager::new(store, storage, settings);
    let app = router(AppState::new(packager));

    let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("Packager listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
