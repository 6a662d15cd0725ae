use anyhow::Context;
use checkout_service::{
    pg_store::{PgCheckoutStore, PgCredentialSource},
    router, AppState, CheckoutStore, CredentialSource, EnvCredentialSource, InMemoryCheckoutStore, ServiceConfig,
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env()?;

    let (store, credentials): (Arc<dyn CheckoutStore>, Arc<dyn CredentialSource>) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PgCheckoutStore::new(pool.clone());
            store.ensure_schema().await?;
            let credentials: Arc<dyn CredentialSource> = if config.settings_from_env {
                Arc::new(EnvCredentialSource)
            } else {
                Arc::new(PgCredentialSource::new(pool))
            };
            info!(settings_from_env = config.settings_from_env, "Using Postgres checkout store");
            let store: Arc<dyn CheckoutStore> = Arc::new(store);
            (store, credentials)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory checkout store");
            let store: Arc<dyn CheckoutStore> = Arc::new(InMemoryCheckoutStore::new());
            let credentials: Arc<dyn CredentialSource> = Arc::new(EnvCredentialSource);
            (store, credentials)
        }
    };

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    let state = AppState::new(store, credentials, config)?;
    let app = router(state);

    info!(%addr, "starting checkout-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
