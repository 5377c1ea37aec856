use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod session;
mod transport;

use config::{AppConfig, Mode};
use services::{
    database::{SqliteStore, run_migrations},
    storage_service::StorageService,
    upload_service::UploadService,
};
use session::normalize_key;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting asset-drop with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let connect_options =
        SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    if let Some(parent) = connect_options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    tracing::debug!("Connecting to {}", cfg.database_url);

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?,
    );

    match mode {
        Mode::Migrate => {
            run_migrations(&db).await?;
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        Mode::RegisterUser { name, public_key } => {
            register_user(SqliteStore::new(db.clone()), &cfg, &name, &public_key).await?;
            return Ok(());
        }
        Mode::Serve => {}
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone());
    let store = Arc::new(SqliteStore::new(db.clone()));
    let uploads = UploadService::new(
        store.clone(),
        store,
        Arc::new(storage.clone()),
        cfg.site.clone(),
    );
    let chain = handlers::command_chain(uploads);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
            }
            shutdown.cancel();
        }
    });

    // --- Session listener ---
    let session_listener = bind_with_fallback(&cfg.host, cfg.session_port).await?;
    let sessions = tokio::spawn(transport::run_session_listener(
        session_listener,
        chain,
        shutdown.clone(),
    ));

    // --- Probe router ---
    let app: Router = routes::routes::routes().with_state(storage);
    let listener = bind_with_fallback(&cfg.host, cfg.port).await?;
    tracing::info!("Probes listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    sessions.await??;
    Ok(())
}

/// Bind `host:port`, retrying on loopback when a wildcard bind is not permitted.
async fn bind_with_fallback(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", host, port);
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied && matches!(host, "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            Ok(TcpListener::bind(&fallback_addr).await?)
        }
        Err(err) => Err(err.into()),
    }
}

/// Create a user for `public_key` and grant them the space entitlement.
async fn register_user(
    store: SqliteStore,
    cfg: &AppConfig,
    name: &str,
    public_key: &str,
) -> Result<()> {
    let key_text = normalize_key(public_key)
        .ok_or_else(|| anyhow::anyhow!("public key must look like `<algorithm> <base64 blob>`"))?;
    let user = store.register_user(name, &key_text).await?;
    store.grant_feature(user.id, &cfg.site.space).await?;
    tracing::info!(
        "Registered ({}) as {} with access to ({})",
        user.name,
        user.id,
        cfg.site.space
    );
    Ok(())
}
