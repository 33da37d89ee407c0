use anyhow::Result;
use axum::{Router, extract::DefaultBodyLimit};
use sqlx::postgres::PgConnectOptions;
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::AppConfig;
use services::{
    artifact_store::ArtifactStore,
    credentials::{CredentialStore, PgUserBackend, SqliteUserBackend, UserBackend},
    worker_invoker::WorkerInvoker,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-solver with config: {:?}", cfg);

    // --- Open the credential store ---
    let backend = connect_backend(&cfg).await?;
    tracing::info!("Connected to {} credential store", backend.name());

    // --- Handle migration mode ---
    if migrate {
        backend.migrate().await?;
        tracing::info!("Database migration complete.");
        backend.close().await;
        return Ok(()); // exit after migration
    }

    // --- Ensure upload directory exists ---
    let artifacts = ArtifactStore::new(&cfg.upload_dir);
    if !Path::new(&cfg.upload_dir).exists() {
        artifacts.ensure_dir().await?;
        tracing::info!("Created upload directory at {}", cfg.upload_dir);
    }

    // --- Initialize pipeline components ---
    let credentials = CredentialStore::new(backend, cfg.bcrypt_cost);
    let mut worker = WorkerInvoker::new(
        cfg.worker_program.clone(),
        cfg.worker_args.clone(),
        cfg.worker_timeout,
    );
    if let Some(limit) = cfg.max_concurrent_jobs {
        worker = worker.with_max_concurrent(limit);
        tracing::info!("Worker admission limited to {} concurrent runs", limit);
    }
    tracing::info!(
        "Worker command: {} {:?} (timeout {:?})",
        worker.program(),
        cfg.worker_args,
        worker.timeout()
    );

    let state = AppState {
        credentials: credentials.clone(),
        artifacts,
        worker,
        require_upload_auth: cfg.require_upload_auth,
    };

    // --- Build router ---
    let body_limit = match cfg.upload_limit_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };
    let app: Router = routes::routes::routes()
        .layer(body_limit)
        .with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Teardown ---
    credentials.close().await;
    tracing::info!("Credential store closed, shutting down.");

    Ok(())
}

/// Pick the credential store backend.
///
/// A `sqlite:` `DATABASE_URL` selects SQLite; any other URL is treated as
/// Postgres; without a URL the `DB_*` parts are used.
async fn connect_backend(cfg: &AppConfig) -> Result<Arc<dyn UserBackend>> {
    match cfg.database_url.as_deref() {
        Some(url) if url.starts_with("sqlite:") => {
            prepare_sqlite_path(url)?;
            Ok(Arc::new(SqliteUserBackend::connect(url).await?))
        }
        Some(url) => {
            let options = PgConnectOptions::from_str(url)?;
            Ok(Arc::new(
                PgUserBackend::connect(options, cfg.db_max_connections).await?,
            ))
        }
        None => {
            tracing::debug!("Connecting to Postgres using {:?}", cfg.db);
            Ok(Arc::new(
                PgUserBackend::connect(cfg.db.connect_options(), cfg.db_max_connections).await?,
            ))
        }
    }
}

/// Create the parent directory of a file-backed SQLite database.
fn prepare_sqlite_path(url: &str) -> Result<()> {
    // Extract the local file path SQLx will use
    let db_path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if db_path.is_empty() || db_path.contains(":memory:") {
        return Ok(());
    }
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
