use axum::{
    Router,
    routing::{get, post},
};
use conf::Conf;
use rand::distr::SampleString;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::Level;

mod admin;
mod audit;
mod auth;
mod blobs;
mod cli;
mod crypto;
mod database;
mod gc;
mod info;
mod keyed_lock;
mod s3;

use crate::cli::{CliOperations, RunConfig};
use crate::info::health_check;

pub struct App {
    db: database::Database,
    blobs: blobs::BlobStore,
    locks: keyed_lock::KeyedLocks,
    audit: audit::AuditSink,
    master_key: Option<crypto::MasterKey>,
    tokens: auth::token::TokenSigner,
    config: RunConfig,
}

pub type AppState = Arc<App>;

/// Resolves once SIGINT or SIGTERM asks the process to stop.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::debug!("Received ctrl-c"),
            _ = terminate.recv() => tracing::debug!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Could not wait for ctrl-c");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http::trace=info".into()),
        )
        .compact()
        .init();

    let cli = cli::Cli::parse();
    let config = match cli.command {
        Some(CliOperations::Config(config)) => {
            println!("{config:#?}");
            std::process::exit(0);
        }
        Some(CliOperations::Credentials) => {
            let mut rng = rand::rng();
            let access_key = rand::distr::Alphanumeric
                .sample_string(&mut rng, 20)
                .to_uppercase();
            let secret_key = rand::distr::Alphanumeric.sample_string(&mut rng, 40);
            println!("ROOT_ACCESS_KEY={access_key}");
            println!("ROOT_SECRET_KEY={secret_key}");
            std::process::exit(0);
        }
        Some(CliOperations::Run(config)) => config,
        _ => cli.config,
    };

    run(config).await;
}

async fn run(config: RunConfig) {
    tracing::debug!(config = ?config, "Loaded configuration");

    if config.root.is_none() {
        tracing::warn!(
            "No root credentials configured; only policies attached to anonymous will grant access"
        );
    }

    let master_key = match &config.sse_master_key {
        Some(hex_key) => match crypto::MasterKey::from_hex(hex_key) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::error!(error = %e, "Invalid SSE_MASTER_KEY");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // Initialize database before starting the server
    let db = match database::Database::initialize(&config.database_url, &config.sqlite).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize database");
            std::process::exit(1);
        }
    };

    let blobs = match blobs::BlobStore::initialize(&config.blob_path).await {
        Ok(blobs) => blobs,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize blob store");
            std::process::exit(1);
        }
    };

    if let Err(e) = seed_builtin_principals(&db, &config).await {
        tracing::error!(error = %e, "Failed to seed built-in principals");
        std::process::exit(1);
    }

    let session_secret = config.session_secret.clone().unwrap_or_else(|| {
        tracing::warn!("No SESSION_SECRET configured; login tokens expire on restart");
        rand::distr::Alphanumeric.sample_string(&mut rand::rng(), 48)
    });

    let app_state = Arc::new(App {
        db: db.clone(),
        blobs: blobs.clone(),
        locks: keyed_lock::KeyedLocks::new(),
        audit: audit::AuditSink,
        master_key,
        tokens: auth::token::TokenSigner::new(session_secret.as_bytes()),
        config: config.clone(),
    });

    tokio::spawn(gc::run(
        db.clone(),
        blobs,
        app_state.locks.clone(),
        config.gc_interval_secs,
        config.multipart_max_age_secs,
    ));

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/login", post(admin::login))
        .route("/whoami", get(admin::whoami))
        .merge(s3::routes(db, config.virtual_host_domain.clone()))
        .with_state(app_state.clone())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        );

    let listener = match config.listener().await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up the listener");
            std::process::exit(1);
        }
    };
    tracing::info!(region = config.region, "Service started");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_shutdown().await;
        tracing::info!("Shutdown requested, flushing the metadata pool");
        // Bounded flush; whatever has not committed in time is cut off.
        if tokio::time::timeout(Duration::from_secs(3), app_state.db.pool.close())
            .await
            .is_err()
        {
            tracing::warn!("Timed out closing the database pool");
        }
    });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }

    tracing::info!("Server shutdown complete");
}

/// The authorization engine consumes user, key and policy rows; the
/// built-ins come from configuration since the admin surface lives
/// elsewhere.
async fn seed_builtin_principals(
    db: &database::Database,
    config: &RunConfig,
) -> Result<(), database::DatabaseError> {
    if let Some(password) = &config.admin_password {
        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| database::DatabaseError::IoError(std::io::Error::other(e)))?;
        db.set_password_hash(auth::policy::ADMIN_USER, &hash).await?;
        tracing::info!("Admin password configured");
    }
    if let Some(root) = &config.root {
        db.upsert_access_key(&root.access_key, &root.secret_key, auth::policy::ADMIN_USER)
            .await?;
        tracing::info!(access_key = root.access_key, "Root access key configured");
    }
    Ok(())
}
