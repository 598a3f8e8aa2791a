use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tributary_migration::MigratorTrait;
use tributary_plugin::{DbJobStore, KeyedStore, MemoryStore, PluginServer, RuntimeConfig};

mod api;

use api::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Database connection
    let db_config = tributary_db::DatabaseConfig::from_env();
    tracing::info!("connecting to database...");
    let db = tributary_db::connect(&db_config)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("running database migrations...");
    tributary_migration::Migrator::up(&db, None)
        .await
        .expect("failed to run migrations");
    tracing::info!("migrations complete");

    let server = Arc::new(PluginServer::new(
        RuntimeConfig::from_env(),
        cache_store(),
        Arc::new(DbJobStore::new(db)),
    ));

    // Interrupted jobs are requeued before the dispatcher starts.
    server
        .start()
        .await
        .expect("failed to recover interrupted jobs");

    // Job dispatcher. A fault in the job store stops the process.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = server.spawn_job_dispatcher(shutdown_rx);
    tokio::spawn(async move {
        match dispatcher.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "job dispatcher stopped on a runtime fault");
                std::process::exit(1);
            }
            Err(e) => {
                tracing::error!(error = %e, "job dispatcher task failed");
                std::process::exit(1);
            }
        }
    });

    let state = Arc::new(AppState {
        plugins: server.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", api::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
    tracing::info!(%addr, "server started");

    axum::serve(
        tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to bind listener"),
        app,
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    server.shutdown().await;
}

#[cfg(feature = "redis")]
fn cache_store() -> Arc<dyn KeyedStore> {
    match tributary_plugin::RedisStore::from_env() {
        Some(Ok(store)) => {
            tracing::info!("plugin cache backed by redis");
            Arc::new(store)
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "redis unavailable, falling back to in-memory cache");
            Arc::new(MemoryStore::new())
        }
        None => Arc::new(MemoryStore::new()),
    }
}

#[cfg(not(feature = "redis"))]
fn cache_store() -> Arc<dyn KeyedStore> {
    Arc::new(MemoryStore::new())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
}
