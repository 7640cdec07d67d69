//! Margin Trading Position Lifecycle Engine
//! Mission: Own the full lifecycle of a leveraged position from creation to closure

use anyhow::{Context, Result};
use axum::{middleware as axum_mw, routing::get, Router};
use clap::Parser;
use margin_engine::auth::{self, auth_middleware, AuthState, JwtHandler, UserStore};
use margin_engine::persistence::{self, SqliteGateway};
use margin_engine::{api, middleware, Engine, EngineConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Margin trading position lifecycle engine.
#[derive(Debug, Parser)]
#[command(name = "margin-engine")]
struct Cli {
    /// Path to the SQLite database file. Overrides DATABASE_PATH.
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Address to bind the HTTP server to. Overrides BIND_ADDR.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(path) = cli.database_path {
        config.database_path = path;
    }
    if let Some(addr) = cli.bind_addr {
        config.bind_addr = addr;
    }

    init_tracing(&config.log_level);

    info!(database_path = %config.database_path, bind_addr = %config.bind_addr, "margin engine starting");

    let gateway: Arc<dyn persistence::PersistenceGateway> =
        Arc::new(SqliteGateway::open(&config.database_path).context("failed to open database")?);

    let engine = Arc::new(Engine::new(gateway, config.clone()));
    engine.initialize().await.context("engine initialization failed")?;

    let auth_db_path = format!("{}.auth", config.database_path);
    let user_store = Arc::new(UserStore::new(&auth_db_path).context("failed to open auth store")?);
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let auth_state = AuthState::new(user_store, jwt_handler.clone());

    let auth_router = Router::new()
        .route("/api/auth/login", axum::routing::post(auth::api::login))
        .route("/api/auth/me", get(auth::api::get_current_user))
        .with_state(auth_state.clone());

    let admin_router = Router::new()
        .route("/api/admin/users", get(auth::api::list_users))
        .route("/api/admin/users", axum::routing::post(auth::api::create_user))
        .route("/api/admin/users/:id", axum::routing::delete(auth::api::delete_user))
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth_middleware))
        .with_state(auth_state);

    let engine_router = api::router(engine.clone())
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth_middleware));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/engine", engine_router)
        .merge(auth_router)
        .merge(admin_router)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_simple,
        ));

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "engine API listening");

    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_engine.shutdown().await;
        })
        .await
        .context("server error")?;

    Ok(())
}

async fn health_check() -> &'static str {
    "margin-engine operational"
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("margin_engine={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
