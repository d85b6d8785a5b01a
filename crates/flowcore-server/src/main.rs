//! Entry point, grounded on the teacher's `main.rs`: `tracing` init via
//! `EnvFilter`, `dotenvy` + `Config::from_env`, an `axum` router behind
//! `CorsLayer`/`TraceLayer`, background tasks spawned alongside the HTTP
//! server, and graceful shutdown on `ctrl_c`/`SIGTERM`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use flowcore_core::collab::{MemoryDb, TriggerCache};
use flowcore_core::exec::Collaborators;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowcore_server::collab::cache::UpstashCache;
use flowcore_server::collab::db::SqlxDb;
use flowcore_server::collab::http_client::ReqwestHttpClient;
use flowcore_server::collab::rate_limit::RateLimitResolver;
use flowcore_server::config::Config;
use flowcore_server::state::AppState;
use flowcore_server::{cron, loader, router};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowcore_server=info,flowcore_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let bind_addr = config.bind_addr();

    info!("Starting flowcore-server");
    info!(workflow_dir = %config.workflow_dir, "loading workflows");

    let load_result = match loader::load_dir(&config.workflow_dir) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to read workflow directory");
            std::process::exit(1);
        }
    };
    info!(count = load_result.workflows.len(), "workflows loaded");

    let workflows: Vec<Arc<loader::LoadedWorkflow>> =
        load_result.workflows.into_iter().map(Arc::new).collect();

    let db = build_db(&config).await;
    let http = Arc::new(ReqwestHttpClient::new());

    let (step_cache, trigger_cache) = build_cache(&config);

    let rate_limits = RateLimitResolver::new(load_result.rate_limit_pools);

    let collab = Collaborators {
        db,
        http,
        step_cache,
    };

    let state = AppState::new(config.clone(), collab, trigger_cache, rate_limits);

    let app = router::build_router(workflows.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let cron_handle = tokio::spawn(cron::start_cron_ticker(state.clone(), workflows));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));

    info!(addr = %bind_addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    info!("shutdown signal received");
    cron_handle.abort();
}

async fn build_db(config: &Config) -> Arc<dyn flowcore_core::collab::Db> {
    if config.database_url.is_empty() {
        warn!("DATABASE_URL not set - query steps will return no rows");
        return Arc::new(MemoryDb::new());
    }

    let mut databases = BTreeMap::new();
    databases.insert("default".to_string(), config.database_url.clone());
    for (key, value) in std::env::vars() {
        if let Some(name) = key.strip_prefix("FLOWCORE_DATABASE_URL_") {
            databases.insert(name.to_lowercase(), value);
        }
    }

    match SqlxDb::connect(&databases).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, "failed to connect configured databases");
            std::process::exit(1);
        }
    }
}

type CacheHandles = (
    Option<Arc<dyn flowcore_core::collab::StepCache>>,
    Option<Arc<dyn TriggerCache>>,
);

fn build_cache(config: &Config) -> CacheHandles {
    if config.cache_rest_url.is_empty() || config.cache_rest_token.is_empty() {
        warn!("cache REST endpoint not configured - step/trigger caching disabled");
        return (None, None);
    }

    let client = reqwest::Client::new();
    let cache = Arc::new(UpstashCache::new(client, config.cache_rest_url.clone(), config.cache_rest_token.clone()));
    (Some(cache.clone()), Some(cache))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
