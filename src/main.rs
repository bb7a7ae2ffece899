use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod amp_routing;
mod api;
mod balancer;
mod config;
mod error;
mod handler;
mod metrics;
mod rate_limit;
mod resolver;
mod state;
mod translate;
mod upstream;

pub use config::RuntimeConfig;
pub use error::AppError;
pub use handler::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_router=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("LLM_ROUTER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./config.json"));

    let config = match RuntimeConfig::from_env().context("loading config from LLM_ROUTER_CONFIG_JSON")? {
        Some(cfg) => cfg,
        None => RuntimeConfig::load(&config_path).with_context(|| format!("loading config from {}", config_path.display()))?,
    };

    info!(providers = config.providers.len(), "llm-router starting");

    let store = build_state_store().await?;
    let state = Arc::new(AppState::new(config, store));

    tokio::spawn(config_watcher(Arc::clone(&state), config_path.clone()));

    let port: u16 = std::env::var("LLM_ROUTER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    let cors = tower_http::cors::CorsLayer::permissive();
    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(Arc::clone(&state)).layer(trace_layer).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn build_state_store() -> anyhow::Result<state::StateStore> {
    match std::env::var("LLM_ROUTER_STATE_BACKEND").as_deref() {
        Ok("file") => {
            let path = std::env::var("LLM_ROUTER_STATE_FILE_PATH").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./state.json"));
            Ok(state::StateStore::File(state::file::FileStore::open(path).await?))
        }
        _ => Ok(state::StateStore::Memory(state::memory::MemoryStore::new())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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

/// `llm-router --healthcheck`: GET /health and exit 0 on 200, 1 otherwise.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LLM_ROUTER_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);
    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;
    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Polls the config file every 5 seconds and hot-reloads on mtime change,
/// same posture as the teacher's `config_watcher`: parse failures are logged
/// and the running config is kept unchanged. Only runs when the config
/// wasn't supplied via `LLM_ROUTER_CONFIG_JSON` (nothing to poll in that case).
async fn config_watcher(state: Arc<AppState>, path: PathBuf) {
    if std::env::var("LLM_ROUTER_CONFIG_JSON").is_ok() {
        return;
    }

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match RuntimeConfig::load(&path) {
            Ok(new_cfg) => {
                state.replace_config(new_cfg);
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed, keeping previous config");
            }
        }
    }
}
