use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::gemini::GeminiClient;
use crate::telemetry::init_telemetry;

mod config;
mod error;
mod extractors;
mod gemini;
mod relay;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "PassportRelay.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) gemini: Arc<GeminiClient>,
    pub(crate) api_key: Option<Arc<str>>,
}

pub(crate) fn router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route(
            "/api/generate",
            post(relay::generate).fallback(relay::method_not_allowed),
        )
        .route("/health", get(relay::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                eprintln!(
                    "Failed to read configuration file {} with error: {}",
                    args.config_file, err
                );
                std::process::exit(1);
            }
        }
    };

    let _telemetry = init_telemetry(config.otlp_endpoint())?;

    let api_key: Option<Arc<str>> = config.api_key().map(Arc::from);
    if api_key.is_none() {
        warn!("No Gemini API key configured, generation requests will be refused");
    }
    let state = AppState {
        gemini: Arc::new(GeminiClient::new(&config.api_base_url, &config.model)?),
        api_key,
    };

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!(
        "Listening on {} using model {}",
        listener.local_addr()?,
        config.model
    );

    axum::serve(listener, router(state, config.body_limit))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for terminate signal: {}", e);
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}
