mod auth;
mod cache;
mod config;
mod downloader;
mod fingerprint;
mod http;
mod job;
mod params;
mod pipeline;
mod state;
mod transform;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::downloader::Downloader;
use crate::state::AppState;
use crate::transform::ImageEngine;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    http::router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(
        source_base_url = %config.source_base_url,
        master_dir = %config.master_dir.display(),
        result_dir = %config.result_dir.display(),
        timeout_seconds = config.request_timeout.as_secs(),
        allow_list_enabled = config.allowed_prefixes.is_some(),
        "startup config summary"
    );

    let cache = CacheStore::new(&config)?;
    let downloader = Downloader::new(&config, cache.clone())?;
    let state = Arc::new(AppState::new(
        config,
        cache,
        downloader,
        Arc::new(ImageEngine),
    ));
    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "image server listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
