// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod error;
mod handlers;
mod registry;
mod release;
mod resolver;

use cache::ReleaseCache;
use registry::GitHubClient;
use resolver::ReleaseResolver;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Log level
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Cache TTL in seconds
    #[arg(long, env = "CACHE_TTL", default_value = "300")]
    cache_ttl: u64,

    /// GitHub token used to raise the API rate limit
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = registry::DEFAULT_API_URL)]
    github_api_url: String,

    /// Upstream request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "10")]
    request_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tk_release_version={},tower_http=debug", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tk-release-version server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("GitHub API: {}", args.github_api_url);
    info!("Cache TTL: {}s", args.cache_ttl);
    if args.github_token.as_deref().is_some_and(|t| !t.is_empty()) {
        info!("Using authenticated GitHub requests");
    }

    let fetcher = GitHubClient::new(
        &args.github_api_url,
        args.github_token.as_deref(),
        Duration::from_secs(args.request_timeout),
    )?;
    let cache = ReleaseCache::new(Duration::from_secs(args.cache_ttl));
    let resolver = Arc::new(ReleaseResolver::new(Arc::new(fetcher), cache));

    let app = handlers::router(resolver);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutting down gracefully...");
        })
        .await?;

    Ok(())
}
