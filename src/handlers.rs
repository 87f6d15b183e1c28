// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::ReleaseError;
use crate::release::{ReleaseAsset, ReleaseKey, ReleaseRecord};
use crate::resolver::ReleaseResolver;
use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// JSON body for `/{owner}/{repo}`.
#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub release: String,
    pub has_error: bool,
    pub error: String,
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseResponse {
    fn from_record(record: &ReleaseRecord) -> Self {
        Self {
            release: record.tag_name.clone(),
            has_error: false,
            error: String::new(),
            assets: record.assets.clone(),
        }
    }

    fn from_error(err: &ReleaseError) -> Self {
        Self {
            release: String::new(),
            has_error: true,
            error: err.to_string(),
            assets: Vec::new(),
        }
    }
}

pub fn router(resolver: Arc<ReleaseResolver>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/live", get(live_handler))
        .route("/health", get(health_handler))
        .route("/{owner}/{repo}", get(latest_release_handler))
        .with_state(resolver)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn index_handler() -> &'static str {
    "Try accessing /{owner}/{repo}"
}

async fn live_handler() -> &'static str {
    "OK"
}

async fn health_handler(State(resolver): State<Arc<ReleaseResolver>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "tk-release-version",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "cached_releases": resolver.cache().entry_count(),
        "in_flight": resolver.in_flight_count(),
    }))
}

async fn latest_release_handler(
    State(resolver): State<Arc<ReleaseResolver>>,
    Path((owner, repo)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    let plain = query.as_deref().is_some_and(|q| q.contains("plain"));
    let key = ReleaseKey::new(owner, repo);
    info!("Looking up latest release for {}", key);

    match resolver.resolve(&key).await {
        Ok(record) if plain => record.tag_name.clone().into_response(),
        Ok(record) => Json(ReleaseResponse::from_record(&record)).into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if plain {
                status.into_response()
            } else {
                (status, Json(ReleaseResponse::from_error(&e))).into_response()
            }
        }
    }
}
