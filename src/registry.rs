// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{ReleaseError, Result};
use crate::release::{ReleaseAsset, ReleaseKey, ReleaseRecord};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Source of release metadata.
///
/// Implementations must be callable from any number of tasks at once; each
/// call is an independent upstream request.
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    async fn fetch_latest_release(&self, key: &ReleaseKey) -> Result<ReleaseRecord>;
}

pub struct GitHubClient {
    client: Client,
    api_url: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ReleaseError::Transport(format!("Invalid GitHub token: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(
                "tk-release-version/",
                env!("CARGO_PKG_VERSION"),
                " (https://github.com/thinkube/tk-release-version)"
            ))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Deserialize)]
struct GitHubErrorBody {
    message: String,
}

#[async_trait]
impl ReleaseFetcher for GitHubClient {
    async fn fetch_latest_release(&self, key: &ReleaseKey) -> Result<ReleaseRecord> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_url, key.owner, key.repo
        );
        debug!("Fetching latest release for {}", key);

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = match response.json::<GitHubErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string(),
            };
            debug!("GitHub API returned {} for {}: {}", status, key, message);
            return Err(ReleaseError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        // A body that fails to decode keeps the response status; the error's
        // status normalization reports it as 500.
        let release: GitHubRelease =
            response.json().await.map_err(|e| ReleaseError::Upstream {
                status: status.as_u16(),
                message: format!("Failed to decode release: {}", e),
            })?;

        Ok(ReleaseRecord {
            tag_name: release.tag_name,
            assets: release
                .assets
                .into_iter()
                .map(|a| ReleaseAsset {
                    name: a.name,
                    download_url: a.browser_download_url,
                })
                .collect(),
        })
    }
}
