// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failure of a release lookup.
///
/// Cloneable so a single outcome can be handed to every caller that joined
/// the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("GitHub API returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("something wrong: {0}")]
    Internal(String),
}

impl ReleaseError {
    /// HTTP status to report for this error.
    ///
    /// An error paired with a success or redirect status is reported as 500,
    /// as is anything outside the valid status range.
    pub fn status_code(&self) -> u16 {
        match self {
            ReleaseError::Upstream { status, .. } => match *status {
                200..=399 => 500,
                s if (100..=599).contains(&s) => s,
                _ => 500,
            },
            ReleaseError::Transport(_) | ReleaseError::Internal(_) => 500,
        }
    }
}

impl From<reqwest::Error> for ReleaseError {
    fn from(err: reqwest::Error) -> Self {
        ReleaseError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ReleaseError>;
