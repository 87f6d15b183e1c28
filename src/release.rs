// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::fmt;

/// Identifies a GitHub project by owner and repository name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReleaseKey {
    pub owner: String,
    pub repo: String,
}

impl ReleaseKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
}

/// The latest published release of a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub tag_name: String,
    pub assets: Vec<ReleaseAsset>,
}
