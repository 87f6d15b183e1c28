// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use crate::release::{ReleaseKey, ReleaseRecord};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug)]
struct CachedRelease {
    record: Arc<ReleaseRecord>,
    cached_at: Instant,
}

/// Release cache with a fixed read TTL.
///
/// Freshness is decided from the stored timestamp on every read. The
/// underlying store expires entries after twice the TTL purely to reclaim
/// memory, so whether an entry has been physically purged is never visible.
#[derive(Clone)]
pub struct ReleaseCache {
    cache: Cache<ReleaseKey, CachedRelease>,
    ttl: Duration,
}

impl ReleaseCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl.saturating_mul(2))
            .build();

        Self { cache, ttl }
    }

    pub async fn get(&self, key: &ReleaseKey) -> Option<Arc<ReleaseRecord>> {
        let entry = self.cache.get(key).await?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.record)
        } else {
            None
        }
    }

    pub async fn insert(&self, key: ReleaseKey, record: Arc<ReleaseRecord>) {
        let entry = CachedRelease {
            record,
            cached_at: Instant::now(),
        };
        self.cache.insert(key, entry).await;
    }

    /// Approximate number of stored entries, fresh or not.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
