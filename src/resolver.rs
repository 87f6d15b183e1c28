// Copyright 2025 Alejandro Martínez Corriá and the Thinkube contributors
// SPDX-License-Identifier: Apache-2.0

use crate::cache::ReleaseCache;
use crate::error::{ReleaseError, Result};
use crate::registry::ReleaseFetcher;
use crate::release::{ReleaseKey, ReleaseRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tracing::{debug, error, warn};

type Outcome = Result<Arc<ReleaseRecord>>;
type PendingFetch = Shared<BoxFuture<'static, Outcome>>;

/// Cache-aside release lookup that coalesces concurrent misses.
///
/// A miss for a key registers one pending fetch; every caller that misses on
/// the same key while it runs awaits that fetch instead of starting its own,
/// and all of them receive the same outcome. Only successful fetches are
/// cached.
pub struct ReleaseResolver {
    cache: ReleaseCache,
    fetcher: Arc<dyn ReleaseFetcher>,
    in_flight: Arc<DashMap<ReleaseKey, PendingFetch>>,
}

/// Deregisters a pending fetch when its task ends, including on panic.
struct InFlightRegistration {
    in_flight: Arc<DashMap<ReleaseKey, PendingFetch>>,
    key: ReleaseKey,
}

impl Drop for InFlightRegistration {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

impl ReleaseResolver {
    pub fn new(fetcher: Arc<dyn ReleaseFetcher>, cache: ReleaseCache) -> Self {
        Self {
            cache,
            fetcher,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn cache(&self) -> &ReleaseCache {
        &self.cache
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub async fn resolve(&self, key: &ReleaseKey) -> Result<Arc<ReleaseRecord>> {
        if let Some(record) = self.cache.get(key).await {
            debug!("Cache hit for {}", key);
            return Ok(record);
        }

        self.join_or_start(key).await
    }

    fn join_or_start(&self, key: &ReleaseKey) -> PendingFetch {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight fetch for {}", key);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                debug!("Cache miss for {}, fetching upstream", key);
                let pending = self.start_fetch(key.clone());
                entry.insert(pending.clone());
                pending
            }
        }
    }

    // Runs on its own task so the fetch completes, and the cache is filled,
    // even if every waiting caller goes away.
    fn start_fetch(&self, key: ReleaseKey) -> PendingFetch {
        let registration = InFlightRegistration {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
        };
        let cache = self.cache.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let _registration = registration;

            // A previous fetch may have landed between our cache read and
            // registration.
            if let Some(record) = cache.get(&task_key).await {
                return Ok(record);
            }

            match fetcher.fetch_latest_release(&task_key).await {
                Ok(record) => {
                    let record = Arc::new(record);
                    cache.insert(task_key, Arc::clone(&record)).await;
                    Ok(record)
                }
                Err(e) => {
                    warn!("Fetching latest release for {} failed: {}", task_key, e);
                    Err(e)
                }
            }
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Fetch for {} finished without a result or error: {}", key, e);
                    Err(ReleaseError::Internal(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ReleaseAsset;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(300);

    enum Script {
        Release(ReleaseRecord),
        Fail(ReleaseError),
        Panic,
    }

    /// Fetcher that counts calls and takes a fixed time to answer.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        script: Mutex<Script>,
        latency: Duration,
    }

    impl ScriptedFetcher {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
                latency: Duration::from_millis(100),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_script(&self, script: Script) {
            *self.script.lock().unwrap() = script;
        }
    }

    #[async_trait]
    impl ReleaseFetcher for ScriptedFetcher {
        async fn fetch_latest_release(&self, _key: &ReleaseKey) -> Result<ReleaseRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let outcome = match &*self.script.lock().unwrap() {
                Script::Release(record) => Some(Ok(record.clone())),
                Script::Fail(err) => Some(Err(err.clone())),
                Script::Panic => None,
            };
            outcome.unwrap_or_else(|| panic!("fetch task blew up"))
        }
    }

    fn hello_world() -> ReleaseRecord {
        ReleaseRecord {
            tag_name: "v1.2.3".to_string(),
            assets: vec![ReleaseAsset {
                name: "hello.tar.gz".to_string(),
                download_url:
                    "https://github.com/octocat/hello-world/releases/download/v1.2.3/hello.tar.gz"
                        .to_string(),
            }],
        }
    }

    fn not_found() -> ReleaseError {
        ReleaseError::Upstream {
            status: 404,
            message: "Not Found".to_string(),
        }
    }

    fn resolver(fetcher: &Arc<ScriptedFetcher>) -> ReleaseResolver {
        ReleaseResolver::new(fetcher.clone(), ReleaseCache::new(TTL))
    }

    #[tokio::test(start_paused = true)]
    async fn first_resolve_fetches_once_and_caches() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("octocat", "hello-world");

        let first = resolver.resolve(&key).await.unwrap();
        assert_eq!(*first, hello_world());
        assert_eq!(fetcher.calls(), 1);

        let second = resolver.resolve(&key).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(resolver.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("octocat", "hello-world");

        let results = join_all((0..32).map(|_| resolver.resolve(&key))).await;

        assert_eq!(fetcher.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(resolver.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_from_separate_tasks_share_one_fetch() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = Arc::new(resolver(&fetcher));
        let key = ReleaseKey::new("octocat", "hello-world");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let key = key.clone();
                tokio::spawn(async move { resolver.resolve(&key).await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().tag_name, "v1.2.3");
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_fetch_independently() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = resolver(&fetcher);
        let a = ReleaseKey::new("octocat", "hello-world");
        let b = ReleaseKey::new("octocat", "spoon-knife");

        let (ra, rb) = tokio::join!(resolver.resolve(&a), resolver.resolve(&b));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_fetched_again() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("octocat", "hello-world");

        resolver.resolve(&key).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        tokio::time::advance(TTL).await;
        resolver.resolve(&key).await.unwrap();
        assert_eq!(fetcher.calls(), 2);

        resolver.resolve(&key).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_shared_and_not_cached() {
        let fetcher = ScriptedFetcher::new(Script::Fail(not_found()));
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("nouser", "norepo");

        let (first, second) = tokio::join!(resolver.resolve(&key), resolver.resolve(&key));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(first.unwrap_err(), not_found());
        assert_eq!(second.unwrap_err(), not_found());

        let third = resolver.resolve(&key).await.unwrap_err();
        assert_eq!(third.status_code(), 404);
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(resolver.cache().get(&key).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_does_not_overwrite_cached_release() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("octocat", "hello-world");

        resolver.resolve(&key).await.unwrap();
        tokio::time::advance(TTL).await;

        fetcher.set_script(Script::Fail(ReleaseError::Transport("connection reset".into())));
        let err = resolver.resolve(&key).await.unwrap_err();
        assert_eq!(err.status_code(), 500);

        fetcher.set_script(Script::Release(ReleaseRecord {
            tag_name: "v1.2.4".to_string(),
            assets: Vec::new(),
        }));
        assert_eq!(resolver.resolve(&key).await.unwrap().tag_name, "v1.2.4");
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_without_result_is_internal_error() {
        let fetcher = ScriptedFetcher::new(Script::Panic);
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("octocat", "hello-world");

        let (first, second) = tokio::join!(resolver.resolve(&key), resolver.resolve(&key));
        for result in [first, second] {
            let err = result.unwrap_err();
            assert!(matches!(err, ReleaseError::Internal(_)));
            assert_eq!(err.status_code(), 500);
            assert!(err.to_string().starts_with("something wrong"));
        }
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(resolver.in_flight_count(), 0);

        // The key is not wedged by the failed task.
        fetcher.set_script(Script::Release(hello_world()));
        assert!(resolver.resolve(&key).await.is_ok());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_completes_after_caller_is_dropped() {
        let fetcher = ScriptedFetcher::new(Script::Release(hello_world()));
        let resolver = resolver(&fetcher);
        let key = ReleaseKey::new("octocat", "hello-world");

        let abandoned = tokio::time::timeout(Duration::from_millis(10), resolver.resolve(&key)).await;
        assert!(abandoned.is_err());
        assert_eq!(resolver.in_flight_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resolver.in_flight_count(), 0);
        assert!(resolver.cache().get(&key).await.is_some());

        resolver.resolve(&key).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }
}
