//! Flag resolution: decides, for a cache key, whether to serve cached flags, fetch new ones, or
//! fall back.
//!
//! Resolution never fails. Whatever happens on the network, [`FlagResolver::resolve`] returns a
//! usable flag map: fresh flags, the last cached flags, or the configured fallback flags.
//!
//! # Stale-while-revalidate
//!
//! With [`ResolverConfig::stale_while_revalidate`] enabled, a stale successful cache entry is
//! served immediately and refreshed by a background task spawned on the current tokio runtime.
//! The returned [`Resolution`] carries a [`Revalidation`] handle that resolves once the refresh
//! has been written to the cache. Awaiting it is optional.
//!
//! # Failure caching
//!
//! [`FailureCaching`] selects how failed fetches are remembered. When enabled, a failure is written
//! to the cache along with the number of consecutive failed attempts; once the attempt ceiling is
//! reached, the resolver stops fetching and serves the recorded failure until the entry goes
//! stale.
use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    context::FetchParams,
    fetcher::FlagsTransport,
    flag_cache::{CacheResult, CacheValue, FlagCache},
    flags::{fallback_flag_map, FallbackFlag, FlagMap},
    Error, Result,
};

/// How failed fetches are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureCaching {
    /// Failures are never cached; every miss or stale read retries the fetch.
    #[default]
    Disabled,
    /// Failures are cached with a consecutive-attempt counter. `max_attempts: None` retries
    /// without limit.
    Enabled { max_attempts: Option<u32> },
}

impl FailureCaching {
    fn is_enabled(&self) -> bool {
        matches!(self, FailureCaching::Enabled { .. })
    }

    /// Whether a recorded failure with `attempt_count` failed attempts should be retried now.
    fn allows_retry(&self, attempt_count: u32) -> bool {
        match self {
            FailureCaching::Disabled | FailureCaching::Enabled { max_attempts: None } => true,
            FailureCaching::Enabled {
                max_attempts: Some(max),
            } => attempt_count < *max,
        }
    }
}

/// Configuration for [`FlagResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Serve stale successful entries immediately and refresh them in the background.
    pub stale_while_revalidate: bool,
    /// Upper bound for every flags fetch. A timeout counts as a failed fetch.
    pub timeout: Duration,
    /// Flags served when fetching fails and nothing usable is cached.
    pub fallback_flags: Vec<FallbackFlag>,
    pub failure_caching: FailureCaching,
}

impl ResolverConfig {
    /// Default value for [`ResolverConfig::timeout`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for ResolverConfig {
    fn default() -> ResolverConfig {
        ResolverConfig {
            stale_while_revalidate: false,
            timeout: ResolverConfig::DEFAULT_TIMEOUT,
            fallback_flags: Vec::new(),
            failure_caching: FailureCaching::default(),
        }
    }
}

/// How a resolution was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// Served from a fresh cache entry, no network call.
    FreshHit,
    /// Served a stale entry; a background refresh was started.
    StaleHitRevalidating,
    /// A cached entry existed but could not be served as is; fetched synchronously.
    StaleHitBlocking,
    /// Nothing was cached; fetched synchronously.
    MissFetching,
    /// Fetch failed; served the flags of the cached entry.
    FailureStaleServe,
    /// Fetch failed with nothing usable cached; served fallback flags.
    FailureFallback,
    /// A cached failure hit the retry ceiling; served it without fetching.
    RetryLimited,
}

impl ResolutionState {
    /// Whether the flags served are the result of a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ResolutionState::FailureStaleServe
                | ResolutionState::FailureFallback
                | ResolutionState::RetryLimited
        )
    }
}

/// Outcome of [`FlagResolver::resolve`].
#[derive(Debug)]
pub struct Resolution {
    pub flags: Arc<FlagMap>,
    pub state: ResolutionState,
    /// Background refresh started by a stale-while-revalidate hit.
    pub revalidation: Option<Revalidation>,
}

impl Resolution {
    fn ready(flags: FlagMap, state: ResolutionState) -> Resolution {
        Resolution {
            flags: Arc::new(flags),
            state,
            revalidation: None,
        }
    }
}

/// Handle to a background refresh.
///
/// Dropping the handle does not cancel the refresh.
#[derive(Debug)]
pub struct Revalidation {
    handle: JoinHandle<Option<Arc<FlagMap>>>,
}

impl Revalidation {
    /// Wait for the refresh to finish. Returns the new flags, or `None` if the refresh failed.
    /// The new flags have been written to the cache by the time this returns.
    pub async fn finished(self) -> Option<Arc<FlagMap>> {
        self.handle.await.ok().flatten()
    }
}

/// Resolves flags for a cache key using a [`FlagCache`] and a [`FlagsTransport`].
///
/// Cloning is cheap; clones share the cache and the transport.
#[derive(Clone)]
pub struct FlagResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    cache: FlagCache,
    transport: Arc<dyn FlagsTransport>,
    config: ResolverConfig,
}

impl FlagResolver {
    pub fn new(
        cache: FlagCache,
        transport: Arc<dyn FlagsTransport>,
        config: ResolverConfig,
    ) -> FlagResolver {
        FlagResolver {
            inner: Arc::new(ResolverInner {
                cache,
                transport,
                config,
            }),
        }
    }

    pub fn cache(&self) -> &FlagCache {
        &self.inner.cache
    }

    pub fn transport(&self) -> &Arc<dyn FlagsTransport> {
        &self.inner.transport
    }

    /// Resolve flags for `params`.
    ///
    /// Must be called within a tokio runtime with time enabled: fetches are bounded by
    /// [`ResolverConfig::timeout`] and background refreshes are spawned on the runtime.
    pub async fn resolve(&self, params: &FetchParams) -> Resolution {
        self.resolve_then(params, |_| {}).await
    }

    /// Like [`FlagResolver::resolve`], but calls `on_refresh` with the new flags when a background
    /// refresh succeeds. `on_refresh` runs on the refresh task, right after the cache write and
    /// before [`Revalidation::finished`] resolves.
    pub async fn resolve_then<F>(&self, params: &FetchParams, on_refresh: F) -> Resolution
    where
        F: FnOnce(Arc<FlagMap>) + Send + 'static,
    {
        let key = params.cache_key();
        let cached = self.inner.cache.get(&key);
        let config = &self.inner.config;

        if let Some(entry) = &cached {
            let retry_failure =
                !entry.success && config.failure_caching.allows_retry(entry.attempt_count);

            if !retry_failure {
                if !entry.stale {
                    let state = if entry.success {
                        ResolutionState::FreshHit
                    } else {
                        ResolutionState::RetryLimited
                    };
                    log::trace!(target: "flagwise", cache_key:display = key, state:debug = state; "serving cached flags");
                    return Resolution::ready(self.inner.flags_or_fallback(entry), state);
                }

                if config.stale_while_revalidate && entry.success {
                    log::trace!(target: "flagwise", cache_key:display = key; "serving stale flags, revalidating");
                    let mut resolution = Resolution::ready(
                        self.inner.flags_or_fallback(entry),
                        ResolutionState::StaleHitRevalidating,
                    );
                    resolution.revalidation =
                        Some(self.revalidate(key, params.clone(), on_refresh));
                    return resolution;
                }
            }
        }

        self.inner.fetch_and_store(&key, params, cached).await
    }

    fn revalidate<F>(&self, key: String, params: FetchParams, on_refresh: F) -> Revalidation
    where
        F: FnOnce(Arc<FlagMap>) + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            match inner.fetch(&params).await {
                Ok(flags) => {
                    inner.cache.set(&key, CacheValue::success(flags.clone()));
                    log::debug!(target: "flagwise", cache_key:display = key; "revalidated stale flags");
                    let flags = Arc::new(flags);
                    on_refresh(Arc::clone(&flags));
                    Some(flags)
                }
                Err(err) => {
                    // The stale flags have already been served; nothing else to do.
                    log::warn!(target: "flagwise", cache_key:display = key; "background flags refresh failed: {:?}", err);
                    None
                }
            }
        });
        Revalidation { handle }
    }
}

impl ResolverInner {
    async fn fetch(&self, params: &FetchParams) -> Result<FlagMap> {
        match tokio::time::timeout(self.config.timeout, self.transport.fetch_flags(params)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout(self.config.timeout)),
        }
    }

    async fn fetch_and_store(
        &self,
        key: &str,
        params: &FetchParams,
        cached: Option<CacheResult>,
    ) -> Resolution {
        match self.fetch(params).await {
            Ok(flags) => {
                // Write before returning, so the next resolution sees these flags.
                self.cache.set(key, CacheValue::success(flags.clone()));
                let state = if cached.is_some() {
                    ResolutionState::StaleHitBlocking
                } else {
                    ResolutionState::MissFetching
                };
                log::trace!(target: "flagwise", cache_key = key, state:debug = state; "fetched flags");
                Resolution::ready(flags, state)
            }
            Err(err) => {
                log::error!(target: "flagwise", cache_key = key; "fetching flags failed: {:?}", err);

                let previous_flags = cached.as_ref().and_then(|entry| entry.flags.clone());
                let (flags, state) = match previous_flags {
                    Some(flags) => (flags, ResolutionState::FailureStaleServe),
                    None => (
                        fallback_flag_map(&self.config.fallback_flags),
                        ResolutionState::FailureFallback,
                    ),
                };

                if self.config.failure_caching.is_enabled() {
                    let previous_attempts = cached
                        .as_ref()
                        .filter(|entry| !entry.success)
                        .map_or(0, |entry| entry.attempt_count);
                    self.cache.set(
                        key,
                        CacheValue::failure(Some(flags.clone()), previous_attempts.saturating_add(1)),
                    );
                }

                Resolution::ready(flags, state)
            }
        }
    }

    fn flags_or_fallback(&self, entry: &CacheResult) -> FlagMap {
        entry
            .flags
            .clone()
            .unwrap_or_else(|| fallback_flag_map(&self.config.fallback_flags))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        clock::ManualClock,
        storage::{MemoryStorage, Storage},
        test_utils::{flag_map, MockTransport},
    };

    struct Harness {
        resolver: FlagResolver,
        transport: MockTransport,
        clock: Arc<ManualClock>,
        storage: MemoryStorage,
    }

    fn harness(config: ResolverConfig) -> Harness {
        let storage = MemoryStorage::new();
        let clock = Arc::new(ManualClock::from_millis(0));
        let transport = MockTransport::new();
        let cache = FlagCache::new(
            Arc::new(storage.clone()),
            clock.clone(),
            Duration::from_millis(1000),
            Duration::from_millis(60_000),
        );
        Harness {
            resolver: FlagResolver::new(cache, Arc::new(transport.clone()), config),
            transport,
            clock,
            storage,
        }
    }

    fn params() -> FetchParams {
        FetchParams::from_pairs([("publishableKey", "pk"), ("user.id", "1")])
    }

    #[tokio::test]
    async fn miss_fetches_and_caches() {
        let h = harness(ResolverConfig::default());
        h.transport.respond_with(flag_map(&[("a", true)]));

        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::MissFetching);
        assert_eq!(*resolution.flags, flag_map(&[("a", true)]));
        assert_eq!(h.transport.fetch_count(), 1);
        assert!(h.storage.get().unwrap().contains("user.id=1"));
    }

    #[tokio::test]
    async fn fresh_hit_does_not_fetch() {
        let h = harness(ResolverConfig::default());
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(500);
        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::FreshHit);
        assert_eq!(*resolution.flags, flag_map(&[("a", true)]));
        assert_eq!(h.transport.fetch_count(), 1);
    }

    #[tokio::test]
    async fn stale_without_revalidation_fetches_synchronously() {
        let h = harness(ResolverConfig::default());
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.respond_with(flag_map(&[("a", false)]));
        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::StaleHitBlocking);
        assert_eq!(*resolution.flags, flag_map(&[("a", false)]));
        assert!(resolution.revalidation.is_none());
        assert_eq!(h.transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_old_value_then_new() {
        let h = harness(ResolverConfig {
            stale_while_revalidate: true,
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.respond_with(flag_map(&[("a", false)]));
        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::StaleHitRevalidating);
        assert_eq!(*resolution.flags, flag_map(&[("a", true)]));

        let refreshed = resolution.revalidation.unwrap().finished().await;
        assert_eq!(refreshed.as_deref(), Some(&flag_map(&[("a", false)])));
        assert_eq!(h.transport.fetch_count(), 2);

        let resolution = h.resolver.resolve(&params()).await;
        assert_eq!(resolution.state, ResolutionState::FreshHit);
        assert_eq!(*resolution.flags, flag_map(&[("a", false)]));
        assert_eq!(h.transport.fetch_count(), 2);
    }

    #[tokio::test]
    async fn refresh_callback_runs_after_cache_write() {
        let h = harness(ResolverConfig {
            stale_while_revalidate: true,
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.respond_with(flag_map(&[("a", false)]));
        let seen = Arc::new(std::sync::Mutex::new(None));
        let resolution = {
            let seen = seen.clone();
            let cache = h.resolver.clone();
            h.resolver
                .resolve_then(&params(), move |flags| {
                    let cached = cache.cache().get(&params().cache_key()).unwrap().flags;
                    *seen.lock().unwrap() = Some((flags, cached));
                })
                .await
        };
        assert!(seen.lock().unwrap().is_none());

        resolution.revalidation.unwrap().finished().await;

        let (flags, cached) = seen.lock().unwrap().take().unwrap();
        assert_eq!(*flags, flag_map(&[("a", false)]));
        assert_eq!(cached, Some(flag_map(&[("a", false)])));
    }

    #[tokio::test]
    async fn refresh_callback_skipped_when_refresh_fails() {
        let h = harness(ResolverConfig {
            stale_while_revalidate: true,
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.fail();
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let resolution = h
            .resolver
            .resolve_then(&params(), move |_| {
                flag.store(true, std::sync::atomic::Ordering::SeqCst)
            })
            .await;
        resolution.revalidation.unwrap().finished().await;

        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_revalidation_keeps_stale_entry() {
        let h = harness(ResolverConfig {
            stale_while_revalidate: true,
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.fail();
        let resolution = h.resolver.resolve(&params()).await;
        assert_eq!(resolution.revalidation.unwrap().finished().await, None);

        let resolution = h.resolver.resolve(&params()).await;
        assert_eq!(resolution.state, ResolutionState::StaleHitRevalidating);
        assert_eq!(*resolution.flags, flag_map(&[("a", true)]));
    }

    #[tokio::test]
    async fn total_failure_serves_fallback_flags() {
        let h = harness(ResolverConfig {
            fallback_flags: vec!["flagX".into()],
            ..ResolverConfig::default()
        });
        h.transport.fail();

        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::FailureFallback);
        assert_eq!(*resolution.flags, flag_map(&[("flagX", true)]));
        // Failure caching is disabled by default.
        assert_eq!(h.storage.get(), None);
    }

    #[tokio::test]
    async fn failure_serves_last_good_flags() {
        let h = harness(ResolverConfig {
            fallback_flags: vec!["flagX".into()],
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true), ("b", false)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.fail();
        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::FailureStaleServe);
        assert_eq!(*resolution.flags, flag_map(&[("a", true), ("b", false)]));
    }

    #[tokio::test]
    async fn retry_ceiling_stops_fetching() {
        let h = harness(ResolverConfig {
            fallback_flags: vec!["flagX".into()],
            failure_caching: FailureCaching::Enabled {
                max_attempts: Some(3),
            },
            ..ResolverConfig::default()
        });
        h.transport.fail();

        for attempt in 1..=3 {
            let resolution = h.resolver.resolve(&params()).await;
            assert!(resolution.state.is_failure());
            assert_eq!(h.transport.fetch_count(), attempt);
            assert_eq!(
                h.resolver.cache().get(&params().cache_key()).unwrap().attempt_count,
                attempt as u32
            );
        }

        let resolution = h.resolver.resolve(&params()).await;
        assert_eq!(resolution.state, ResolutionState::RetryLimited);
        assert_eq!(*resolution.flags, flag_map(&[("flagX", true)]));
        assert_eq!(h.transport.fetch_count(), 3);

        // Once the failure record goes stale, fetching resumes.
        h.clock.set_millis(1500);
        h.transport.respond_with(flag_map(&[("a", true)]));
        let resolution = h.resolver.resolve(&params()).await;
        assert_eq!(resolution.state, ResolutionState::StaleHitBlocking);
        assert_eq!(*resolution.flags, flag_map(&[("a", true)]));
        assert_eq!(h.transport.fetch_count(), 4);
        let entry = h.resolver.cache().get(&params().cache_key()).unwrap();
        assert!(entry.success);
        assert_eq!(entry.attempt_count, 0);
    }

    #[tokio::test]
    async fn unlimited_retries_always_fetch() {
        let h = harness(ResolverConfig {
            failure_caching: FailureCaching::Enabled { max_attempts: None },
            ..ResolverConfig::default()
        });
        h.transport.fail();

        for _ in 0..5 {
            h.resolver.resolve(&params()).await;
        }

        assert_eq!(h.transport.fetch_count(), 5);
        assert_eq!(
            h.resolver.cache().get(&params().cache_key()).unwrap().attempt_count,
            5
        );
    }

    #[tokio::test]
    async fn failure_after_success_restarts_attempt_count() {
        let h = harness(ResolverConfig {
            failure_caching: FailureCaching::Enabled {
                max_attempts: Some(3),
            },
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.fail();
        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::FailureStaleServe);
        let entry = h.resolver.cache().get(&params().cache_key()).unwrap();
        assert!(!entry.success);
        assert_eq!(entry.attempt_count, 1);
        assert_eq!(entry.flags, Some(flag_map(&[("a", true)])));
    }

    #[tokio::test]
    async fn failure_records_are_not_revalidated_in_background() {
        let h = harness(ResolverConfig {
            stale_while_revalidate: true,
            failure_caching: FailureCaching::Enabled {
                max_attempts: Some(1),
            },
            ..ResolverConfig::default()
        });
        h.transport.fail();
        h.resolver.resolve(&params()).await;

        h.clock.set_millis(1500);
        h.transport.respond_with(flag_map(&[("a", true)]));
        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::StaleHitBlocking);
        assert!(resolution.revalidation.is_none());
        assert_eq!(*resolution.flags, flag_map(&[("a", true)]));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let h = harness(ResolverConfig {
            timeout: Duration::from_millis(100),
            fallback_flags: vec!["flagX".into()],
            ..ResolverConfig::default()
        });
        h.transport.respond_with(flag_map(&[("a", true)]));
        h.transport.delay(Duration::from_secs(5));

        let resolution = h.resolver.resolve(&params()).await;

        assert_eq!(resolution.state, ResolutionState::FailureFallback);
        assert_eq!(*resolution.flags, flag_map(&[("flagX", true)]));
    }
}
