use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{
    context::{deep_merge, Attributes, FetchParams, FlagsContext},
    events::{CheckEvent, CheckEventBody},
    fetcher::{FlagsTransport, HttpTransport, HttpTransportConfig, EVENTS_ENDPOINT},
    flag_cache::FlagCache,
    flags::{FlagConfig, FlagMap, FlagRecord, FlagsView},
    overrides::{self, OverrideStore},
    rate_limiter::RateLimiter,
    resolver::{FlagResolver, ResolutionState},
    subscribers::{Subscribers, Subscription},
    ClientConfig, Error,
};

/// A feature flags client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// The client holds flags for one context at a time. Call [`Client::initialize`] once to load
/// flags for the configured context, and [`Client::set_context`] (or one of the `update_*`
/// methods) whenever the context changes. Reads are synchronous and never fail: before flags are
/// loaded, every flag reads as disabled.
///
/// Flag loading never returns an error. When the flags service is unreachable, the client serves
/// cached flags or, if nothing is cached, the configured fallback flags.
///
/// Cloning is cheap; clones share state.
///
/// # Examples
/// ```no_run
/// # async fn run() {
/// # use flagwise::{ClientConfig, FlagsContext};
/// let client = ClientConfig::from_publishable_key("pk_test")
///     .context(FlagsContext::new().with_user("id", "user-1"))
///     .to_client();
/// client.initialize().await;
///
/// if client.is_enabled("huddles") {
///     // ...
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    publishable_key: String,
    resolver: FlagResolver,
    overrides: OverrideStore,
    subscribers: Subscribers,
    check_events: RateLimiter,
    /// Upper bound for posting a check event.
    event_timeout: Duration,
    state: RwLock<ClientState>,
}

struct ClientState {
    context: FlagsContext,
    params: FetchParams,
    cache_key: String,
    fetched: Arc<FlagMap>,
    /// Bumped every time flags are applied.
    revision: u64,
}

impl ClientState {
    fn new(publishable_key: &str, context: FlagsContext) -> ClientState {
        let params = FetchParams::new(publishable_key, &context);
        ClientState {
            cache_key: params.cache_key(),
            params,
            context,
            fetched: Arc::default(),
            revision: 0,
        }
    }
}

impl Client {
    /// Create a new `Client` talking to the flags service over HTTP.
    ///
    /// # Panics
    ///
    /// Panics if the configured stale time exceeds the expire time.
    ///
    /// ```
    /// # use flagwise::{ClientConfig, Client};
    /// let client = Client::new(ClientConfig::from_publishable_key("pk_test"));
    /// ```
    pub fn new(config: ClientConfig) -> Client {
        let transport = HttpTransport::new(HttpTransportConfig {
            base_url: config.base_url.clone(),
            publishable_key: config.publishable_key.clone(),
            sdk_name: "rust".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
        });
        Client::with_transport(config, transport)
    }

    /// Create a new `Client` using a custom transport.
    ///
    /// # Panics
    ///
    /// Panics if the configured stale time exceeds the expire time.
    pub fn with_transport(config: ClientConfig, transport: impl FlagsTransport + 'static) -> Client {
        let cache = FlagCache::new(
            config.cache_storage.clone(),
            config.clock.clone(),
            config.stale_time,
            config.expire_time,
        );
        let resolver = FlagResolver::new(cache, Arc::new(transport), config.resolver_config());

        Client {
            inner: Arc::new(ClientInner {
                state: RwLock::new(ClientState::new(&config.publishable_key, config.context)),
                publishable_key: config.publishable_key,
                resolver,
                overrides: OverrideStore::new(config.override_storage),
                subscribers: Subscribers::new(),
                check_events: RateLimiter::new(config.check_event_window, config.clock),
                event_timeout: config.timeout,
            }),
        }
    }

    /// Load flags for the current context and notify subscribers.
    ///
    /// With stale-while-revalidate enabled, this may return stale flags immediately; subscribers
    /// are notified once more when the refreshed flags arrive.
    ///
    /// Must be called within a tokio runtime.
    pub async fn initialize(&self) -> ResolutionState {
        self.inner.refresh().await
    }

    /// Replace the context and load flags for it.
    pub async fn set_context(&self, context: FlagsContext) -> ResolutionState {
        self.inner.replace_context(context);
        self.inner.refresh().await
    }

    /// Merge `attributes` into the user context and load flags for the result.
    pub async fn update_user(&self, attributes: Attributes) -> ResolutionState {
        let mut context = self.context();
        deep_merge(&mut context.user, attributes);
        self.set_context(context).await
    }

    /// Merge `attributes` into the company context and load flags for the result.
    pub async fn update_company(&self, attributes: Attributes) -> ResolutionState {
        let mut context = self.context();
        deep_merge(&mut context.company, attributes);
        self.set_context(context).await
    }

    /// Merge `attributes` into the "other" context and load flags for the result.
    pub async fn update_other_context(&self, attributes: Attributes) -> ResolutionState {
        let mut context = self.context();
        deep_merge(&mut context.other, attributes);
        self.set_context(context).await
    }

    /// Current context.
    pub fn context(&self) -> FlagsContext {
        self.inner.read_state().context.clone()
    }

    /// Flags for the current context with local overrides applied.
    pub fn get_flags(&self) -> FlagsView {
        let fetched = self.get_fetched_flags();
        overrides::merge(&fetched, &self.inner.overrides.snapshot())
    }

    /// Flags for the current context as fetched, ignoring local overrides.
    pub fn get_fetched_flags(&self) -> Arc<FlagMap> {
        Arc::clone(&self.inner.read_state().fetched)
    }

    /// Register a callback invoked whenever the flags returned by [`Client::get_flags`] change.
    ///
    /// The callback runs synchronously on the task that caused the change and must not block.
    pub fn on_updated(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.subscribers.subscribe(callback)
    }

    /// Override the enabled state of a flag locally. `None` removes the override.
    ///
    /// Overrides only affect flags that were fetched; overriding an unknown key does not add it.
    /// Subscribers are notified on every call, even when the override is unchanged.
    pub fn set_flag_override(&self, key: &str, value: Option<bool>) {
        self.inner.overrides.set(key, value);
        self.inner.subscribers.notify();
    }

    pub fn get_flag_override(&self, key: &str) -> Option<bool> {
        self.inner.overrides.get(key)
    }

    /// Whether `key` is enabled, overrides included. Unknown flags are disabled.
    ///
    /// Reports a check event in the background when called within a tokio runtime.
    pub fn is_enabled(&self, key: &str) -> bool {
        let flags = self.get_flags();
        let value = flags.is_enabled(key);
        let event = match flags.get(key) {
            Some(flag) => CheckEvent::flag_check(flag, value),
            None => CheckEvent::flag_check(&FlagRecord::new(key, value), value),
        };
        self.inner.spawn_check_event(event);
        value
    }

    /// Config attached to `key`, if any.
    ///
    /// Reports a check event in the background when called within a tokio runtime.
    pub fn get_config(&self, key: &str) -> Option<FlagConfig> {
        let config = self.get_flags().get(key)?.config.clone()?;
        self.inner
            .spawn_check_event(CheckEvent::config_check(key, &config));
        Some(config)
    }

    /// Send a check event for the current context.
    ///
    /// Identical events are sent at most once per check event window. Posting is bounded by the
    /// configured timeout. Returns whether the event was sent; failures are logged and otherwise
    /// ignored.
    pub async fn send_check_event(&self, event: CheckEvent) -> bool {
        self.inner.send_check_event(event).await
    }
}

impl ClientInner {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ClientState> {
        self.state
            .read()
            .expect("thread holding client state lock should not panic")
    }

    fn replace_context(&self, context: FlagsContext) {
        let state = {
            let current = self.read_state();
            ClientState {
                fetched: current.fetched.clone(),
                revision: current.revision,
                ..ClientState::new(&self.publishable_key, context)
            }
        };
        *self
            .state
            .write()
            .expect("thread holding client state lock should not panic") = state;
    }

    async fn refresh(self: &Arc<Self>) -> ResolutionState {
        let (params, cache_key, revision) = {
            let state = self.read_state();
            (state.params.clone(), state.cache_key.clone(), state.revision)
        };

        // Refreshed flags are applied on the refresh task itself, right after the cache write.
        let inner = Arc::clone(self);
        let refresh_key = cache_key.clone();
        let resolution = self
            .resolver
            .resolve_then(&params, move |flags| {
                inner.apply(&refresh_key, flags, None);
            })
            .await;
        // A refresh that landed in the meantime is newer than these flags.
        self.apply(&cache_key, resolution.flags, Some(revision));

        resolution.state
    }

    /// Make `flags` current if they were resolved for the current context and, when
    /// `expected_revision` is given, nothing else was applied since. Returns whether they were
    /// applied.
    fn apply(&self, cache_key: &str, flags: Arc<FlagMap>, expected_revision: Option<u64>) -> bool {
        {
            let mut state = self
                .state
                .write()
                .expect("thread holding client state lock should not panic");
            if state.cache_key != cache_key {
                log::debug!(target: "flagwise", cache_key = cache_key; "context changed, discarding resolved flags");
                return false;
            }
            if expected_revision.is_some_and(|revision| revision != state.revision) {
                log::debug!(target: "flagwise", cache_key = cache_key; "newer flags already applied, discarding resolved flags");
                return false;
            }
            state.fetched = flags;
            state.revision += 1;
        }
        self.subscribers.notify();
        true
    }

    fn spawn_check_event(self: &Arc<Self>, event: CheckEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::debug!(target: "flagwise", flag_key = event.key; "no tokio runtime, not sending check event");
            return;
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            inner.send_check_event(event).await;
        });
    }

    async fn send_check_event(&self, event: CheckEvent) -> bool {
        let (cache_key, body) = {
            let state = self.read_state();
            let body = serde_json::to_value(CheckEventBody {
                event: &event,
                eval_context: &state.context,
            });
            (state.cache_key.clone(), body)
        };

        if !self.check_events.check(&event.rate_limit_key(&cache_key)) {
            log::trace!(target: "flagwise", flag_key = event.key; "check event rate limited");
            return false;
        }

        let body = match body {
            Ok(body) => body,
            Err(err) => {
                log::warn!(target: "flagwise", flag_key = event.key; "failed to serialize check event: {:?}", err);
                return false;
            }
        };

        let post = self.resolver.transport().post_event(EVENTS_ENDPOINT, body);
        let result = match tokio::time::timeout(self.event_timeout, post).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout(self.event_timeout)),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                log::warn!(target: "flagwise", flag_key = event.key; "failed to send check event: {:?}", err);
                false
            }
        }
    }
}
