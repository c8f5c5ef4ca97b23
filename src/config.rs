use std::{path::Path, sync::Arc, time::Duration};

use crate::{
    clock::{Clock, SystemClock},
    context::FlagsContext,
    fetcher::DEFAULT_BASE_URL,
    flags::FallbackFlag,
    resolver::{FailureCaching, ResolverConfig},
    storage::{FileStorage, MemoryStorage, Storage},
    Client,
};

/// Configuration for [`Client`].
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagwise::{ClientConfig, FlagsContext};
/// let client = ClientConfig::from_publishable_key("pk_test")
///     .stale_while_revalidate(true)
///     .stale_time(Duration::from_secs(60))
///     .fallback_flag("new-checkout")
///     .context(FlagsContext::new().with_user("id", "user-1"))
///     .to_client();
/// ```
pub struct ClientConfig {
    pub(crate) publishable_key: String,
    pub(crate) base_url: String,
    pub(crate) timeout: Duration,
    pub(crate) stale_time: Duration,
    pub(crate) expire_time: Duration,
    pub(crate) stale_while_revalidate: bool,
    pub(crate) fallback_flags: Vec<FallbackFlag>,
    pub(crate) failure_caching: FailureCaching,
    pub(crate) cache_storage: Arc<dyn Storage>,
    pub(crate) override_storage: Arc<dyn Storage>,
    pub(crate) check_event_window: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) context: FlagsContext,
}

impl ClientConfig {
    /// Default timeout for flag fetches.
    pub const DEFAULT_TIMEOUT: Duration = ResolverConfig::DEFAULT_TIMEOUT;
    /// Default time after which cached flags are considered stale.
    pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(60 * 60);
    /// Default time after which cached flags are discarded.
    pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);
    /// Default window in which identical check events are sent only once.
    pub const DEFAULT_CHECK_EVENT_WINDOW: Duration = Duration::from_secs(60);
    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = DEFAULT_BASE_URL;

    /// File name of the flag cache inside [`storage_dir`](ClientConfig::storage_dir).
    pub const CACHE_FILE_NAME: &'static str = "flags-cache.json";
    /// File name of the flag overrides inside [`storage_dir`](ClientConfig::storage_dir).
    pub const OVERRIDES_FILE_NAME: &'static str = "flag-overrides.json";

    /// Create a default configuration using the specified publishable key.
    ///
    /// Flags are cached in memory only; see [`storage_dir`](ClientConfig::storage_dir) to persist
    /// them across restarts.
    ///
    /// ```
    /// # use flagwise::ClientConfig;
    /// ClientConfig::from_publishable_key("pk_test");
    /// ```
    pub fn from_publishable_key(publishable_key: impl Into<String>) -> Self {
        ClientConfig {
            publishable_key: publishable_key.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            timeout: ClientConfig::DEFAULT_TIMEOUT,
            stale_time: ClientConfig::DEFAULT_STALE_TIME,
            expire_time: ClientConfig::DEFAULT_EXPIRE_TIME,
            stale_while_revalidate: false,
            fallback_flags: Vec::new(),
            failure_caching: FailureCaching::default(),
            cache_storage: Arc::new(MemoryStorage::new()),
            override_storage: Arc::new(MemoryStorage::new()),
            check_event_window: ClientConfig::DEFAULT_CHECK_EVENT_WINDOW,
            clock: Arc::new(SystemClock),
            context: FlagsContext::default(),
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Upper bound for a single flags fetch.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Time after which cached flags are refetched. Must not exceed
    /// [`expire_time`](ClientConfig::expire_time).
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Time after which cached flags are no longer served.
    pub fn expire_time(mut self, expire_time: Duration) -> Self {
        self.expire_time = expire_time;
        self
    }

    /// Serve stale flags immediately and refresh them in the background.
    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Add a flag reported as enabled when flags cannot be fetched and nothing is cached.
    pub fn fallback_flag(mut self, flag: impl Into<FallbackFlag>) -> Self {
        self.fallback_flags.push(flag.into());
        self
    }

    /// Replace the fallback flags.
    pub fn fallback_flags<I>(mut self, flags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<FallbackFlag>,
    {
        self.fallback_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn failure_caching(mut self, failure_caching: FailureCaching) -> Self {
        self.failure_caching = failure_caching;
        self
    }

    /// Storage for the flag cache.
    pub fn cache_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.cache_storage = Arc::new(storage);
        self
    }

    /// Storage for flag overrides. Should not be the same slot as the cache storage.
    pub fn override_storage(mut self, storage: impl Storage + 'static) -> Self {
        self.override_storage = Arc::new(storage);
        self
    }

    /// Persist the flag cache and overrides as files in `dir`. The directory must exist.
    pub fn storage_dir(self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.cache_storage(FileStorage::new(dir.join(ClientConfig::CACHE_FILE_NAME)))
            .override_storage(FileStorage::new(dir.join(ClientConfig::OVERRIDES_FILE_NAME)))
    }

    /// Window in which identical check events are sent only once.
    pub fn check_event_window(mut self, window: Duration) -> Self {
        self.check_event_window = window;
        self
    }

    /// Time source. Mostly useful in tests.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Initial context.
    pub fn context(mut self, context: FlagsContext) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            stale_while_revalidate: self.stale_while_revalidate,
            timeout: self.timeout,
            fallback_flags: self.fallback_flags.clone(),
            failure_caching: self.failure_caching,
        }
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if `stale_time` exceeds `expire_time`.
    ///
    /// ```
    /// # use flagwise::{ClientConfig, Client};
    /// let client: Client = ClientConfig::from_publishable_key("pk_test").to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}
