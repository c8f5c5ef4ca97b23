//! A feature flags client with a persisted flag cache.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that fetches evaluated feature flags for a
//! [`FlagsContext`] (user, company, and other attributes) from the flags service. Fetched flags are
//! cached in a [`Storage`] slot keyed by the flattened context, so subsequent loads for the same
//! context are served locally until the entry goes stale.
//!
//! Loading flags never fails. When the flags service is unreachable, the client serves the last
//! cached flags for the context or, if there are none, the configured fallback flags.
//!
//! Local overrides set with [`Client::set_flag_override`] are persisted separately and applied on
//! read; they never modify cached flags.
//!
//! # Caching
//!
//! A cache entry is fresh for [`ClientConfig::stale_time`] and usable for
//! [`ClientConfig::expire_time`]. Stale entries are refetched before being served, or served
//! immediately and refreshed in the background with
//! [`ClientConfig::stale_while_revalidate`]. Failed fetches can be cached as well, with a retry
//! ceiling; see [`FailureCaching`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. They are only returned by the lower-level
//! building blocks ([`Storage`], [`FlagsTransport`]); the client recovers from all of them and
//! logs them instead.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! the `flagwise` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into client operations.
//!
//! # Async runtime
//!
//! Flag loading is `async` and must run within a [tokio](https://docs.rs/tokio) runtime. Background
//! refreshes and check events are spawned on the current runtime; a current-thread runtime is
//! enough.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache_codec;
pub mod clock;
mod client;
mod config;
pub mod context;
mod error;
pub mod events;
pub mod fetcher;
pub mod flag_cache;
pub mod flags;
pub mod overrides;
pub mod rate_limiter;
pub mod resolver;
pub mod storage;
pub mod subscribers;

#[cfg(test)]
mod test_utils;

pub use client::Client;
pub use config::ClientConfig;
pub use context::{Attributes, ContextValue, FlagsContext};
pub use error::{Error, Result};
pub use events::CheckEvent;
pub use fetcher::{FlagsTransport, HttpTransport};
pub use flags::{FallbackFlag, FlagConfig, FlagMap, FlagRecord, FlagsView, RawFlag};
pub use resolver::{FailureCaching, ResolutionState};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use subscribers::Subscription;
