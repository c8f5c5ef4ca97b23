//! Encoding, decoding, and validation of the persisted flag cache.
//!
//! The flag cache is stored as a single JSON object keyed by cache key:
//!
//! ```json
//! {
//!   "publishableKey=pk&user.id=1": {
//!     "expireAt": 1710000000000,
//!     "staleAt": 1709996400000,
//!     "flags": { "flagA": { "key": "flagA", "isEnabled": true, "targetingVersion": 1 } },
//!     "success": true,
//!     "attemptCount": 0
//!   }
//! }
//! ```
//!
//! Storage content is untrusted: it may be truncated, hand-edited, or written by an older client.
//! Decoding is a structural check (types of every field) followed by a semantic check (flag keys
//! match their map keys, `staleAt <= expireAt`). A single malformed entry or flag invalidates the
//! whole blob; the flag cache then starts over from an empty map.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{clock::Timestamp, flags::FlagMap};

/// Decoded flag cache, keyed by cache key.
pub type CacheMap = HashMap<String, CacheEntry>;

/// A cached resolution for one cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// After this instant the entry must not be served and is evicted on the next write.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expire_at: Timestamp,
    /// After this instant the entry is stale but still usable.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub stale_at: Timestamp,
    /// Flags served for this key. May be missing on a recorded failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagMap>,
    /// Whether the fetch that produced this entry succeeded. Entries written by clients that never
    /// cache failures don't carry the field, so it defaults to `true`.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Consecutive failed fetches recorded for this key.
    #[serde(default)]
    pub attempt_count: u32,
}

fn default_success() -> bool {
    true
}

/// Reason a cache blob or a flag map was rejected.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ValidationError {
    /// Not valid JSON, or a field has the wrong type.
    #[error("malformed JSON")]
    Json(#[from] serde_json::Error),

    /// A flag is stored under a key different from its own `key`.
    #[error("flag stored under {map_key:?} has key {flag_key:?}")]
    FlagKeyMismatch { map_key: String, flag_key: String },

    /// A flag carries a config without a key.
    #[error("config of flag {flag_key:?} has an empty key")]
    EmptyConfigKey { flag_key: String },

    /// A cache entry becomes stale after it expires.
    #[error("cache entry {cache_key:?} has staleAt after expireAt")]
    StaleAfterExpire { cache_key: String },

    /// The flags service reported that evaluation failed.
    #[error("flags service reported an unsuccessful evaluation")]
    Unsuccessful,
}

/// Decode and validate a cache blob.
pub fn decode(raw: &str) -> Result<CacheMap, ValidationError> {
    let map: CacheMap = serde_json::from_str(raw)?;
    validate(&map)?;
    Ok(map)
}

/// Decode and validate an already-parsed cache blob.
pub fn decode_value(value: serde_json::Value) -> Result<CacheMap, ValidationError> {
    let map: CacheMap = serde_json::from_value(value)?;
    validate(&map)?;
    Ok(map)
}

/// Decode a cache blob, treating a missing or unusable blob as an empty cache.
pub fn decode_or_empty(raw: Option<&str>) -> CacheMap {
    let Some(raw) = raw else {
        return CacheMap::new();
    };
    decode(raw).unwrap_or_else(|err| {
        log::debug!(target: "flagwise", "ignoring unusable flag cache: {}", err);
        CacheMap::new()
    })
}

/// Serialize a cache map.
pub fn encode(map: &CacheMap) -> Result<String, ValidationError> {
    Ok(serde_json::to_string(map)?)
}

/// Check semantic invariants of a decoded cache map.
pub fn validate(map: &CacheMap) -> Result<(), ValidationError> {
    for (cache_key, entry) in map {
        if entry.stale_at > entry.expire_at {
            return Err(ValidationError::StaleAfterExpire {
                cache_key: cache_key.clone(),
            });
        }
        if let Some(flags) = &entry.flags {
            validate_flags(flags)?;
        }
    }
    Ok(())
}

/// Check that every flag is stored under its own key and every config has a key.
pub fn validate_flags(flags: &FlagMap) -> Result<(), ValidationError> {
    for (map_key, flag) in flags {
        if *map_key != flag.key {
            return Err(ValidationError::FlagKeyMismatch {
                map_key: map_key.clone(),
                flag_key: flag.key.clone(),
            });
        }
        if matches!(&flag.config, Some(config) if config.key.is_empty()) {
            return Err(ValidationError::EmptyConfigKey {
                flag_key: flag.key.clone(),
            });
        }
    }
    Ok(())
}
