//! Local flag overrides.
//!
//! Overrides are kept in their own [`Storage`] slot, separate from the flag cache, so they survive
//! cache expiry and [`FlagCache::clear`](crate::flag_cache::FlagCache::clear). They are applied on
//! read by [`merge`]; cached flags are never modified.
//!
//! Persisted as a JSON object of flag key to `true`, `false` or `null`. `null` means "not
//! overridden".
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    flags::{FlagMap, FlagsView, RawFlag},
    storage::Storage,
};

/// Persisted map of flag overrides.
pub struct OverrideStore {
    storage: Arc<dyn Storage>,
    overrides: RwLock<HashMap<String, bool>>,
}

impl OverrideStore {
    /// Load overrides from `storage`. A missing or unreadable blob starts with no overrides.
    pub fn new(storage: Arc<dyn Storage>) -> OverrideStore {
        let overrides = storage.get().map(|raw| load(&raw)).unwrap_or_default();
        OverrideStore {
            storage,
            overrides: RwLock::new(overrides),
        }
    }

    /// Get the override for `key`, if any.
    pub fn get(&self, key: &str) -> Option<bool> {
        self.overrides
            .read()
            .expect("thread holding overrides lock should not panic")
            .get(key)
            .copied()
    }

    /// Set (`Some`) or remove (`None`) the override for `key` and persist the whole map.
    ///
    /// Returns whether the stored overrides changed.
    pub fn set(&self, key: &str, value: Option<bool>) -> bool {
        let mut overrides = self
            .overrides
            .write()
            .expect("thread holding overrides lock should not panic");

        let previous = match value {
            Some(value) => overrides.insert(key.to_owned(), value),
            None => overrides.remove(key),
        };
        if previous == value {
            return false;
        }

        let result = serde_json::to_string(&*overrides)
            .map_err(crate::Error::from)
            .and_then(|blob| self.storage.set(&blob));
        if let Err(err) = result {
            log::warn!(target: "flagwise", flag_key = key; "failed to persist flag overrides: {:?}", err);
        }
        true
    }

    /// Copy of the current overrides.
    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.overrides
            .read()
            .expect("thread holding overrides lock should not panic")
            .clone()
    }
}

fn load(raw: &str) -> HashMap<String, bool> {
    match serde_json::from_str::<HashMap<String, Option<bool>>>(raw) {
        Ok(overrides) => overrides
            .into_iter()
            .filter_map(|(key, value)| Some((key, value?)))
            .collect(),
        Err(err) => {
            log::debug!(target: "flagwise", "ignoring unusable flag overrides: {}", err);
            HashMap::new()
        }
    }
}

/// Apply `overrides` on top of `fetched`.
///
/// Every fetched flag gets its override, if one exists. Overrides for keys that were not fetched
/// have no effect: they never add flags to the view.
pub fn merge(fetched: &FlagMap, overrides: &HashMap<String, bool>) -> FlagsView {
    FlagsView::new(
        fetched
            .iter()
            .map(|(key, flag)| {
                (
                    key.clone(),
                    RawFlag {
                        flag: flag.clone(),
                        is_enabled_override: overrides.get(key).copied(),
                    },
                )
            })
            .collect(),
    )
}
