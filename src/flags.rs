//! Flag models: flags as fetched from the service, flags merged with local overrides, and
//! fallback flags used when nothing else is available.
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

/// Fetched flags keyed by flag key.
pub type FlagMap = HashMap<String, FlagRecord>;

/// Evaluation result of a single flag, as returned by the flags service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    /// Flag key. Always equal to the key the record is stored under.
    pub key: String,
    /// Raw evaluation result, ignoring local overrides.
    pub is_enabled: bool,
    /// Version of the targeting rules that produced the result. Reported with check events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_version: Option<i64>,
    /// Remote configuration attached to the flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<FlagConfig>,
    /// Per-rule evaluation results, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_evaluation_results: Option<Vec<bool>>,
    /// Context fields referenced by targeting rules but missing from the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_context_fields: Option<Vec<String>>,
}

impl FlagRecord {
    /// Create a record with no config and no diagnostics.
    pub fn new(key: impl Into<String>, is_enabled: bool) -> FlagRecord {
        FlagRecord {
            key: key.into(),
            is_enabled,
            targeting_version: None,
            config: None,
            rule_evaluation_results: None,
            missing_context_fields: None,
        }
    }
}

/// A named configuration value evaluated alongside a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagConfig {
    /// Key of the config variant that matched.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Arbitrary JSON payload of the variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_evaluation_results: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_context_fields: Option<Vec<String>>,
}

/// A fetched flag with the local override applied on top.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFlag {
    #[serde(flatten)]
    pub flag: FlagRecord,
    /// `None` means no override is active.
    pub is_enabled_override: Option<bool>,
}

impl RawFlag {
    /// Effective enabled state: the override if one is set, the fetched value otherwise.
    pub fn is_enabled(&self) -> bool {
        self.is_enabled_override.unwrap_or(self.flag.is_enabled)
    }
}

impl std::ops::Deref for RawFlag {
    type Target = FlagRecord;

    fn deref(&self) -> &FlagRecord {
        &self.flag
    }
}

/// Read-only view of the flags visible to the caller, with overrides applied.
///
/// The view is a snapshot: later resolutions or override changes produce a new view and do not
/// affect existing ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagsView {
    flags: Arc<HashMap<String, RawFlag>>,
}

impl FlagsView {
    pub(crate) fn new(flags: HashMap<String, RawFlag>) -> FlagsView {
        FlagsView {
            flags: Arc::new(flags),
        }
    }

    /// Get a flag by key.
    pub fn get(&self, key: &str) -> Option<&RawFlag> {
        self.flags.get(key)
    }

    /// Effective enabled state of a flag. Unknown flags are disabled.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key).map_or(false, RawFlag::is_enabled)
    }

    /// Whether the view contains `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.flags.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawFlag)> {
        self.flags.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl Serialize for FlagsView {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.flags.serialize(serializer)
    }
}

/// A flag to report as enabled when flags cannot be fetched and nothing is cached.
///
/// # Examples
/// ```
/// # use flagwise::FallbackFlag;
/// let plain: FallbackFlag = "new-checkout".into();
/// let with_config = FallbackFlag::with_config(
///     "pricing-page",
///     "variant-a",
///     Some(serde_json::json!({ "discount": 10 })),
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackFlag {
    pub key: String,
    pub config: Option<FallbackConfig>,
}

/// Config attached to a [`FallbackFlag`].
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    pub key: String,
    pub payload: Option<serde_json::Value>,
}

impl FallbackFlag {
    /// A fallback flag that also carries a config.
    pub fn with_config(
        key: impl Into<String>,
        config_key: impl Into<String>,
        payload: Option<serde_json::Value>,
    ) -> FallbackFlag {
        FallbackFlag {
            key: key.into(),
            config: Some(FallbackConfig {
                key: config_key.into(),
                payload,
            }),
        }
    }

    fn to_record(&self) -> FlagRecord {
        FlagRecord {
            config: self.config.as_ref().map(|config| FlagConfig {
                key: config.key.clone(),
                version: None,
                payload: config.payload.clone(),
                rule_evaluation_results: None,
                missing_context_fields: None,
            }),
            ..FlagRecord::new(self.key.clone(), true)
        }
    }
}

impl From<&str> for FallbackFlag {
    fn from(key: &str) -> FallbackFlag {
        key.to_owned().into()
    }
}

impl From<String> for FallbackFlag {
    fn from(key: String) -> FallbackFlag {
        FallbackFlag { key, config: None }
    }
}

/// Build the flag map served when fetching fails and nothing is cached. Every fallback flag is
/// enabled.
pub fn fallback_flag_map(fallbacks: &[FallbackFlag]) -> FlagMap {
    fallbacks
        .iter()
        .map(|fallback| (fallback.key.clone(), fallback.to_record()))
        .collect()
}
