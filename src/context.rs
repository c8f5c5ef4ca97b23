//! Evaluation context and the cache key / query parameters derived from it.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing attributes of a context entity (user, company, ...).
///
/// # Examples
/// ```
/// # use flagwise::{Attributes, ContextValue};
/// let attributes = [
///     ("id".to_owned(), "user-1".into()),
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, ContextValue>;

/// Values nested deeper than this are dropped when the context is flattened.
pub const MAX_CONTEXT_DEPTH: usize = 16;

/// A context attribute value. Objects and lists nest arbitrarily.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum ContextValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A list of values. Flattened with the index as the key segment.
    List(Vec<ContextValue>),
    /// Nested attributes.
    Object(Attributes),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Context that flags are evaluated against.
///
/// The context is sent to the flags service as flattened query parameters and, together with the
/// publishable key, determines the flag cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagsContext {
    /// Attributes of the current user. Usually includes `id`.
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub user: Attributes,
    /// Attributes of the company the user belongs to. Usually includes `id`.
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub company: Attributes,
    /// Any other attributes relevant for targeting.
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub other: Attributes,
}

impl FlagsContext {
    /// Create an empty context.
    pub fn new() -> FlagsContext {
        FlagsContext::default()
    }

    /// Set a user attribute.
    pub fn with_user(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.user.insert(key.into(), value.into());
        self
    }

    /// Set a company attribute.
    pub fn with_company(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.company.insert(key.into(), value.into());
        self
    }

    /// Set an "other" attribute.
    pub fn with_other(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.other.insert(key.into(), value.into());
        self
    }

    /// Flatten the context into dotted `key=value` pairs, e.g. `user.id=1`,
    /// `company.plan.name=pro`. Null values are left out, as if the attribute were absent. Order
    /// is unspecified.
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (section, attributes) in [
            ("user", &self.user),
            ("company", &self.company),
            ("other", &self.other),
        ] {
            for (key, value) in attributes {
                flatten_into(&format!("{section}.{key}"), value, 1, &mut out);
            }
        }
        out
    }
}

fn flatten_into(prefix: &str, value: &ContextValue, depth: usize, out: &mut Vec<(String, String)>) {
    if depth > MAX_CONTEXT_DEPTH {
        log::warn!(target: "flagwise", key = prefix; "context value is nested too deep, dropping it");
        return;
    }
    match value {
        ContextValue::String(s) => out.push((prefix.to_owned(), s.clone())),
        // f64 Display prints integral values without a fractional part (`1`, not `1.0`).
        ContextValue::Number(n) => out.push((prefix.to_owned(), n.to_string())),
        ContextValue::Boolean(b) => out.push((prefix.to_owned(), b.to_string())),
        ContextValue::Null => {}
        ContextValue::List(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}.{index}"), item, depth + 1, out);
            }
        }
        ContextValue::Object(attributes) => {
            for (key, item) in attributes {
                flatten_into(&format!("{prefix}.{key}"), item, depth + 1, out);
            }
        }
    }
}

/// Merge `source` into `target`. Nested objects are merged recursively; any other value replaces
/// the existing one.
pub fn deep_merge(target: &mut Attributes, source: Attributes) {
    for (key, value) in source {
        let incoming = match value {
            ContextValue::Object(incoming) => incoming,
            value => {
                target.insert(key, value);
                continue;
            }
        };
        if let Some(ContextValue::Object(existing)) = target.get_mut(&key) {
            deep_merge(existing, incoming);
            continue;
        }
        target.insert(key, ContextValue::Object(incoming));
    }
}

/// Query parameters of a flags request, sorted by key.
///
/// The serialized form is the flag cache key: identical contexts always produce the same key,
/// regardless of attribute insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchParams {
    params: Vec<(String, String)>,
}

impl FetchParams {
    /// Build request parameters for `context` under the given publishable key.
    pub fn new(publishable_key: &str, context: &FlagsContext) -> FetchParams {
        let mut params = context.flatten();
        params.push(("publishableKey".to_owned(), publishable_key.to_owned()));
        FetchParams::from_pairs(params)
    }

    /// Build request parameters from raw pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> FetchParams
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut params: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        // Stable sort: repeated keys keep their relative order.
        params.sort_by(|a, b| a.0.cmp(&b.0));
        FetchParams { params }
    }

    /// Sorted `(key, value)` pairs.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.params
    }

    /// URL-encoded query string, used as the flag cache key.
    pub fn cache_key(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.params)
            .finish()
    }
}
