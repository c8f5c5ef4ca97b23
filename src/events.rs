//! Check events: telemetry sent when the application reads a flag or its config.
use serde::Serialize;

use crate::{
    context::FlagsContext,
    flags::{FlagConfig, FlagRecord},
};

/// What the application read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckAction {
    Check,
    CheckConfig,
}

/// A flag or config read, reported to the flags service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckEvent {
    pub action: CheckAction,
    pub key: String,
    /// Targeting version for flag checks, config version for config checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    /// Value the application saw.
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_context_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_evaluation_results: Option<Vec<bool>>,
}

impl CheckEvent {
    /// Event for reading whether `flag` is enabled. `value` is the effective value the
    /// application saw, overrides included.
    pub fn flag_check(flag: &FlagRecord, value: bool) -> CheckEvent {
        CheckEvent {
            action: CheckAction::Check,
            key: flag.key.clone(),
            version: flag.targeting_version,
            value: value.into(),
            missing_context_fields: flag.missing_context_fields.clone(),
            rule_evaluation_results: flag.rule_evaluation_results.clone(),
        }
    }

    /// Event for reading the config of flag `flag_key`.
    pub fn config_check(flag_key: &str, config: &FlagConfig) -> CheckEvent {
        CheckEvent {
            action: CheckAction::CheckConfig,
            key: flag_key.to_owned(),
            version: config.version,
            value: serde_json::json!({
                "key": config.key,
                "payload": config.payload,
            }),
            missing_context_fields: config.missing_context_fields.clone(),
            rule_evaluation_results: config.rule_evaluation_results.clone(),
        }
    }

    /// Key identifying duplicate events for rate limiting. Events for different contexts are
    /// never duplicates.
    pub fn rate_limit_key(&self, cache_key: &str) -> String {
        let version = self.version.map(|v| v.to_string()).unwrap_or_default();
        format!(
            "{:?}:{}:{}:{}:{}",
            self.action, cache_key, self.key, version, self.value
        )
    }
}

/// Request body posted to the events endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckEventBody<'a> {
    #[serde(flatten)]
    pub event: &'a CheckEvent,
    pub eval_context: &'a FlagsContext,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_flag_check() {
        let mut flag = FlagRecord::new("huddles", true);
        flag.targeting_version = Some(3);
        flag.missing_context_fields = Some(vec!["company.id".to_owned()]);

        let event = CheckEvent::flag_check(&flag, false);
        let context = FlagsContext::new().with_user("id", "u1");
        let body = CheckEventBody {
            event: &event,
            eval_context: &context,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "action": "check",
                "key": "huddles",
                "version": 3,
                "value": false,
                "missingContextFields": ["company.id"],
                "evalContext": { "user": { "id": "u1" } },
            })
        );
    }

    #[test]
    fn serializes_config_check() {
        let config = FlagConfig {
            key: "large".to_owned(),
            version: Some(2),
            payload: Some(json!({ "model": "large" })),
            rule_evaluation_results: Some(vec![true, false]),
            missing_context_fields: None,
        };

        let event = CheckEvent::config_check("ai-assist", &config);

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "action": "check-config",
                "key": "ai-assist",
                "version": 2,
                "value": { "key": "large", "payload": { "model": "large" } },
                "ruleEvaluationResults": [true, false],
            })
        );
    }

    #[test]
    fn rate_limit_key_distinguishes_value_and_context() {
        let flag = FlagRecord::new("a", true);
        let on = CheckEvent::flag_check(&flag, true);
        let off = CheckEvent::flag_check(&flag, false);

        assert_ne!(on.rate_limit_key("u=1"), off.rate_limit_key("u=1"));
        assert_ne!(on.rate_limit_key("u=1"), on.rate_limit_key("u=2"));
        assert_eq!(on.rate_limit_key("u=1"), on.clone().rate_limit_key("u=1"));
    }
}
