//! HTTP transport that fetches evaluated flags from the flags service and posts telemetry events.
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::{
    cache_codec::{self, ValidationError},
    context::FetchParams,
    flags::FlagMap,
    Error, Result,
};

/// Transport used by the client to talk to the flags service.
///
/// The crate ships [`HttpTransport`]; other implementations are mostly useful in tests or to route
/// requests through an existing HTTP stack.
#[async_trait]
pub trait FlagsTransport: Send + Sync {
    /// Fetch evaluated flags for the given request parameters.
    ///
    /// Any failure (network error, non-2xx status, malformed response) is reported as an error;
    /// callers treat all of them the same way.
    async fn fetch_flags(&self, params: &FetchParams) -> Result<FlagMap>;

    /// Post a telemetry event. `path` is relative to the service base URL.
    async fn post_event(&self, path: &str, body: serde_json::Value) -> Result<()>;
}

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub publishable_key: String,
    /// SDK name. Sent with every request.
    pub sdk_name: String,
    /// Version of SDK.
    pub sdk_version: String,
}

pub const DEFAULT_BASE_URL: &str = "https://front.flagwise.dev";

const FLAGS_ENDPOINT: &str = "/features/evaluated";

/// Endpoint for check events.
pub const EVENTS_ENDPOINT: &str = "/features/events";

/// Response body of the flags endpoint.
#[derive(Debug, Deserialize)]
struct FlagsResponse {
    success: bool,
    #[serde(default)]
    features: FlagMap,
}

/// A [`FlagsTransport`] over HTTP.
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> HttpTransport {
        HttpTransport {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn flags_url(&self, params: &FetchParams) -> Result<Url> {
        let sdk_params = [
            ("sdkName", self.config.sdk_name.as_str()),
            ("sdkVersion", self.config.sdk_version.as_str()),
        ];
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url, FLAGS_ENDPOINT),
            params
                .pairs()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .chain(sdk_params),
        )
        .map_err(Error::InvalidBaseUrl)
    }

    fn event_url(&self, path: &str) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url, path),
            [("publishableKey", self.config.publishable_key.as_str())],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

#[async_trait]
impl FlagsTransport for HttpTransport {
    async fn fetch_flags(&self, params: &FetchParams) -> Result<FlagMap> {
        let url = self.flags_url(params)?;

        log::debug!(target: "flagwise", "fetching flags");
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            log::warn!(target: "flagwise", "client is not authorized. Check your publishable key");
            return Err(Error::Unauthorized);
        }
        if !status.is_success() {
            log::warn!(target: "flagwise", "received non-2xx response while fetching flags: {:?}", status);
            return Err(Error::Status(status));
        }

        let body = response.bytes().await?;
        let response: FlagsResponse =
            serde_json::from_slice(&body).map_err(ValidationError::from)?;
        if !response.success {
            return Err(ValidationError::Unsuccessful.into());
        }
        cache_codec::validate_flags(&response.features)?;

        log::debug!(target: "flagwise", flag_count = response.features.len(); "successfully fetched flags");

        Ok(response.features)
    }

    async fn post_event(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = self.event_url(path)?;

        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base_url: &str) -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            base_url: base_url.to_owned(),
            publishable_key: "pk_test".to_owned(),
            sdk_name: "rust".to_owned(),
            sdk_version: "0.1.0".to_owned(),
        })
    }

    #[test]
    fn flags_url_carries_context_and_sdk_params() {
        let params = FetchParams::from_pairs([("user.id", "1"), ("publishableKey", "pk_test")]);
        let url = transport("https://example.com/api").flags_url(&params).unwrap();

        assert_eq!(
            url.as_str(),
            "https://example.com/api/features/evaluated?publishableKey=pk_test&user.id=1&sdkName=rust&sdkVersion=0.1.0"
        );
    }

    #[test]
    fn event_url_carries_publishable_key() {
        let url = transport("https://example.com")
            .event_url(EVENTS_ENDPOINT)
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://example.com/features/events?publishableKey=pk_test"
        );
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let params = FetchParams::default();
        assert!(matches!(
            transport("not a url").flags_url(&params),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn parses_flags_response_fixture() {
        let raw = std::fs::read_to_string("tests/data/flags-response.json")
            .expect("Failed to open tests/data/flags-response.json");
        let response: FlagsResponse = serde_json::from_str(&raw).unwrap();

        assert!(response.success);
        assert_eq!(response.features.len(), 2);
        cache_codec::validate_flags(&response.features).unwrap();
    }
}
