//! Helpers shared by unit tests.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    context::FetchParams,
    fetcher::FlagsTransport,
    flags::{FlagMap, FlagRecord},
    Error, Result,
};

/// Build a flag map from `(key, is_enabled)` pairs.
pub fn flag_map(flags: &[(&str, bool)]) -> FlagMap {
    flags
        .iter()
        .map(|(key, enabled)| ((*key).to_owned(), FlagRecord::new(*key, *enabled)))
        .collect()
}

/// In-memory transport. Answers every fetch with the last configured response.
///
/// Clones share state, so a test can keep one clone and hand another to the code under test.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    response: Option<FlagMap>,
    delay: Option<Duration>,
    fetches: Vec<FetchParams>,
    events: Vec<(String, serde_json::Value)>,
    fail_events: bool,
    hang_events: bool,
}

impl MockTransport {
    /// A transport that fails every fetch until told otherwise.
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    pub fn respond_with(&self, flags: FlagMap) {
        self.state.lock().unwrap().response = Some(flags);
    }

    pub fn fail(&self) {
        self.state.lock().unwrap().response = None;
    }

    /// Delay every fetch by `delay`.
    pub fn delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn fail_events(&self) {
        self.state.lock().unwrap().fail_events = true;
    }

    /// Never complete posting events.
    pub fn hang_events(&self) {
        self.state.lock().unwrap().hang_events = true;
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().unwrap().fetches.len()
    }

    /// Parameters of every fetch so far, oldest first.
    pub fn fetches(&self) -> Vec<FetchParams> {
        self.state.lock().unwrap().fetches.clone()
    }

    /// Every posted event as `(path, body)`, oldest first.
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl FlagsTransport for MockTransport {
    async fn fetch_flags(&self, params: &FetchParams) -> Result<FlagMap> {
        let (response, delay) = {
            let mut state = self.state.lock().unwrap();
            state.fetches.push(params.clone());
            (state.response.clone(), state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        response.ok_or_else(|| {
            Error::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock transport is failing",
            ))
        })
    }

    async fn post_event(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            if state.fail_events {
                return Err(Error::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
            }
            if !state.hang_events {
                state.events.push((path.to_owned(), body));
                return Ok(());
            }
            true
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
