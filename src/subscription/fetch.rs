use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use super::{parse, SubscriptionResult};
use crate::error::SubscriptionError;
use crate::settings::Settings;

/// Downloads subscription bodies with a bounded timeout and a recognised
/// client User-Agent (some providers shape their answer by it).
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Option<Client>,
}

impl Fetcher {
    pub fn new(settings: &Settings) -> Self {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .build();
        match client {
            Ok(client) => Self { client: Some(client) },
            Err(e) => {
                warn!("http client unavailable: {e}");
                Self { client: None }
            }
        }
    }

    pub fn fetch(&self, url: &str) -> Result<String, SubscriptionError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SubscriptionError::EmptyUrl);
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SubscriptionError::ConnectionFailed("http client unavailable".into()))?;

        debug!("fetching subscription {url}");
        let response = client.get(url).send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SubscriptionError::Http(status.as_u16()));
        }
        let body = response.text().map_err(classify)?;
        info!("fetched subscription, {} bytes", body.len());
        Ok(body)
    }

    /// Fetches and parses. An empty URL fails before any network access.
    pub fn load(&self, url: &str) -> SubscriptionResult {
        let body = self.fetch(url)?;
        parse(&body)
    }
}

fn classify(error: reqwest::Error) -> SubscriptionError {
    if error.is_timeout() {
        SubscriptionError::Timeout
    } else if let Some(status) = error.status() {
        SubscriptionError::Http(status.as_u16())
    } else {
        SubscriptionError::ConnectionFailed(error.to_string())
    }
}
