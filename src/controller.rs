//! Client for the proxy engine's HTTP control API.
//!
//! Every call is best-effort: failures are logged at debug level and come
//! back as `None`/empty values, never as errors.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const CALL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DELAY_TEST_URL: &str = "http://www.gstatic.com/generate_204";
pub const DELAY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub meta: bool,
}

/// The subset of `/configs` the core cares about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LiveConfig {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub socks_port: u16,
    #[serde(default)]
    pub mixed_port: u16,
    #[serde(default)]
    pub mode: String,
}

impl LiveConfig {
    /// The port a SOCKS client can use: the dedicated SOCKS port, else the
    /// mixed port. Zero means the listener is disabled.
    pub fn socks_capable_port(&self) -> Option<u16> {
        [self.socks_port, self.mixed_port].into_iter().find(|port| *port != 0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub now: Option<String>,
    #[serde(default)]
    pub all: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    #[serde(default)]
    proxies: BTreeMap<String, ProxyInfo>,
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    delay: u64,
}

#[derive(Debug, Clone)]
pub struct ControllerClient {
    base: String,
    client: Option<Client>,
}

impl ControllerClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_timeout(base, CALL_TIMEOUT)
    }

    pub fn with_timeout(base: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| debug!("controller client unavailable: {e}"))
            .ok();
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Option<T> {
        let client = self.client.as_ref()?;
        let url = format!("{}{path}", self.base);
        let response = client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| debug!("GET {url} failed: {e}"))
            .ok()?;
        response
            .json::<T>()
            .map_err(|e| debug!("GET {url} returned unexpected body: {e}"))
            .ok()
    }

    pub fn version(&self) -> Option<VersionInfo> {
        self.get_json("/version")
    }

    pub fn configs(&self) -> Option<LiveConfig> {
        self.get_json("/configs")
    }

    /// Asks the engine to refresh its geo databases. Returns whether the
    /// engine accepted the request.
    pub fn update_geo(&self) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        let url = format!("{}/configs/geo", self.base);
        match client.post(&url).json(&json!({})).send() {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("POST {url} failed: {e}");
                false
            }
        }
    }

    pub fn proxies(&self) -> BTreeMap<String, ProxyInfo> {
        self.get_json::<ProxiesResponse>("/proxies")
            .map(|response| response.proxies)
            .unwrap_or_default()
    }

    pub fn proxy(&self, name: &str) -> Option<ProxyInfo> {
        self.get_json(&format!("/proxies/{}", encode_segment(name)))
    }

    /// Points a selector group at one of its members.
    pub fn select(&self, group: &str, name: &str) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        let url = format!("{}/proxies/{}", self.base, encode_segment(group));
        match client.put(&url).json(&json!({ "name": name })).send() {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("PUT {url} failed: {e}");
                false
            }
        }
    }

    /// Round-trip delay in milliseconds through the named proxy.
    pub fn delay(&self, name: &str, test_url: &str, timeout_ms: u64) -> Option<u64> {
        let client = self.client.as_ref()?;
        let url = format!("{}/proxies/{}/delay", self.base, encode_segment(name));
        let timeout = timeout_ms.to_string();
        let response = client
            .get(&url)
            .query(&[("url", test_url), ("timeout", timeout.as_str())])
            .timeout(Duration::from_millis(timeout_ms) + CALL_TIMEOUT)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(|e| debug!("delay test for {name} failed: {e}"))
            .ok()?;
        response.json::<DelayResponse>().ok().map(|body| body.delay)
    }

    /// Delay of every member of `group`; members that fail report `-1`.
    pub fn group_delays(&self, group: &str) -> BTreeMap<String, i64> {
        let Some(info) = self.proxy(group) else {
            return BTreeMap::new();
        };
        info.all
            .iter()
            .map(|member| {
                let delay = self
                    .delay(member, DELAY_TEST_URL, DELAY_TIMEOUT_MS)
                    .and_then(|delay| i64::try_from(delay).ok())
                    .unwrap_or(-1);
                (member.clone(), delay)
            })
            .collect()
    }

    pub fn connections(&self) -> Value {
        self.get_json("/connections").unwrap_or(Value::Null)
    }
}

fn encode_segment(value: &str) -> String {
    percent_encoding::utf8_percent_encode(value, percent_encoding::NON_ALPHANUMERIC).to_string()
}
