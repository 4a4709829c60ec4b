//! Subscription payload parsing.
//!
//! A payload may be a Clash YAML document, a JSON document (Clash or
//! sing-box shaped), or a newline separated list of share links, and any of
//! those may additionally be wrapped in base64. [`parse`] sniffs the shape
//! instead of trusting a content type and normalises everything into
//! [`Subscription`].

mod base64;
mod document;
mod fetch;
mod links;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::SubscriptionError;

pub use self::base64::decode_base64_to_string;
pub use self::fetch::Fetcher;
pub use self::links::parse_share_link;

pub type SubscriptionResult = Result<Subscription, SubscriptionError>;

const LINK_SCHEMES: [&str; 7] = ["ss://", "vmess://", "trojan://", "vless://", "ssr://", "hysteria2://", "hy2://"];

/// Protocol of one upstream server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProxyKind {
    Shadowsocks,
    Vmess,
    Trojan,
    Vless,
    /// Any other protocol; handed to the engine untouched.
    Other(String),
}

impl ProxyKind {
    pub fn from_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => Self::Shadowsocks,
            "vmess" => Self::Vmess,
            "trojan" => Self::Trojan,
            "vless" => Self::Vless,
            other => Self::Other(other.to_string()),
        }
    }

    /// Name of the type as the engine's proxy list expects it.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Shadowsocks => "ss",
            Self::Vmess => "vmess",
            Self::Trojan => "trojan",
            Self::Vless => "vless",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for ProxyKind {
    fn from(value: String) -> Self {
        Self::from_type(&value)
    }
}

impl From<ProxyKind> for String {
    fn from(value: ProxyKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream server.
///
/// `attrs` holds the type specific options (credentials, transport, TLS)
/// keyed the way the engine's proxy list spells them, so an entry renders
/// into the engine config without a per-protocol schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyEntry {
    pub name: String,
    pub kind: ProxyKind,
    pub server: String,
    pub port: u16,
    pub attrs: BTreeMap<String, Value>,
}

impl ProxyEntry {
    pub fn new(name: impl Into<String>, kind: ProxyKind, server: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            kind,
            server: server.into(),
            port,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn placeholder_name(kind: &ProxyKind, server: &str, port: u16) -> String {
        format!("{kind}-{server}:{port}")
    }

    /// Renders the entry as one item of the engine's `proxies` list.
    pub fn to_engine_value(&self) -> Value {
        let mut map = Mapping::new();
        map.insert("name".into(), self.name.clone().into());
        map.insert("type".into(), self.kind.as_str().into());
        map.insert("server".into(), self.server.clone().into());
        map.insert("port".into(), u64::from(self.port).into());
        for (key, value) in &self.attrs {
            map.insert(key.as_str().into(), value.clone());
        }
        Value::Mapping(map)
    }
}

/// A named selector over proxies (or other groups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingGroup {
    pub name: String,
    #[serde(rename = "type", default = "default_group_kind")]
    pub kind: String,
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Remaining keys (`url`, `interval`, ...) carried through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_group_kind() -> String {
    "select".to_string()
}

impl RoutingGroup {
    pub fn select(name: impl Into<String>, proxies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_group_kind(),
            proxies,
            extra: BTreeMap::new(),
        }
    }
}

/// One routing rule line: `KIND,MATCHER,TARGET[,OPTIONS...]` or `MATCH,TARGET`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub kind: String,
    pub matcher: Option<String>,
    pub target: String,
    pub options: Vec<String>,
}

impl RoutingRule {
    pub fn catch_all(target: impl Into<String>) -> Self {
        Self {
            kind: "MATCH".to_string(),
            matcher: None,
            target: target.into(),
            options: Vec::new(),
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (kind, rest) = line.split_once(',')?;
        let kind = kind.trim().to_ascii_uppercase();
        if kind.is_empty() {
            return None;
        }
        if matches!(kind.as_str(), "MATCH" | "FINAL") {
            let target = rest.trim();
            return (!target.is_empty()).then(|| Self::catch_all(target));
        }
        // Logical rules nest commas inside parentheses, so only the last
        // segment is the target.
        if matches!(kind.as_str(), "AND" | "OR" | "NOT") {
            let (matcher, target) = rest.rsplit_once(',')?;
            return Some(Self {
                kind,
                matcher: Some(matcher.trim().to_string()),
                target: target.trim().to_string(),
                options: Vec::new(),
            });
        }
        let mut parts = rest.split(',').map(str::trim);
        let matcher = parts.next()?.to_string();
        let target = parts.next().filter(|target| !target.is_empty())?.to_string();
        Some(Self {
            kind,
            matcher: Some(matcher),
            target,
            options: parts.map(str::to_string).collect(),
        })
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self.kind.as_str(), "MATCH" | "FINAL")
    }

    /// Rules that pull their matcher from an external rule provider.
    pub fn is_rule_set(&self) -> bool {
        matches!(self.kind.as_str(), "RULE-SET" | "SUB-RULE")
    }

    pub fn to_line(&self) -> String {
        let mut parts = vec![self.kind.as_str()];
        if let Some(matcher) = &self.matcher {
            parts.push(matcher);
        }
        parts.push(&self.target);
        parts.extend(self.options.iter().map(String::as_str));
        parts.join(",")
    }
}

/// The shape of the payload a subscription arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Only proxies (share links or a sing-box outbound list).
    ProxyList,
    /// A full engine document whose proxies and DNS block are reused as-is.
    Routing(RoutingDocument),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDocument {
    pub proxies: Vec<Value>,
    pub dns: Option<Value>,
}

/// Outcome of a successful parse; built once per load and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub proxies: Vec<ProxyEntry>,
    pub groups: Vec<RoutingGroup>,
    pub rules: Vec<RoutingRule>,
    pub document: Document,
}

impl Subscription {
    pub fn proxy_list(proxies: Vec<ProxyEntry>) -> Self {
        Self {
            proxies,
            groups: Vec::new(),
            rules: Vec::new(),
            document: Document::ProxyList,
        }
    }

    pub fn routing_document(&self) -> Option<&RoutingDocument> {
        match &self.document {
            Document::Routing(doc) => Some(doc),
            Document::ProxyList => None,
        }
    }
}

/// Parses a fetched subscription body. Never panics; every failure is a
/// [`SubscriptionError`].
pub fn parse(raw: &str) -> SubscriptionResult {
    let raw = raw.trim_start_matches('\u{feff}');
    let mut candidates = Vec::with_capacity(2);
    if let Some(decoded) = decode_base64_to_string(raw) {
        debug!("payload decoded as base64, {} bytes", decoded.len());
        candidates.push(decoded);
    }
    candidates.push(raw.to_string());

    let mut failure = SubscriptionError::UnsupportedFormat;
    for candidate in &candidates {
        match parse_candidate(candidate.trim()) {
            Ok(subscription) => return Ok(subscription),
            Err(error) => {
                debug!("candidate rejected: {error}");
                if rank(&error) > rank(&failure) {
                    failure = error;
                }
            }
        }
    }
    Err(failure)
}

// A structurally recognised but broken payload says more than "unknown".
fn rank(error: &SubscriptionError) -> u8 {
    match error {
        SubscriptionError::MalformedPayload(_) => 2,
        SubscriptionError::NoProxiesFound => 1,
        _ => 0,
    }
}

fn parse_candidate(text: &str) -> SubscriptionResult {
    let mut failure = SubscriptionError::UnsupportedFormat;

    if text.starts_with('{') || text.starts_with('[') {
        match document::parse_json(text) {
            Ok(subscription) => return Ok(subscription),
            Err(error) => failure = error,
        }
    }

    if text.contains("proxies:") || text.starts_with("port:") {
        match document::parse_yaml(text) {
            Ok(subscription) => return Ok(subscription),
            Err(error) if rank(&error) >= rank(&failure) => failure = error,
            Err(_) => {}
        }
    }

    if LINK_SCHEMES.iter().any(|scheme| text.contains(scheme)) {
        let proxies = parse_link_lines(text);
        if !proxies.is_empty() {
            return Ok(Subscription::proxy_list(proxies));
        }
    }

    Err(failure)
}

fn parse_link_lines(text: &str) -> Vec<ProxyEntry> {
    let mut proxies = Vec::new();
    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match parse_share_link(line) {
            Some(entry) => proxies.push(entry),
            None => debug!("dropping unparsable line: {}", truncate(line, 48)),
        }
    }
    dedup_names(&mut proxies);
    proxies
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

/// Makes proxy names unique by suffixing `-2`, `-3`, ... to repeats.
pub(crate) fn dedup_names(proxies: &mut [ProxyEntry]) {
    let mut used: HashSet<String> = HashSet::new();
    for entry in proxies.iter_mut() {
        entry.name = unique_name(&entry.name, &mut used);
    }
}

pub(crate) fn unique_name(base: &str, used: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut index = 2;
    while used.contains(&candidate) {
        candidate = format!("{base}-{index}");
        index += 1;
    }
    used.insert(candidate.clone());
    candidate
}
