use std::collections::{BTreeMap, HashSet};

use serde_json::Value as JsonValue;
use serde_yaml::Value;
use tracing::debug;

use super::{
    dedup_names, unique_name, Document, ProxyEntry, ProxyKind, RoutingDocument, RoutingGroup,
    RoutingRule, Subscription, SubscriptionResult,
};
use crate::error::SubscriptionError;

const ENTRY_KEYS: [&str; 4] = ["name", "type", "server", "port"];

/// Structured JSON: either an engine document with `proxies`, a sing-box
/// document with `outbounds`, or a bare array of outbounds.
pub(super) fn parse_json(text: &str) -> SubscriptionResult {
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|e| SubscriptionError::MalformedPayload(format!("invalid json: {e}")))?;

    match &value {
        JsonValue::Object(map) => {
            if map.get("proxies").and_then(JsonValue::as_array).is_some_and(|items| !items.is_empty()) {
                let yaml = serde_yaml::to_value(&value)
                    .map_err(|e| SubscriptionError::MalformedPayload(e.to_string()))?;
                return parse_mapping(yaml);
            }
            match map.get("outbounds").and_then(JsonValue::as_array) {
                Some(outbounds) if !outbounds.is_empty() => parse_outbounds(outbounds),
                _ => Err(SubscriptionError::NoProxiesFound),
            }
        }
        JsonValue::Array(items) => parse_outbounds(items),
        _ => Err(SubscriptionError::UnsupportedFormat),
    }
}

pub(super) fn parse_yaml(text: &str) -> SubscriptionResult {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| SubscriptionError::MalformedPayload(format!("invalid yaml: {e}")))?;
    parse_mapping(value)
}

fn parse_mapping(root: Value) -> SubscriptionResult {
    let Value::Mapping(mut root) = root else {
        return Err(SubscriptionError::MalformedPayload("document root is not a mapping".into()));
    };

    let raw_proxies = match root.remove("proxies") {
        None | Some(Value::Null) => return Err(SubscriptionError::NoProxiesFound),
        Some(Value::Sequence(items)) => items,
        Some(_) => {
            return Err(SubscriptionError::MalformedPayload("proxies must be a list".into()));
        }
    };
    if raw_proxies.iter().any(|item| !item.is_mapping()) {
        return Err(SubscriptionError::MalformedPayload("proxies must be a list of maps".into()));
    }

    let mut used = HashSet::new();
    let mut proxies = Vec::with_capacity(raw_proxies.len());
    let mut kept = Vec::with_capacity(raw_proxies.len());
    for mut raw in raw_proxies {
        let Some(mut entry) = entry_from_mapping(&raw) else {
            debug!("skipping proxy without server/port: {:?}", raw.get("name"));
            continue;
        };
        // The raw map goes to the engine as is, so it must carry the final
        // name even when the entry had none.
        entry.name = unique_name(&entry.name, &mut used);
        if let Some(map) = raw.as_mapping_mut() {
            map.insert("name".into(), entry.name.clone().into());
        }
        proxies.push(entry);
        kept.push(raw);
    }
    if proxies.is_empty() {
        return Err(SubscriptionError::NoProxiesFound);
    }

    let groups = match root.remove("proxy-groups") {
        Some(Value::Sequence(items)) => parse_groups(items),
        _ => Vec::new(),
    };
    let rules = match root.remove("rules") {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(RoutingRule::parse)
            .collect(),
        _ => Vec::new(),
    };
    let dns = root.remove("dns").filter(Value::is_mapping);

    Ok(Subscription {
        proxies,
        groups,
        rules,
        document: Document::Routing(RoutingDocument { proxies: kept, dns }),
    })
}

fn parse_groups(items: Vec<Value>) -> Vec<RoutingGroup> {
    let mut seen = HashSet::new();
    let mut groups = Vec::new();
    for item in items {
        match serde_yaml::from_value::<RoutingGroup>(item) {
            Ok(group) if seen.insert(group.name.clone()) => groups.push(group),
            Ok(group) => debug!("duplicate group {} ignored", group.name),
            Err(e) => debug!("skipping unreadable group: {e}"),
        }
    }
    groups
}

fn yaml_port(value: Option<&Value>) -> Option<u16> {
    let value = value?;
    let port = value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))?;
    u16::try_from(port).ok().filter(|port| *port != 0)
}

fn entry_from_mapping(raw: &Value) -> Option<ProxyEntry> {
    let map = raw.as_mapping()?;
    let kind = ProxyKind::from_type(map.get("type").and_then(Value::as_str)?);
    let server = map.get("server").and_then(Value::as_str)?.trim();
    if server.is_empty() {
        return None;
    }
    let port = yaml_port(map.get("port"))?;
    let name = map
        .get("name")
        .and_then(|name| match name {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| ProxyEntry::placeholder_name(&kind, server, port));

    let attrs: BTreeMap<String, Value> = map
        .iter()
        .filter_map(|(key, value)| Some((key.as_str()?, value)))
        .filter(|(key, _)| !ENTRY_KEYS.contains(key))
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect();

    Some(ProxyEntry {
        name,
        kind,
        server: server.to_string(),
        port,
        attrs,
    })
}

fn parse_outbounds(items: &[JsonValue]) -> SubscriptionResult {
    let mut proxies = Vec::new();
    let mut groups = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let kind = obj.get("type").and_then(JsonValue::as_str).unwrap_or_default();
        match kind {
            "direct" | "block" | "dns" => {}
            "selector" | "urltest" => {
                if let Some(group) = group_from_outbound(obj, kind) {
                    groups.push(group);
                }
            }
            _ => match entry_from_outbound(obj) {
                Some(entry) => proxies.push(entry),
                None => debug!("skipping outbound {:?}", obj.get("tag")),
            },
        }
    }
    if proxies.is_empty() {
        return Err(SubscriptionError::NoProxiesFound);
    }
    dedup_names(&mut proxies);
    Ok(Subscription {
        proxies,
        groups,
        rules: Vec::new(),
        document: Document::ProxyList,
    })
}

fn group_from_outbound(obj: &serde_json::Map<String, JsonValue>, kind: &str) -> Option<RoutingGroup> {
    let name = obj.get("tag").and_then(JsonValue::as_str)?.to_string();
    let members = obj
        .get("outbounds")
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().filter_map(JsonValue::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let mut group = RoutingGroup::select(name, members);
    if kind == "urltest" {
        group.kind = "url-test".to_string();
        if let Some(url) = obj.get("url").and_then(JsonValue::as_str) {
            group.extra.insert("url".to_string(), url.into());
        }
    }
    Some(group)
}

fn json_to_yaml(value: &JsonValue) -> Option<Value> {
    serde_yaml::to_value(value).ok()
}

// sing-box spells most options differently from the engine's proxy list;
// only the fields every protocol needs are translated.
fn entry_from_outbound(obj: &serde_json::Map<String, JsonValue>) -> Option<ProxyEntry> {
    let kind = ProxyKind::from_type(obj.get("type").and_then(JsonValue::as_str)?);
    let server = obj.get("server").and_then(JsonValue::as_str)?.trim();
    if server.is_empty() {
        return None;
    }
    let port = obj
        .get("server_port")
        .and_then(JsonValue::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)?;
    let name = obj
        .get("tag")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| ProxyEntry::placeholder_name(&kind, server, port));

    let mut entry = ProxyEntry::new(name, kind.clone(), server, port);
    let text = |key: &str| obj.get(key).and_then(JsonValue::as_str).map(str::to_string);
    match kind {
        ProxyKind::Shadowsocks => {
            entry = entry
                .with_attr("cipher", text("method")?)
                .with_attr("password", text("password")?);
        }
        ProxyKind::Vmess => {
            entry = entry
                .with_attr("uuid", text("uuid")?)
                .with_attr("alterId", obj.get("alter_id").and_then(JsonValue::as_u64).unwrap_or(0))
                .with_attr("cipher", text("security").unwrap_or_else(|| "auto".to_string()));
        }
        ProxyKind::Trojan => {
            entry = entry.with_attr("password", text("password")?);
        }
        ProxyKind::Vless => {
            entry = entry.with_attr("uuid", text("uuid")?);
            if let Some(flow) = text("flow") {
                entry = entry.with_attr("flow", flow);
            }
        }
        ProxyKind::Other(_) => {
            for (key, value) in obj {
                if matches!(key.as_str(), "type" | "tag" | "server" | "server_port") {
                    continue;
                }
                if let Some(value) = json_to_yaml(value) {
                    entry.attrs.insert(key.clone(), value);
                }
            }
            return Some(entry);
        }
    }

    if let Some(tls) = obj.get("tls").and_then(JsonValue::as_object) {
        let enabled = tls.get("enabled").and_then(JsonValue::as_bool).unwrap_or(false);
        if enabled {
            entry = entry.with_attr("tls", true);
            if let Some(sni) = tls.get("server_name").and_then(JsonValue::as_str) {
                let key = if entry.kind == ProxyKind::Trojan { "sni" } else { "servername" };
                entry = entry.with_attr(key, sni);
            }
        }
    }
    if let Some(transport) = obj.get("transport").and_then(JsonValue::as_object) {
        if let Some(network) = transport.get("type").and_then(JsonValue::as_str) {
            entry = entry.with_attr("network", network);
        }
    }
    Some(entry)
}
