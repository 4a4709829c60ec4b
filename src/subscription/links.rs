use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value};
use url::Url;

use super::base64::decode_base64_to_string;
use super::{ProxyEntry, ProxyKind};

/// Parses one share link. Any malformed link yields `None`.
pub fn parse_share_link(link: &str) -> Option<ProxyEntry> {
    let trimmed = link.trim();
    let (scheme, _) = trimmed.split_once("://")?;
    match scheme.to_ascii_lowercase().as_str() {
        "ss" => parse_ss(trimmed),
        "vmess" => parse_vmess(trimmed),
        "trojan" => parse_trojan(trimmed),
        "vless" => parse_vless(trimmed),
        "ssr" => parse_ssr(trimmed),
        "hysteria2" | "hy2" => parse_hysteria2(trimmed),
        _ => None,
    }
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn fragment_name(fragment: Option<&str>, fallback: &str) -> String {
    let name = fragment.map(percent_decode).unwrap_or_default();
    let name = name.trim();
    if name.is_empty() {
        fallback.to_string()
    } else {
        name.to_string()
    }
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in query.split('&').filter(|part| !part.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        params.insert(
            percent_decode(&key.replace('+', " ")).to_lowercase(),
            percent_decode(&value.replace('+', " ")),
        );
    }
    params
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn nonzero_port(port: u16) -> Option<u16> {
    (port != 0).then_some(port)
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

fn parse_host_port(value: &str) -> Option<(String, u16)> {
    let value = value.trim().trim_end_matches('/');
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse::<u16>().ok()?;
        return Some((host.to_string(), nonzero_port(port)?));
    }
    let (host, port) = value.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), nonzero_port(port.parse().ok()?)?))
}

fn split_method_password(value: &str) -> Option<(String, String)> {
    let (method, password) = value.split_once(':')?;
    if method.is_empty() {
        return None;
    }
    Some((method.to_string(), password.to_string()))
}

fn ss_userinfo(userinfo: &str) -> Option<(String, String)> {
    let literal = percent_decode(userinfo);
    decode_base64_to_string(&literal)
        .and_then(|decoded| split_method_password(&decoded))
        .or_else(|| split_method_password(&literal))
}

fn parse_ss(link: &str) -> Option<ProxyEntry> {
    let raw = &link["ss://".len()..];
    let (body, fragment) = match raw.split_once('#') {
        Some((body, fragment)) => (body, Some(fragment)),
        None => (raw, None),
    };
    let (payload, query) = body.split_once('?').unwrap_or((body, ""));

    let (method, password, server, port) = match payload.rsplit_once('@') {
        Some((userinfo, hostpart)) => {
            let (method, password) = ss_userinfo(userinfo)?;
            let (server, port) = parse_host_port(hostpart)?;
            (method, password, server, port)
        }
        None => {
            let decoded = decode_base64_to_string(payload)?;
            let (userinfo, hostpart) = decoded.rsplit_once('@')?;
            let (method, password) = split_method_password(userinfo)?;
            let (server, port) = parse_host_port(hostpart)?;
            (method, password, server, port)
        }
    };

    let mut entry = ProxyEntry::new(fragment_name(fragment, "SS Server"), ProxyKind::Shadowsocks, server, port)
        .with_attr("cipher", method)
        .with_attr("password", password);

    let params = parse_query(query);
    if let Some(plugin) = params.get("plugin") {
        let mut parts = plugin.split(';');
        if let Some(name) = parts.next().filter(|name| !name.is_empty()) {
            entry = entry.with_attr("plugin", name);
            let mut opts = Mapping::new();
            for opt in parts.filter(|opt| !opt.is_empty()) {
                let (key, value) = opt.split_once('=').unwrap_or((opt, "true"));
                opts.insert(key.into(), value.into());
            }
            if !opts.is_empty() {
                entry = entry.with_attr("plugin-opts", Value::Mapping(opts));
            }
        }
    }
    Some(entry)
}

fn json_str<'a>(obj: &'a serde_json::Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn json_u64(obj: &serde_json::Map<String, JsonValue>, key: &str) -> Option<u64> {
    obj.get(key).and_then(|value| {
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

fn ws_opts(path: Option<&str>, host: Option<&str>) -> Value {
    let mut opts = Mapping::new();
    if let Some(path) = path {
        opts.insert("path".into(), path.into());
    }
    if let Some(host) = host {
        let mut headers = Mapping::new();
        headers.insert("Host".into(), host.into());
        opts.insert("headers".into(), Value::Mapping(headers));
    }
    Value::Mapping(opts)
}

fn grpc_opts(service: &str) -> Value {
    let mut opts = Mapping::new();
    opts.insert("grpc-service-name".into(), service.into());
    Value::Mapping(opts)
}

fn with_transport(mut entry: ProxyEntry, network: &str, path: Option<&str>, host: Option<&str>) -> ProxyEntry {
    match network {
        "ws" => entry = entry.with_attr("ws-opts", ws_opts(path, host)),
        "grpc" => {
            if let Some(service) = path {
                entry = entry.with_attr("grpc-opts", grpc_opts(service));
            }
        }
        _ => {}
    }
    entry
}

fn parse_vmess(link: &str) -> Option<ProxyEntry> {
    let decoded = decode_base64_to_string(&link["vmess://".len()..])?;
    let raw: JsonValue = serde_json::from_str(&decoded).ok()?;
    let obj = raw.as_object()?;

    let server = json_str(obj, "add")?;
    let port = nonzero_port(u16::try_from(json_u64(obj, "port")?).ok()?)?;
    let uuid = json_str(obj, "id")?;
    let name = json_str(obj, "ps").unwrap_or("VMess Server");
    let network = json_str(obj, "net").unwrap_or("tcp").to_ascii_lowercase();
    let tls = json_str(obj, "tls").map_or(false, |value| value.eq_ignore_ascii_case("tls"));

    let mut entry = ProxyEntry::new(name, ProxyKind::Vmess, server, port)
        .with_attr("uuid", uuid)
        .with_attr("alterId", json_u64(obj, "aid").unwrap_or(0))
        .with_attr("cipher", json_str(obj, "scy").unwrap_or("auto"))
        .with_attr("network", network.as_str())
        .with_attr("tls", tls);
    if let Some(sni) = json_str(obj, "sni") {
        entry = entry.with_attr("servername", sni);
    }
    Some(with_transport(entry, &network, json_str(obj, "path"), json_str(obj, "host")))
}

struct Authority {
    user: String,
    server: String,
    port: u16,
    params: HashMap<String, String>,
    fragment: Option<String>,
}

fn authority(link: &str) -> Option<Authority> {
    let url = Url::parse(link).ok()?;
    let user = percent_decode(url.username());
    if user.is_empty() {
        return None;
    }
    let server = strip_brackets(url.host_str()?).to_string();
    if server.is_empty() {
        return None;
    }
    let port = nonzero_port(url.port()?)?;
    Some(Authority {
        user,
        server,
        port,
        params: query_map(&url),
        fragment: url.fragment().map(str::to_string),
    })
}

fn parse_trojan(link: &str) -> Option<ProxyEntry> {
    let auth = authority(link)?;
    let name = fragment_name(auth.fragment.as_deref(), "Trojan Server");
    let params = &auth.params;
    let mut entry = ProxyEntry::new(name, ProxyKind::Trojan, auth.server, auth.port)
        .with_attr("password", auth.user.as_str());
    if let Some(sni) = params.get("sni").or_else(|| params.get("peer")) {
        entry = entry.with_attr("sni", sni.as_str());
    }
    if params.get("allowinsecure").map_or(false, |v| is_truthy(v)) {
        entry = entry.with_attr("skip-cert-verify", true);
    }
    let network = params.get("type").map(|v| v.to_ascii_lowercase()).unwrap_or_default();
    if !network.is_empty() && network != "tcp" {
        entry = entry.with_attr("network", network.as_str());
    }
    let path = params.get("path").or_else(|| params.get("servicename"));
    Some(with_transport(entry, &network, path.map(String::as_str), params.get("host").map(String::as_str)))
}

fn parse_vless(link: &str) -> Option<ProxyEntry> {
    let auth = authority(link)?;
    let name = fragment_name(auth.fragment.as_deref(), "VLESS Server");
    let params = &auth.params;
    let network = params.get("type").map(|v| v.to_ascii_lowercase()).unwrap_or_else(|| "tcp".to_string());
    let security = params.get("security").map(|v| v.to_ascii_lowercase()).unwrap_or_default();
    let tls = security == "tls" || security == "reality";

    let mut entry = ProxyEntry::new(name, ProxyKind::Vless, auth.server, auth.port)
        .with_attr("uuid", auth.user.as_str())
        .with_attr("network", network.as_str())
        .with_attr("tls", tls);
    if let Some(sni) = params.get("sni") {
        entry = entry.with_attr("servername", sni.as_str());
    }
    if let Some(flow) = params.get("flow").filter(|flow| !flow.is_empty()) {
        entry = entry.with_attr("flow", flow.as_str());
    }
    if let Some(fp) = params.get("fp").filter(|fp| !fp.is_empty()) {
        entry = entry.with_attr("client-fingerprint", fp.as_str());
    }
    if security == "reality" {
        let mut reality = Mapping::new();
        if let Some(pbk) = params.get("pbk") {
            reality.insert("public-key".into(), pbk.as_str().into());
        }
        if let Some(sid) = params.get("sid") {
            reality.insert("short-id".into(), sid.as_str().into());
        }
        if !reality.is_empty() {
            entry = entry.with_attr("reality-opts", Value::Mapping(reality));
        }
    }
    let path = params.get("path").or_else(|| params.get("servicename"));
    Some(with_transport(entry, &network, path.map(String::as_str), params.get("host").map(String::as_str)))
}

fn parse_hysteria2(link: &str) -> Option<ProxyEntry> {
    let auth = authority(link)?;
    let name = fragment_name(auth.fragment.as_deref(), "Hysteria2 Server");
    let params = &auth.params;
    let mut entry = ProxyEntry::new(name, ProxyKind::Other("hysteria2".to_string()), auth.server, auth.port)
        .with_attr("password", auth.user.as_str());
    if let Some(sni) = params.get("sni") {
        entry = entry.with_attr("sni", sni.as_str());
    }
    if let Some(obfs) = params.get("obfs") {
        entry = entry.with_attr("obfs", obfs.as_str());
        if let Some(password) = params.get("obfs-password") {
            entry = entry.with_attr("obfs-password", password.as_str());
        }
    }
    if params.get("insecure").map_or(false, |v| is_truthy(v)) {
        entry = entry.with_attr("skip-cert-verify", true);
    }
    Some(entry)
}

// ssr://base64(host:port:protocol:method:obfs:base64(password)/?obfsparam=..&remarks=..)
fn parse_ssr(link: &str) -> Option<ProxyEntry> {
    let decoded = decode_base64_to_string(&link["ssr://".len()..])?;
    let (main, query) = decoded.split_once("/?").unwrap_or((decoded.as_str(), ""));
    let mut fields = main.rsplitn(6, ':');
    let password = decode_base64_to_string(fields.next()?)?;
    let obfs = fields.next()?;
    let method = fields.next()?;
    let protocol = fields.next()?;
    let port = nonzero_port(fields.next()?.parse().ok()?)?;
    let server = strip_brackets(fields.next()?).to_string();
    if server.is_empty() {
        return None;
    }

    let params = parse_query(query);
    let param = |key: &str| {
        params
            .get(key)
            .and_then(|value| decode_base64_to_string(value))
            .filter(|value| !value.is_empty())
    };
    let name = param("remarks").unwrap_or_else(|| "SSR Server".to_string());
    let mut entry = ProxyEntry::new(name, ProxyKind::Other("ssr".to_string()), server, port)
        .with_attr("cipher", method)
        .with_attr("password", password)
        .with_attr("protocol", protocol)
        .with_attr("obfs", obfs);
    if let Some(value) = param("obfsparam") {
        entry = entry.with_attr("obfs-param", value);
    }
    if let Some(value) = param("protoparam") {
        entry = entry.with_attr("protocol-param", value);
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    #[test]
    fn ss_with_base64_userinfo() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:secret");
        let link = format!("ss://{userinfo}@1.2.3.4:8388#My%20Node");
        let entry = parse_share_link(&link).unwrap();
        assert_eq!(entry.kind, ProxyKind::Shadowsocks);
        assert_eq!(entry.name, "My Node");
        assert_eq!(entry.server, "1.2.3.4");
        assert_eq!(entry.port, 8388);
        assert_eq!(entry.attr_str("cipher"), Some("aes-256-gcm"));
        assert_eq!(entry.attr_str("password"), Some("secret"));
    }

    #[test]
    fn ss_with_literal_userinfo() {
        let entry = parse_share_link("ss://chacha20-ietf-poly1305:pa55@host.example:443").unwrap();
        assert_eq!(entry.name, "SS Server");
        assert_eq!(entry.attr_str("cipher"), Some("chacha20-ietf-poly1305"));
        assert_eq!(entry.attr_str("password"), Some("pa55"));
    }

    #[test]
    fn ss_fully_encoded() {
        let body = STANDARD.encode("aes-128-gcm:pw@10.0.0.1:9000");
        let entry = parse_share_link(&format!("ss://{body}#legacy")).unwrap();
        assert_eq!(entry.server, "10.0.0.1");
        assert_eq!(entry.port, 9000);
        assert_eq!(entry.name, "legacy");
    }

    #[test]
    fn ss_plugin_query() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-128-gcm:pw");
        let link = format!("ss://{userinfo}@h.example:8388/?plugin=obfs-local%3Bobfs%3Dhttp%3Bobfs-host%3Dcdn.example#p");
        let entry = parse_share_link(&link).unwrap();
        assert_eq!(entry.attr_str("plugin"), Some("obfs-local"));
        let opts = entry.attrs.get("plugin-opts").unwrap();
        assert_eq!(opts.get("obfs").and_then(Value::as_str), Some("http"));
    }

    #[test]
    fn ss_rejects_bad_port() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-128-gcm:pw");
        assert!(parse_share_link(&format!("ss://{userinfo}@h.example:0")).is_none());
        assert!(parse_share_link(&format!("ss://{userinfo}@h.example:99999")).is_none());
        assert!(parse_share_link(&format!("ss://{userinfo}@h.example")).is_none());
    }

    #[test]
    fn vmess_fields_and_defaults() {
        let json = r#"{"v":"2","ps":"JP-1","add":"jp.example.com","port":"443","id":"b831381d-6324-4d53-ad4f-8cda48b30811","aid":"0","net":"ws","path":"/ray","host":"cdn.example.com","tls":"tls"}"#;
        let entry = parse_share_link(&format!("vmess://{}", STANDARD.encode(json))).unwrap();
        assert_eq!(entry.kind, ProxyKind::Vmess);
        assert_eq!(entry.name, "JP-1");
        assert_eq!(entry.port, 443);
        assert_eq!(entry.attr_str("cipher"), Some("auto"));
        assert_eq!(entry.attr_str("network"), Some("ws"));
        assert_eq!(entry.attrs.get("tls"), Some(&Value::Bool(true)));
        assert_eq!(entry.attrs.get("alterId").and_then(Value::as_u64), Some(0));
        assert!(entry.attrs.contains_key("ws-opts"));
    }

    #[test]
    fn vmess_numeric_port_and_plain_tcp() {
        let json = r#"{"ps":"","add":"h.example","port":8080,"id":"uuid-1","aid":2,"scy":"aes-128-gcm"}"#;
        let entry = parse_share_link(&format!("vmess://{}", STANDARD.encode(json))).unwrap();
        assert_eq!(entry.name, "VMess Server");
        assert_eq!(entry.port, 8080);
        assert_eq!(entry.attr_str("network"), Some("tcp"));
        assert_eq!(entry.attrs.get("tls"), Some(&Value::Bool(false)));
        assert_eq!(entry.attr_str("cipher"), Some("aes-128-gcm"));
    }

    #[test]
    fn vmess_missing_host_is_dropped() {
        let json = r#"{"ps":"x","port":443,"id":"uuid"}"#;
        assert!(parse_share_link(&format!("vmess://{}", STANDARD.encode(json))).is_none());
    }

    #[test]
    fn trojan_with_sni() {
        let entry = parse_share_link("trojan://p%40ss@t.example.com:443?sni=front.example.com#%F0%9F%87%BA%F0%9F%87%B8%20US").unwrap();
        assert_eq!(entry.kind, ProxyKind::Trojan);
        assert_eq!(entry.attr_str("password"), Some("p@ss"));
        assert_eq!(entry.attr_str("sni"), Some("front.example.com"));
        assert!(entry.name.ends_with("US"));
    }

    #[test]
    fn trojan_default_name_and_missing_parts() {
        assert_eq!(parse_share_link("trojan://pw@t.example.com:443").unwrap().name, "Trojan Server");
        assert!(parse_share_link("trojan://@t.example.com:443").is_none());
        assert!(parse_share_link("trojan://pw@t.example.com").is_none());
    }

    #[test]
    fn vless_reality_counts_as_tls() {
        let link = "vless://0c7a5d3e@v.example.com:443?type=grpc&security=reality&sni=www.example.com&pbk=KEY&sid=ab&serviceName=svc&fp=chrome#R";
        let entry = parse_share_link(link).unwrap();
        assert_eq!(entry.kind, ProxyKind::Vless);
        assert_eq!(entry.attrs.get("tls"), Some(&Value::Bool(true)));
        assert_eq!(entry.attr_str("network"), Some("grpc"));
        assert_eq!(entry.attr_str("servername"), Some("www.example.com"));
        assert!(entry.attrs.contains_key("reality-opts"));
        assert!(entry.attrs.contains_key("grpc-opts"));
    }

    #[test]
    fn vless_without_security_is_plain() {
        let entry = parse_share_link("vless://id@[2001:db8::1]:8443").unwrap();
        assert_eq!(entry.server, "2001:db8::1");
        assert_eq!(entry.name, "VLESS Server");
        assert_eq!(entry.attrs.get("tls"), Some(&Value::Bool(false)));
    }

    #[test]
    fn ssr_decodes_to_passthrough() {
        let password = URL_SAFE_NO_PAD.encode("pw");
        let remarks = URL_SAFE_NO_PAD.encode("HK SSR");
        let body = format!("hk.example.com:8989:auth_aes128_md5:aes-256-cfb:tls1.2_ticket_auth:{password}/?remarks={remarks}");
        let entry = parse_share_link(&format!("ssr://{}", URL_SAFE_NO_PAD.encode(body))).unwrap();
        assert_eq!(entry.kind, ProxyKind::Other("ssr".into()));
        assert_eq!(entry.name, "HK SSR");
        assert_eq!(entry.port, 8989);
        assert_eq!(entry.attr_str("protocol"), Some("auth_aes128_md5"));
        assert_eq!(entry.attr_str("password"), Some("pw"));
    }

    #[test]
    fn hysteria2_short_scheme() {
        let entry = parse_share_link("hy2://secret@h.example:8443?sni=h.example&insecure=1#hy").unwrap();
        assert_eq!(entry.kind.as_str(), "hysteria2");
        assert_eq!(entry.attrs.get("skip-cert-verify"), Some(&Value::Bool(true)));
    }

    #[test]
    fn unknown_scheme_is_none() {
        assert!(parse_share_link("socks5://h.example:1080").is_none());
        assert!(parse_share_link("not a link").is_none());
    }
}
