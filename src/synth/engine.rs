use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_yaml::Value;
use tracing::debug;

use crate::error::ArtifactError;
use crate::settings::Settings;
use crate::subscription::{ProxyEntry, RoutingDocument, RoutingGroup, RoutingRule, Subscription};

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const DEFAULT_GROUP: &str = "Server-Auto";

/// The proxy-engine configuration document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    pub port: u16,
    pub socks_port: u16,
    pub allow_lan: bool,
    pub mode: String,
    pub log_level: String,
    pub external_controller: String,
    pub geo_auto_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
    pub proxies: Vec<Value>,
    pub proxy_groups: Vec<RoutingGroup>,
    pub rules: Vec<String>,
}

impl EngineConfig {
    pub fn to_yaml(&self) -> Result<String, ArtifactError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), ArtifactError> {
        fs::write(path, self.to_yaml()?).map_err(|e| ArtifactError::io(path, e))
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.proxy_groups.iter().map(|group| group.name.as_str())
    }
}

pub fn synthesize_engine_config(subscription: &Subscription, socks_port: u16, settings: &Settings) -> EngineConfig {
    synthesize_engine_config_from_parts(
        &subscription.proxies,
        &subscription.groups,
        &subscription.rules,
        subscription.routing_document(),
        socks_port,
        settings,
    )
}

/// Builds the engine document. Pure: identical inputs give identical output.
///
/// With a routing document the raw proxies and DNS block are reused and the
/// listener, controller and mode keys are overlaid. Groups survive only when
/// their name contains one of `settings.group_keywords`; rules survive only
/// when they target a surviving group, `DIRECT` or `REJECT`.
pub fn synthesize_engine_config_from_parts(
    proxies: &[ProxyEntry],
    groups: &[RoutingGroup],
    rules: &[RoutingRule],
    document: Option<&RoutingDocument>,
    socks_port: u16,
    settings: &Settings,
) -> EngineConfig {
    let proxy_values = match document {
        Some(doc) => doc.proxies.clone(),
        None => proxies.iter().map(ProxyEntry::to_engine_value).collect(),
    };
    let proxy_names: HashSet<&str> = proxies.iter().map(|entry| entry.name.as_str()).collect();

    let mut kept_groups = filter_groups(groups, &proxy_names, &settings.group_keywords);
    let kept_rules = if kept_groups.is_empty() {
        if !groups.is_empty() {
            debug!("no routing group matched the naming convention, using default group");
        }
        kept_groups = vec![default_group(proxies)];
        default_rules(rules)
    } else {
        let names: HashSet<&str> = kept_groups.iter().map(|group| group.name.as_str()).collect();
        filter_rules(rules, &names)
    };

    EngineConfig {
        port: settings.bundled_http_port,
        socks_port,
        allow_lan: false,
        mode: "rule".to_string(),
        log_level: "info".to_string(),
        external_controller: settings.bundled_controller.clone(),
        geo_auto_update: false,
        dns: document.and_then(|doc| doc.dns.clone()),
        proxies: proxy_values,
        proxy_groups: kept_groups,
        rules: kept_rules.iter().map(RoutingRule::to_line).collect(),
    }
}

pub fn matches_keywords(name: &str, keywords: &[String]) -> bool {
    let name = name.to_lowercase();
    keywords.iter().any(|keyword| name.contains(&keyword.to_lowercase()))
}

fn is_builtin(target: &str) -> bool {
    target == DIRECT || target == REJECT
}

/// Keeps groups matching the naming convention, prunes members that point
/// nowhere, and drops groups left empty until nothing changes.
pub fn filter_groups(groups: &[RoutingGroup], proxy_names: &HashSet<&str>, keywords: &[String]) -> Vec<RoutingGroup> {
    let mut kept: Vec<RoutingGroup> = groups
        .iter()
        .filter(|group| matches_keywords(&group.name, keywords))
        .cloned()
        .collect();

    loop {
        let before = kept.len();
        let names: HashSet<String> = kept.iter().map(|group| group.name.clone()).collect();
        for group in &mut kept {
            let own = group.name.clone();
            group.proxies.retain(|member| {
                proxy_names.contains(member.as_str())
                    || is_builtin(member)
                    || (member != &own && names.contains(member))
            });
        }
        kept.retain(|group| !group.proxies.is_empty());
        if kept.len() == before {
            return kept;
        }
    }
}

/// Keeps rules aimed at a surviving group or a builtin target and makes sure
/// a catch-all closes the list.
pub fn filter_rules(rules: &[RoutingRule], group_names: &HashSet<&str>) -> Vec<RoutingRule> {
    let mut kept: Vec<RoutingRule> = rules
        .iter()
        .filter(|rule| !rule.is_rule_set())
        .filter(|rule| group_names.contains(rule.target.as_str()) || is_builtin(&rule.target))
        .cloned()
        .collect();
    if !kept.iter().any(RoutingRule::is_catch_all) {
        kept.push(RoutingRule::catch_all(DIRECT));
    }
    kept
}

fn default_group(proxies: &[ProxyEntry]) -> RoutingGroup {
    let members = if proxies.is_empty() {
        vec![DIRECT.to_string()]
    } else {
        proxies.iter().map(|entry| entry.name.clone()).collect()
    };
    RoutingGroup::select(DEFAULT_GROUP, members)
}

fn default_rules(rules: &[RoutingRule]) -> Vec<RoutingRule> {
    let mut kept: Vec<RoutingRule> = rules
        .iter()
        .filter(|rule| !rule.is_rule_set() && !rule.is_catch_all() && is_builtin(&rule.target))
        .cloned()
        .collect();
    kept.push(RoutingRule::catch_all(DEFAULT_GROUP));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{parse, ProxyKind};

    fn entry(name: &str) -> ProxyEntry {
        ProxyEntry::new(name, ProxyKind::Trojan, "h.example", 443).with_attr("password", "pw")
    }

    fn rule(line: &str) -> RoutingRule {
        RoutingRule::parse(line).unwrap()
    }

    #[test]
    fn groups_and_rules_follow_naming_convention() {
        let proxies = vec![entry("us-1"), entry("other-1")];
        let groups = vec![
            RoutingGroup::select("Server-US", vec!["us-1".into()]),
            RoutingGroup::select("Other", vec!["other-1".into()]),
        ];
        let rules = vec![
            rule("DOMAIN-SUFFIX,us.example,Server-US"),
            rule("DOMAIN-SUFFIX,other.example,Other"),
            rule("MATCH,Other"),
        ];
        let config = synthesize_engine_config_from_parts(&proxies, &groups, &rules, None, 17897, &Settings::default());
        assert_eq!(config.group_names().collect::<Vec<_>>(), vec!["Server-US"]);
        assert_eq!(config.rules, vec!["DOMAIN-SUFFIX,us.example,Server-US", "MATCH,DIRECT"]);
    }

    #[test]
    fn rule_set_references_are_discarded() {
        let names: HashSet<&str> = ["Server-A"].into_iter().collect();
        let rules = vec![rule("RULE-SET,ads,REJECT"), rule("GEOIP,CN,DIRECT"), rule("MATCH,Server-A")];
        let kept: Vec<String> = filter_rules(&rules, &names).iter().map(RoutingRule::to_line).collect();
        assert_eq!(kept, vec!["GEOIP,CN,DIRECT", "MATCH,Server-A"]);
    }

    #[test]
    fn groups_emptied_by_member_pruning_are_dropped() {
        let proxies = vec![entry("a")];
        let names: HashSet<&str> = proxies.iter().map(|p| p.name.as_str()).collect();
        let groups = vec![
            RoutingGroup::select("auto-ghost", vec!["missing".into()]),
            RoutingGroup::select("server-chain", vec!["auto-ghost".into()]),
            RoutingGroup::select("server-real", vec!["a".into(), "missing".into()]),
        ];
        let keywords = Settings::default().group_keywords;
        let kept = filter_groups(&groups, &names, &keywords);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "server-real");
        assert_eq!(kept[0].proxies, vec!["a"]);
    }

    #[test]
    fn bare_list_gets_default_group_and_catch_all() {
        let proxies = vec![entry("a"), entry("b")];
        let config = synthesize_engine_config_from_parts(&proxies, &[], &[], None, 20000, &Settings::default());
        assert_eq!(config.socks_port, 20000);
        assert!(!config.allow_lan);
        assert_eq!(config.mode, "rule");
        assert_eq!(config.proxy_groups.len(), 1);
        assert_eq!(config.proxy_groups[0].proxies, vec!["a", "b"]);
        assert_eq!(config.rules, vec![format!("MATCH,{DEFAULT_GROUP}")]);
        assert_eq!(config.proxies[0].get("type").and_then(Value::as_str), Some("trojan"));
    }

    #[test]
    fn empty_list_gets_direct_placeholder_group() {
        let config = synthesize_engine_config_from_parts(&[], &[], &[], None, 17897, &Settings::default());
        assert_eq!(config.proxy_groups[0].proxies, vec![DIRECT]);
    }

    #[test]
    fn routing_document_is_overlaid() {
        let body = "port: 1234\nallow-lan: true\nmode: global\nproxies:\n  - {name: n1, type: ss, server: a.example, port: 8388, cipher: aes-128-gcm, password: pw}\nproxy-groups:\n  - {name: Auto-Best, type: url-test, proxies: [n1], url: 'http://t.example', interval: 300}\nrules:\n  - DOMAIN,x.example,Auto-Best\ndns:\n  enable: true\n";
        let subscription = parse(body).unwrap();
        let config = synthesize_engine_config(&subscription, 17897, &Settings::default());
        assert_eq!(config.port, 17890);
        assert!(!config.allow_lan);
        assert_eq!(config.mode, "rule");
        assert!(!config.geo_auto_update);
        assert!(config.dns.is_some());
        assert_eq!(config.proxy_groups[0].extra.get("interval").and_then(Value::as_u64), Some(300));
        assert_eq!(config.rules.last().map(String::as_str), Some("MATCH,DIRECT"));

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("socks-port: 17897"));
        assert!(yaml.contains("external-controller: 127.0.0.1:17899"));
        assert!(yaml.contains("geo-auto-update: false"));
    }

    #[test]
    fn unmatched_groups_fall_back_to_default_group() {
        let proxies = vec![entry("a")];
        let groups = vec![RoutingGroup::select("Proxy", vec!["a".into()])];
        let rules = vec![rule("DOMAIN,x.example,Proxy"), rule("GEOIP,CN,DIRECT"), rule("MATCH,Proxy")];
        let config = synthesize_engine_config_from_parts(&proxies, &groups, &rules, None, 17897, &Settings::default());
        assert_eq!(config.group_names().collect::<Vec<_>>(), vec![DEFAULT_GROUP]);
        assert_eq!(config.rules, vec!["GEOIP,CN,DIRECT".to_string(), format!("MATCH,{DEFAULT_GROUP}")]);
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let keywords = Settings::default().group_keywords;
        assert!(matches_keywords("SERVER-HK", &keywords));
        assert!(matches_keywords("My Auto-Select", &keywords));
        assert!(!matches_keywords("Servers", &keywords));
    }

    #[test]
    fn nameless_routing_proxies_match_group_members() {
        let body = "proxies:\n  - {type: trojan, server: t.example, port: 443, password: pw}\n  - {type: trojan, server: t.example, port: 443, password: pw2}\n";
        let subscription = parse(body).unwrap();
        let config = synthesize_engine_config(&subscription, 17897, &Settings::default());
        let names: Vec<&str> = config
            .proxies
            .iter()
            .filter_map(|proxy| proxy.get("name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["trojan-t.example:443", "trojan-t.example:443-2"]);
        assert_eq!(config.proxy_groups[0].proxies, names);
    }
}
