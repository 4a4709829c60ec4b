//! Derives the two on-disk artifacts from a parsed subscription: the proxy
//! engine's YAML document and the desktop client's connection file.
//!
//! Both must always be rendered with the same SOCKS port in one pass.

mod client;
mod engine;

pub use client::{escape_xml, synthesize_client_config, write_client_config};
pub use engine::{
    filter_groups, filter_rules, matches_keywords, synthesize_engine_config, synthesize_engine_config_from_parts,
    EngineConfig, DEFAULT_GROUP, DIRECT, REJECT,
};
