use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Identity used for leadership and as owner of installed groups.
    pub app_id: String,
    pub member_id: String,
    /// Address of this member, programmed as an OpenFlow controller.
    pub member_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes_file: Option<PathBuf>,
    /// Management port for node entries that do not declare one.
    pub ovsdb_port: u16,
    pub openflow_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: "org.fabric.node".into(),
            member_id: "local".into(),
            member_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            nodes_file: None,
            ovsdb_port: 6640,
            openflow_port: 6653,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then `fabric-node.toml`, then `fabric-node.json`, then
    /// `FABRIC_*` environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("fabric-node.toml"))
            .merge(Json::file("fabric-node.json"))
            .merge(Env::prefixed("FABRIC_"))
    }

    pub fn extract(figment: Figment) -> anyhow::Result<Self> {
        figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }
}

#[derive(Debug, Default, Deserialize)]
struct NodeSet {
    #[serde(default)]
    nodes: Vec<Value>,
}

/// Reads the declared node set.  `.json` files are read as JSON, anything
/// else as TOML.  Entries are returned unparsed so one bad entry cannot
/// reject the whole file.
pub fn load_node_set(path: &Path) -> anyhow::Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read node set {}", path.display()))?;
    let figment = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Figment::from(Json::string(&text)),
        _ => Figment::from(Toml::string(&text)),
    };
    let set: NodeSet = figment
        .extract()
        .map_err(|e| anyhow::anyhow!("Invalid node set {}: {}", path.display(), e))?;
    Ok(set.nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::extract(Figment::from(Serialized::defaults(Config::default())))
            .unwrap();
        assert_eq!(config.app_id, "org.fabric.node");
        assert_eq!(config.ovsdb_port, 6640);
        assert_eq!(config.openflow_port, 6653);
        assert!(config.nodes_file.is_none());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
            r#"
            member_id = "node-b"
            member_ip = "172.16.0.2"
            nodes_file = "/etc/fabric/nodes.toml"
            "#,
        ));
        let config = Config::extract(figment).unwrap();
        assert_eq!(config.member_id, "node-b");
        assert_eq!(config.member_ip, "172.16.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(
            config.nodes_file.as_deref(),
            Some(Path::new("/etc/fabric/nodes.toml"))
        );
        assert_eq!(config.app_id, "org.fabric.node");
    }
}
