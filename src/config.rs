//! Gateway configuration: a TOML file for nodes and client keys, plus runtime tunables.
//!
//! The file is validated once at startup. A configuration that loads is
//! guaranteed to have unique, non-empty node names and absolute http(s) node
//! addresses.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::registry::{NodeDescriptor, NodeRegistry};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration:\n{0}")]
    Validation(String),
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub client_api_keys: HashSet<String>,
    pub health_timeout: Duration,
    pub discovery_timeout: Duration,
    pub forward_timeout: Duration,
    pub upstream_connect_timeout: Duration,
    /// Zero disables the periodic refresh loop.
    pub discovery_refresh: Duration,
    pub max_request_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            client_api_keys: HashSet::new(),
            health_timeout: Duration::from_millis(2_000),
            discovery_timeout: Duration::from_millis(5_000),
            forward_timeout: Duration::from_millis(300_000),
            upstream_connect_timeout: Duration::from_millis(2_000),
            discovery_refresh: Duration::from_secs(300),
            max_request_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    listen_addr: Option<SocketAddr>,
    #[serde(default)]
    client_api_keys: Vec<String>,
    #[serde(default)]
    nodes: Vec<NodeConfig>,
    discovery_refresh_secs: Option<u64>,
    health_timeout_ms: Option<u64>,
    discovery_timeout_ms: Option<u64>,
    forward_timeout_ms: Option<u64>,
    max_request_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct NodeConfig {
    name: String,
    address: String,
    #[serde(default, alias = "credential")]
    api_key: String,
    models: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub app: AppConfig,
    pub registry: NodeRegistry,
}

pub fn load_from_file(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

pub fn load_from_str(content: &str, source_name: &str) -> Result<LoadedConfig, ConfigError> {
    let file: FileConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut nodes = Vec::with_capacity(file.nodes.len());

    for (idx, node) in file.nodes.into_iter().enumerate() {
        let name = node.name.trim().to_string();
        if name.is_empty() {
            errors.push(format!("nodes[{idx}]: name must not be empty"));
            continue;
        }
        if !seen.insert(name.clone()) {
            errors.push(format!("nodes[{idx}]: duplicate node name {name:?}"));
            continue;
        }
        let address = match parse_node_address(&node.address) {
            Ok(address) => address,
            Err(reason) => {
                errors.push(format!("node {name:?}: {reason}"));
                continue;
            }
        };
        let declared = node.models.map(|models| {
            models
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect::<BTreeSet<_>>()
        });
        nodes.push(NodeDescriptor::new(name, address, node.api_key, declared));
    }

    if file.client_api_keys.iter().any(|k| k.trim().is_empty()) {
        errors.push("client_api_keys: keys must not be empty".to_string());
    }

    if !errors.is_empty() {
        return Err(ConfigError::Validation(errors.join("\n")));
    }

    let mut app = AppConfig {
        client_api_keys: file.client_api_keys.into_iter().collect(),
        ..AppConfig::default()
    };
    if let Some(addr) = file.listen_addr {
        app.listen_addr = addr;
    }
    if let Some(secs) = file.discovery_refresh_secs {
        app.discovery_refresh = Duration::from_secs(secs);
    }
    if let Some(ms) = file.health_timeout_ms {
        app.health_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = file.discovery_timeout_ms {
        app.discovery_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = file.forward_timeout_ms {
        app.forward_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = file.max_request_bytes {
        app.max_request_bytes = bytes;
    }

    if app.client_api_keys.is_empty() {
        tracing::warn!(
            source = source_name,
            "no client_api_keys configured; every API call will be rejected"
        );
    }

    Ok(LoadedConfig {
        app,
        registry: NodeRegistry::new(nodes),
    })
}

fn parse_node_address(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid address {raw:?}: {e}"))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        "http" | "https" => Err(format!("address {raw:?} has no host")),
        other => Err(format!("address {raw:?} has unsupported scheme {other:?}")),
    }
}
