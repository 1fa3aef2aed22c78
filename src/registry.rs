use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use reqwest::Url;

/// A backend node as loaded from configuration. Immutable for the process lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub name: String,
    pub address: Url,
    credential: String,
    pub declared_models: Option<BTreeSet<String>>,
}

impl NodeDescriptor {
    pub fn new(
        name: impl Into<String>,
        address: Url,
        credential: impl Into<String>,
        declared_models: Option<BTreeSet<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            credential: credential.into(),
            declared_models,
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Joins `path` onto the node address, keeping any path prefix the address carries.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.address.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// Credentials must never end up in logs.
impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("name", &self.name)
            .field("address", &self.address.as_str())
            .field("declared_models", &self.declared_models)
            .finish_non_exhaustive()
    }
}

/// Read-only list of backend nodes, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<[Arc<NodeDescriptor>]>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<NodeDescriptor>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn list(&self) -> &[Arc<NodeDescriptor>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
