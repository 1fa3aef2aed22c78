use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::health::HealthChecker;
use crate::registry::{NodeDescriptor, NodeRegistry};
use crate::routing::{RouteStore, RoutingTable};

/// Builds routing tables by asking every node which models it serves.
#[derive(Debug)]
pub struct ModelDiscovery {
    client: Client,
    health: HealthChecker,
    timeout: Duration,
    // Serializes writers only; request handlers never take this lock.
    refresh_lock: Mutex<()>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshSummary {
    pub generation: u64,
    pub models: usize,
    pub nodes_listed: usize,
    pub nodes_skipped: usize,
}

#[derive(Debug)]
enum NodeScan {
    Offline,
    Listed(Vec<String>),
    Failed(anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct ModelListPayload {
    #[serde(default)]
    data: Vec<Value>,
}

impl ModelDiscovery {
    pub fn new(client: Client, health: HealthChecker, timeout: Duration) -> Self {
        Self {
            client,
            health,
            timeout,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Runs one discovery pass and installs the result into `routes`.
    pub async fn refresh(&self, registry: &NodeRegistry, routes: &RouteStore) -> RefreshSummary {
        let _guard = self.refresh_lock.lock().await;

        let (table, nodes_listed) = self.build_table(registry).await;
        let models = table.len();
        let generation = routes.install(table);

        let summary = RefreshSummary {
            generation,
            models,
            nodes_listed,
            nodes_skipped: registry.len() - nodes_listed,
        };
        tracing::info!(
            generation,
            models,
            nodes_listed,
            nodes_skipped = summary.nodes_skipped,
            "model discovery complete"
        );
        summary
    }

    /// Queries every node and assembles a complete table without publishing it.
    ///
    /// Declared models come first in each entry, then discovered ones, both in
    /// registry order. Returns the table and the number of nodes that answered
    /// their model listing.
    pub async fn build_table(&self, registry: &NodeRegistry) -> (RoutingTable, usize) {
        let nodes = registry.list();
        let scans = join_all(nodes.iter().map(|node| self.scan_node(node))).await;

        let mut builder = RoutingTable::builder();
        for node in nodes {
            for model in node.declared_models.iter().flatten() {
                builder.add_candidate(model, node);
            }
        }

        let mut nodes_listed = 0;
        for (node, scan) in nodes.iter().zip(scans) {
            match scan {
                NodeScan::Offline => {
                    tracing::warn!(
                        node = %node.name,
                        address = %node.address,
                        "node is offline; skipping model listing"
                    );
                }
                NodeScan::Failed(err) => {
                    tracing::warn!(
                        node = %node.name,
                        error = %err,
                        "node could not list models; skipping"
                    );
                }
                NodeScan::Listed(models) => {
                    nodes_listed += 1;
                    if models.is_empty() {
                        tracing::info!(node = %node.name, "node is online but reported no models");
                    }
                    for model in &models {
                        if builder.add_candidate(model, node) {
                            tracing::debug!(node = %node.name, model = %model, "discovered model");
                        }
                    }
                }
            }
        }

        (builder.build(), nodes_listed)
    }

    async fn scan_node(&self, node: &Arc<NodeDescriptor>) -> NodeScan {
        if !self.health.check(&node.address).await {
            return NodeScan::Offline;
        }
        match fetch_model_ids(&self.client, node, self.timeout).await {
            Ok(models) => NodeScan::Listed(models),
            Err(err) => NodeScan::Failed(err),
        }
    }
}

pub async fn fetch_model_ids(
    client: &Client,
    node: &NodeDescriptor,
    timeout: Duration,
) -> anyhow::Result<Vec<String>> {
    let payload = client
        .get(node.endpoint("/v1/models"))
        .bearer_auth(node.credential())
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .json::<ModelListPayload>()
        .await?;

    Ok(payload
        .data
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// Re-runs discovery every `interval` until the process exits.
pub async fn run_periodic_refresh(
    discovery: Arc<ModelDiscovery>,
    registry: NodeRegistry,
    routes: Arc<RouteStore>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        discovery.refresh(&registry, &routes).await;
    }
}
