use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod proxy;
pub mod registry;
pub mod routing;

pub use config::AppConfig;
pub use discovery::{ModelDiscovery, RefreshSummary};
pub use error::{openai_error_response, GatewayError, OpenAiErrorResponse};
pub use health::HealthChecker;
pub use proxy::{ChatCompletionProxy, ChatRequest};
pub use registry::{NodeDescriptor, NodeRegistry};
pub use routing::{RouteStore, RoutingTable};

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    registry: NodeRegistry,
    routes: Arc<RouteStore>,
    discovery: Arc<ModelDiscovery>,
    proxy: ChatCompletionProxy,
    health: HealthChecker,
}

impl AppState {
    pub fn new(config: AppConfig, registry: NodeRegistry) -> Self {
        let http_client = Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .build()
            .expect("failed to build reqwest client");
        let health = HealthChecker::new(http_client.clone(), config.health_timeout);
        let discovery = ModelDiscovery::new(
            http_client.clone(),
            health.clone(),
            config.discovery_timeout,
        );
        let proxy = ChatCompletionProxy::new(http_client, health.clone(), config.forward_timeout);

        Self {
            config: Arc::new(config),
            registry,
            routes: Arc::new(RouteStore::new()),
            discovery: Arc::new(discovery),
            proxy,
            health,
        }
    }

    /// Runs one discovery pass against every configured node and installs the result.
    pub async fn refresh_routes(&self) -> RefreshSummary {
        self.discovery.refresh(&self.registry, &self.routes).await
    }

    /// Union of known model ids, answered from the installed snapshot.
    pub fn list_models(&self) -> ModelList {
        ModelList::from_table(&self.routes.snapshot())
    }

    /// Routing snapshot plus freshly checked node health, for operator tooling.
    pub async fn status_report(&self) -> StatusReport {
        let snapshot = self.routes.snapshot();
        let nodes = self.registry.list();
        let online = join_all(nodes.iter().map(|node| self.health.check(&node.address))).await;

        StatusReport {
            generation: snapshot.generation(),
            routes: snapshot
                .entries()
                .map(|entry| {
                    let names: Vec<String> =
                        entry.candidates.iter().map(|n| n.name.clone()).collect();
                    (entry.model_id.clone(), names)
                })
                .collect(),
            nodes: nodes
                .iter()
                .zip(online)
                .map(|(node, online)| NodeStatus {
                    name: node.name.clone(),
                    address: node.address.to_string(),
                    declared_models: node
                        .declared_models
                        .as_ref()
                        .map(|models| models.iter().cloned().collect()),
                    online,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
}

impl ModelList {
    pub fn from_table(table: &RoutingTable) -> Self {
        Self {
            object: "list".to_string(),
            data: table
                .list_model_ids()
                .into_iter()
                .map(|id| ModelCard {
                    id,
                    object: "model".to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub generation: u64,
    pub routes: BTreeMap<String, Vec<String>>,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_models: Option<Vec<String>>,
    pub online: bool,
}

/// Starts the background loop that keeps the routing table fresh.
///
/// A failed pass for one node only drops that node's discovered models until
/// the next pass. Does nothing when the refresh interval is zero.
pub fn spawn_discovery_refresh(state: AppState) {
    let interval = state.config.discovery_refresh;
    if interval.is_zero() {
        return;
    }
    tokio::spawn(discovery::run_periodic_refresh(
        state.discovery.clone(),
        state.registry.clone(),
        state.routes.clone(),
        interval,
    ));
}

pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;

    let api = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/admin/status", get(admin_status))
        .route("/admin/refresh", post(admin_refresh))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_client_key,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(api)
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .with_state(state)
}

fn authorize(accepted: &HashSet<String>, headers: &HeaderMap) -> Result<(), GatewayError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(GatewayError::MissingCredential)?;

    if accepted.contains(token) {
        Ok(())
    } else {
        Err(GatewayError::InvalidCredential)
    }
}

async fn require_client_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Err(err) = authorize(&state.config.client_api_keys, req.headers()) {
        tracing::debug!(path = %req.uri().path(), error = %err, "rejected client request");
        return err.into_response();
    }
    next.run(req).await
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<AppState>) -> Response {
    let snapshot = state.routes.snapshot();

    if snapshot.generation() == 0 {
        return openai_error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "service not ready: discovery has not completed",
            None,
            Some("not_ready"),
        );
    }

    if snapshot.is_empty() {
        return openai_error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "service not ready: no models discovered",
            None,
            Some("not_ready"),
        );
    }

    (StatusCode::OK, "ready").into_response()
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(state.list_models())
}

async fn admin_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status_report().await)
}

async fn admin_refresh(State(state): State<AppState>) -> Json<RefreshSummary> {
    Json(state.refresh_routes().await)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, GatewayError> {
    let body = body.map_err(|rejection| match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            GatewayError::PayloadTooLarge
        }
        _ => GatewayError::invalid_request("failed to read request body", "invalid_body"),
    })?;

    let request = ChatRequest::parse(headers, body)?;
    state.proxy.handle(&state.routes, request).await
}
