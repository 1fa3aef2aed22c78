//! Forwarding of chat completions to the nodes hosting the requested model.
//!
//! One request walks its candidates sequentially: health check, then open the
//! forwarding request. The first candidate that answers with any HTTP response
//! wins and its body is streamed back verbatim. Nothing is retried once bytes
//! have started flowing.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;

use crate::error::GatewayError;
use crate::health::HealthChecker;
use crate::registry::NodeDescriptor;
use crate::routing::RouteStore;

pub const SELECTED_NODE_HEADER: &str = "x-node-router-node";

/// A validated inbound chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl ChatRequest {
    /// Decodes just enough of `body` to find the model; the bytes are forwarded unmodified.
    pub fn parse(headers: HeaderMap, body: Bytes) -> Result<Self, GatewayError> {
        let v: Value = serde_json::from_slice(&body).map_err(|_| {
            GatewayError::invalid_request("failed to parse JSON body", "invalid_json")
        })?;

        if !v.is_object() {
            return Err(GatewayError::invalid_request(
                "request body must be a JSON object",
                "invalid_body",
            ));
        }

        let model = match v.get("model").and_then(Value::as_str) {
            Some(model) if !model.trim().is_empty() => model.to_string(),
            _ => {
                return Err(GatewayError::InvalidRequest {
                    message: "the 'model' field is required".to_string(),
                    param: Some("model"),
                    code: "missing_model",
                })
            }
        };

        Ok(Self {
            model,
            body,
            headers,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptFailure {
    #[error("node failed its health check")]
    Unhealthy,
    #[error("could not open forwarding request: {0}")]
    Connect(#[source] reqwest::Error),
}

impl AttemptFailure {
    fn reason(&self) -> &'static str {
        match self {
            Self::Unhealthy => "unhealthy",
            Self::Connect(err) if err.is_timeout() => "upstream_timeout",
            Self::Connect(_) => "upstream_connect_error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChatCompletionProxy {
    client: Client,
    health: HealthChecker,
    forward_timeout: Duration,
}

impl ChatCompletionProxy {
    pub fn new(client: Client, health: HealthChecker, forward_timeout: Duration) -> Self {
        Self {
            client,
            health,
            forward_timeout,
        }
    }

    /// Resolves candidates from the current snapshot and forwards to the first one that answers.
    pub async fn handle(
        &self,
        routes: &RouteStore,
        request: ChatRequest,
    ) -> Result<Response, GatewayError> {
        // Held for the whole request; a concurrent install does not affect it.
        let snapshot = routes.snapshot();
        let candidates = snapshot.lookup(&request.model);
        if candidates.is_empty() {
            return Err(GatewayError::ModelNotFound(request.model));
        }

        self.forward_with_failover(candidates, &request).await
    }

    pub async fn forward_with_failover(
        &self,
        candidates: &[Arc<NodeDescriptor>],
        request: &ChatRequest,
    ) -> Result<Response, GatewayError> {
        let outbound_headers = filter_upstream_request_headers(&request.headers);

        for (idx, node) in candidates.iter().enumerate() {
            match self.attempt(node, &outbound_headers, &request.body).await {
                Ok(upstream) => {
                    tracing::info!(
                        model = %request.model,
                        selected_node = %node.name,
                        attempt_idx = idx,
                        candidates_total = candidates.len(),
                        upstream_status = upstream.status().as_u16(),
                        "forwarding to node"
                    );
                    return Ok(streaming_response(upstream, &node.name));
                }
                Err(failure) => {
                    tracing::warn!(
                        model = %request.model,
                        failed_node = %node.name,
                        attempt_idx = idx,
                        candidates_total = candidates.len(),
                        reason = failure.reason(),
                        error = %failure,
                        "candidate failed; trying next"
                    );
                }
            }
        }

        Err(GatewayError::Unavailable {
            model: request.model.clone(),
            attempted: candidates.len(),
        })
    }

    async fn attempt(
        &self,
        node: &NodeDescriptor,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<reqwest::Response, AttemptFailure> {
        if !self.health.check(&node.address).await {
            return Err(AttemptFailure::Unhealthy);
        }

        self.client
            .post(node.endpoint("/v1/chat/completions"))
            .headers(headers.clone())
            .bearer_auth(node.credential())
            .header(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .body(body.clone())
            .timeout(self.forward_timeout)
            .send()
            .await
            .map_err(AttemptFailure::Connect)
    }
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    use axum::http::header;

    name == header::CONNECTION
        || name.as_str() == "keep-alive"
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::TE
        || name == header::TRAILER
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
}

fn filter_upstream_request_headers(headers: &HeaderMap) -> HeaderMap {
    use axum::http::header;

    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop_header(name) {
            continue;
        }
        if name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::CONTENT_TYPE
            || name == header::AUTHORIZATION
        {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

fn copy_upstream_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop_header(name) {
            continue;
        }
        to.append(name, value.clone());
    }
}

fn streaming_response(upstream: reqwest::Response, node_name: &str) -> Response {
    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let node = node_name.to_string();

    // Dropping the body (client went away) drops this stream and the upstream connection with it.
    let stream = upstream.bytes_stream().map(move |item| {
        item.map_err(|err| {
            tracing::warn!(node = %node, error = %err, "upstream stream aborted mid-response");
            std::io::Error::other(err)
        })
    });

    let mut resp = Response::new(Body::from_stream(stream));
    *resp.status_mut() = status;
    copy_upstream_response_headers(&upstream_headers, resp.headers_mut());
    if let Ok(value) = HeaderValue::from_str(node_name) {
        resp.headers_mut().insert(SELECTED_NODE_HEADER, value);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::Router;
    use futures_util::stream;
    use http_body_util::BodyExt;
    use reqwest::Url;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::routing::RoutingTable;

    async fn spawn_upstream(app: Router) -> (Url, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .unwrap();
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), handle)
    }

    async fn closed_address() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    /// Answers health checks but drops every forwarding request before replying.
    async fn spawn_dropping_node(
        label: &'static str,
        attempts: Arc<Mutex<Vec<String>>>,
    ) -> (Url, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let attempts = attempts.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let mut read = 0;
                    loop {
                        let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if read == buf.len() {
                            return;
                        }
                    }
                    if buf.starts_with(b"GET") {
                        let reply: &[u8] =
                            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
                        let _ = socket.write_all(reply).await;
                    } else {
                        attempts.lock().unwrap().push(label.to_string());
                    }
                });
            }
        });
        (Url::parse(&format!("http://{addr}")).unwrap(), handle)
    }

    fn proxy() -> ChatCompletionProxy {
        let client = Client::new();
        let health = HealthChecker::new(client.clone(), Duration::from_millis(300));
        ChatCompletionProxy::new(client, health, Duration::from_secs(5))
    }

    fn store_with(model: &str, nodes: Vec<NodeDescriptor>) -> RouteStore {
        let mut builder = RoutingTable::builder();
        for node in nodes {
            builder.add_candidate(model, &Arc::new(node));
        }
        let store = RouteStore::new();
        store.install(builder.build());
        store
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest::parse(
            HeaderMap::new(),
            Bytes::from(format!(r#"{{"model":"{model}","messages":[]}}"#)),
        )
        .unwrap()
    }

    fn chat_node(reply: &'static str, hits: Arc<Mutex<Vec<String>>>) -> Router {
        Router::new().route("/", get(|| async { "ok" })).route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, body: Bytes| {
                let hits = hits.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    hits.lock()
                        .unwrap()
                        .push(format!("{reply}|{auth}|{}", String::from_utf8_lossy(&body)));
                    (
                        StatusCode::OK,
                        [("content-type", "text/event-stream")],
                        reply,
                    )
                }
            }),
        )
    }

    #[test]
    fn parse_rejects_missing_model() {
        let err = ChatRequest::parse(HeaderMap::new(), Bytes::from_static(b"{}")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(err, GatewayError::InvalidRequest { code: "missing_model", .. }));
    }

    #[test]
    fn parse_rejects_invalid_json_and_non_objects() {
        let err = ChatRequest::parse(HeaderMap::new(), Bytes::from_static(b"{nope")).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { code: "invalid_json", .. }));

        let err = ChatRequest::parse(HeaderMap::new(), Bytes::from_static(b"[1,2]")).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { code: "invalid_body", .. }));

        let body = Bytes::from_static(br#"{"model":7}"#);
        let err = ChatRequest::parse(HeaderMap::new(), body).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { code: "missing_model", .. }));
    }

    #[test]
    fn filter_drops_client_credential_and_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer client-key"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("host", HeaderValue::from_static("gateway"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));

        let out = filter_upstream_request_headers(&headers);
        assert!(out.get("authorization").is_none());
        assert!(out.get("connection").is_none());
        assert!(out.get("host").is_none());
        assert_eq!(out.get("accept").unwrap(), "text/event-stream");
    }

    #[tokio::test]
    async fn unknown_model_is_not_found_without_network() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (url, handle) = spawn_upstream(chat_node("a", hits.clone())).await;
        let store = store_with("m1", vec![NodeDescriptor::new("a", url, "", None)]);

        let err = proxy().handle(&store, request("other")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotFound(ref m) if m == "other"));
        assert!(hits.lock().unwrap().is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn unhealthy_first_candidate_falls_back_to_second() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (url, handle) = spawn_upstream(chat_node("b", hits.clone())).await;
        let store = store_with(
            "m1",
            vec![
                NodeDescriptor::new("a", closed_address().await, "", None),
                NodeDescriptor::new("b", url, "node-b-key", None),
            ],
        );

        let resp = proxy().handle(&store, request("m1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(SELECTED_NODE_HEADER).unwrap(), "b");
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"b"));

        let got = hits.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert!(got[0].starts_with("b|Bearer node-b-key|"));

        handle.abort();
    }

    #[tokio::test]
    async fn forwards_body_unmodified_with_node_credential() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (url, handle) = spawn_upstream(chat_node("a", hits.clone())).await;
        let store = store_with("m1", vec![NodeDescriptor::new("a", url, "secret-a", None)]);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer K1"));
        let raw = r#"{"model":"m1","messages":[{"role":"user","content":"hi"}],"stream":true}"#;
        let req = ChatRequest::parse(headers, Bytes::from_static(raw.as_bytes())).unwrap();

        let resp = proxy().handle(&store, req).await.unwrap();
        let _ = resp.into_body().collect().await.unwrap();

        let got = hits.lock().unwrap().clone();
        assert_eq!(got, vec![format!("a|Bearer secret-a|{raw}")]);

        handle.abort();
    }

    #[tokio::test]
    async fn all_candidates_unreachable_is_unavailable() {
        let store = store_with(
            "m1",
            vec![
                NodeDescriptor::new("a", closed_address().await, "", None),
                NodeDescriptor::new("b", closed_address().await, "", None),
            ],
        );

        let err = proxy().handle(&store, request("m1")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            err,
            GatewayError::Unavailable { ref model, attempted: 2 } if model == "m1"
        ));
    }

    #[tokio::test]
    async fn connect_failures_try_each_candidate_once_in_order() {
        let attempts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let (first_url, first) = spawn_dropping_node("first", attempts.clone()).await;
        let (second_url, second) = spawn_dropping_node("second", attempts.clone()).await;
        let (third_url, third) = spawn_dropping_node("third", attempts.clone()).await;

        let store = store_with(
            "m1",
            vec![
                NodeDescriptor::new("first", first_url, "", None),
                NodeDescriptor::new("second", second_url, "", None),
                NodeDescriptor::new("third", third_url, "", None),
            ],
        );

        let err = proxy().handle(&store, request("m1")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable { attempted: 3, .. }));
        assert_eq!(
            attempts.lock().unwrap().clone(),
            vec!["first", "second", "third"]
        );

        first.abort();
        second.abort();
        third.abort();
    }

    #[tokio::test]
    async fn upstream_error_status_is_passed_through_not_retried() {
        let second_hits = Arc::new(Mutex::new(Vec::new()));
        let failing = Router::new().route("/", get(|| async { "ok" })).route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("content-type", "application/json")],
                    r#"{"error":"busy"}"#,
                )
            }),
        );
        let (a_url, a) = spawn_upstream(failing).await;
        let (b_url, b) = spawn_upstream(chat_node("b", second_hits.clone())).await;
        let store = store_with(
            "m1",
            vec![
                NodeDescriptor::new("a", a_url, "", None),
                NodeDescriptor::new("b", b_url, "", None),
            ],
        );

        let resp = proxy().handle(&store, request("m1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(br#"{"error":"busy"}"#));
        assert!(second_hits.lock().unwrap().is_empty());

        a.abort();
        b.abort();
    }

    #[tokio::test]
    async fn mid_stream_failure_is_not_retried() {
        let second_hits = Arc::new(Mutex::new(Vec::new()));
        let flaky = Router::new().route("/", get(|| async { "ok" })).route(
            "/v1/chat/completions",
            post(|| async {
                let first = stream::once(async move {
                    Ok::<Bytes, std::io::Error>(Bytes::from_static(b"first"))
                });
                let second = stream::once(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<Bytes, std::io::Error>(std::io::Error::other("boom"))
                });
                Response::new(Body::from_stream(first.chain(second))).into_response()
            }),
        );
        let (a_url, a) = spawn_upstream(flaky).await;
        let (b_url, b) = spawn_upstream(chat_node("b", second_hits.clone())).await;
        let store = store_with(
            "m1",
            vec![
                NodeDescriptor::new("a", a_url, "", None),
                NodeDescriptor::new("b", b_url, "", None),
            ],
        );

        let resp = proxy().handle(&store, request("m1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(SELECTED_NODE_HEADER).unwrap(), "a");

        let collected = resp.into_body().collect().await;
        assert!(collected.is_err());
        assert!(second_hits.lock().unwrap().is_empty());

        a.abort();
        b.abort();
    }
}
