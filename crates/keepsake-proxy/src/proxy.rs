use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use keepsake::{
    CacheEngine, CacheRequest, HttpResponse, NetworkError, NetworkExecutor, PolicyTable,
    RequestBody, Timeouts,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

pub type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub engine: CacheEngine,
    pub policies: ArcSwap<PolicyTable>,
    pub network: Arc<UpstreamExecutor>,
    pub upstream_url: String,
    pub max_request_body: usize,
}

/// Sends engine requests to the upstream with the hyper client.
pub struct UpstreamExecutor {
    client: HttpClient,
    default_timeout: Duration,
}

impl UpstreamExecutor {
    pub fn new(client: HttpClient, default_timeout: Duration) -> Self {
        Self {
            client,
            default_timeout,
        }
    }
}

/// Deadline for the whole exchange: the sum of the timeouts the policy sets,
/// or the upstream default when it sets none.
fn exchange_deadline(timeouts: &Timeouts, default: Duration) -> Duration {
    let parts = [
        timeouts.connect_timeout(),
        timeouts.write_timeout(),
        timeouts.read_timeout(),
    ];
    if parts.iter().all(Option::is_none) {
        return default;
    }
    parts.into_iter().flatten().sum()
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::TE
        || name == header::TRAILER
        || name == header::UPGRADE
        || name == header::PROXY_AUTHORIZATION
        || name.as_str() == "keep-alive"
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[async_trait]
impl NetworkExecutor for UpstreamExecutor {
    async fn execute(
        &self,
        request: CacheRequest,
        timeouts: Timeouts,
    ) -> Result<HttpResponse, NetworkError> {
        let body = request
            .body
            .as_ref()
            .map(RequestBody::to_bytes)
            .unwrap_or_default();

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in forwardable_headers(&request.headers).iter() {
            builder = builder.header(name, value);
        }
        let upstream_req = builder
            .body(Full::new(body))
            .map_err(|e| NetworkError::InvalidRequest(e.to_string()))?;

        let deadline = exchange_deadline(&timeouts, self.default_timeout);
        let exchange = async {
            let resp = self
                .client
                .request(upstream_req)
                .await
                .map_err(|e| NetworkError::Connect(e.to_string()))?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| NetworkError::Body(e.to_string()))?
                .to_bytes();
            Ok::<_, NetworkError>((parts, body))
        };
        let (parts, body) = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| NetworkError::Timeout)??;

        Ok(HttpResponse::new(
            parts.status,
            forwardable_headers(&parts.headers),
            body,
        ))
    }
}

/// Main proxy handler. Resolves the route's policy, runs the call through the
/// engine and answers with the first delivery.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let body = match axum::body::to_bytes(body, state.max_request_body).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
        }
    };

    let policy = match state.policies.load().resolve(&parts.method, parts.uri.path()) {
        Ok(policy) => policy,
        Err(e) => {
            tracing::error!(error = %e, path = %parts.uri.path(), "cannot resolve call policy");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid cache policy").into_response();
        }
    };
    let strategy = policy.strategy;

    // A route-level upstream replaces the service default.
    let base = policy
        .upstream
        .as_ref()
        .map_or_else(|| state.upstream_url.clone(), Url::to_string);
    let url = match upstream_url(&base, path_and_query) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, upstream = %base, "invalid upstream url");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    let mut request = CacheRequest::new(parts.method.clone(), url);
    request.headers = forwardable_headers(&parts.headers);
    if !body.is_empty() {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        request.body = Some(RequestBody::from_wire(body, content_type));
    }

    let network: Arc<dyn NetworkExecutor> = state.network.clone();
    let mut handle = match state.engine.dispatch(request, policy, network) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "dispatch failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid cache policy").into_response();
        }
    };

    // Any later delivery (the network leg of cache_and_network) keeps running
    // in the engine and is written back after this handle is dropped.
    let Some(delivery) = handle.next().await else {
        return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
    };
    let hit = delivery.is_from_cache();

    let response = match delivery.into_http_response() {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, upstream = %base, "upstream request failed");
            let status = match e {
                NetworkError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            };
            return (status, "Bad Gateway").into_response();
        }
    };

    tracing::debug!(
        method = %parts.method,
        path = %parts.uri.path(),
        %strategy,
        status = response.status.as_u16(),
        cache = if hit { "HIT" } else { "MISS" },
        latency_us = start.elapsed().as_micros(),
        "request served"
    );

    build_response(response, hit, strategy.as_str())
}

fn upstream_url(base: &str, path_and_query: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!("{}{}", base.trim_end_matches('/'), path_and_query))
}

fn build_response(response: HttpResponse, hit: bool, strategy: &'static str) -> Response<Body> {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;

    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        // Length is recomputed from the body we actually send.
        if name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        "x-cache",
        HeaderValue::from_static(if hit { "HIT" } else { "MISS" }),
    );
    headers.insert("x-cache-strategy", HeaderValue::from_static(strategy));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use hyper_util::rt::TokioExecutor;
    use keepsake::TimeUnit;

    #[test]
    fn test_exchange_deadline() {
        let default = Duration::from_secs(5);
        assert_eq!(exchange_deadline(&Timeouts::default(), default), default);

        let timeouts = Timeouts {
            connect: 2,
            read: 3,
            write: 0,
            unit: TimeUnit::Seconds,
        };
        assert_eq!(exchange_deadline(&timeouts, default), Duration::from_secs(5));

        let timeouts = Timeouts {
            read: 250,
            unit: TimeUnit::Milliseconds,
            ..Timeouts::default()
        };
        assert_eq!(exchange_deadline(&timeouts, default), Duration::from_millis(250));
    }

    #[test]
    fn test_upstream_url_joins_base_and_path() {
        let url = upstream_url("http://127.0.0.1:3000/", "/items?page=2").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:3000/items?page=2");

        let url = upstream_url("https://search.internal/v2/", "/search?q=rust").unwrap();
        assert_eq!(url.as_str(), "https://search.internal/v2/search?q=rust");

        assert!(upstream_url("not a url", "/").is_err());
    }

    #[test]
    fn test_forwardable_headers_drop_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::HOST, HeaderValue::from_static("proxy:8080"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));

        let out = forwardable_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn test_build_response_tags_cache_status() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        let response = HttpResponse::new(StatusCode::OK, headers, Bytes::from_static(b"hi"));

        let out = build_response(response, true, "force_cache");
        assert_eq!(out.status(), StatusCode::OK);
        assert_eq!(out.headers().get("x-cache").unwrap(), "HIT");
        assert_eq!(out.headers().get("x-cache-strategy").unwrap(), "force_cache");
        assert!(out.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_upstream_executor_round_trip() {
        let upstream = Router::new().route(
            "/items",
            get(|| async { ([("content-type", "application/json")], "[1,2,3]") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
        let executor = UpstreamExecutor::new(client, Duration::from_secs(5));
        let url = Url::parse(&format!("http://{addr}/items")).unwrap();

        let response = executor
            .execute(CacheRequest::get(url), Timeouts::default())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"[1,2,3]");
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_upstream_executor_connect_failure() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
        let executor = UpstreamExecutor::new(client, Duration::from_secs(5));
        let url = Url::parse(&format!("http://{addr}/")).unwrap();

        let result = executor.execute(CacheRequest::get(url), Timeouts::default()).await;
        assert!(matches!(result, Err(NetworkError::Connect(_))));
    }
}
