//! The serving plane: HTTP read API, NDJSON streaming, websocket diffs.
//!
//! One request per task; the response cache, rate limiter tables, and the
//! websocket hub are the only process-wide mutable collaborators, each with
//! explicit construction and shutdown. Handlers return `Result<_, ApiError>`
//! and the taxonomy maps to statuses in exactly one place.

pub mod api;
pub mod cache;
pub mod compress;
pub mod diffsync;
pub mod health;
pub mod metrics;
pub mod ratelimit;
pub mod stream;
pub mod ws;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{
    HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, ETAG, IF_NONE_MATCH,
    RETRY_AFTER, VARY,
};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::RedditFetcher;
use crate::precalc::Precalculator;
use crate::store::Store;

use cache::ResponseCache;
use compress::Encoding;
use metrics::ServerMetrics;
use ratelimit::RequestLimiter;
use ws::Hub;

/// Shared state handed to every handler. Cloning is cheap; everything
/// mutable lives behind its own lock or atomics.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<Config>,
    pub metrics: Arc<ServerMetrics>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RequestLimiter>,
    pub hub: Arc<Hub>,
    pub precalc: Arc<Precalculator>,
    /// Present in the real server; absent in router-level tests.
    pub fetcher: Option<Arc<RedditFetcher>>,
}

impl AppState {
    /// Builds the collaborators around an opened store.
    pub fn new(
        store: Store,
        config: Config,
        precalc: Arc<Precalculator>,
        fetcher: Option<Arc<RedditFetcher>>,
    ) -> Self {
        let cache = ResponseCache::new(&config.response);
        let limiter = RequestLimiter::new(config.rate_limit.clone());
        let hub = Hub::new(store.clone());
        Self {
            store,
            config: Arc::new(config),
            metrics: Arc::new(ServerMetrics::default()),
            cache,
            limiter,
            hub,
            precalc,
            fetcher,
        }
    }
}

/// Handler-facing error: the crate taxonomy plus the HTTP mapping.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::AuthRequired | Error::AuthInvalid => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Store(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        // Client mistakes are request-level noise; server faults are not.
        if status.is_server_error() {
            error!(code = err.code(), error = %err, "request failed");
        }
        let message = match &err {
            Error::AuthRequired | Error::AuthInvalid => "authentication failed".to_string(),
            other => other.to_string(),
        };
        let mut response = (
            status,
            Json(ErrorBody {
                code: err.code(),
                message,
            }),
        )
            .into_response();
        if let Error::RateLimited { retry_after_secs } = &err {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Assembles the router. Separate from `serve` so tests drive it in-process.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health_handler))
        .route("/api/stats", get(api::stats_handler))
        .route("/api/graph", get(api::graph_handler))
        .route("/api/graph/version", get(api::version_handler))
        .route("/api/graph/diff", get(api::diff_handler))
        .route("/api/graph/ws", get(ws::ws_handler))
        .route("/api/search", get(api::search_handler))
        .route("/api/export", get(api::export_handler))
        .route("/api/communities", get(api::communities_handler))
        .route("/api/communities/:id", get(api::community_detail_handler))
        .route(
            "/api/crawl/jobs",
            get(api::list_jobs_handler).post(api::enqueue_handler),
        )
        .route("/api/crawl/jobs/:id/retry", post(api::retry_job_handler))
        .route("/api/crawl/retry-failed", post(api::bulk_retry_handler))
        .route("/api/precalc/trigger", post(api::trigger_precalc_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            observe_and_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request accounting plus the global and per-IP token buckets.
async fn observe_and_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    state
        .metrics
        .requests_total
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let ip = client_ip(&request);
    if let Err(wait) = state.limiter.check(ip) {
        state
            .metrics
            .rate_limited
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let error: ApiError = Error::RateLimited {
            retry_after_secs: wait.as_secs().max(1),
        }
        .into();
        let response = error.into_response();
        state.metrics.record_status(response.status().as_u16());
        return response;
    }

    let response = next.run(request).await;
    state.metrics.record_status(response.status().as_u16());
    response
}

/// Best-effort client address: `X-Forwarded-For` first hop, then the socket
/// peer, then loopback (router tests have neither).
fn client_ip(request: &Request) -> IpAddr {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// The cached-response pipeline every read endpoint goes through.
///
/// `build` produces the uncompressed body under the request's wall-clock
/// budget; the pipeline owns negotiation, the ETag round-trip, compression,
/// and cache fill. `Content-Encoding` is attached only together with an
/// encoded body, never speculatively.
pub(crate) async fn respond_cached<F>(
    state: &AppState,
    request_headers: &axum::http::HeaderMap,
    cache_key: &str,
    content_type: &'static str,
    build: F,
) -> std::result::Result<Response, ApiError>
where
    F: std::future::Future<Output = Result<Vec<u8>>>,
{
    let encoding = if state.config.response.compression {
        compress::negotiate(
            request_headers
                .get(axum::http::header::ACCEPT_ENCODING)
                .and_then(|value| value.to_str().ok()),
        )
    } else {
        Encoding::Identity
    };
    let key = format!("{cache_key}|{}", encoding.cache_suffix());
    let if_none_match = request_headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Some(cached) = state.cache.get(&key) {
        if etag_matches(if_none_match.as_deref(), &cached.etag) {
            return Ok(not_modified(state, &cached.etag));
        }
        return Ok(full_response(
            state,
            cached.body.clone(),
            &cached.etag,
            cached.content_type,
            cached.content_encoding,
        ));
    }

    let budget = state.config.response.request_timeout;
    let body = match tokio::time::timeout(budget, build).await {
        Ok(result) => result?,
        Err(_) => {
            state
                .metrics
                .timeouts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Err(Error::Timeout(budget.as_millis() as u64).into());
        }
    };

    let etag = cache::etag_of(&body);
    let encoded = Arc::new(compress::encode(encoding, &body)?);
    state.cache.put(
        key,
        encoded.clone(),
        etag.clone(),
        content_type,
        encoding.content_encoding(),
    );
    if etag_matches(if_none_match.as_deref(), &etag) {
        return Ok(not_modified(state, &etag));
    }
    Ok(full_response(
        state,
        encoded,
        &etag,
        content_type,
        encoding.content_encoding(),
    ))
}

fn etag_matches(if_none_match: Option<&str>, etag: &str) -> bool {
    let Some(raw) = if_none_match else {
        return false;
    };
    raw.split(',')
        .map(|candidate| candidate.trim().trim_start_matches("W/").trim_matches('"'))
        .any(|candidate| candidate == etag || candidate == "*")
}

fn cache_control_value(state: &AppState) -> String {
    format!(
        "public, max-age={}, stale-while-revalidate={}",
        state.config.response.etag_max_age.as_secs(),
        state.config.response.stale_while_revalidate.as_secs()
    )
}

fn not_modified(state: &AppState, etag: &str) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .body(Body::empty())
        .expect("static response");
    let headers = response.headers_mut();
    headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&cache_control_value(state)) {
        headers.insert(CACHE_CONTROL, value);
    }
    response
}

fn full_response(
    state: &AppState,
    body: Arc<Vec<u8>>,
    etag: &str,
    content_type: &'static str,
    content_encoding: Option<&'static str>,
) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body.as_ref().clone()))
        .expect("static response");
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
    if let Some(encoding) = content_encoding {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&cache_control_value(state)) {
        headers.insert(CACHE_CONTROL, value);
    }
    response
}

/// Whether the request asked for NDJSON progressive loading.
pub(crate) fn wants_ndjson(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("application/x-ndjson"))
        .unwrap_or(false)
}

/// Binds and serves until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "api listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
        info!("api shutting down");
    })
    .await?;
    Ok(())
}

/// Cache metrics sampler: every 15 seconds, log counter deltas.
pub async fn run_cache_sampler(cache: Arc<ResponseCache>, mut shutdown: watch::Receiver<bool>) {
    const PERIOD: Duration = Duration::from_secs(15);
    let (mut last_hits, mut last_misses, mut last_evictions) = cache.counters();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PERIOD) => {}
            _ = shutdown.changed() => break,
        }
        let (hits, misses, evictions) = cache.counters();
        let (entries, bytes) = cache.usage();
        info!(
            hits = hits - last_hits,
            misses = misses - last_misses,
            evictions = evictions - last_evictions,
            entries,
            bytes,
            "cache sample"
        );
        (last_hits, last_misses, last_evictions) = (hits, misses, evictions);
    }
}

/// Rate-limiter GC loop.
pub async fn run_limiter_gc(limiter: Arc<RequestLimiter>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(limiter.cleanup_period()) => {}
            _ = shutdown.changed() => break,
        }
        let collected = limiter.collect_idle();
        if collected > 0 {
            tracing::debug!(collected, "collected idle rate-limiter entries");
        }
    }
}

/// Installs the process-wide tracing subscriber once.
pub fn install_tracing_subscriber() {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt, EnvFilter};
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(filter).try_init();
    });
}
