//! Read API and crawl-admin handlers.

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::header::{HeaderValue, CONTENT_DISPOSITION};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::crawl;
use crate::error::Error;
use crate::model::{
    Community, CommunityBundle, CrawlJob, CrawlStatus, GraphLink, GraphNode, NodeKind,
};
use crate::precalc::{PrecalcOptions, MAX_LINKS_CAP, MAX_NODES_CAP};
use crate::store::{NodeSelection, PageCursor, QueueCounts};

use super::diffsync::{self, DiffMessage};
use super::health::{Check, HealthCheck};
use super::metrics::ServerMetricsSnapshot;
use super::{respond_cached, stream, wants_ndjson, ApiError, AppState};

/// Search result cap, per the API contract.
const SEARCH_LIMIT_CAP: usize = 500;
/// Default search page when the caller leaves `limit` off.
const SEARCH_LIMIT_DEFAULT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct GraphParams {
    pub max_nodes: Option<usize>,
    pub max_links: Option<usize>,
    pub types: Option<String>,
    pub with_positions: Option<bool>,
    pub page_size: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GraphResponse {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

/// Resolved, clamped selection shared by the JSON, NDJSON, and export paths.
pub(crate) struct ResolvedQuery {
    pub selection: NodeSelection,
    pub max_links: usize,
    pub page_limit: usize,
    pub cursor: Option<PageCursor>,
    pub paginated: bool,
}

pub(crate) fn resolve_graph_params(params: &GraphParams) -> Result<ResolvedQuery, Error> {
    let max_nodes = params.max_nodes.unwrap_or(MAX_NODES_CAP).clamp(1, MAX_NODES_CAP);
    let max_links = params.max_links.unwrap_or(MAX_LINKS_CAP).clamp(1, MAX_LINKS_CAP);
    let types = match &params.types {
        Some(raw) => diffsync::node_kind_list(raw),
        None => None,
    };
    let cursor = match &params.cursor {
        Some(raw) => Some(PageCursor::decode(raw)?),
        None => None,
    };
    let paginated = params.page_size.is_some();
    let page_limit = match params.page_size {
        Some(size) => size.clamp(1, max_nodes),
        None => max_nodes,
    };
    Ok(ResolvedQuery {
        selection: NodeSelection {
            max_nodes,
            types,
            with_positions: params.with_positions.unwrap_or(false),
        },
        max_links,
        page_limit,
        cursor,
        paginated,
    })
}

/// `GET /api/graph` — the capped, ordered, optionally paginated read.
pub async fn graph_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<GraphParams>,
) -> Result<Response, ApiError> {
    let resolved = resolve_graph_params(&params)?;
    if wants_ndjson(&headers) {
        return stream::stream_graph(state, resolved).await;
    }
    let key = format!("/api/graph?{}", raw_query.unwrap_or_default());
    let store = state.store.clone();
    respond_cached(&state, &headers, &key, "application/json", async move {
        let paginated = resolved.paginated;
        let slice = store
            .run(move |s| {
                s.graph_slice(
                    &resolved.selection,
                    resolved.cursor.as_ref(),
                    resolved.page_limit,
                    resolved.max_links,
                )
            })
            .await?;
        let response = GraphResponse {
            nodes: slice.nodes,
            links: slice.links,
            pagination: paginated.then(|| Pagination {
                has_more: slice.has_more,
                next_cursor: slice.next_cursor.map(|cursor| cursor.encode()),
            }),
        };
        Ok(serde_json::to_vec(&response)?)
    })
    .await
}

#[derive(Debug, Serialize)]
pub struct VersionPayload {
    pub version_id: i64,
    pub node_count: i64,
    pub link_count: i64,
}

/// `GET /api/graph/version`.
pub async fn version_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let store = state.store.clone();
    respond_cached(
        &state,
        &headers,
        "/api/graph/version",
        "application/json",
        async move {
            let version = store.run(move |s| s.current_version()).await?;
            let payload = match version {
                Some(version) => VersionPayload {
                    version_id: version.id,
                    node_count: version.node_count,
                    link_count: version.link_count,
                },
                None => VersionPayload {
                    version_id: 0,
                    node_count: 0,
                    link_count: 0,
                },
            };
            Ok(serde_json::to_vec(&payload)?)
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct DiffParams {
    pub since: i64,
}

/// `GET /api/graph/diff?since=N` — the HTTP catch-up fallback.
pub async fn diff_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DiffParams>,
) -> Result<Response, ApiError> {
    if params.since < 0 {
        return Err(Error::Validation("since must be non-negative".into()).into());
    }
    let key = format!("/api/graph/diff?since={}", params.since);
    let store = state.store.clone();
    respond_cached(&state, &headers, &key, "application/json", async move {
        let since = params.since;
        let messages = store
            .run(move |s| {
                let versions = s.diffs_since(since)?;
                let mut messages: Vec<DiffMessage> = Vec::new();
                for version in &versions {
                    messages.extend(diffsync::build_messages(s, version)?);
                }
                Ok(messages)
            })
            .await?;
        Ok(serde_json::to_vec(&messages)?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub node: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub count: usize,
    pub results: Vec<GraphNode>,
}

/// `GET /api/search?node=<q>&limit=<n>`.
pub async fn search_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    let query = params.node.trim().to_string();
    if query.is_empty() {
        return Err(Error::Validation("node query must not be empty".into()).into());
    }
    let limit = params
        .limit
        .unwrap_or(SEARCH_LIMIT_DEFAULT)
        .clamp(1, SEARCH_LIMIT_CAP);
    let key = format!("/api/search?{}", raw_query.unwrap_or_default());
    let store = state.store.clone();
    respond_cached(&state, &headers, &key, "application/json", async move {
        let results = {
            let query = query.clone();
            store.run(move |s| s.search_nodes(&query, limit)).await?
        };
        let response = SearchResponse {
            count: results.len(),
            results,
            query,
        };
        Ok(serde_json::to_vec(&response)?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
    pub max_nodes: Option<usize>,
    pub max_links: Option<usize>,
    pub types: Option<String>,
}

/// `GET /api/export?format=json|csv`.
pub async fn export_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let format = params.format.as_deref().unwrap_or("json");
    let (content_type, filename) = match format {
        "json" => ("application/json", "graph_export.json"),
        "csv" => ("text/csv", "graph_export.csv"),
        other => {
            return Err(Error::Validation(format!("unsupported export format {other:?}")).into())
        }
    };
    let resolved = resolve_graph_params(&GraphParams {
        max_nodes: params.max_nodes,
        max_links: params.max_links,
        types: params.types.clone(),
        with_positions: None,
        page_size: None,
        cursor: None,
    })?;
    let key = format!("/api/export?{}", raw_query.unwrap_or_default());
    let store = state.store.clone();
    let is_csv = format == "csv";
    let mut response = respond_cached(&state, &headers, &key, content_type, async move {
        let slice = store
            .run(move |s| {
                s.graph_slice(
                    &resolved.selection,
                    None,
                    resolved.page_limit,
                    resolved.max_links,
                )
            })
            .await?;
        if is_csv {
            export_csv(&slice.nodes, &slice.links)
        } else {
            let body = GraphResponse {
                nodes: slice.nodes,
                links: slice.links,
                pagination: None,
            };
            Ok(serde_json::to_vec(&body)?)
        }
    })
    .await?;
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn export_csv(nodes: &[GraphNode], links: &[GraphLink]) -> crate::error::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["data_type", "id", "name", "val", "type", "source", "target"])
        .map_err(|err| Error::Internal(format!("csv: {err}")))?;
    for node in nodes {
        writer
            .write_record([
                "node",
                &node.id,
                &node.name,
                node.val.as_deref().unwrap_or(""),
                node.kind.as_ref().map(NodeKind::as_str).unwrap_or(""),
                "",
                "",
            ])
            .map_err(|err| Error::Internal(format!("csv: {err}")))?;
    }
    for link in links {
        writer
            .write_record(["link", "", "", "", "", &link.source, &link.target])
            .map_err(|err| Error::Internal(format!("csv: {err}")))?;
    }
    writer
        .into_inner()
        .map_err(|err| Error::Internal(format!("csv: {err}")))
}

#[derive(Debug, Serialize)]
pub struct CommunitiesResponse {
    pub communities: Vec<Community>,
    pub bundles: Vec<CommunityBundle>,
}

/// `GET /api/communities`.
pub async fn communities_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let store = state.store.clone();
    respond_cached(
        &state,
        &headers,
        "/api/communities",
        "application/json",
        async move {
            let response = store
                .run(move |s| {
                    Ok(CommunitiesResponse {
                        communities: s.list_communities()?,
                        bundles: s.list_bundles()?,
                    })
                })
                .await?;
            Ok(serde_json::to_vec(&response)?)
        },
    )
    .await
}

#[derive(Debug, Serialize)]
pub struct CommunityDetail {
    pub community: Community,
    pub members: Vec<String>,
}

/// `GET /api/communities/{id}`.
pub async fn community_detail_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let key = format!("/api/communities/{id}");
    let store = state.store.clone();
    respond_cached(&state, &headers, &key, "application/json", async move {
        let (community, members) = store.run(move |s| s.community_detail(id)).await?;
        Ok(serde_json::to_vec(&CommunityDetail { community, members })?)
    })
    .await
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// `GET /api/crawl/jobs`.
pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<CrawlJob>>, ApiError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            CrawlStatus::parse(raw)
                .ok_or_else(|| Error::Validation(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(100).clamp(1, 1_000);
    let jobs = state
        .store
        .run(move |s| s.list_jobs(status, limit))
        .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub subreddit: String,
    pub priority: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: i64,
}

/// `POST /api/crawl/jobs` — enqueue by subreddit name.
pub async fn enqueue_handler(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let name = request.subreddit.trim().to_lowercase();
    if name.is_empty() {
        return Err(Error::Validation("subreddit must not be empty".into()).into());
    }
    let job_id = crawl::enqueue_by_name(
        &state.store,
        &name,
        request.priority.unwrap_or(0),
        state.config.crawl.max_retries as i64,
        "api",
    )
    .await?;
    Ok(Json(EnqueueResponse { job_id }))
}

/// `POST /api/crawl/jobs/{id}/retry`.
pub async fn retry_job_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.run(move |s| s.retry_job(id)).await?;
    Ok(Json(serde_json::json!({ "job_id": id, "status": "queued" })))
}

/// `POST /api/crawl/retry-failed`.
pub async fn bulk_retry_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let retried = state.store.run(|s| s.bulk_retry_failed()).await?;
    Ok(Json(serde_json::json!({ "retried": retried })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub full_rebuild: bool,
    pub max_nodes: Option<usize>,
    pub max_links: Option<usize>,
    pub types: Option<String>,
}

/// `POST /api/precalc/trigger` — coalesced when a run is already in flight.
pub async fn trigger_precalc_handler(
    State(state): State<AppState>,
    request: Option<Json<TriggerRequest>>,
) -> Result<Json<crate::precalc::PrecalcOutcome>, ApiError> {
    let request = request.map(|Json(body)| body).unwrap_or_default();
    let options = PrecalcOptions {
        full_rebuild: request.full_rebuild,
        max_nodes: request.max_nodes.unwrap_or(MAX_NODES_CAP),
        max_links: request.max_links.unwrap_or(MAX_LINKS_CAP),
        types: request.types.as_deref().and_then(diffsync::node_kind_list),
    };
    let outcome = state.precalc.run(options).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub metrics: ServerMetricsSnapshot,
    pub queue: QueueCounts,
    pub cache: CacheStats,
    pub rate_limiter_ips: usize,
    pub store_pool: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
}

/// `GET /api/stats` — live counters, never cached.
pub async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, ApiError> {
    let queue = state.store.run(|s| s.queue_counts()).await?;
    let (hits, misses, evictions) = state.cache.counters();
    let (entries, bytes) = state.cache.usage();
    let (capacity, available) = state.store.pool_usage();
    Ok(Json(StatsResponse {
        metrics: state.metrics.snapshot(),
        queue,
        cache: CacheStats {
            hits,
            misses,
            evictions,
            entries,
            bytes,
        },
        rate_limiter_ips: state.limiter.tracked_ips(),
        store_pool: PoolStats {
            capacity,
            available,
        },
    }))
}

/// `GET /health`.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut report = HealthCheck::new();

    let queue = state.store.run(|s| s.queue_counts()).await;
    match &queue {
        Ok(counts) => {
            report.add_check(Check::StoreReachable { healthy: true });
            report.add_check(Check::QueueBacklog {
                queued: counts.queued,
                threshold: 10_000,
                healthy: counts.queued < 10_000,
            });
        }
        Err(_) => report.add_check(Check::StoreReachable { healthy: false }),
    }

    if let Some(fetcher) = &state.fetcher {
        let open = fetcher
            .breaker_snapshot()
            .iter()
            .filter(|(_, state)| *state == crate::fetch::breaker::BreakerState::Open)
            .count();
        report.add_check(Check::CircuitBreakers {
            open,
            healthy: open == 0,
        });
    }

    if let Ok(precalc) = state.store.run(|s| s.precalc_state()).await {
        let seconds_ago = precalc
            .last_precalc_at
            .map(|at| (OffsetDateTime::now_utc() - at).whole_seconds().max(0) as u64);
        report.add_check(Check::PrecalcAge {
            seconds_ago,
            threshold: 24 * 3_600,
            healthy: seconds_ago.map_or(true, |age| age < 24 * 3_600),
        });
    }

    let status = if report.is_healthy() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
