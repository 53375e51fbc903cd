//! NDJSON progressive loader.
//!
//! Line order is the contract: one metadata line, then node lines in
//! weight-descending order, then link lines whose endpoints have already
//! been sent. The body is streamed line by line so a client can render
//! incrementally and abort mid-transfer.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::Response;
use futures::stream;
use serde::Serialize;

use crate::model::{GraphLink, GraphNode};

use super::api::ResolvedQuery;
use super::{ApiError, AppState};

#[derive(Serialize)]
#[serde(tag = "type")]
enum Line<'a> {
    #[serde(rename = "metadata")]
    Metadata {
        #[serde(rename = "totalNodes")]
        total_nodes: usize,
        #[serde(rename = "totalLinks")]
        total_links: usize,
    },
    #[serde(rename = "node")]
    Node { data: &'a GraphNode },
    #[serde(rename = "link")]
    Link { data: &'a GraphLink },
}

/// Streams the selected graph as `application/x-ndjson`.
pub async fn stream_graph(state: AppState, resolved: ResolvedQuery) -> Result<Response, ApiError> {
    let store = state.store.clone();
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

    // Nodes from graph_slice are already weight-descending; every link's
    // endpoints are members of the node set, so emitting all nodes first
    // satisfies the endpoints-already-sent rule.
    let mut lines: Vec<Result<Vec<u8>, Infallible>> =
        Vec::with_capacity(1 + slice.nodes.len() + slice.links.len());
    lines.push(Ok(render_line(&Line::Metadata {
        total_nodes: slice.nodes.len(),
        total_links: slice.links.len(),
    })));
    for node in &slice.nodes {
        lines.push(Ok(render_line(&Line::Node { data: node })));
    }
    for link in &slice.links {
        lines.push(Ok(render_line(&Line::Link { data: link })));
    }

    let body = Body::from_stream(stream::iter(lines));
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .expect("static response");
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

fn render_line(line: &Line<'_>) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(line).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}
