//! # Clustermap - Social Graph Crawler and Map Server
//!
//! Clustermap crawls a public discussion platform (subreddits, users, posts,
//! comments), materializes the observed social structure as a graph of typed
//! nodes and directed links, precomputes a force-directed 3D layout plus a
//! hierarchical community decomposition, and serves the result to interactive
//! front-ends as snapshots, progressive streams, and live diffs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clustermap::config::Config;
//! use clustermap::store::Store;
//!
//! let config = Config::from_env();
//! let store = Store::open(&config.database_path, 4)?;
//! store.migrate()?;
//! # Ok::<(), clustermap::Error>(())
//! ```
//!
//! ## Architecture
//!
//! Clustermap is a pipeline of three planes sharing one SQLite store:
//! - **Crawl plane**: a persistent job queue with visibility timeouts and
//!   bounded retries, fed by a cron scheduler and drained by a worker pool
//!   behind a rate-limited, circuit-broken upstream client.
//! - **Precalc plane**: a single-flighted engine that rebuilds graph nodes
//!   and links, runs the force layout and Louvain hierarchy, and commits a
//!   versioned diff.
//! - **Serving plane**: an axum HTTP/WebSocket API with strict size caps,
//!   NDJSON progressive loading, compression negotiation, and content-hash
//!   caching.

pub mod config;
pub mod crawl;
pub mod error;
pub mod fetch;
pub mod model;
pub mod precalc;
pub mod serve;
pub mod store;

// Re-export the main public API
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::model::{
    CrawlStatus, DiffAction, EntityType, GraphLink, GraphNode, NodeKind, VersionStatus,
};
pub use crate::store::Store;
