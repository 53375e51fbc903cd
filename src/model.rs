//! Data models for crawled entities and the materialized graph.
//!
//! This module defines the rows the store persists and the wire shapes the
//! serving plane emits. Domain entities (subreddits, users, posts, comments)
//! are created on first sighting and refreshed on re-sighting; graph entities
//! are derived projections written by the precalc engine.
//!
//! # Key Types
//!
//! - [`GraphNode`] / [`GraphLink`] - materialized graph projection
//! - [`CrawlJob`] / [`ScheduledJob`] - queue entities
//! - [`GraphVersion`] / [`GraphDiff`] - monotone version log with diff rows
//! - [`parse_weight`] - the single place the `val` sorting contract lives

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Timestamps are RFC 3339 UTC on the wire and in the store.
pub type Timestamp = OffsetDateTime;

/// A tracked subreddit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subreddit {
    pub id: i64,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub subscribers: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

/// A sighted author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

/// A crawled post. Ids are the platform's fullname strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub subreddit_id: i64,
    pub author_id: Option<i64>,
    pub title: String,
    pub selftext: Option<String>,
    pub permalink: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<Timestamp>,
    pub score: i64,
    pub flair: Option<String>,
    pub url: Option<String>,
    pub is_self: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

/// A crawled comment, positioned in its post's tree by `parent_id`/`depth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author_id: Option<i64>,
    pub subreddit_id: i64,
    pub parent_id: Option<String>,
    pub body: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<Timestamp>,
    pub score: i64,
    pub depth: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: Timestamp,
}

/// Opaque OAuth material for the upstream platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAccount {
    pub reddit_user_id: String,
    pub username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: Timestamp,
    pub scopes: String,
}

/// Crawl job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Queued,
    Crawling,
    Success,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Queued => "queued",
            CrawlStatus::Crawling => "crawling",
            CrawlStatus::Success => "success",
            CrawlStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(CrawlStatus::Queued),
            "crawling" => Some(CrawlStatus::Crawling),
            "success" => Some(CrawlStatus::Success),
            "failed" => Some(CrawlStatus::Failed),
            _ => None,
        }
    }

    /// Non-terminal states block re-enqueueing the same target.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CrawlStatus::Success | CrawlStatus::Failed)
    }
}

/// A queued crawl of one subreddit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: i64,
    pub subreddit_id: i64,
    pub status: CrawlStatus,
    pub priority: i64,
    pub retries: i64,
    pub max_retries: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub visible_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt: Option<Timestamp>,
    pub duration_ms: Option<i64>,
    pub enqueued_by: Option<String>,
}

/// A recurring crawl definition driven by a cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub subreddit_id: Option<i64>,
    pub cron_expression: String,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<Timestamp>,
    pub priority: i64,
}

/// Node kinds projected into the graph. The set is open-ended; kinds the
/// reader does not recognize round-trip through [`NodeKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Subreddit,
    User,
    Post,
    Comment,
    Other(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Subreddit => "subreddit",
            NodeKind::User => "user",
            NodeKind::Post => "post",
            NodeKind::Comment => "comment",
            NodeKind::Other(name) => name,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "subreddit" => NodeKind::Subreddit,
            "user" => NodeKind::User,
            "post" => NodeKind::Post,
            "comment" => NodeKind::Comment,
            other => NodeKind::Other(other.to_string()),
        }
    }
}

impl Serialize for NodeKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NodeKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(NodeKind::parse(&raw))
    }
}

/// A materialized graph node.
///
/// `val` carries the node's weight as decimal text and is preserved verbatim
/// on the wire; [`parse_weight`] defines how it orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<NodeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_z: Option<f64>,
}

impl GraphNode {
    /// The node's weight under the sorting contract.
    pub fn weight(&self) -> u64 {
        parse_weight(self.val.as_deref())
    }

    /// Strips position fields, for responses without `with_positions`.
    pub fn without_positions(mut self) -> Self {
        self.pos_x = None;
        self.pos_y = None;
        self.pos_z = None;
        self
    }
}

/// A directed link between two graph nodes. Links own nothing; they
/// reference node ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphLink {
    pub source: String,
    pub target: String,
}

/// Parses the `val` weight contract: a non-negative integer when the text is
/// all ASCII digits, otherwise 0. Missing values are 0.
pub fn parse_weight(val: Option<&str>) -> u64 {
    match val {
        Some(raw) if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) => {
            raw.parse().unwrap_or(u64::MAX)
        }
        _ => 0,
    }
}

/// A detected community at some level of the hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: i64,
    pub label: String,
    pub size: i64,
    pub modularity: f64,
}

/// One row per (node, level) of the community hierarchy; level 0 is the leaf
/// partition and every original node appears at every level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityAssignment {
    pub node_id: String,
    pub level: i64,
    pub community_id: i64,
    pub parent_community_id: Option<i64>,
    pub centroid_x: Option<f64>,
    pub centroid_y: Option<f64>,
    pub centroid_z: Option<f64>,
}

/// Aggregated inter-community edge with an optional bundling control point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityBundle {
    pub source_community_id: i64,
    pub target_community_id: i64,
    pub weight: f64,
    pub avg_strength: f64,
    pub control_x: Option<f64>,
    pub control_y: Option<f64>,
    pub control_z: Option<f64>,
}

/// Version lifecycle. Only `Completed` versions are visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Pending,
    Completed,
    Failed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Pending => "pending",
            VersionStatus::Completed => "completed",
            VersionStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(VersionStatus::Pending),
            "completed" => Some(VersionStatus::Completed),
            "failed" => Some(VersionStatus::Failed),
            _ => None,
        }
    }
}

/// A committed (or in-flight) graph snapshot in the monotone version log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphVersion {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    pub node_count: i64,
    pub link_count: i64,
    pub status: VersionStatus,
    pub is_full_rebuild: bool,
    pub precalc_duration_ms: Option<i64>,
}

/// What a diff row did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Add,
    Remove,
    Update,
}

impl DiffAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffAction::Add => "add",
            DiffAction::Remove => "remove",
            DiffAction::Update => "update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "add" => Some(DiffAction::Add),
            "remove" => Some(DiffAction::Remove),
            "update" => Some(DiffAction::Update),
            _ => None,
        }
    }
}

/// Which table a diff row touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Node,
    Link,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Node => "node",
            EntityType::Link => "link",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "node" => Some(EntityType::Node),
            "link" => Some(EntityType::Link),
            _ => None,
        }
    }
}

/// One recorded change belonging to exactly one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDiff {
    pub id: i64,
    pub version_id: i64,
    pub action: DiffAction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub old_val: Option<String>,
    pub new_val: Option<String>,
    pub old_pos: Option<[f64; 3]>,
    pub new_pos: Option<[f64; 3]>,
}

/// Singleton bookkeeping row for the precalc engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecalcState {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_precalc_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_full_precalc_at: Option<Timestamp>,
    pub total_nodes: i64,
    pub total_links: i64,
    pub duration_ms: Option<i64>,
    pub current_version_id: Option<i64>,
}

/// Wire message for one version's worth of changes on the diff channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffMessage {
    pub action: DiffAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<GraphNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<GraphLink>,
    pub version_id: i64,
}
