//! Derivation of graph rows from the source entity tables.
//!
//! The precalc engine rebuilds (or incrementally refreshes) the graph
//! projection from here: one node per entity, `val` carrying the activity
//! weight as decimal text, and the structural links between them. An
//! incremental pass restricts the input set to entities sighted since the
//! previous run; weights are always computed over the full tables.

use rusqlite::params;

use crate::error::Result;
use crate::model::{GraphLink, GraphNode, NodeKind, Timestamp};

use super::Store;

fn node(id: String, name: String, val: Option<String>, kind: NodeKind) -> GraphNode {
    GraphNode {
        id,
        name,
        val,
        kind: Some(kind),
        pos_x: None,
        pos_y: None,
        pos_z: None,
    }
}

impl Store {
    /// Derives the graph projection of the entity tables.
    ///
    /// With `since`, only entities sighted after that instant are included
    /// (the incremental input set); without it the full tables project.
    pub fn derive_graph_rows(
        &self,
        since: Option<Timestamp>,
    ) -> Result<(Vec<GraphNode>, Vec<GraphLink>)> {
        self.with_conn(|conn| {
            let mut nodes = Vec::new();
            let mut links = Vec::new();
            // A far past sentinel keeps one query shape for both passes.
            let since = since.unwrap_or(Timestamp::UNIX_EPOCH);

            {
                let mut stmt = conn.prepare(
                    "SELECT name, MAX(subscribers, 0) FROM subreddits
                     WHERE last_seen > ?1 ORDER BY name",
                )?;
                let mut rows = stmt.query(params![since])?;
                while let Some(row) = rows.next()? {
                    let name: String = row.get(0)?;
                    let subscribers: i64 = row.get(1)?;
                    nodes.push(node(
                        format!("sub:{}", name.to_lowercase()),
                        name,
                        Some(subscribers.to_string()),
                        NodeKind::Subreddit,
                    ));
                }
            }
            {
                let mut stmt = conn.prepare(
                    "SELECT u.username,
                            (SELECT COUNT(*) FROM posts p WHERE p.author_id = u.id) +
                            (SELECT COUNT(*) FROM comments c WHERE c.author_id = u.id)
                     FROM users u WHERE u.last_seen > ?1 ORDER BY u.username",
                )?;
                let mut rows = stmt.query(params![since])?;
                while let Some(row) = rows.next()? {
                    let username: String = row.get(0)?;
                    let activity: i64 = row.get(1)?;
                    nodes.push(node(
                        format!("user:{username}"),
                        username,
                        Some(activity.to_string()),
                        NodeKind::User,
                    ));
                }
            }
            {
                let mut stmt = conn.prepare(
                    "SELECT p.id, p.title, MAX(p.score, 0), LOWER(s.name)
                     FROM posts p JOIN subreddits s ON s.id = p.subreddit_id
                     WHERE p.last_seen > ?1 ORDER BY p.id",
                )?;
                let mut rows = stmt.query(params![since])?;
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let title: String = row.get(1)?;
                    let score: i64 = row.get(2)?;
                    let sub: String = row.get(3)?;
                    links.push(GraphLink {
                        source: id.clone(),
                        target: format!("sub:{sub}"),
                    });
                    nodes.push(node(id, title, Some(score.to_string()), NodeKind::Post));
                }
            }
            {
                let mut stmt = conn.prepare(
                    "SELECT c.id, COALESCE(u.username, '[deleted]'), MAX(c.score, 0), c.post_id
                     FROM comments c LEFT JOIN users u ON u.id = c.author_id
                     WHERE c.last_seen > ?1 ORDER BY c.id",
                )?;
                let mut rows = stmt.query(params![since])?;
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let label: String = row.get(1)?;
                    let score: i64 = row.get(2)?;
                    let post_id: String = row.get(3)?;
                    links.push(GraphLink {
                        source: id.clone(),
                        target: post_id,
                    });
                    nodes.push(node(id, label, Some(score.to_string()), NodeKind::Comment));
                }
            }
            {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT u.username, LOWER(s.name)
                     FROM posts p
                     JOIN users u ON u.id = p.author_id
                     JOIN subreddits s ON s.id = p.subreddit_id
                     WHERE p.last_seen > ?1
                     UNION
                     SELECT DISTINCT u.username, LOWER(s.name)
                     FROM comments c
                     JOIN users u ON u.id = c.author_id
                     JOIN subreddits s ON s.id = c.subreddit_id
                     WHERE c.last_seen > ?1
                     ORDER BY 1, 2",
                )?;
                let mut rows = stmt.query(params![since])?;
                while let Some(row) = rows.next()? {
                    let username: String = row.get(0)?;
                    let sub: String = row.get(1)?;
                    links.push(GraphLink {
                        source: format!("user:{username}"),
                        target: format!("sub:{sub}"),
                    });
                }
            }
            Ok((nodes, links))
        })
    }
}
