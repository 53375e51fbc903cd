//! Materialized graph reads and writes.
//!
//! The ordering contract lives here once, in SQL: nodes order by their
//! integer-parsed `val` descending (non-numeric and missing parse as 0) with
//! ties broken by `id` ascending. Keyset pagination reuses the exact same
//! ordering, so consecutive pages partition the unpaginated prefix.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::model::{GraphLink, GraphNode, NodeKind};

use super::Store;

/// SQL expression implementing the `val` weight contract: all-digit text
/// parses as an integer, everything else (including NULL) is 0.
const WEIGHT_EXPR: &str =
    "CASE WHEN val IS NOT NULL AND val != '' AND val NOT GLOB '*[^0-9]*'
          THEN CAST(val AS INTEGER) ELSE 0 END";

/// Node selection parameters shared by reads and the precalc candidate scan.
#[derive(Debug, Clone, Default)]
pub struct NodeSelection {
    pub max_nodes: usize,
    pub types: Option<Vec<NodeKind>>,
    pub with_positions: bool,
}

/// Keyset cursor over the (weight desc, id asc) ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub weight: i64,
    pub id: String,
}

impl PageCursor {
    /// Opaque wire encoding.
    pub fn encode(&self) -> String {
        B64.encode(format!("{}:{}", self.weight, self.id))
    }

    /// Decodes a wire cursor; malformed input is a validation error.
    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = B64
            .decode(raw)
            .map_err(|_| Error::Validation("malformed cursor".into()))?;
        let text =
            String::from_utf8(bytes).map_err(|_| Error::Validation("malformed cursor".into()))?;
        let (weight, id) = text
            .split_once(':')
            .ok_or_else(|| Error::Validation("malformed cursor".into()))?;
        let weight = weight
            .parse()
            .map_err(|_| Error::Validation("malformed cursor".into()))?;
        Ok(Self {
            weight,
            id: id.to_string(),
        })
    }
}

/// One page (or the whole capped set) of nodes plus the links among them.
#[derive(Debug, Clone, Default)]
pub struct GraphSlice {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    pub has_more: bool,
    pub next_cursor: Option<PageCursor>,
}

/// A pending position write for one node.
#[derive(Debug, Clone, Copy)]
pub struct PositionWrite<'a> {
    pub id: &'a str,
    pub pos: [f64; 3],
}

fn node_from_row(row: &Row<'_>, with_positions: bool) -> rusqlite::Result<GraphNode> {
    let kind: Option<String> = row.get(3)?;
    let (pos_x, pos_y, pos_z) = if with_positions {
        (row.get(4)?, row.get(5)?, row.get(6)?)
    } else {
        (None, None, None)
    };
    Ok(GraphNode {
        id: row.get(0)?,
        name: row.get(1)?,
        val: row.get(2)?,
        kind: kind.map(|raw| NodeKind::parse(&raw)),
        pos_x,
        pos_y,
        pos_z,
    })
}

impl Store {
    fn node_columns(&self, with_positions: bool) -> &'static str {
        if with_positions && self.has_position_columns() {
            "id, name, val, type, pos_x, pos_y, pos_z"
        } else {
            "id, name, val, type"
        }
    }

    /// Top nodes under the ordering contract, optionally filtered by type
    /// and resumed from a keyset cursor. Returns up to `limit` nodes.
    pub fn top_nodes(
        &self,
        selection: &NodeSelection,
        after: Option<&PageCursor>,
        limit: usize,
    ) -> Result<Vec<GraphNode>> {
        let read_positions = selection.with_positions && self.has_position_columns();
        let columns = self.node_columns(selection.with_positions);
        self.with_conn(|conn| {
            let mut sql = format!(
                "SELECT {columns}, {WEIGHT_EXPR} AS weight FROM graph_nodes"
            );
            let mut clauses: Vec<String> = Vec::new();
            let mut args: Vec<SqlValue> = Vec::new();

            if let Some(types) = &selection.types {
                let placeholders = vec!["?"; types.len()].join(", ");
                clauses.push(format!("type IN ({placeholders})"));
                for kind in types {
                    args.push(SqlValue::Text(kind.as_str().to_string()));
                }
            }
            if let Some(cursor) = after {
                clauses.push(format!(
                    "({WEIGHT_EXPR} < ? OR ({WEIGHT_EXPR} = ? AND id > ?))"
                ));
                args.push(SqlValue::Integer(cursor.weight));
                args.push(SqlValue::Integer(cursor.weight));
                args.push(SqlValue::Text(cursor.id.clone()));
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY weight DESC, id ASC LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                node_from_row(row, read_positions)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Selects a capped slice: up to `page_limit` nodes from the cursor, the
    /// deduplicated links among them, and the cursor for the next page.
    pub fn graph_slice(
        &self,
        selection: &NodeSelection,
        after: Option<&PageCursor>,
        page_limit: usize,
        max_links: usize,
    ) -> Result<GraphSlice> {
        // Fetch one extra row to learn whether another page exists.
        let mut nodes = self.top_nodes(selection, after, page_limit + 1)?;
        let has_more = nodes.len() > page_limit;
        nodes.truncate(page_limit);
        let next_cursor = if has_more {
            nodes.last().map(|node| PageCursor {
                weight: node.weight().min(i64::MAX as u64) as i64,
                id: node.id.clone(),
            })
        } else {
            None
        };
        let ids: Vec<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        let links = self.links_among(&ids, max_links)?;
        Ok(GraphSlice {
            nodes,
            links,
            has_more,
            next_cursor,
        })
    }

    /// Links whose source AND target are both in `ids`, deduplicated by the
    /// store's `(source, target)` uniqueness, ordered by (source, target).
    pub fn links_among(&self, ids: &[&str], max_links: usize) -> Result<Vec<GraphLink>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "CREATE TEMP TABLE IF NOT EXISTS selected_nodes (id TEXT PRIMARY KEY);
                 DELETE FROM selected_nodes;",
            )?;
            {
                let mut insert = tx.prepare("INSERT OR IGNORE INTO selected_nodes (id) VALUES (?1)")?;
                for id in ids {
                    insert.execute([id])?;
                }
            }
            let mut out = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT l.source, l.target FROM graph_links l
                     JOIN selected_nodes s ON s.id = l.source
                     JOIN selected_nodes t ON t.id = l.target
                     ORDER BY l.source ASC, l.target ASC
                     LIMIT ?1",
                )?;
                let rows = stmt.query_map([max_links as i64], |row| {
                    Ok(GraphLink {
                        source: row.get(0)?,
                        target: row.get(1)?,
                    })
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            tx.execute_batch("DELETE FROM selected_nodes;")?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Bulk-merges nodes by id. Positions are not touched here; layout owns
    /// them through [`Store::batch_update_positions`].
    pub fn upsert_nodes(&self, nodes: &[GraphNode]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO graph_nodes (id, name, val, type)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (id) DO UPDATE SET
                         name = excluded.name,
                         val = excluded.val,
                         type = excluded.type",
                )?;
                for node in nodes {
                    stmt.execute(params![
                        node.id,
                        node.name,
                        node.val,
                        node.kind.as_ref().map(|kind| kind.as_str().to_string()),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Bulk-merges links; `(source, target)` uniqueness makes this idempotent.
    pub fn upsert_links(&self, links: &[GraphLink]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO graph_links (source, target) VALUES (?1, ?2)",
                )?;
                for link in links {
                    stmt.execute(params![link.source, link.target])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Deletes nodes and any links incident to them.
    pub fn delete_nodes(&self, ids: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut del_links = tx.prepare(
                    "DELETE FROM graph_links WHERE source = ?1 OR target = ?1",
                )?;
                let mut del_node = tx.prepare("DELETE FROM graph_nodes WHERE id = ?1")?;
                for id in ids {
                    del_links.execute([id])?;
                    del_node.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Deletes specific links by endpoint pair.
    pub fn delete_links(&self, links: &[GraphLink]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("DELETE FROM graph_links WHERE source = ?1 AND target = ?2")?;
                for link in links {
                    stmt.execute(params![link.source, link.target])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Removes links whose source or target no longer resolves (I1).
    pub fn prune_dangling_links(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM graph_links
                 WHERE source NOT IN (SELECT id FROM graph_nodes)
                    OR target NOT IN (SELECT id FROM graph_nodes)",
                [],
            )?;
            Ok(removed)
        })
    }

    /// Applies one batch of position writes in a single transaction.
    /// Returns the number of rows that matched.
    pub fn batch_update_positions(&self, writes: &[PositionWrite<'_>]) -> Result<usize> {
        if !self.has_position_columns() {
            return Err(Error::Internal(
                "position columns missing from graph_nodes".into(),
            ));
        }
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE graph_nodes SET pos_x = ?2, pos_y = ?3, pos_z = ?4 WHERE id = ?1",
                )?;
                for write in writes {
                    written +=
                        stmt.execute(params![write.id, write.pos[0], write.pos[1], write.pos[2]])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }

    /// Every stored node (the diff baseline). Positions included when the
    /// columns exist.
    pub fn all_nodes(&self) -> Result<Vec<GraphNode>> {
        let read_positions = self.has_position_columns();
        let columns = self.node_columns(true);
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {columns} FROM graph_nodes ORDER BY id ASC"))?;
            let rows = stmt.query_map([], |row| node_from_row(row, read_positions))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Every stored link.
    pub fn all_links(&self) -> Result<Vec<GraphLink>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT source, target FROM graph_links ORDER BY source ASC, target ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok(GraphLink {
                    source: row.get(0)?,
                    target: row.get(1)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Case-insensitive substring search over name and id. Exact matches
    /// sort first, then weight descending, then id.
    pub fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<GraphNode>> {
        let columns = self.node_columns(false);
        let escaped = query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {columns} FROM graph_nodes
                 WHERE name LIKE ?1 ESCAPE '\\' OR id LIKE ?1 ESCAPE '\\'
                 ORDER BY (LOWER(name) = LOWER(?2) OR LOWER(id) = LOWER(?2)) DESC,
                          {WEIGHT_EXPR} DESC, id ASC
                 LIMIT ?3",
            ))?;
            let rows = stmt.query_map(params![pattern, query, limit as i64], |row| {
                node_from_row(row, false)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Fetches nodes by id, preserving the caller's order; missing ids are
    /// skipped.
    pub fn nodes_by_ids(&self, ids: &[String]) -> Result<Vec<GraphNode>> {
        let read_positions = self.has_position_columns();
        let columns = self.node_columns(true);
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {columns} FROM graph_nodes WHERE id = ?1"))?;
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(node) = stmt
                    .query_row([id], |row| node_from_row(row, read_positions))
                    .optional()?
                {
                    out.push(node);
                }
            }
            Ok(out)
        })
    }

    /// Total stored nodes.
    pub fn node_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM graph_nodes", [], |row| row.get(0))?)
        })
    }

    /// Total stored links.
    pub fn link_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM graph_links", [], |row| row.get(0))?)
        })
    }
}
