//! The monotone version log, per-version diff rows, and the precalc
//! bookkeeping singleton.
//!
//! A version is opened `pending`, filled with diff rows, then committed
//! `completed` in one transaction together with the `precalc_state` update.
//! Readers only ever observe committed versions (I4).

use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::error::Result;
use crate::model::{
    DiffAction, EntityType, GraphDiff, GraphVersion, PrecalcState, VersionStatus,
};

use super::Store;

/// A diff row ready for insertion under a pending version.
#[derive(Debug, Clone)]
pub struct DiffRow {
    pub action: DiffAction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub old_val: Option<String>,
    pub new_val: Option<String>,
    pub old_pos: Option<[f64; 3]>,
    pub new_pos: Option<[f64; 3]>,
}

/// One version's committed metadata plus its ordered diff rows.
#[derive(Debug, Clone)]
pub struct VersionDiffs {
    pub version: GraphVersion,
    pub diffs: Vec<GraphDiff>,
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<GraphVersion> {
    let status: String = row.get(4)?;
    Ok(GraphVersion {
        id: row.get(0)?,
        created_at: row.get(1)?,
        node_count: row.get(2)?,
        link_count: row.get(3)?,
        status: VersionStatus::parse(&status).unwrap_or(VersionStatus::Failed),
        is_full_rebuild: row.get(5)?,
        precalc_duration_ms: row.get(6)?,
    })
}

const VERSION_COLUMNS: &str =
    "id, created_at, node_count, link_count, status, is_full_rebuild, precalc_duration_ms";

fn diff_from_row(row: &Row<'_>) -> rusqlite::Result<GraphDiff> {
    let action: String = row.get(2)?;
    let entity_type: String = row.get(3)?;
    let old_pos = match (row.get::<_, Option<f64>>(7)?, row.get(8)?, row.get(9)?) {
        (Some(x), Some(y), Some(z)) => Some([x, y, z]),
        _ => None,
    };
    let new_pos = match (row.get::<_, Option<f64>>(10)?, row.get(11)?, row.get(12)?) {
        (Some(x), Some(y), Some(z)) => Some([x, y, z]),
        _ => None,
    };
    Ok(GraphDiff {
        id: row.get(0)?,
        version_id: row.get(1)?,
        action: DiffAction::parse(&action).unwrap_or(DiffAction::Update),
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::Node),
        entity_id: row.get(4)?,
        old_val: row.get(5)?,
        new_val: row.get(6)?,
        old_pos,
        new_pos,
    })
}

const DIFF_COLUMNS: &str = "id, version_id, action, entity_type, entity_id, old_val, new_val,
    old_pos_x, old_pos_y, old_pos_z, new_pos_x, new_pos_y, new_pos_z";

impl Store {
    /// Opens a new pending version and returns its id.
    pub fn open_version(&self, is_full_rebuild: bool) -> Result<i64> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO graph_versions (created_at, status, is_full_rebuild)
                 VALUES (?1, 'pending', ?2)
                 RETURNING id",
                params![now, is_full_rebuild],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Appends diff rows to a pending version.
    pub fn insert_diffs(&self, version_id: i64, rows: &[DiffRow]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO graph_diffs (version_id, action, entity_type, entity_id,
                                              old_val, new_val,
                                              old_pos_x, old_pos_y, old_pos_z,
                                              new_pos_x, new_pos_y, new_pos_z)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )?;
                for row in rows {
                    stmt.execute(params![
                        version_id,
                        row.action.as_str(),
                        row.entity_type.as_str(),
                        row.entity_id,
                        row.old_val,
                        row.new_val,
                        row.old_pos.map(|p| p[0]),
                        row.old_pos.map(|p| p[1]),
                        row.old_pos.map(|p| p[2]),
                        row.new_pos.map(|p| p[0]),
                        row.new_pos.map(|p| p[1]),
                        row.new_pos.map(|p| p[2]),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Commits a pending version and flips the precalc bookkeeping to it,
    /// atomically. Readers see the new version only after this returns.
    pub fn commit_version(
        &self,
        version_id: i64,
        node_count: i64,
        link_count: i64,
        duration_ms: i64,
        is_full_rebuild: bool,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE graph_versions
                 SET status = 'completed', node_count = ?1, link_count = ?2,
                     precalc_duration_ms = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![node_count, link_count, duration_ms, version_id],
            )?;
            tx.execute(
                "UPDATE precalc_state
                 SET last_precalc_at = ?1,
                     last_full_precalc_at = CASE WHEN ?2 THEN ?1 ELSE last_full_precalc_at END,
                     total_nodes = ?3, total_links = ?4, duration_ms = ?5,
                     current_version_id = ?6
                 WHERE id = 1",
                params![now, is_full_rebuild, node_count, link_count, duration_ms, version_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Marks a pending version failed; `precalc_state` keeps pointing at the
    /// previous committed version.
    pub fn fail_version(&self, version_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE graph_versions SET status = 'failed'
                 WHERE id = ?1 AND status = 'pending'",
                [version_id],
            )?;
            Ok(())
        })
    }

    /// The latest committed version, if any.
    pub fn current_version(&self) -> Result<Option<GraphVersion>> {
        self.with_conn(|conn| {
            let version = conn
                .query_row(
                    &format!(
                        "SELECT {VERSION_COLUMNS} FROM graph_versions
                         WHERE status = 'completed'
                         ORDER BY id DESC LIMIT 1"
                    ),
                    [],
                    version_from_row,
                )
                .optional()?;
            Ok(version)
        })
    }

    /// Committed versions newer than `since`, each with its ordered diffs.
    pub fn diffs_since(&self, since: i64) -> Result<Vec<VersionDiffs>> {
        self.with_conn(|conn| {
            let mut versions = Vec::new();
            {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {VERSION_COLUMNS} FROM graph_versions
                     WHERE status = 'completed' AND id > ?1
                     ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map([since], version_from_row)?;
                for row in rows {
                    versions.push(row?);
                }
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT {DIFF_COLUMNS} FROM graph_diffs
                 WHERE version_id = ?1 ORDER BY id ASC"
            ))?;
            let mut out = Vec::with_capacity(versions.len());
            for version in versions {
                let rows = stmt.query_map([version.id], diff_from_row)?;
                let mut diffs = Vec::new();
                for row in rows {
                    diffs.push(row?);
                }
                out.push(VersionDiffs { version, diffs });
            }
            Ok(out)
        })
    }

    /// The precalc bookkeeping singleton.
    pub fn precalc_state(&self) -> Result<PrecalcState> {
        self.with_conn(|conn| {
            let state = conn.query_row(
                "SELECT last_precalc_at, last_full_precalc_at, total_nodes, total_links,
                        duration_ms, current_version_id
                 FROM precalc_state WHERE id = 1",
                [],
                |row| {
                    Ok(PrecalcState {
                        last_precalc_at: row.get(0)?,
                        last_full_precalc_at: row.get(1)?,
                        total_nodes: row.get(2)?,
                        total_links: row.get(3)?,
                        duration_ms: row.get(4)?,
                        current_version_id: row.get(5)?,
                    })
                },
            )?;
            Ok(state)
        })
    }
}
