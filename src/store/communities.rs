//! Community hierarchy and bundle persistence.
//!
//! The community engine produces a complete decomposition per precalc run,
//! so writes replace the previous contents wholesale in one transaction.

use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::model::{Community, CommunityAssignment, CommunityBundle};

use super::Store;

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<CommunityAssignment> {
    Ok(CommunityAssignment {
        node_id: row.get(0)?,
        level: row.get(1)?,
        community_id: row.get(2)?,
        parent_community_id: row.get(3)?,
        centroid_x: row.get(4)?,
        centroid_y: row.get(5)?,
        centroid_z: row.get(6)?,
    })
}

impl Store {
    /// Replaces the whole community decomposition: summary rows, leaf
    /// memberships, hierarchy assignments, and inter-community bundles.
    pub fn replace_communities(
        &self,
        communities: &[Community],
        assignments: &[CommunityAssignment],
        bundles: &[CommunityBundle],
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM community_members;
                 DELETE FROM community_bundles;
                 DELETE FROM community_hierarchy;
                 DELETE FROM communities;",
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO communities (id, label, size, modularity) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for community in communities {
                    stmt.execute(params![
                        community.id,
                        community.label,
                        community.size,
                        community.modularity,
                    ])?;
                }
            }
            {
                let mut member = tx.prepare(
                    "INSERT OR IGNORE INTO community_members (community_id, node_id) VALUES (?1, ?2)",
                )?;
                let mut hierarchy = tx.prepare(
                    "INSERT INTO community_hierarchy
                         (node_id, level, community_id, parent_community_id,
                          centroid_x, centroid_y, centroid_z)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for assignment in assignments {
                    if assignment.level == 0 {
                        member.execute(params![assignment.community_id, assignment.node_id])?;
                    }
                    hierarchy.execute(params![
                        assignment.node_id,
                        assignment.level,
                        assignment.community_id,
                        assignment.parent_community_id,
                        assignment.centroid_x,
                        assignment.centroid_y,
                        assignment.centroid_z,
                    ])?;
                }
            }
            {
                let mut bundle = tx.prepare(
                    "INSERT OR REPLACE INTO community_bundles
                         (source_community_id, target_community_id, weight, avg_strength,
                          control_x, control_y, control_z)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for row in bundles {
                    bundle.execute(params![
                        row.source_community_id,
                        row.target_community_id,
                        row.weight,
                        row.avg_strength,
                        row.control_x,
                        row.control_y,
                        row.control_z,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Community summaries ordered by descending size.
    pub fn list_communities(&self) -> Result<Vec<Community>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, label, size, modularity FROM communities
                 ORDER BY size DESC, id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Community {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    size: row.get(2)?,
                    modularity: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// One community's summary plus its member node ids.
    pub fn community_detail(&self, id: i64) -> Result<(Community, Vec<String>)> {
        self.with_conn(|conn| {
            let community = conn
                .query_row(
                    "SELECT id, label, size, modularity FROM communities WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(Community {
                            id: row.get(0)?,
                            label: row.get(1)?,
                            size: row.get(2)?,
                            modularity: row.get(3)?,
                        })
                    },
                )
                .optional()?
                .ok_or(Error::NotFound("community"))?;
            let mut stmt = conn.prepare(
                "SELECT node_id FROM community_members WHERE community_id = ?1 ORDER BY node_id",
            )?;
            let rows = stmt.query_map([id], |row| row.get(0))?;
            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            Ok((community, members))
        })
    }

    /// All hierarchy assignments, ordered by (level, node_id).
    pub fn hierarchy_assignments(&self) -> Result<Vec<CommunityAssignment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id, level, community_id, parent_community_id,
                        centroid_x, centroid_y, centroid_z
                 FROM community_hierarchy ORDER BY level ASC, node_id ASC",
            )?;
            let rows = stmt.query_map([], assignment_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// All inter-community bundles.
    pub fn list_bundles(&self) -> Result<Vec<CommunityBundle>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_community_id, target_community_id, weight, avg_strength,
                        control_x, control_y, control_z
                 FROM community_bundles
                 ORDER BY source_community_id ASC, target_community_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CommunityBundle {
                    source_community_id: row.get(0)?,
                    target_community_id: row.get(1)?,
                    weight: row.get(2)?,
                    avg_strength: row.get(3)?,
                    control_x: row.get(4)?,
                    control_y: row.get(5)?,
                    control_z: row.get(6)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}
