//! Additive schema migrations.
//!
//! Each migration runs in its own transaction and is recorded in
//! `schema_migrations`. Optional capabilities (the position columns) are
//! probed from the live schema rather than assumed from the migration level,
//! so a database managed by older binaries degrades cleanly.

use rusqlite::Connection;

use crate::error::Result;

/// Highest migration this binary knows about.
pub const LATEST_VERSION: i64 = 4;

/// Migration 1: domain entities, OAuth material, and the crawl queue.
const V1_ENTITIES_AND_QUEUE: &str = "
CREATE TABLE IF NOT EXISTS subreddits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    title TEXT,
    description TEXT,
    subscribers INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    last_seen TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    created_at TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS posts (
    id TEXT PRIMARY KEY,
    subreddit_id INTEGER NOT NULL REFERENCES subreddits (id),
    author_id INTEGER REFERENCES users (id),
    title TEXT NOT NULL,
    selftext TEXT,
    permalink TEXT,
    created_at TEXT,
    score INTEGER NOT NULL DEFAULT 0,
    flair TEXT,
    url TEXT,
    is_self INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_posts_subreddit ON posts (subreddit_id);
CREATE INDEX IF NOT EXISTS idx_posts_author ON posts (author_id);

CREATE TABLE IF NOT EXISTS comments (
    id TEXT PRIMARY KEY,
    post_id TEXT NOT NULL REFERENCES posts (id),
    author_id INTEGER REFERENCES users (id),
    subreddit_id INTEGER NOT NULL REFERENCES subreddits (id),
    parent_id TEXT,
    body TEXT,
    created_at TEXT,
    score INTEGER NOT NULL DEFAULT 0,
    depth INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_comments_post ON comments (post_id);
CREATE INDEX IF NOT EXISTS idx_comments_author ON comments (author_id);

CREATE TABLE IF NOT EXISTS oauth_accounts (
    reddit_user_id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at TEXT NOT NULL,
    scopes TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS crawl_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subreddit_id INTEGER NOT NULL REFERENCES subreddits (id),
    status TEXT NOT NULL DEFAULT 'queued',
    priority INTEGER NOT NULL DEFAULT 0,
    retries INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    visible_at TEXT,
    next_retry_at TEXT,
    last_attempt TEXT,
    duration_ms INTEGER,
    enqueued_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ux_crawl_jobs_active
    ON crawl_jobs (subreddit_id) WHERE status IN ('queued', 'crawling');
CREATE INDEX IF NOT EXISTS idx_crawl_jobs_status ON crawl_jobs (status, priority, id);

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    subreddit_id INTEGER REFERENCES subreddits (id),
    cron_expression TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT,
    priority INTEGER NOT NULL DEFAULT 0
);

CREATE TRIGGER IF NOT EXISTS trg_subreddits_updated AFTER UPDATE ON subreddits
BEGIN
    UPDATE subreddits SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id AND NEW.updated_at = OLD.updated_at;
END;

CREATE TRIGGER IF NOT EXISTS trg_users_updated AFTER UPDATE ON users
BEGIN
    UPDATE users SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id AND NEW.updated_at = OLD.updated_at;
END;

CREATE TRIGGER IF NOT EXISTS trg_posts_updated AFTER UPDATE ON posts
BEGIN
    UPDATE posts SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id AND NEW.updated_at = OLD.updated_at;
END;

CREATE TRIGGER IF NOT EXISTS trg_comments_updated AFTER UPDATE ON comments
BEGIN
    UPDATE comments SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = NEW.id AND NEW.updated_at = OLD.updated_at;
END;
";

/// Migration 2: the materialized graph and the monotone version log.
const V2_GRAPH_AND_VERSIONS: &str = "
CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    val TEXT,
    type TEXT
);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_type ON graph_nodes (type);

CREATE TABLE IF NOT EXISTS graph_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    UNIQUE (source, target)
);
CREATE INDEX IF NOT EXISTS idx_graph_links_target ON graph_links (target);

CREATE TABLE IF NOT EXISTS graph_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    node_count INTEGER NOT NULL DEFAULT 0,
    link_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    is_full_rebuild INTEGER NOT NULL DEFAULT 0,
    precalc_duration_ms INTEGER
);

CREATE TABLE IF NOT EXISTS graph_diffs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version_id INTEGER NOT NULL REFERENCES graph_versions (id),
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    old_val TEXT,
    new_val TEXT,
    old_pos_x REAL, old_pos_y REAL, old_pos_z REAL,
    new_pos_x REAL, new_pos_y REAL, new_pos_z REAL
);
CREATE INDEX IF NOT EXISTS idx_graph_diffs_version ON graph_diffs (version_id, id);

CREATE TABLE IF NOT EXISTS precalc_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_precalc_at TEXT,
    last_full_precalc_at TEXT,
    total_nodes INTEGER NOT NULL DEFAULT 0,
    total_links INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER,
    current_version_id INTEGER
);
INSERT OR IGNORE INTO precalc_state (id) VALUES (1);
";

/// Migration 3: feature-gated 3D position columns.
const V3_POSITIONS: &str = "
ALTER TABLE graph_nodes ADD COLUMN pos_x REAL;
ALTER TABLE graph_nodes ADD COLUMN pos_y REAL;
ALTER TABLE graph_nodes ADD COLUMN pos_z REAL;
";

/// Migration 4: community decomposition and inter-community bundles.
const V4_COMMUNITIES: &str = "
CREATE TABLE IF NOT EXISTS communities (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    modularity REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS community_members (
    community_id INTEGER NOT NULL REFERENCES communities (id),
    node_id TEXT NOT NULL,
    PRIMARY KEY (community_id, node_id)
);

CREATE TABLE IF NOT EXISTS community_hierarchy (
    node_id TEXT NOT NULL,
    level INTEGER NOT NULL,
    community_id INTEGER NOT NULL,
    parent_community_id INTEGER,
    centroid_x REAL, centroid_y REAL, centroid_z REAL,
    PRIMARY KEY (node_id, level)
);
CREATE INDEX IF NOT EXISTS idx_hierarchy_level ON community_hierarchy (level, community_id);

CREATE TABLE IF NOT EXISTS community_bundles (
    source_community_id INTEGER NOT NULL,
    target_community_id INTEGER NOT NULL,
    weight REAL NOT NULL DEFAULT 0,
    avg_strength REAL NOT NULL DEFAULT 0,
    control_x REAL, control_y REAL, control_z REAL,
    PRIMARY KEY (source_community_id, target_community_id)
);
";

const MIGRATIONS: &[(i64, &str)] = &[
    (1, V1_ENTITIES_AND_QUEUE),
    (2, V2_GRAPH_AND_VERSIONS),
    (3, V3_POSITIONS),
    (4, V4_COMMUNITIES),
];

/// Applies every migration with version ≤ `target` that has not yet run.
pub fn migrate(conn: &mut Connection, target: i64) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )?;

    for (version, sql) in MIGRATIONS {
        if *version > target {
            break;
        }
        let applied: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE version = ?1)",
            [version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at)
             VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
            [version],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

/// Probes `graph_nodes` for the optional position columns.
pub fn has_position_columns(conn: &Connection) -> Result<bool> {
    let mut stmt = conn.prepare("PRAGMA table_info(graph_nodes)")?;
    let mut found = false;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "pos_x" {
            found = true;
        }
    }
    Ok(found)
}
