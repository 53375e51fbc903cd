//! Upserts for crawled domain entities.
//!
//! Entities are created on first sighting; a re-sighting refreshes
//! `last_seen` and any fields the upstream still reports. Nothing here
//! deletes rows.

use rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

use crate::error::Result;
use crate::model::{OAuthAccount, Subreddit, Timestamp};

use super::Store;

/// A post as observed on the wire, before it has a stored row.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub subreddit_id: i64,
    pub author_id: Option<i64>,
    pub title: String,
    pub selftext: Option<String>,
    pub permalink: Option<String>,
    pub created_at: Option<Timestamp>,
    pub score: i64,
    pub flair: Option<String>,
    pub url: Option<String>,
    pub is_self: bool,
}

/// A comment as observed on the wire.
#[derive(Debug, Clone)]
pub struct NewComment {
    pub id: String,
    pub post_id: String,
    pub author_id: Option<i64>,
    pub subreddit_id: i64,
    pub parent_id: Option<String>,
    pub body: Option<String>,
    pub created_at: Option<Timestamp>,
    pub score: i64,
    pub depth: i64,
}

impl Store {
    /// Creates or refreshes a subreddit row, returning its id.
    pub fn upsert_subreddit(
        &self,
        name: &str,
        title: Option<&str>,
        description: Option<&str>,
        subscribers: i64,
        created_at: Option<Timestamp>,
    ) -> Result<i64> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO subreddits (name, title, description, subscribers, created_at, last_seen, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (name) DO UPDATE SET
                     title = COALESCE(excluded.title, subreddits.title),
                     description = COALESCE(excluded.description, subreddits.description),
                     subscribers = excluded.subscribers,
                     created_at = COALESCE(subreddits.created_at, excluded.created_at),
                     last_seen = excluded.last_seen
                 RETURNING id",
                params![name, title, description, subscribers, created_at, now],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Looks up a subreddit by its unique name.
    pub fn subreddit_by_name(&self, name: &str) -> Result<Option<Subreddit>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, title, description, subscribers, created_at, last_seen, updated_at
                     FROM subreddits WHERE name = ?1",
                    [name],
                    |row| {
                        Ok(Subreddit {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            title: row.get(2)?,
                            description: row.get(3)?,
                            subscribers: row.get(4)?,
                            created_at: row.get(5)?,
                            last_seen: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Looks up a subreddit by id.
    pub fn subreddit_by_id(&self, id: i64) -> Result<Option<Subreddit>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, title, description, subscribers, created_at, last_seen, updated_at
                     FROM subreddits WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(Subreddit {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            title: row.get(2)?,
                            description: row.get(3)?,
                            subscribers: row.get(4)?,
                            created_at: row.get(5)?,
                            last_seen: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Creates or refreshes a user row, returning its id.
    pub fn upsert_user(&self, username: &str, created_at: Option<Timestamp>) -> Result<i64> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO users (username, created_at, first_seen, last_seen, updated_at)
                 VALUES (?1, ?2, ?3, ?3, ?3)
                 ON CONFLICT (username) DO UPDATE SET
                     created_at = COALESCE(users.created_at, excluded.created_at),
                     last_seen = excluded.last_seen
                 RETURNING id",
                params![username, created_at, now],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Creates or refreshes a post row.
    pub fn upsert_post(&self, post: &NewPost) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, subreddit_id, author_id, title, selftext, permalink,
                                    created_at, score, flair, url, is_self, last_seen, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                 ON CONFLICT (id) DO UPDATE SET
                     title = excluded.title,
                     selftext = COALESCE(excluded.selftext, posts.selftext),
                     score = excluded.score,
                     flair = COALESCE(excluded.flair, posts.flair),
                     last_seen = excluded.last_seen",
                params![
                    post.id,
                    post.subreddit_id,
                    post.author_id,
                    post.title,
                    post.selftext,
                    post.permalink,
                    post.created_at,
                    post.score,
                    post.flair,
                    post.url,
                    post.is_self,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Creates or refreshes a comment row.
    pub fn upsert_comment(&self, comment: &NewComment) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO comments (id, post_id, author_id, subreddit_id, parent_id, body,
                                       created_at, score, depth, last_seen, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT (id) DO UPDATE SET
                     body = COALESCE(excluded.body, comments.body),
                     score = excluded.score,
                     last_seen = excluded.last_seen",
                params![
                    comment.id,
                    comment.post_id,
                    comment.author_id,
                    comment.subreddit_id,
                    comment.parent_id,
                    comment.body,
                    comment.created_at,
                    comment.score,
                    comment.depth,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Posts plus comments attributed to a user, the user's activity weight.
    pub fn user_activity(&self, user_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let posts: i64 = conn.query_row(
                "SELECT COUNT(*) FROM posts WHERE author_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            let comments: i64 = conn.query_row(
                "SELECT COUNT(*) FROM comments WHERE author_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(posts + comments)
        })
    }

    /// Row counts per domain table: (subreddits, users, posts, comments).
    pub fn entity_counts(&self) -> Result<(i64, i64, i64, i64)> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<i64> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?)
            };
            Ok((
                count("subreddits")?,
                count("users")?,
                count("posts")?,
                count("comments")?,
            ))
        })
    }

    /// Stores (replacing) an OAuth account's opaque token material.
    pub fn put_oauth_account(&self, account: &OAuthAccount) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO oauth_accounts (reddit_user_id, username, access_token,
                                             refresh_token, expires_at, scopes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (reddit_user_id) DO UPDATE SET
                     username = excluded.username,
                     access_token = excluded.access_token,
                     refresh_token = COALESCE(excluded.refresh_token, oauth_accounts.refresh_token),
                     expires_at = excluded.expires_at,
                     scopes = excluded.scopes",
                params![
                    account.reddit_user_id,
                    account.username,
                    account.access_token,
                    account.refresh_token,
                    account.expires_at,
                    account.scopes,
                ],
            )?;
            Ok(())
        })
    }

    /// Loads any stored OAuth account (single-tenant deployments keep one).
    pub fn oauth_account(&self) -> Result<Option<OAuthAccount>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT reddit_user_id, username, access_token, refresh_token, expires_at, scopes
                     FROM oauth_accounts ORDER BY expires_at DESC LIMIT 1",
                    [],
                    |row| {
                        Ok(OAuthAccount {
                            reddit_user_id: row.get(0)?,
                            username: row.get(1)?,
                            access_token: row.get(2)?,
                            refresh_token: row.get(3)?,
                            expires_at: row.get(4)?,
                            scopes: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }
}
