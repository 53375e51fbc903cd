//! Rate-limited, retrying client for the upstream platform.
//!
//! The client hides token refresh, 429/503 backoff with `Retry-After`, and
//! per-endpoint circuit breaking. Workers depend on the [`Fetcher`]
//! capability set, not on the concrete client, so tests substitute fakes.

pub mod breaker;
pub mod ratelimit;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::model::Timestamp;

use breaker::{BreakerConfig, BreakerMap};
use ratelimit::TokenBucket;

/// A subreddit's profile as reported by a listing response.
#[derive(Debug, Clone, Default)]
pub struct SubredditInfo {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub subscribers: i64,
    pub created_at: Option<Timestamp>,
}

/// One post out of a listing.
#[derive(Debug, Clone)]
pub struct PostInfo {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub selftext: Option<String>,
    pub permalink: Option<String>,
    pub score: i64,
    pub flair: Option<String>,
    pub url: Option<String>,
    pub is_self: bool,
    pub created_at: Option<Timestamp>,
    pub num_comments: i64,
}

/// One comment out of a post's tree, already flattened.
#[derive(Debug, Clone)]
pub struct CommentInfo {
    pub id: String,
    pub parent_id: Option<String>,
    pub author: Option<String>,
    pub body: Option<String>,
    pub score: i64,
    pub depth: i64,
    pub created_at: Option<Timestamp>,
}

/// A page of a subreddit's post listing.
#[derive(Debug, Clone)]
pub struct Listing {
    pub subreddit: SubredditInfo,
    pub posts: Vec<PostInfo>,
    pub after: Option<String>,
}

/// A post's flattened comment tree.
#[derive(Debug, Clone)]
pub struct PostTree {
    pub post_id: String,
    pub comments: Vec<CommentInfo>,
}

/// Subreddits a user was recently active in.
#[derive(Debug, Clone)]
pub struct UserActivity {
    pub username: String,
    pub created_at: Option<Timestamp>,
    pub subreddits: Vec<String>,
}

/// Capability set the crawl workers depend on.
pub trait Fetcher: Send + Sync + 'static {
    /// One page of a subreddit's newest posts.
    fn listing(
        &self,
        subreddit: String,
        after: Option<String>,
    ) -> impl Future<Output = Result<Listing>> + Send;

    /// The comment tree under one post.
    fn post_tree(&self, post_id: String) -> impl Future<Output = Result<PostTree>> + Send;

    /// A user's recent activity footprint.
    fn user_activity(&self, username: String) -> impl Future<Output = Result<UserActivity>> + Send;
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Timestamp,
}

/// The concrete upstream client.
pub struct RedditFetcher {
    http: reqwest::Client,
    config: UpstreamConfig,
    bucket: TokenBucket,
    breakers: BreakerMap,
    token: Mutex<Option<CachedToken>>,
}

/// Attempts per request before the error is handed to the retry queue.
const MAX_ATTEMPTS: u32 = 3;
/// Fallback pause when a 429/503 carries no usable Retry-After.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

impl RedditFetcher {
    /// Builds a client for `config`, optionally seeded with token material
    /// loaded out-of-band.
    pub fn new(
        config: UpstreamConfig,
        rate_per_sec: f64,
        burst: u32,
        seed_token: Option<(String, Timestamp)>,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| Error::Internal(format!("http client: {err}")))?;
        Ok(Arc::new(Self {
            http,
            config,
            bucket: TokenBucket::new(rate_per_sec, burst),
            breakers: BreakerMap::new(BreakerConfig::default()),
            token: Mutex::new(seed_token.map(|(access_token, expires_at)| CachedToken {
                access_token,
                expires_at,
            })),
        }))
    }

    /// Breaker states for health reporting.
    pub fn breaker_snapshot(&self) -> Vec<(String, breaker::BreakerState)> {
        self.breakers.snapshot()
    }

    async fn ensure_token(&self) -> Result<String> {
        let now = OffsetDateTime::now_utc();
        if let Some(cached) = self.token.lock().clone() {
            if cached.expires_at > now + Duration::from_secs(60) {
                return Ok(cached.access_token);
            }
        }
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<String> {
        if self.config.client_id.is_empty() {
            return Err(Error::AuthRequired);
        }
        let response = self
            .http
            .post(&self.config.oauth_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::AuthInvalid);
        }
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "token refresh failed with {}",
                response.status()
            )));
        }
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }
        let body: TokenResponse = response.json().await?;
        let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(body.expires_in);
        let mut token = self.token.lock();
        *token = Some(CachedToken {
            access_token: body.access_token.clone(),
            expires_at,
        });
        tracing::debug!("refreshed upstream access token");
        Ok(body.access_token)
    }

    /// Shared request path: breaker admission, pacing, auth, bounded retry
    /// on 429/503 honouring `Retry-After`.
    async fn get_json(&self, endpoint: &'static str, path: String) -> Result<serde_json::Value> {
        self.breakers.check(endpoint)?;
        let outcome = self.get_json_inner(&path).await;
        match &outcome {
            Ok(_) => self.breakers.record_success(endpoint),
            // Hard 4xx rejections are the caller's problem, not the
            // endpoint's health.
            Err(Error::NotFound(_)) | Err(Error::AuthRequired) | Err(Error::AuthInvalid) => {}
            Err(_) => self.breakers.record_failure(endpoint),
        }
        outcome
    }

    async fn get_json_inner(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.bucket.acquire().await;
            let token = self.ensure_token().await?;
            let response = self.http.get(&url).bearer_auth(&token).send().await?;
            let status = response.status();
            match status.as_u16() {
                200..=299 => return Ok(response.json().await?),
                401 => {
                    // Token expired server-side; refresh once and retry.
                    self.refresh_token().await?;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::AuthInvalid);
                    }
                }
                404 | 410 => return Err(Error::NotFound("upstream resource")),
                429 | 503 => {
                    let wait = retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::RateLimited {
                            retry_after_secs: wait.as_secs().max(1),
                        });
                    }
                    tracing::debug!(%status, wait_secs = wait.as_secs(), url, "upstream throttled, pausing");
                    tokio::time::sleep(wait).await;
                }
                500..=599 => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::Upstream(format!("{status} from {url}")));
                    }
                    tokio::time::sleep(DEFAULT_RETRY_AFTER).await;
                }
                _ => return Err(Error::Upstream(format!("{status} from {url}"))),
            }
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn timestamp_from_epoch(value: Option<f64>) -> Option<Timestamp> {
    value.and_then(|secs| OffsetDateTime::from_unix_timestamp(secs as i64).ok())
}

fn opt_string(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn author_of(value: &serde_json::Value) -> Option<String> {
    opt_string(value, "author").filter(|name| name != "[deleted]")
}

fn parse_post(data: &serde_json::Value) -> Option<PostInfo> {
    Some(PostInfo {
        id: opt_string(data, "name").or_else(|| opt_string(data, "id"))?,
        title: opt_string(data, "title").unwrap_or_default(),
        author: author_of(data),
        selftext: opt_string(data, "selftext"),
        permalink: opt_string(data, "permalink"),
        score: data.get("score").and_then(|v| v.as_i64()).unwrap_or(0),
        flair: opt_string(data, "link_flair_text"),
        url: opt_string(data, "url"),
        is_self: data.get("is_self").and_then(|v| v.as_bool()).unwrap_or(false),
        created_at: timestamp_from_epoch(data.get("created_utc").and_then(|v| v.as_f64())),
        num_comments: data
            .get("num_comments")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}

fn flatten_comments(
    value: &serde_json::Value,
    depth: i64,
    parent: Option<&str>,
    out: &mut Vec<CommentInfo>,
) {
    let Some(children) = value
        .pointer("/data/children")
        .and_then(|v| v.as_array())
    else {
        return;
    };
    for child in children {
        if child.get("kind").and_then(|v| v.as_str()) != Some("t1") {
            continue;
        }
        let Some(data) = child.get("data") else { continue };
        let Some(id) = opt_string(data, "name").or_else(|| opt_string(data, "id")) else {
            continue;
        };
        out.push(CommentInfo {
            id: id.clone(),
            parent_id: parent.map(str::to_string),
            author: author_of(data),
            body: opt_string(data, "body"),
            score: data.get("score").and_then(|v| v.as_i64()).unwrap_or(0),
            depth,
            created_at: timestamp_from_epoch(data.get("created_utc").and_then(|v| v.as_f64())),
        });
        if let Some(replies) = data.get("replies") {
            if replies.is_object() {
                flatten_comments(replies, depth + 1, Some(&id), out);
            }
        }
    }
}

impl Fetcher for RedditFetcher {
    fn listing(
        &self,
        subreddit: String,
        after: Option<String>,
    ) -> impl Future<Output = Result<Listing>> + Send {
        async move {
            let mut path = format!("/r/{subreddit}/new.json?limit=100&raw_json=1");
            if let Some(after) = &after {
                path.push_str("&after=");
                path.push_str(after);
            }
            let body = self.get_json("listing", path).await?;
            let about = self
                .get_json("about", format!("/r/{subreddit}/about.json?raw_json=1"))
                .await?;
            let about_data = about.get("data").cloned().unwrap_or_default();
            let info = SubredditInfo {
                name: opt_string(&about_data, "display_name").unwrap_or(subreddit),
                title: opt_string(&about_data, "title"),
                description: opt_string(&about_data, "public_description"),
                subscribers: about_data
                    .get("subscribers")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
                created_at: timestamp_from_epoch(
                    about_data.get("created_utc").and_then(|v| v.as_f64()),
                ),
            };
            let posts = body
                .pointer("/data/children")
                .and_then(|v| v.as_array())
                .map(|children| {
                    children
                        .iter()
                        .filter(|c| c.get("kind").and_then(|v| v.as_str()) == Some("t3"))
                        .filter_map(|c| c.get("data").and_then(parse_post))
                        .collect()
                })
                .unwrap_or_default();
            let after = body
                .pointer("/data/after")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Ok(Listing {
                subreddit: info,
                posts,
                after,
            })
        }
    }

    fn post_tree(&self, post_id: String) -> impl Future<Output = Result<PostTree>> + Send {
        async move {
            let short_id = post_id.strip_prefix("t3_").unwrap_or(&post_id);
            let body = self
                .get_json(
                    "post_tree",
                    format!("/comments/{short_id}.json?limit=500&depth=10&raw_json=1"),
                )
                .await?;
            // The endpoint returns [listing-of-post, listing-of-comments].
            let mut comments = Vec::new();
            if let Some(tree) = body.get(1) {
                flatten_comments(tree, 0, None, &mut comments);
            }
            Ok(PostTree { post_id, comments })
        }
    }

    fn user_activity(&self, username: String) -> impl Future<Output = Result<UserActivity>> + Send {
        async move {
            let body = self
                .get_json(
                    "user_activity",
                    format!("/user/{username}/overview.json?limit=100&raw_json=1"),
                )
                .await?;
            let mut subreddits: Vec<String> = Vec::new();
            if let Some(children) = body.pointer("/data/children").and_then(|v| v.as_array()) {
                for child in children {
                    if let Some(name) = child
                        .get("data")
                        .and_then(|data| opt_string(data, "subreddit"))
                    {
                        if !subreddits.contains(&name) {
                            subreddits.push(name);
                        }
                    }
                }
            }
            Ok(UserActivity {
                username,
                created_at: None,
                subreddits,
            })
        }
    }
}
