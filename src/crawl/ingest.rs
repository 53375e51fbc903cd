//! Job execution: expand a crawl target and upsert the entities observed.
//!
//! One job walks one subreddit: recent post listings, the comment trees of
//! the most active posts, and the activity footprint of a bounded set of
//! authors. Everything observed lands in the entity tables (re-sightings
//! refresh `last_seen`). The graph projection over those tables is written
//! by the precalc engine alone; workers never touch `graph_nodes` or
//! `graph_links`.

use std::time::Duration;

use crate::error::Result;
use crate::fetch::Fetcher;
use crate::store::{NewComment, NewPost, Store};

/// Listing pages fetched per job.
const MAX_LISTING_PAGES: usize = 3;
/// Comment trees walked per job, picked from the most commented posts.
const MAX_TREES_PER_JOB: usize = 25;
/// Author activity lookups per job.
const MAX_USER_LOOKUPS: usize = 10;
/// Lease extension granted between expensive phases.
const PHASE_LEASE: Duration = Duration::from_secs(300);

/// Counters describing one finished crawl.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrawlSummary {
    pub posts: usize,
    pub comments: usize,
    pub users: usize,
    pub subreddits_discovered: usize,
}

/// Runs one claimed job against the store. Returns counters for logging.
pub async fn crawl_subreddit<F: Fetcher>(
    store: &Store,
    fetcher: &F,
    job_id: i64,
    subreddit_name: &str,
) -> Result<CrawlSummary> {
    let mut summary = CrawlSummary::default();

    // Phase 1: listing pages. The first page also carries the subreddit's
    // profile, which establishes the stored row and its subscriber weight.
    let mut posts = Vec::new();
    let mut cursor: Option<String> = None;
    let mut subreddit_id = None;
    for page in 0..MAX_LISTING_PAGES {
        let listing = fetcher
            .listing(subreddit_name.to_string(), cursor.clone())
            .await?;
        if page == 0 {
            let info = listing.subreddit.clone();
            let id = {
                let store = store.clone();
                store
                    .run(move |s| {
                        // Subreddit rows are keyed by lowercase name, the
                        // same canonical form the queue uses.
                        s.upsert_subreddit(
                            &info.name.to_lowercase(),
                            info.title.as_deref(),
                            info.description.as_deref(),
                            info.subscribers,
                            info.created_at,
                        )
                    })
                    .await?
            };
            subreddit_id = Some(id);
        }
        posts.extend(listing.posts);
        cursor = listing.after;
        if cursor.is_none() {
            break;
        }
    }
    let subreddit_id = subreddit_id.unwrap_or_default();

    {
        let store = store.clone();
        store.run(move |s| s.extend_lease(job_id, PHASE_LEASE)).await?;
    }

    // Phase 2: posts and their authors.
    let mut authors: Vec<String> = Vec::new();
    for post in &posts {
        let author_id = match &post.author {
            Some(author) => {
                if !authors.contains(author) {
                    authors.push(author.clone());
                }
                let store = store.clone();
                let author = author.clone();
                Some(store.run(move |s| s.upsert_user(&author, None)).await?)
            }
            None => None,
        };
        let row = NewPost {
            id: post.id.clone(),
            subreddit_id,
            author_id,
            title: post.title.clone(),
            selftext: post.selftext.clone(),
            permalink: post.permalink.clone(),
            created_at: post.created_at,
            score: post.score,
            flair: post.flair.clone(),
            url: post.url.clone(),
            is_self: post.is_self,
        };
        {
            let store = store.clone();
            store.run(move |s| s.upsert_post(&row)).await?;
        }
        summary.posts += 1;
    }

    // Phase 3: comment trees for the most commented posts.
    let mut ranked: Vec<_> = posts.iter().collect();
    ranked.sort_by(|a, b| b.num_comments.cmp(&a.num_comments).then(a.id.cmp(&b.id)));
    for post in ranked.into_iter().take(MAX_TREES_PER_JOB) {
        if post.num_comments == 0 {
            continue;
        }
        let tree = fetcher.post_tree(post.id.clone()).await?;
        for comment in &tree.comments {
            let author_id = match &comment.author {
                Some(author) => {
                    if !authors.contains(author) {
                        authors.push(author.clone());
                    }
                    let store = store.clone();
                    let author = author.clone();
                    Some(store.run(move |s| s.upsert_user(&author, None)).await?)
                }
                None => None,
            };
            let row = NewComment {
                id: comment.id.clone(),
                post_id: tree.post_id.clone(),
                author_id,
                subreddit_id,
                parent_id: comment.parent_id.clone(),
                body: comment.body.clone(),
                created_at: comment.created_at,
                score: comment.score,
                depth: comment.depth,
            };
            {
                let store = store.clone();
                store.run(move |s| s.upsert_comment(&row)).await?;
            }
            summary.comments += 1;
        }
    }
    summary.users = authors.len();

    {
        let store = store.clone();
        store.run(move |s| s.extend_lease(job_id, PHASE_LEASE)).await?;
    }

    // Phase 4: activity footprints. Subreddits sighted through an author's
    // activity get a stub entity row on first sighting, which puts them in
    // the precalc projection and makes them schedulable crawl targets.
    // Existing rows are left alone so a stub never clobbers real counts.
    for author in authors.iter().take(MAX_USER_LOOKUPS) {
        let activity = match fetcher.user_activity(author.clone()).await {
            Ok(activity) => activity,
            // A vanished or suspended account is not a job failure.
            Err(err) if !err.is_transient() => {
                tracing::debug!(author, error = %err, "skipping user activity");
                continue;
            }
            Err(err) => return Err(err),
        };
        for name in &activity.subreddits {
            let canon = name.to_lowercase();
            let created = {
                let store = store.clone();
                store
                    .run(move |s| {
                        if s.subreddit_by_name(&canon)?.is_some() {
                            return Ok(false);
                        }
                        s.upsert_subreddit(&canon, None, None, 0, None)?;
                        Ok(true)
                    })
                    .await?
            };
            if created {
                summary.subreddits_discovered += 1;
            }
        }
    }

    Ok(summary)
}
