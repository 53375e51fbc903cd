//! Process configuration, sourced from the environment.
//!
//! Every recognized variable has a default that works for a local
//! single-process deployment; `Config::from_env` never fails, it falls back
//! to defaults on missing or malformed values and logs the fallback.

use std::env;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Layout engine tunables (§ layout pipeline).
#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub max_nodes: usize,
    pub iterations: usize,
    pub batch_size: usize,
    pub epsilon: f64,
    pub auto_tune: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            max_nodes: 5_000,
            iterations: 400,
            batch_size: 5_000,
            epsilon: 0.0,
            auto_tune: true,
        }
    }
}

/// Crawl plane tunables: worker pool, retries, leases, upstream pacing.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub workers: usize,
    pub rate_per_sec: f64,
    pub burst: u32,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_ceiling: Duration,
    pub visibility_timeout: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            rate_per_sec: 1.0,
            burst: 5,
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_ceiling: Duration::from_secs(60),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Response pipeline tunables: compression, cache, ETag freshness.
#[derive(Debug, Clone)]
pub struct ResponseConfig {
    pub compression: bool,
    pub cache_max_bytes: usize,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    pub etag_max_age: Duration,
    pub stale_while_revalidate: Duration,
    pub request_timeout: Duration,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            compression: true,
            cache_max_bytes: 64 * 1024 * 1024,
            cache_max_entries: 256,
            cache_ttl: Duration::from_secs(60),
            etag_max_age: Duration::from_secs(60),
            stale_while_revalidate: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Inbound rate limiting: one global bucket plus one bucket per client IP.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_rps: f64,
    pub global_burst: u32,
    pub per_ip_rps: f64,
    pub per_ip_burst: u32,
    pub cleanup_period: Duration,
    pub idle_expiry: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rps: 500.0,
            global_burst: 1_000,
            per_ip_rps: 25.0,
            per_ip_burst: 50,
            cleanup_period: Duration::from_secs(60),
            idle_expiry: Duration::from_secs(180),
        }
    }
}

/// Upstream platform endpoints and credentials.
///
/// Credentials are consumed opaquely; token refresh happens inside the
/// fetcher against `oauth_url`.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub oauth_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://oauth.reddit.com".to_string(),
            oauth_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            user_agent: "clustermap/0.4 (graph crawler)".to_string(),
        }
    }
}

/// Top-level configuration for both binaries.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub store_pool_size: usize,
    pub layout: LayoutConfig,
    pub crawl: CrawlConfig,
    pub response: ResponseConfig,
    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("clustermap.db"),
            bind_addr: "127.0.0.1:8080".parse().expect("static addr"),
            store_pool_size: 8,
            layout: LayoutConfig::default(),
            crawl: CrawlConfig::default(),
            response: ResponseConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let layout = LayoutConfig {
            max_nodes: read("LAYOUT_MAX_NODES", defaults.layout.max_nodes),
            iterations: read("LAYOUT_ITERATIONS", defaults.layout.iterations),
            batch_size: read("LAYOUT_BATCH_SIZE", defaults.layout.batch_size),
            epsilon: read("LAYOUT_EPSILON", defaults.layout.epsilon),
            auto_tune: read("LAYOUT_AUTO_TUNE", defaults.layout.auto_tune),
        };
        let crawl = CrawlConfig {
            workers: read("CRAWL_WORKERS", defaults.crawl.workers),
            rate_per_sec: read("CRAWL_RATE_PER_SEC", defaults.crawl.rate_per_sec),
            burst: read("CRAWL_BURST", defaults.crawl.burst),
            max_retries: read("CRAWL_MAX_RETRIES", defaults.crawl.max_retries),
            retry_base: read_secs("CRAWL_RETRY_BASE_SECS", defaults.crawl.retry_base),
            retry_ceiling: read_secs("CRAWL_RETRY_CEILING_SECS", defaults.crawl.retry_ceiling),
            visibility_timeout: read_secs(
                "CRAWL_VISIBILITY_TIMEOUT_SECS",
                defaults.crawl.visibility_timeout,
            ),
        };
        let response = ResponseConfig {
            compression: read("RESPONSE_COMPRESSION", defaults.response.compression),
            cache_max_bytes: read("RESPONSE_CACHE_MAX_BYTES", defaults.response.cache_max_bytes),
            cache_max_entries: read(
                "RESPONSE_CACHE_MAX_ENTRIES",
                defaults.response.cache_max_entries,
            ),
            cache_ttl: read_secs("RESPONSE_CACHE_TTL_SECS", defaults.response.cache_ttl),
            etag_max_age: read_secs("RESPONSE_ETAG_TTL_SECS", defaults.response.etag_max_age),
            stale_while_revalidate: read_secs(
                "RESPONSE_SWR_SECS",
                defaults.response.stale_while_revalidate,
            ),
            request_timeout: read_secs(
                "RESPONSE_TIMEOUT_SECS",
                defaults.response.request_timeout,
            ),
        };
        let rate_limit = RateLimitConfig {
            global_rps: read("RATE_LIMIT_RPS", defaults.rate_limit.global_rps),
            global_burst: read("RATE_LIMIT_BURST", defaults.rate_limit.global_burst),
            per_ip_rps: read("RATE_LIMIT_PER_IP_RPS", defaults.rate_limit.per_ip_rps),
            per_ip_burst: read("RATE_LIMIT_PER_IP_BURST", defaults.rate_limit.per_ip_burst),
            cleanup_period: read_secs(
                "RATE_LIMIT_CLEANUP_SECS",
                defaults.rate_limit.cleanup_period,
            ),
            idle_expiry: read_secs("RATE_LIMIT_IDLE_SECS", defaults.rate_limit.idle_expiry),
        };
        let upstream = UpstreamConfig {
            base_url: read("REDDIT_BASE_URL", defaults.upstream.base_url),
            oauth_url: read("REDDIT_OAUTH_URL", defaults.upstream.oauth_url),
            client_id: read("REDDIT_CLIENT_ID", defaults.upstream.client_id),
            client_secret: read("REDDIT_CLIENT_SECRET", defaults.upstream.client_secret),
            user_agent: read("REDDIT_USER_AGENT", defaults.upstream.user_agent),
        };
        Self {
            database_path: read("DATABASE_PATH", defaults.database_path),
            bind_addr: read("BIND_ADDR", defaults.bind_addr),
            store_pool_size: read("STORE_POOL_SIZE", defaults.store_pool_size),
            layout,
            crawl,
            response,
            rate_limit,
            upstream,
        }
    }
}

fn read<T>(key: &str, default: T) -> T
where
    T: FromStr + Debug,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw, ?default, "unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn read_secs(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(key, raw, default_secs = default.as_secs(), "unparseable env value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
