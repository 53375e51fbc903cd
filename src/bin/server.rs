//! Binary entry point for the clustermap server.
//!
//! Hosts every plane in one process: the HTTP/WebSocket API, the crawl
//! worker pool, the scheduler tick loop, the single-flighted precalc
//! runner, the websocket hub fan-out, and the cache metrics sampler.
#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use clustermap::config::Config;
use clustermap::crawl;
use clustermap::fetch::RedditFetcher;
use clustermap::precalc::{self, Precalculator};
use clustermap::serve::{self, AppState};
use clustermap::store::Store;

#[derive(Parser, Debug)]
#[command(
    name = "clustermap-server",
    version,
    about = "Crawl, precalculate, and serve the community graph"
)]
struct Args {
    /// Database file; overrides DATABASE_PATH.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Listen address; overrides BIND_ADDR.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Serve only: skip the crawl workers and scheduler.
    #[arg(long)]
    no_crawl: bool,

    /// Seconds between automatic precalc runs (0 disables).
    #[arg(long, env = "PRECALC_INTERVAL_SECS", default_value_t = 900)]
    precalc_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    serve::install_tracing_subscriber();
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    match run(config, args.no_crawl, args.precalc_interval).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server exited with failure");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, no_crawl: bool, precalc_interval: u64) -> clustermap::Result<()> {
    let store = Store::open(&config.database_path, config.store_pool_size)?;
    store.migrate()?;
    info!(
        db = %config.database_path.display(),
        positions = store.has_position_columns(),
        "store ready"
    );

    let seed_token = store
        .oauth_account()?
        .map(|account| (account.access_token, account.expires_at));
    let fetcher = RedditFetcher::new(
        config.upstream.clone(),
        config.crawl.rate_per_sec,
        config.crawl.burst,
        seed_token,
    )?;

    let precalc = Precalculator::new(store.clone(), config.layout.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = AppState::new(
        store.clone(),
        config.clone(),
        precalc.clone(),
        Some(fetcher.clone()),
    );

    let mut background = Vec::new();
    background.push(tokio::spawn(serve::ws::run_hub(
        state.hub.clone(),
        precalc.subscribe(),
        state.cache.clone(),
        shutdown_rx.clone(),
    )));
    background.push(tokio::spawn(serve::run_cache_sampler(
        state.cache.clone(),
        shutdown_rx.clone(),
    )));
    background.push(tokio::spawn(serve::run_limiter_gc(
        state.limiter.clone(),
        shutdown_rx.clone(),
    )));

    if no_crawl {
        info!("crawl plane disabled (--no-crawl)");
    } else {
        background.extend(crawl::spawn_workers(
            store.clone(),
            fetcher,
            config.crawl.clone(),
            shutdown_rx.clone(),
        ));
        background.push(tokio::spawn(crawl::run_scheduler(
            store.clone(),
            shutdown_rx.clone(),
        )));
    }

    if precalc_interval > 0 {
        background.push(tokio::spawn(run_precalc_loop(
            precalc.clone(),
            Duration::from_secs(precalc_interval),
            shutdown_rx.clone(),
        )));
    }

    let bind_addr = config.bind_addr;
    let server = tokio::spawn(serve::serve(state, bind_addr, shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "api server failed"),
        Err(err) => error!(error = %err, "api server task failed"),
    }
    for handle in background {
        if tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .is_err()
        {
            warn!("background task did not stop within the grace period");
            break;
        }
    }
    info!("server stopped");
    Ok(())
}

/// Periodic precalc trigger; the engine's latch coalesces overlaps.
async fn run_precalc_loop(
    engine: Arc<Precalculator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match precalc::run_default(&engine).await {
            Ok(outcome) if outcome.coalesced => {
                info!("precalc trigger coalesced into a running pass");
            }
            Ok(outcome) => {
                info!(
                    version = outcome.version_id,
                    nodes = outcome.node_count,
                    links = outcome.link_count,
                    "periodic precalc finished"
                );
            }
            Err(err) => warn!(error = %err, "periodic precalc failed"),
        }
    }
}
