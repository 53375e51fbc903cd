//! Administrative CLI for the clustermap store.
//!
//! Operates directly on the database file: queue administration, scheduled
//! job management, precalc triggers, and graph exports.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use time::OffsetDateTime;

use clustermap::config::Config;
use clustermap::crawl::cron::Schedule;
use clustermap::model::CrawlStatus;
use clustermap::precalc::{PrecalcOptions, Precalculator, MAX_LINKS_CAP, MAX_NODES_CAP};
use clustermap::store::{NodeSelection, Store};
use clustermap::{Error, Result};

#[derive(Parser, Debug)]
#[command(
    name = "clustermap",
    version,
    about = "Administrative CLI for the clustermap database",
    disable_help_subcommand = true
)]
struct Cli {
    /// Database file; falls back to DATABASE_PATH.
    #[arg(long, global = true, env = "DATABASE_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl queue administration.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Recurring crawl definitions.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
    /// Run a precalculation pass and wait for it.
    Precalc {
        /// Clear nodes and links outside the selected set.
        #[arg(long)]
        full: bool,
        #[arg(long, default_value_t = MAX_NODES_CAP)]
        max_nodes: usize,
        #[arg(long, default_value_t = MAX_LINKS_CAP)]
        max_links: usize,
    },
    /// Export the graph to a file.
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        /// Output path; stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = MAX_NODES_CAP)]
        max_nodes: usize,
        #[arg(long, default_value_t = MAX_LINKS_CAP)]
        max_links: usize,
    },
    /// Show the current graph version.
    Version,
    /// Show queue and precalc state.
    Stats,
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// List jobs, optionally by status.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Enqueue a crawl for a subreddit.
    Enqueue {
        subreddit: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Return one failed job to the queue.
    Retry { id: i64 },
    /// Return every failed job to the queue.
    RetryFailed,
    /// Override a job's priority.
    SetPriority { id: i64, priority: i64 },
    /// Override a job's status.
    SetStatus { id: i64, status: String },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// List recurring definitions.
    List,
    /// Create or replace a recurring crawl.
    Add {
        name: String,
        subreddit: String,
        /// Cron expression or `@every <duration>`.
        cron: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Enable a definition.
    Enable { id: i64 },
    /// Disable a definition.
    Disable { id: i64 },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExportFormat {
    Json,
    Csv,
}

fn main() -> ExitCode {
    clustermap::serve::install_tracing_subscriber();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn open_store(db: Option<PathBuf>) -> Result<Store> {
    let path = db.unwrap_or_else(|| Config::from_env().database_path);
    let store = Store::open(&path, 2)?;
    store.migrate()?;
    Ok(store)
}

fn run(cli: Cli) -> Result<()> {
    let store = open_store(cli.db)?;
    match cli.command {
        Command::Jobs { command } => run_jobs(&store, command),
        Command::Schedule { command } => run_schedule(&store, command),
        Command::Precalc {
            full,
            max_nodes,
            max_links,
        } => run_precalc(&store, full, max_nodes, max_links),
        Command::Export {
            format,
            output,
            max_nodes,
            max_links,
        } => run_export(&store, format, output, max_nodes, max_links),
        Command::Version => {
            match store.current_version()? {
                Some(version) => println!(
                    "version {} nodes {} links {} ({})",
                    version.id,
                    version.node_count,
                    version.link_count,
                    if version.is_full_rebuild {
                        "full rebuild"
                    } else {
                        "incremental"
                    }
                ),
                None => println!("no committed version yet"),
            }
            Ok(())
        }
        Command::Stats => {
            let counts = store.queue_counts()?;
            let state = store.precalc_state()?;
            println!(
                "queue: {} queued, {} crawling, {} success, {} failed",
                counts.queued, counts.crawling, counts.success, counts.failed
            );
            println!(
                "graph: {} nodes, {} links, current version {:?}",
                state.total_nodes, state.total_links, state.current_version_id
            );
            println!(
                "last precalc: {:?} (full: {:?}, {}ms)",
                state.last_precalc_at.map(|t| t.to_string()),
                state.last_full_precalc_at.map(|t| t.to_string()),
                state.duration_ms.unwrap_or(0)
            );
            Ok(())
        }
    }
}

fn run_jobs(store: &Store, command: JobsCommand) -> Result<()> {
    match command {
        JobsCommand::List { status, limit } => {
            let status = match status.as_deref() {
                Some(raw) => Some(
                    CrawlStatus::parse(raw)
                        .ok_or_else(|| Error::Validation(format!("unknown status {raw:?}")))?,
                ),
                None => None,
            };
            let jobs = store.list_jobs(status, limit)?;
            if jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "#{:<6} sub {:<6} {:<9} prio {:<4} retries {}/{} {}",
                    job.id,
                    job.subreddit_id,
                    job.status.as_str(),
                    job.priority,
                    job.retries,
                    job.max_retries,
                    job.enqueued_by.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
        JobsCommand::Enqueue {
            subreddit,
            priority,
        } => {
            let name = subreddit.trim().to_lowercase();
            let subreddit_id = match store.subreddit_by_name(&name)? {
                Some(subreddit) => subreddit.id,
                None => store.upsert_subreddit(&name, None, None, 0, None)?,
            };
            let job_id = store.enqueue_job(subreddit_id, priority, 3, Some("cli"))?;
            println!("enqueued job {job_id} for r/{name}");
            Ok(())
        }
        JobsCommand::Retry { id } => {
            store.retry_job(id)?;
            println!("job {id} returned to queue");
            Ok(())
        }
        JobsCommand::RetryFailed => {
            let retried = store.bulk_retry_failed()?;
            println!("retried {retried} failed jobs");
            Ok(())
        }
        JobsCommand::SetPriority { id, priority } => {
            store.update_job_priority(id, priority)?;
            println!("job {id} priority set to {priority}");
            Ok(())
        }
        JobsCommand::SetStatus { id, status } => {
            let status = CrawlStatus::parse(&status)
                .ok_or_else(|| Error::Validation(format!("unknown status {status:?}")))?;
            store.update_job_status(id, status)?;
            println!("job {id} status set to {}", status.as_str());
            Ok(())
        }
    }
}

fn run_schedule(store: &Store, command: ScheduleCommand) -> Result<()> {
    match command {
        ScheduleCommand::List => {
            let jobs = store.list_scheduled_jobs()?;
            if jobs.is_empty() {
                println!("no scheduled jobs");
                return Ok(());
            }
            for job in jobs {
                println!(
                    "#{:<4} {:<24} {:<16} {} next {}",
                    job.id,
                    job.name,
                    job.cron_expression,
                    if job.enabled { "enabled" } else { "disabled" },
                    job.next_run_at
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
            Ok(())
        }
        ScheduleCommand::Add {
            name,
            subreddit,
            cron,
            priority,
        } => {
            let schedule = Schedule::parse(&cron)?;
            let sub_name = subreddit.trim().to_lowercase();
            let subreddit_id = match store.subreddit_by_name(&sub_name)? {
                Some(subreddit) => subreddit.id,
                None => store.upsert_subreddit(&sub_name, None, None, 0, None)?,
            };
            let next = schedule.next_after(OffsetDateTime::now_utc());
            let id =
                store.upsert_scheduled_job(&name, Some(subreddit_id), &cron, priority, next)?;
            println!(
                "schedule {id} ({name}) -> r/{sub_name}, next run {}",
                next.map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            Ok(())
        }
        ScheduleCommand::Enable { id } => {
            store.set_scheduled_enabled(id, true)?;
            println!("schedule {id} enabled");
            Ok(())
        }
        ScheduleCommand::Disable { id } => {
            store.set_scheduled_enabled(id, false)?;
            println!("schedule {id} disabled");
            Ok(())
        }
    }
}

fn run_precalc(store: &Store, full: bool, max_nodes: usize, max_links: usize) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let engine = Precalculator::new(store.clone(), Config::from_env().layout);
    let outcome = runtime.block_on(engine.run(PrecalcOptions {
        full_rebuild: full,
        max_nodes,
        max_links,
        types: None,
    }))?;
    println!(
        "version {:?}: {} nodes, {} links, {} diff rows, {} positions written ({} skipped), {} communities across {} levels, {}ms",
        outcome.version_id,
        outcome.node_count,
        outcome.link_count,
        outcome.diff_rows,
        outcome.positions_written,
        outcome.positions_skipped,
        outcome.communities,
        outcome.community_levels,
        outcome.duration_ms,
    );
    Ok(())
}

fn run_export(
    store: &Store,
    format: ExportFormat,
    output: Option<PathBuf>,
    max_nodes: usize,
    max_links: usize,
) -> Result<()> {
    let selection = NodeSelection {
        max_nodes: max_nodes.clamp(1, MAX_NODES_CAP),
        types: None,
        with_positions: true,
    };
    let slice = store.graph_slice(
        &selection,
        None,
        selection.max_nodes,
        max_links.clamp(1, MAX_LINKS_CAP),
    )?;
    let body = match format {
        ExportFormat::Json => serde_json::to_vec_pretty(&serde_json::json!({
            "nodes": slice.nodes,
            "links": slice.links,
        }))
        .map_err(Error::from)?,
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record(["data_type", "id", "name", "val", "type", "source", "target"])
                .map_err(|err| Error::Internal(format!("csv: {err}")))?;
            for node in &slice.nodes {
                writer
                    .write_record([
                        "node",
                        &node.id,
                        &node.name,
                        node.val.as_deref().unwrap_or(""),
                        node.kind.as_ref().map(|kind| kind.as_str()).unwrap_or(""),
                        "",
                        "",
                    ])
                    .map_err(|err| Error::Internal(format!("csv: {err}")))?;
            }
            for link in &slice.links {
                writer
                    .write_record(["link", "", "", "", "", &link.source, &link.target])
                    .map_err(|err| Error::Internal(format!("csv: {err}")))?;
            }
            writer
                .into_inner()
                .map_err(|err| Error::Internal(format!("csv: {err}")))?
        }
    };
    match output {
        Some(path) => {
            std::fs::write(&path, &body)?;
            println!(
                "exported {} nodes and {} links to {}",
                slice.nodes.len(),
                slice.links.len(),
                path.display()
            );
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&body)?;
        }
    }
    Ok(())
}
