//! Operator tool for a backlog store.
//!
//! Dispatches jobs and inspects or repairs the pending and dead-letter sets of
//! whichever backend the config selects. It never executes jobs: handlers live
//! in the application process that runs the sweeps.

use std::sync::Arc;

use anyhow::Context;
use backlog_core::{BacklogConfig, Clock, SystemClock};
use backlog_queue::{Dispatcher, DriverRegistry};
use clap::{Parser, Subcommand};
use tracing::warn;

#[derive(Parser)]
#[command(name = "backlog", version, about = "Inspect and manage a backlog job store")]
struct Cli {
    /// Config file (defaults to ~/.backlog/backlog.toml)
    #[arg(long, env = "BACKLOG_CONFIG")]
    config: Option<String>,

    /// Backend to use instead of `queue.driver` from config
    #[arg(long)]
    driver: Option<String>,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist a job for later execution
    Dispatch {
        /// Job name (slugified for storage)
        name: String,
        /// JSON payload handed to the handler
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long, default_value = backlog_core::DEFAULT_QUEUE)]
        queue: String,
        /// When the job becomes due: RFC 3339, "2026-01-01 09:00", epoch, "+10 minutes", ...
        #[arg(long)]
        at: Option<String>,
        /// Flag the record so overlap checks see it
        #[arg(long)]
        without_overlapping: bool,
        /// Skip the dispatch if a flagged record is already pending
        #[arg(long)]
        unless_overlapping: bool,
    },
    /// List pending jobs, oldest first
    Pending {
        /// Only this job name
        name: Option<String>,
    },
    /// List dead letters, newest first
    Failed,
    /// Delete pending jobs by name
    Forget {
        name: String,
        /// Only this queue
        #[arg(long)]
        queue: Option<String>,
    },
    /// Exit 0 if an overlap-flagged job is pending for (name, queue), 1 otherwise
    Overlapping {
        name: String,
        #[arg(long, default_value = backlog_core::DEFAULT_QUEUE)]
        queue: String,
    },
    /// Delete one dead letter, or all with --all
    PurgeFailed {
        id: Option<String>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Move a dead letter back to the pending set, due now
    RetryFailed { id: String },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backlog=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = BacklogConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        BacklogConfig::default()
    });
    if let Some(driver) = cli.driver {
        config.queue.driver = driver;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(DriverRegistry::new(config.queue, Arc::clone(&clock)));
    let store = registry.default_driver().context("opening queue backend")?;
    let json = cli.json;

    match cli.command {
        Commands::Dispatch {
            name,
            payload,
            queue,
            at,
            without_overlapping,
            unless_overlapping,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let dispatcher = Dispatcher::new(registry);
            let mut job = dispatcher.job(&name, &payload)?.on_queue(queue).at(at);
            if without_overlapping {
                job = job.without_overlapping();
            }
            let placed = if unless_overlapping {
                job.dispatch_unless_overlapping()?
            } else {
                Some(job.dispatch()?)
            };
            match placed {
                Some(job) => println!("{}  {}  due {}", job.id, job.slug, job.scheduled_at.to_rfc3339()),
                None => println!("skipped: {name} already pending with overlap flag"),
            }
        }

        Commands::Pending { name } => {
            let records = store.pending(name.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in &records {
                    println!(
                        "{}  {:<24} {:<10} due {}{}",
                        r.id,
                        r.name,
                        r.queue,
                        r.scheduled_at.to_rfc3339(),
                        if r.without_overlapping { "  [no-overlap]" } else { "" }
                    );
                }
                println!("{} pending", records.len());
            }
        }

        Commands::Failed => {
            let records = store.failed()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in &records {
                    println!(
                        "{}  {:<24} {:<10} {}  {}",
                        r.id,
                        r.name,
                        r.queue,
                        r.failed_at.to_rfc3339(),
                        first_line(&r.exception)
                    );
                }
                println!("{} failed", records.len());
            }
        }

        Commands::Forget { name, queue } => {
            let removed = store.forget(&name, queue.as_deref())?;
            println!("{removed} removed");
        }

        Commands::Overlapping { name, queue } => {
            let found = store.has_overlapping(&name, &queue)?;
            println!("{found}");
            if !found {
                std::process::exit(1);
            }
        }

        Commands::PurgeFailed { id, all } => {
            if id.is_none() && !all {
                anyhow::bail!("give a dead-letter id or --all");
            }
            let removed = store.purge_failed(id.as_deref())?;
            println!("{removed} purged");
        }

        Commands::RetryFailed { id } => {
            let record = store.retry_failed(&id, clock.now())?;
            println!("{}  {}  re-queued on {}", record.id, record.slug, record.queue);
        }
    }

    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
