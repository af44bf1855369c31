//! `jobqueue` subcommands: enqueue, worker, reap, and the admin group.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;

use crate::admin::Admin;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::job::{JobRecord, Priority};
use crate::metrics::{self, MetricsSink, PrometheusMetricsSink};
use crate::producer::Producer;
use crate::reaper;
use crate::store::{RedisStore, Store};
use crate::worker::{JobHandler, WorkerPool};

#[derive(Debug, Parser)]
#[command(name = "jobqueue", about = "Distributed, Redis-backed work queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Tracing filter directive, overridden by `RUST_LOG` if set.
    #[arg(long, env = "JOBQUEUE_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, env = "JOBQUEUE_REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    pub redis_url: String,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Enqueue one job.
    Enqueue {
        /// Job payload (producer-defined; a file path for the reference producer).
        #[arg(long)]
        payload: String,
        /// Priority name; defaults to classifying by payload size.
        #[arg(long)]
        priority: Option<String>,
        /// Optional distributed-tracing correlation id to attach to the job.
        #[arg(long)]
        trace_id: Option<String>,
    },
    /// Run a worker pool until interrupted.
    Worker {
        /// Overrides `Config::worker_count`.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run a single reap pass and exit.
    Reap,
    /// Administrative inspection and recovery operations.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum AdminAction {
    /// Print queue depths, processing count, dead-letter count, worker count.
    Stats,
    /// Look at the next `n` records a worker would consume from a queue,
    /// without removing them. `queue` is a configured priority name,
    /// `dead_letter`, or `completed`.
    Peek {
        queue: String,
        #[arg(long, default_value = "10")]
        n: usize,
    },
    /// Page through the dead-letter queue.
    DlqList {
        /// Opaque cursor from a previous call's output; omit to start over.
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Requeue dead-lettered jobs by id.
    DlqRequeue {
        /// One or more job ids to requeue.
        #[arg(required = true)]
        job_ids: Vec<String>,
        /// Destination priority; defaults to each job's own recorded priority.
        #[arg(long)]
        dest: Option<String>,
    },
    /// Discard dead-lettered jobs by id.
    DlqPurge {
        /// One or more job ids to discard.
        #[arg(required = true)]
        job_ids: Vec<String>,
    },
    /// Destroy every queue, processing list, and the dead-letter list.
    PurgeAll {
        /// Required confirmation flag; refuses to run without it.
        #[arg(long)]
        yes: bool,
    },
    /// List currently-registered worker ids.
    Workers,
    /// Synthesize load and report throughput/latency.
    Bench {
        #[arg(long, default_value = "high")]
        priority: String,
        #[arg(long, default_value = "1000")]
        count: u64,
        /// Target jobs/sec; 0 means as fast as possible.
        #[arg(long, default_value = "0")]
        rate: u64,
        #[arg(long, default_value = "256")]
        payload_bytes: usize,
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// No-op job handler used by the `worker` subcommand when the binary is
/// run standalone; logs each job and succeeds immediately. A real
/// deployment links its own [`JobHandler`] into [`WorkerPool`] rather than
/// going through this CLI at all.
struct LoggingJobHandler;

#[async_trait]
impl JobHandler for LoggingJobHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), anyhow::Error> {
        info!(job_id = %job.id, priority = %job.priority, payload = %job.payload, "processing job");
        Ok(())
    }
}

pub async fn run_with_cli(cli: Cli) -> Result<()> {
    let config = Arc::new(Config::default());
    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&cli.redis_url)
            .await
            .context("failed to connect to redis")?,
    );
    metrics::init_metrics().context("failed to initialize metrics")?;
    let metrics_sink: Arc<dyn MetricsSink> = Arc::new(PrometheusMetricsSink);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Enqueue { payload, priority, trace_id } => {
            let producer = Producer::new(config.clone(), store.clone(), metrics_sink.clone());
            let priority = match priority {
                Some(name) => Priority::new(name),
                None => crate::producer::classify_priority_by_size(payload.len() as u64),
            };
            let size = payload.len() as u64;
            let mut job = JobRecord::new(payload, size, priority);
            if let Some(trace_id) = trace_id {
                job = job.with_trace_id(trace_id);
            }
            producer.enqueue_job(&job).await?;
            println!("enqueued job {} (priority {})", job.id, job.priority);
            Ok(())
        }
        Commands::Worker { workers } => {
            let mut config = (*config).clone();
            if let Some(n) = workers {
                config.worker_count = n;
            }
            let config = Arc::new(config);
            let handler = Arc::new(LoggingJobHandler);
            let mut pool = WorkerPool::new(config.clone(), store.clone(), handler, metrics_sink.clone(), clock);
            pool.start().context("failed to start worker pool")?;

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let reaper_handle = reaper::spawn_reaper(config.clone(), store.clone(), metrics_sink.clone(), shutdown_rx);

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
            pool.shutdown().await.context("worker pool shutdown failed")?;
            let _ = reaper_handle.await;
            Ok(())
        }
        Commands::Reap => {
            reaper::run_once(&config, store.as_ref(), metrics_sink.as_ref()).await?;
            println!("reap pass complete");
            Ok(())
        }
        Commands::Admin { action } => run_admin(action, config, store).await,
    }
}

async fn run_admin(action: AdminAction, config: Arc<Config>, store: Arc<dyn Store>) -> Result<()> {
    let admin = Admin::new(config, store);
    match action {
        AdminAction::Stats => {
            let stats = admin.stats().await?;
            println!("pending by priority:");
            for (priority, count) in &stats.pending_by_priority {
                println!("  {priority}: {count}");
            }
            println!("processing: {}", stats.processing_total);
            println!("dead letter: {}", stats.dead_letter_total);
            println!("workers: {}", stats.worker_count);
            Ok(())
        }
        AdminAction::Peek { queue, n } => {
            let jobs = admin.peek(&queue, n).await?;
            for job in &jobs {
                println!("{} priority={} retries={} payload={}", job.id, job.priority, job.retries, job.payload);
            }
            Ok(())
        }
        AdminAction::DlqList { cursor, limit } => {
            let page = admin.dlq_list(cursor.as_deref(), limit).await?;
            for item in &page.items {
                println!(
                    "{} priority={} retries={} reap_count={} last_error={}",
                    item.id,
                    item.priority,
                    item.retries,
                    item.reap_count,
                    item.last_error.as_deref().unwrap_or("-")
                );
            }
            match page.next_cursor {
                Some(cursor) => println!("next cursor: {cursor}"),
                None => println!("(end of list)"),
            }
            Ok(())
        }
        AdminAction::DlqRequeue { job_ids, dest } => {
            let count = admin.dlq_requeue(&job_ids, dest.map(Priority::new)).await?;
            println!("requeued {count} job(s)");
            Ok(())
        }
        AdminAction::DlqPurge { job_ids } => {
            let count = admin.dlq_purge(&job_ids).await?;
            println!("purged {count} dead-lettered job(s)");
            Ok(())
        }
        AdminAction::PurgeAll { yes } => {
            if !yes {
                anyhow::bail!("refusing to purge all queues without --yes");
            }
            let count = admin.purge_all().await?;
            println!("purged {count} record(s) across all queues");
            Ok(())
        }
        AdminAction::Workers => {
            for worker in admin.workers().await? {
                let heartbeat = worker.last_heartbeat.map(|ts| ts.to_rfc3339()).unwrap_or_else(|| "-".to_string());
                let current_job = worker.current_job_id.as_deref().unwrap_or("-");
                println!("{} last_heartbeat={} current_job={}", worker.id, heartbeat, current_job);
            }
            Ok(())
        }
        AdminAction::Bench {
            priority,
            count,
            rate,
            payload_bytes,
            timeout_secs,
        } => {
            let result = admin
                .bench(
                    Priority::new(priority),
                    count,
                    rate,
                    payload_bytes,
                    Duration::from_secs(timeout_secs),
                )
                .await?;
            println!(
                "completed {} jobs in {:?} ({:.2}/s, p50={:.1}ms, p95={:.1}ms)",
                result.jobs_completed, result.duration, result.throughput_per_sec, result.p50_ms, result.p95_ms
            );
            Ok(())
        }
    }
}
