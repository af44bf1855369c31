//! Reaper: recovers jobs stuck in a crashed worker's processing list
//! (spec section 4.4).
//!
//! Runs as an independent background task on its own interval, the same
//! shape as `spawn_reaper` in this codebase's Postgres-backed worker
//! crate, adapted from `UPDATE ... RETURNING` semantics to Redis `SCAN` +
//! a heartbeat-guarded Lua move that closes the TOCTOU window between
//! "heartbeat looked absent" and "move the record".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::job::Codec;
use crate::metrics::MetricsSink;
use crate::store::{ReapOutcome, Store};

/// Spawns the reaper as a background task. Returns its `JoinHandle` so the
/// caller can await it during shutdown.
pub fn spawn_reaper(
    config: Arc<Config>,
    store: Arc<dyn Store>,
    metrics: Arc<dyn MetricsSink>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.reap_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = run_once(&config, store.as_ref(), metrics.as_ref()).await {
                        warn!(error = %err, "reap pass failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    })
}

/// One full sweep over every worker's processing list. Exposed directly
/// for the `jobqueue reap` one-shot subcommand; the background task
/// spawned by [`spawn_reaper`] just calls this on an interval.
pub async fn run_once(
    config: &Config,
    store: &dyn Store,
    metrics: &dyn MetricsSink,
) -> Result<(), crate::store::StoreError> {
    let codec = Codec::new(config.max_job_bytes);
    let pattern = format!("{}worker:*:processing", config.key_prefix);
    let processing_keys = store.scan_keys(&pattern).await?;

    for processing_key in processing_keys {
        let Some(worker_id) = extract_worker_id(&processing_key, &config.key_prefix) else {
            continue;
        };
        let heartbeat_key = config.heartbeat_key(&worker_id);

        if store.heartbeat_exists(&heartbeat_key).await? {
            continue;
        }

        let entries = store.lrange(&processing_key, 0, -1).await?;
        for raw in entries {
            let mut job = match codec.decode(&raw) {
                Ok(job) => job,
                Err(_) => {
                    // Can't interpret it; drop rather than loop on it forever.
                    let _ = store.lrem(&processing_key, &raw).await;
                    continue;
                }
            };
            job.reap_count += 1;

            let (dest_key, reason) = if config
                .max_reaps
                .map(|max| job.reap_count > max)
                .unwrap_or(false)
            {
                (config.dead_letter_list.clone(), "reaped_too_many_times")
            } else {
                (config.queue_key(&job.priority), "recovered")
            };

            let new_raw = match codec.encode(&job) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to re-encode reaped job");
                    continue;
                }
            };

            match store
                .guarded_reap_move(&heartbeat_key, &processing_key, &raw, &dest_key, &new_raw)
                .await?
            {
                ReapOutcome::Moved => {
                    info!(
                        worker_id = %worker_id,
                        job_id = %job.id,
                        reap_count = job.reap_count,
                        reason,
                        "reaped stuck job"
                    );
                    metrics.record_job_reaped(&worker_id, &job.priority);
                }
                ReapOutcome::StillAlive => {
                    // Heartbeat reappeared between our check above and the
                    // script running; the worker is alive after all, stop
                    // touching its list this pass.
                    break;
                }
                ReapOutcome::NotFound => {
                    // Already acked, failed, or reaped by a concurrent pass.
                }
            }
        }
    }
    Ok(())
}

fn extract_worker_id(processing_key: &str, key_prefix: &str) -> Option<String> {
    let rest = processing_key.strip_prefix(key_prefix)?;
    let rest = rest.strip_prefix("worker:")?;
    let worker_id = rest.strip_suffix(":processing")?;
    Some(worker_id.to_string())
}
