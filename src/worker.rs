//! Worker pool: claims jobs, runs them through a [`JobHandler`], and
//! retires them to completion, retry, or the dead-letter queue (spec
//! section 4.3).
//!
//! Structure mirrors `WorkerPool`/`Worker` in this codebase's scheduler
//! almost one-to-one: a pool owns a `broadcast` shutdown channel and a set
//! of `JoinHandle`s, each worker runs its own claim loop and reports into
//! a shared, atomics-based stats struct.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::Config;
use crate::job::{Codec, JobRecord};
use crate::metrics::MetricsSink;
use crate::store::{ClaimOutcome, Store, StoreError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// User-supplied job processing logic.
///
/// `Err` means the job should be retried (or dead-lettered, once retries
/// are exhausted); implementations should return `Err` for any failure
/// that isn't a signal the job is permanently unprocessable.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> Result<(), anyhow::Error>;
}

/// Snapshot of pool-wide counters, also the source for the `PoolStats`
/// admin surface in spec section 6.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub active_workers: u64,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_dead_lettered
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 1.0;
        }
        self.jobs_completed as f64 / total as f64
    }
}

#[derive(Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record_completion(&self) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
    }
    fn record_retry(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
    }
    fn record_dead_letter(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::SeqCst);
    }
    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }
    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
    fn to_pool_stats(&self) -> PoolStats {
        PoolStats {
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::SeqCst),
            active_workers: self.active_workers.load(Ordering::SeqCst),
        }
    }
}

/// Owns the worker pool's lifecycle: spawning workers, propagating
/// shutdown, and exposing aggregate stats.
pub struct WorkerPool {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        handler: Arc<dyn JobHandler>,
        metrics: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(config.worker_count.max(1));
        Self {
            config,
            store,
            handler,
            metrics,
            clock,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns `config.worker_count` independent claim loops. Each worker
    /// gets its own id (and thus its own processing list and heartbeat
    /// key), so a reaper scan never has to distinguish "this worker's
    /// record" from another's.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        for index in 0..self.config.worker_count {
            let worker_id = crate::ids::new_worker_id(index);
            let worker = Worker {
                id: worker_id.clone(),
                config: self.config.clone(),
                store: self.store.clone(),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
                breaker: CircuitBreaker::new(self.config.breaker, self.clock.clone()),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: self.stats.clone(),
            };
            info!(worker_id = %worker_id, "starting worker");
            self.worker_handles.push(tokio::spawn(worker.run()));
        }
        Ok(())
    }

    /// Broadcasts shutdown and waits up to `config.shutdown_grace` for
    /// every worker to finish its current job and exit.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        let _ = self.shutdown_tx.send(());
        let grace = self.config.shutdown_grace;
        let handles = std::mem::take(&mut self.worker_handles);
        let joined = tokio::time::timeout(grace, futures::future::join_all(handles)).await;
        match joined {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::ShutdownTimeout(grace)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats()
    }
}

struct Worker {
    id: String,
    config: Arc<Config>,
    store: Arc<dyn Store>,
    handler: Arc<dyn JobHandler>,
    metrics: Arc<dyn MetricsSink>,
    breaker: CircuitBreaker,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        let processing_key = self.config.processing_key(&self.id);
        let heartbeat_key = self.config.heartbeat_key(&self.id);
        let workers_key = self.config.workers_key();
        let codec = Codec::new(self.config.max_job_bytes);
        // Taken out of `self` so it can be threaded into `process_claimed`
        // as `&mut` — a job in flight still has to observe shutdown
        // (spec §4.3), not just the idle top of this loop.
        let mut shutdown_rx = self.shutdown_rx;

        if let Err(err) = self.store.register_worker(&workers_key, &self.id).await {
            warn!(worker_id = %self.id, error = %err, "failed to register in worker roster");
        }

        // Recover anything left in our own processing list from a prior
        // crash of this exact worker id (collision only across restarts
        // with an identical host/pid/index/start_nanos, effectively never).
        if let Err(err) = self.recover_own_processing(&processing_key, &codec).await {
            warn!(worker_id = %self.id, error = %err, "failed to recover stale processing entries");
        }

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => break,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            if !self.breaker.allow() {
                self.metrics.set_breaker_state(&self.id, self.breaker.state().as_gauge_value());
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            self.metrics.set_breaker_state(&self.id, self.breaker.state().as_gauge_value());

            match self.claim_next(&processing_key).await {
                Ok(Some(raw)) => {
                    if let Err(err) = self.store.set_heartbeat(&heartbeat_key, self.config.heartbeat_ttl).await {
                        warn!(worker_id = %self.id, error = %err, "failed to set heartbeat");
                    }
                    let outcome = self
                        .process_claimed(&processing_key, &heartbeat_key, raw, &codec, &mut shutdown_rx)
                        .await;
                    if outcome == Outcome::Canceled {
                        // The shutdown broadcast was consumed inside the job
                        // (a receiver only ever sees a given message once),
                        // so the top-of-loop try_recv above won't see it
                        // again. Stop explicitly instead of spinning.
                        break;
                    }
                }
                Ok(None) => {
                    // No job was found for the probe `allow()` just granted
                    // (or for a Closed-state pass-through, where this is a
                    // no-op). Release it so a HalfOpen recovery tick doesn't
                    // get stranded waiting on jobs that already processed.
                    self.breaker.release_unclaimed_probe();
                }
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "claim attempt failed");
                    self.breaker.release_unclaimed_probe();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        if let Err(err) = self.store.unregister_worker(&workers_key, &self.id).await {
            warn!(worker_id = %self.id, error = %err, "failed to unregister from worker roster");
        }
        let _ = self.store.del(&heartbeat_key).await;
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Non-blocking pass over every priority highest-to-lowest, falling
    /// back to a single blocking claim on the lowest priority so an idle
    /// worker doesn't spin (spec section 4.3 step 2).
    async fn claim_next(&self, processing_key: &str) -> Result<Option<String>, StoreError> {
        let priorities = &self.config.priorities;
        for priority in priorities.iter().take(priorities.len().saturating_sub(1)) {
            let queue_key = self.config.queue_key(priority);
            if let Some(raw) = self.store.try_claim(&queue_key, processing_key).await? {
                return Ok(Some(raw));
            }
        }
        let Some(lowest) = priorities.last() else {
            return Ok(None);
        };
        let queue_key = self.config.queue_key(lowest);
        match self
            .store
            .blocking_claim(&queue_key, processing_key, self.config.brpop_lpush_timeout)
            .await?
        {
            ClaimOutcome::Claimed(raw) => Ok(Some(raw)),
            ClaimOutcome::Timeout => Ok(None),
        }
    }

    async fn process_claimed(
        &self,
        processing_key: &str,
        heartbeat_key: &str,
        raw: String,
        codec: &Codec,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Outcome {
        self.stats.increment_active();
        let result = self
            .handle_one(processing_key, heartbeat_key, &raw, codec, shutdown_rx)
            .await;
        self.stats.decrement_active();

        match result {
            Outcome::Completed => {
                self.stats.record_completion();
                self.breaker.record_success();
            }
            Outcome::Requeued => {
                self.stats.record_retry();
                self.record_failure_and_trip();
            }
            Outcome::DeadLettered => {
                self.stats.record_dead_letter();
                self.record_failure_and_trip();
            }
            Outcome::Undecodable | Outcome::Canceled => {
                // Undecodable: malformed record, already removed from
                // processing by handle_one. Canceled: shutdown cut the
                // handler off mid-run, not a handler failure. Neither
                // reflects on the breaker.
            }
        }
        result
    }

    fn record_failure_and_trip(&self) {
        use crate::breaker::CircuitState;
        let was_open = self.breaker.state() == CircuitState::Open;
        self.breaker.record_failure();
        if !was_open && self.breaker.state() == CircuitState::Open {
            self.metrics.record_breaker_trip(&self.id);
        }
    }

    async fn handle_one(
        &self,
        processing_key: &str,
        heartbeat_key: &str,
        raw: &str,
        codec: &Codec,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Outcome {
        let mut job = match codec.decode(raw) {
            Ok(job) => job,
            Err(err) => {
                error!(worker_id = %self.id, error = %err, "dropping undecodable processing record");
                let _ = self.store.lrem(processing_key, raw).await;
                return Outcome::Undecodable;
            }
        };

        let refresh_interval = self.config.heartbeat_refresh_interval;
        let heartbeat_ttl = self.config.heartbeat_ttl;
        let store = self.store.clone();
        let heartbeat_key_owned = heartbeat_key.to_string();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            loop {
                interval.tick().await;
                if store.refresh_heartbeat(&heartbeat_key_owned, heartbeat_ttl).await.is_err() {
                    break;
                }
            }
        });

        // The handler runs in its own task so a shutdown signal can abort
        // it rather than merely stop awaiting it (spec §4.3: "abort
        // handler" on grace expiry, not just move on while it keeps
        // running against job state).
        let handler = self.handler.clone();
        let job_for_handler = job.clone();
        let mut handler_task = tokio::spawn(async move { handler.handle(&job_for_handler).await });

        let started = std::time::Instant::now();
        let job_timeout = self.config.job_timeout;
        let result: Result<Result<(), anyhow::Error>, Outcome> = tokio::select! {
            joined = tokio::time::timeout(job_timeout, &mut handler_task) => {
                match joined {
                    Ok(Ok(handler_result)) => Ok(handler_result),
                    Ok(Err(join_err)) => Ok(Err(anyhow::anyhow!("handler task panicked: {join_err}"))),
                    Err(_elapsed) => Ok(Err(anyhow::anyhow!("timeout"))),
                }
            }
            _ = shutdown_rx.recv() => {
                let grace = self.config.shutdown_grace;
                match tokio::time::timeout(grace, &mut handler_task).await {
                    Ok(Ok(handler_result)) => Ok(handler_result),
                    Ok(Err(join_err)) => Ok(Err(anyhow::anyhow!("handler task panicked: {join_err}"))),
                    Err(_elapsed) => {
                        handler_task.abort();
                        Err(Outcome::Canceled)
                    }
                }
            }
        };
        heartbeat_task.abort();
        self.metrics
            .observe_job_duration(&job.priority, started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(())) => {
                debug!(worker_id = %self.id, job_id = %job.id, priority = %job.priority, "job completed");
                self.metrics.record_job_completed(&job.priority, &self.id);
                let completed_key = self.config.completed_list.as_deref();
                match self.store.ack(processing_key, raw, completed_key).await {
                    Ok(()) => Outcome::Completed,
                    Err(err) => {
                        error!(worker_id = %self.id, job_id = %job.id, error = %err, "ack failed");
                        Outcome::Completed
                    }
                }
            }
            Ok(Err(err)) => {
                let reason = err.to_string();
                warn!(worker_id = %self.id, job_id = %job.id, error = %reason, "job handler failed");
                self.retire_failed(processing_key, raw, &mut job, codec, &reason).await
            }
            Err(Outcome::Canceled) => {
                warn!(worker_id = %self.id, job_id = %job.id, "shutdown grace elapsed mid-job, canceling");
                self.retire_canceled(processing_key, raw, &job).await
            }
            Err(other) => other,
        }
    }

    /// Shutdown cut the handler off before it could finish. Per spec §4.3/
    /// §7: no partial ack, requeue immediately (no backoff sleep — the
    /// process is exiting), and leave `retries` untouched since the job
    /// itself never actually failed.
    async fn retire_canceled(&self, processing_key: &str, raw: &str, job: &JobRecord) -> Outcome {
        let dest_key = self.config.queue_key(&job.priority);
        match self.store.fail_requeue(processing_key, raw, &dest_key, raw).await {
            Ok(()) => {}
            Err(err) => error!(job_id = %job.id, error = %err, "fail_requeue failed while canceling"),
        }
        Outcome::Canceled
    }

    async fn retire_failed(
        &self,
        processing_key: &str,
        raw: &str,
        job: &mut JobRecord,
        codec: &Codec,
        reason: &str,
    ) -> Outcome {
        // `should_retry` is evaluated against the retry count *before* this
        // failure, not after: `retries` is the number of retries already
        // spent, so reaching DLQ with `retries == MaxRetries` (spec §3 P4,
        // §8 S2: MaxRetries=3 observes 4 invocations, DLQ at retries=3)
        // means the count is only bumped on the branch that actually
        // requeues, never on the terminal failure that sends it to DLQ.
        let will_retry = job.should_retry(self.config.max_retries);
        job.last_error = Some(reason.to_string());
        job.last_attempt_time = Some(Utc::now());
        if will_retry {
            job.retries += 1;
            let delay = self.config.retry_backoff.delay_for(job.retries);
            tokio::time::sleep(delay).await;
            let dest_key = self.config.queue_key(&job.priority);
            let new_raw = match codec.encode(job) {
                Ok(raw) => raw,
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "failed to re-encode job for retry");
                    return Outcome::Undecodable;
                }
            };
            match self.store.fail_requeue(processing_key, raw, &dest_key, &new_raw).await {
                Ok(()) => {
                    self.metrics.record_job_retried(&job.priority, &self.id);
                    Outcome::Requeued
                }
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "fail_requeue failed");
                    Outcome::Requeued
                }
            }
        } else {
            let dlq_key = self.config.dead_letter_list.clone();
            let new_raw = match codec.encode(job) {
                Ok(raw) => raw,
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "failed to re-encode job for dead-letter");
                    return Outcome::Undecodable;
                }
            };
            match self.store.fail_dlq(processing_key, raw, &dlq_key, &new_raw).await {
                Ok(()) => {
                    warn!(job_id = %job.id, retries = job.retries, "job moved to dead-letter queue");
                    self.metrics.record_job_dead_lettered(&job.priority, &self.id);
                    Outcome::DeadLettered
                }
                Err(err) => {
                    error!(job_id = %job.id, error = %err, "fail_dlq failed");
                    Outcome::DeadLettered
                }
            }
        }
    }

    async fn recover_own_processing(&self, processing_key: &str, codec: &Codec) -> Result<(), StoreError> {
        let entries = self.store.lrange(processing_key, 0, -1).await?;
        for raw in entries {
            if let Ok(mut job) = codec.decode(&raw) {
                let _ = self
                    .retire_failed(processing_key, &raw, &mut job, codec, "worker restarted mid-job")
                    .await;
            } else {
                let _ = self.store.lrem(processing_key, &raw).await;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Requeued,
    DeadLettered,
    Undecodable,
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_stats_success_rate_with_no_jobs_is_one() {
        let stats = PoolStats::default();
        assert_eq!(stats.success_rate(), 1.0);
    }

    #[test]
    fn pool_stats_success_rate_accounts_for_failures() {
        let stats = PoolStats {
            jobs_completed: 3,
            jobs_failed: 1,
            jobs_dead_lettered: 0,
            active_workers: 0,
        };
        assert_eq!(stats.total_processed(), 4);
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn shared_pool_stats_tracks_all_counters() {
        let stats = SharedPoolStats::default();
        stats.record_completion();
        stats.record_retry();
        stats.record_dead_letter();
        stats.increment_active();
        let snapshot = stats.to_pool_stats();
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.jobs_dead_lettered, 1);
        assert_eq!(snapshot.active_workers, 1);
        stats.decrement_active();
        assert_eq!(stats.to_pool_stats().active_workers, 0);
    }
}
