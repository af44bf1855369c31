//! Administrative operations: inspection and recovery surfaces that don't
//! belong to the worker hot path (spec section 4.7, 4.8, 6).
//!
//! Grounded on `JobQueue::stats`/`peek`/`recover_processing_jobs`
//! for the read-side shape; `dlq_requeue`/`dlq_purge` reuse the same
//! atomic-move script the worker's retry path uses, since "move one record
//! from list A to list B" is exactly what a DLQ requeue is, chunked the way
//! spec §4.7 describes (scan the DLQ 500 records at a time rather than
//! loading it whole).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::Config;
use crate::job::{Codec, CodecError, JobRecord, Priority};
use crate::store::{Store, StoreError};

/// Page size spec §4.7 mandates for chunked DLQ scans (list, requeue, purge
/// all walk the dead-letter list in chunks of this size).
const DLQ_CHUNK_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("page limit must be between 1 and 500, got {0}")]
    InvalidLimit(usize),
    #[error("invalid cursor {0:?}")]
    InvalidCursor(String),
    #[error("unknown queue alias {0:?}")]
    UnknownQueueAlias(String),
}

/// Point-in-time snapshot of queue depths, used by `jobqueue admin stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub pending_by_priority: Vec<(Priority, u64)>,
    pub processing_total: u64,
    pub dead_letter_total: u64,
    pub worker_count: u64,
}

impl QueueStats {
    pub fn total_pending(&self) -> u64 {
        self.pending_by_priority.iter().map(|(_, n)| n).sum()
    }
}

/// One dead-lettered job as returned by [`Admin::dlq_list`]: the record's
/// own fields plus the bits an operator cares about without having to
/// decode the raw JSON themselves (spec §4.7 "parsed metadata").
#[derive(Debug, Clone, PartialEq)]
pub struct DlqItem {
    pub id: String,
    pub priority: Priority,
    pub retries: u32,
    pub reap_count: u32,
    pub last_error: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<JobRecord> for DlqItem {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            priority: job.priority,
            retries: job.retries,
            reap_count: job.reap_count,
            last_error: job.last_error,
            first_seen: job.creation_time,
            last_seen: job.last_attempt_time,
        }
    }
}

/// A page of [`Admin::dlq_list`] results plus the opaque cursor to fetch
/// the next one. `next_cursor` is `None` once the list is exhausted (spec
/// §4.7: "if returned count < limit, cursor is empty").
#[derive(Debug, Clone, PartialEq)]
pub struct DlqPage {
    pub items: Vec<DlqItem>,
    pub next_cursor: Option<String>,
}

/// Result of running the `bench` subcommand (spec §4.7, §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchResult {
    pub jobs_completed: u64,
    pub duration: Duration,
    pub throughput_per_sec: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

/// One registered worker as returned by [`Admin::workers`] (spec §4.8, §6:
/// `Workers() -> [{id, lastHeartbeat, currentJobID?}]`). `last_heartbeat` is
/// approximated as "now" when the worker's heartbeat key is present, since
/// the heartbeat value itself carries no timestamp, only a TTL (spec §4.8).
/// `None` means the worker is registered but currently idle (no heartbeat
/// key set — a worker only holds one while it has a job claimed).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_job_id: Option<String>,
}

pub struct Admin {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    codec: Codec,
}

impl Admin {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>) -> Self {
        let codec = Codec::new(config.max_job_bytes);
        Self { config, store, codec }
    }

    pub async fn stats(&self) -> Result<QueueStats, AdminError> {
        let mut pending_by_priority = Vec::with_capacity(self.config.priorities.len());
        for priority in &self.config.priorities {
            let len = self.store.llen(&self.config.queue_key(priority)).await?;
            pending_by_priority.push((priority.clone(), len));
        }

        let processing_pattern = format!("{}worker:*:processing", self.config.key_prefix);
        let processing_keys = self.store.scan_keys(&processing_pattern).await?;
        let mut processing_total = 0u64;
        for key in processing_keys {
            processing_total += self.store.llen(&key).await?;
        }

        let dead_letter_total = self.store.llen(&self.config.dead_letter_list).await?;
        let worker_count = self.store.scard(&self.config.workers_key()).await?;

        Ok(QueueStats {
            pending_by_priority,
            processing_total,
            dead_letter_total,
            worker_count,
        })
    }

    /// Returns up to `n` records from `queue_alias`'s tail — the order a
    /// worker would consume them in (spec §6 `Peek(queueAlias, n)`) —
    /// without removing anything. `queue_alias` is one of the configured
    /// priority names, `"dead_letter"`, or `"completed"`.
    pub async fn peek(&self, queue_alias: &str, n: usize) -> Result<Vec<JobRecord>, AdminError> {
        let limit = n.max(1);
        let key = self.resolve_queue_alias(queue_alias)?;
        let raws = self.store.lrange(&key, -(limit as isize), -1).await?;
        let mut jobs = Vec::with_capacity(raws.len());
        for raw in raws {
            jobs.push(self.codec.decode(&raw)?);
        }
        jobs.reverse();
        Ok(jobs)
    }

    fn resolve_queue_alias(&self, alias: &str) -> Result<String, AdminError> {
        if alias == "dead_letter" {
            return Ok(self.config.dead_letter_list.clone());
        }
        if alias == "completed" {
            return self
                .config
                .completed_list
                .clone()
                .ok_or_else(|| AdminError::UnknownQueueAlias(alias.to_string()));
        }
        if let Some(priority) = self.config.priorities.iter().find(|p| p.as_str() == alias) {
            return Ok(self.config.queue_key(priority));
        }
        Err(AdminError::UnknownQueueAlias(alias.to_string()))
    }

    /// Paginated DLQ listing with an opaque decimal-offset cursor (spec
    /// §4.7). `cursor = None` starts from the head of the list; `limit` is
    /// clamped into `[1, 500]` the caller doesn't pass something absurd,
    /// but out-of-range values are still rejected so callers notice.
    pub async fn dlq_list(&self, cursor: Option<&str>, limit: usize) -> Result<DlqPage, AdminError> {
        if limit == 0 || limit > DLQ_CHUNK_SIZE {
            return Err(AdminError::InvalidLimit(limit));
        }
        let offset: usize = match cursor {
            None => 0,
            Some(c) => c.parse().map_err(|_| AdminError::InvalidCursor(c.to_string()))?,
        };

        let start = offset as isize;
        let stop = (offset + limit - 1) as isize;
        let raws = self.store.lrange(&self.config.dead_letter_list, start, stop).await?;

        let mut items = Vec::with_capacity(raws.len());
        for raw in &raws {
            if let Ok(job) = self.codec.decode(raw) {
                items.push(DlqItem::from(job));
            }
        }

        let next_cursor = if raws.len() < limit {
            None
        } else {
            Some((offset + limit).to_string())
        };

        Ok(DlqPage { items, next_cursor })
    }

    /// Moves every dead-lettered job whose id is in `ids` back onto a
    /// priority queue, resetting its retry and reap counters. `dest`
    /// defaults to each job's own recorded priority when `None`, rather
    /// than one fixed destination queue, so a mixed-priority requeue
    /// doesn't silently collapse everything onto a single priority (spec
    /// §9 open question). Walks the DLQ in chunks of 500 per spec §4.7 and
    /// moves each match with the same guarded Lua script the worker's
    /// retry path uses, so a crash mid-requeue can never duplicate or lose
    /// a job. Returns the number of jobs actually requeued.
    pub async fn dlq_requeue(&self, ids: &[String], dest: Option<Priority>) -> Result<u64, AdminError> {
        let mut remaining: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut requeued = 0u64;
        let mut offset: isize = 0;

        while !remaining.is_empty() {
            let raws = self
                .store
                .lrange(
                    &self.config.dead_letter_list,
                    offset,
                    offset + DLQ_CHUNK_SIZE as isize - 1,
                )
                .await?;
            if raws.is_empty() {
                break;
            }
            let chunk_len = raws.len();
            let mut removed_this_chunk = 0isize;

            for raw in raws {
                let Ok(mut job) = self.codec.decode(&raw) else {
                    continue;
                };
                if !remaining.remove(job.id.as_str()) {
                    continue;
                }
                let dest_priority = dest.clone().unwrap_or_else(|| job.priority.clone());
                job.retries = 0;
                job.reap_count = 0;
                job.priority = dest_priority.clone();
                let new_raw = self.codec.encode(&job)?;
                let dest_key = self.config.queue_key(&dest_priority);
                self.store
                    .fail_requeue(&self.config.dead_letter_list, &raw, &dest_key, &new_raw)
                    .await?;
                requeued += 1;
                removed_this_chunk += 1;
                if remaining.is_empty() {
                    break;
                }
            }

            if chunk_len < DLQ_CHUNK_SIZE {
                break;
            }
            // Every removal in this chunk shifted everything after it one
            // slot to the left, so the next unscanned record isn't at
            // `offset + chunk_len` anymore — it's that far minus however
            // many we just took out.
            offset += chunk_len as isize - removed_this_chunk;
        }

        Ok(requeued)
    }

    /// Deletes every dead-lettered job whose id is in `ids`, walking the
    /// DLQ in chunks of 500 (spec §4.7). Returns the number of jobs
    /// discarded.
    pub async fn dlq_purge(&self, ids: &[String]) -> Result<u64, AdminError> {
        let mut remaining: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut purged = 0u64;
        let mut offset: isize = 0;

        while !remaining.is_empty() {
            let raws = self
                .store
                .lrange(
                    &self.config.dead_letter_list,
                    offset,
                    offset + DLQ_CHUNK_SIZE as isize - 1,
                )
                .await?;
            if raws.is_empty() {
                break;
            }
            let chunk_len = raws.len();
            let mut removed_this_chunk = 0isize;

            for raw in raws {
                let Ok(job) = self.codec.decode(&raw) else {
                    continue;
                };
                if !remaining.remove(job.id.as_str()) {
                    continue;
                }
                if self.store.lrem(&self.config.dead_letter_list, &raw).await? {
                    purged += 1;
                    removed_this_chunk += 1;
                }
                if remaining.is_empty() {
                    break;
                }
            }

            if chunk_len < DLQ_CHUNK_SIZE {
                break;
            }
            // Same left-shift accounting as `dlq_requeue`.
            offset += chunk_len as isize - removed_this_chunk;
        }

        Ok(purged)
    }

    /// Destroys every queue, processing list, heartbeat, and the
    /// dead-letter/completed/rate-limit keys. Intended for test/staging
    /// environments; callers are expected to gate this behind an explicit
    /// confirmation at the API boundary (the CLI layer's `--yes` flag).
    /// Returns the total number of stored job records plus keys deleted.
    pub async fn purge_all(&self) -> Result<u64, AdminError> {
        let mut deleted = 0u64;

        for priority in &self.config.priorities {
            let key = self.config.queue_key(priority);
            deleted += self.store.llen(&key).await?;
            self.store.del(&key).await?;
        }

        let processing_pattern = format!("{}worker:*:processing", self.config.key_prefix);
        for key in self.store.scan_keys(&processing_pattern).await? {
            deleted += self.store.llen(&key).await?;
            self.store.del(&key).await?;
        }

        let heartbeat_pattern = format!("{}processing:worker:*", self.config.key_prefix);
        for key in self.store.scan_keys(&heartbeat_pattern).await? {
            deleted += 1;
            self.store.del(&key).await?;
        }

        deleted += self.store.llen(&self.config.dead_letter_list).await?;
        self.store.del(&self.config.dead_letter_list).await?;

        if let Some(completed) = &self.config.completed_list {
            deleted += self.store.llen(completed).await?;
            self.store.del(completed).await?;
        }

        if self.store.heartbeat_exists(&self.config.rate_limit_key).await? {
            deleted += 1;
            self.store.del(&self.config.rate_limit_key).await?;
        }

        let workers_key = self.config.workers_key();
        let worker_count = self.store.scard(&workers_key).await?;
        if worker_count > 0 {
            deleted += 1;
            self.store.del(&workers_key).await?;
        }

        Ok(deleted)
    }

    /// Currently-registered workers, correlated with each one's processing
    /// list to surface its in-flight job id (spec §4.8, §6).
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, AdminError> {
        let ids = self.store.smembers(&self.config.workers_key()).await?;
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            let heartbeat_key = self.config.heartbeat_key(&id);
            let last_heartbeat =
                if self.store.heartbeat_exists(&heartbeat_key).await? { Some(Utc::now()) } else { None };

            let processing_key = self.config.processing_key(&id);
            let current_job_id = match self.store.lrange(&processing_key, 0, 0).await?.into_iter().next() {
                Some(raw) => Some(self.codec.decode(&raw)?.id),
                None => None,
            };

            workers.push(WorkerInfo { id, last_heartbeat, current_job_id });
        }
        Ok(workers)
    }

    /// Synthesizes `count` jobs of `priority` at up to `rate` jobs/sec,
    /// each carrying a `payload_bytes`-sized filler payload, drains them
    /// with a dedicated ephemeral worker identity, and reports throughput
    /// and latency percentiles (spec §4.7, §6). Assumes a quiescent queue
    /// for the duration of the run — the same assumption spec §9's bench
    /// baseline-race discussion already makes, just extended from "don't
    /// truncate the completed list" to "don't expect to isolate synthetic
    /// traffic from concurrent real traffic on the same priority queue".
    pub async fn bench(
        &self,
        priority: Priority,
        count: u64,
        rate: u64,
        payload_bytes: usize,
        timeout: Duration,
    ) -> Result<BenchResult, AdminError> {
        let bench_worker_id = format!("bench-{}", crate::ids::new_job_id());
        let processing_key = self.config.processing_key(&bench_worker_id);
        let queue_key = self.config.queue_key(&priority);
        let completed_key = self.config.completed_list.clone();
        let payload = "x".repeat(payload_bytes);

        let interval = if rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / rate as f64)
        };

        let producer_store = self.store.clone();
        let producer_codec = self.codec;
        let producer_queue_key = queue_key.clone();
        let producer_priority = priority.clone();
        let producer_task = tokio::spawn(async move {
            for _ in 0..count {
                let job = JobRecord::new(payload.clone(), payload_bytes as u64, producer_priority.clone());
                if let Ok(raw) = producer_codec.encode(&job) {
                    let _ = producer_store.enqueue(&producer_queue_key, &raw).await;
                }
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
            }
        });

        let mut latencies_ms = Vec::with_capacity(count as usize);
        let start = Instant::now();
        while (latencies_ms.len() as u64) < count && start.elapsed() < timeout {
            match self.store.try_claim(&queue_key, &processing_key).await? {
                Some(raw) => {
                    if let Ok(job) = self.codec.decode(&raw) {
                        let elapsed = Utc::now().signed_duration_since(job.creation_time);
                        latencies_ms.push(elapsed.num_milliseconds().max(0) as f64);
                    }
                    self.store.ack(&processing_key, &raw, completed_key.as_deref()).await?;
                }
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
        let duration = start.elapsed();
        producer_task.abort();
        let _ = self.store.del(&processing_key).await;

        latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let jobs_completed = latencies_ms.len() as u64;
        let p50_ms = percentile(&latencies_ms, 0.50);
        let p95_ms = percentile(&latencies_ms, 0.95);
        let throughput_per_sec = if duration.as_secs_f64() > 0.0 {
            jobs_completed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Ok(BenchResult {
            jobs_completed,
            duration,
            throughput_per_sec,
            p50_ms,
            p95_ms,
        })
    }
}

fn percentile(sorted_ascending: &[f64], pct: f64) -> f64 {
    if sorted_ascending.is_empty() {
        return 0.0;
    }
    let rank = (pct * (sorted_ascending.len() - 1) as f64).round() as usize;
    sorted_ascending[rank.min(sorted_ascending.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal in-memory `Store` backing real Redis list semantics (LPUSH
    /// at the head, LREM-first-match, LRANGE by index) for the chunked
    /// DLQ scans — the only behavior `dlq_requeue`/`dlq_purge` depend on.
    #[derive(Default)]
    struct ListStore {
        lists: Mutex<HashMap<String, Vec<String>>>,
        heartbeats: Mutex<HashSet<String>>,
    }

    impl ListStore {
        fn with_list(key: &str, items: Vec<String>) -> Self {
            let store = Self::default();
            store.lists.lock().unwrap().insert(key.to_string(), items);
            store
        }

        fn with_heartbeat(self, key: &str) -> Self {
            self.heartbeats.lock().unwrap().insert(key.to_string());
            self
        }

        fn get(&self, key: &str) -> Vec<String> {
            self.lists.lock().unwrap().get(key).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Store for ListStore {
        async fn enqueue(&self, key: &str, raw: &str) -> Result<(), StoreError> {
            self.lists.lock().unwrap().entry(key.to_string()).or_default().insert(0, raw.to_string());
            Ok(())
        }
        async fn try_claim(&self, _: &str, _: &str) -> Result<Option<String>, StoreError> {
            unimplemented!()
        }
        async fn blocking_claim(
            &self,
            _: &str,
            _: &str,
            _: Duration,
        ) -> Result<crate::store::ClaimOutcome, StoreError> {
            unimplemented!()
        }
        async fn ack(&self, _: &str, _: &str, _: Option<&str>) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn fail_requeue(
            &self,
            processing_key: &str,
            old_raw: &str,
            dest_key: &str,
            new_raw: &str,
        ) -> Result<(), StoreError> {
            let mut lists = self.lists.lock().unwrap();
            let removed = lists
                .get_mut(processing_key)
                .map(|l| {
                    if let Some(pos) = l.iter().position(|item| item == old_raw) {
                        l.remove(pos);
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if removed {
                lists.entry(dest_key.to_string()).or_default().insert(0, new_raw.to_string());
            }
            Ok(())
        }
        async fn fail_dlq(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn set_heartbeat(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn refresh_heartbeat(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn heartbeat_exists(&self, key: &str) -> Result<bool, StoreError> {
            Ok(self.heartbeats.lock().unwrap().contains(key))
        }
        async fn del(&self, key: &str) -> Result<(), StoreError> {
            self.lists.lock().unwrap().remove(key);
            Ok(())
        }
        async fn llen(&self, key: &str) -> Result<u64, StoreError> {
            Ok(self.get(key).len() as u64)
        }
        async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
            let list = self.get(key);
            if list.is_empty() || start as usize >= list.len() {
                return Ok(Vec::new());
            }
            let start = start.max(0) as usize;
            let stop = if stop < 0 { list.len() - 1 } else { (stop as usize).min(list.len() - 1) };
            if start > stop {
                return Ok(Vec::new());
            }
            Ok(list[start..=stop].to_vec())
        }
        async fn scan_keys(&self, _: &str) -> Result<Vec<String>, StoreError> {
            unimplemented!()
        }
        async fn lrem(&self, key: &str, raw: &str) -> Result<bool, StoreError> {
            let mut lists = self.lists.lock().unwrap();
            Ok(lists
                .get_mut(key)
                .map(|l| {
                    if let Some(pos) = l.iter().position(|item| item == raw) {
                        l.remove(pos);
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false))
        }
        async fn guarded_reap_move(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<crate::store::ReapOutcome, StoreError> {
            unimplemented!()
        }
        async fn incr_window(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
            unimplemented!()
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            unimplemented!()
        }
        async fn register_worker(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn unregister_worker(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }
        async fn scard(&self, key: &str) -> Result<u64, StoreError> {
            Ok(self.get(key).len() as u64)
        }
        async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
            Ok(self.get(key))
        }
    }

    fn sample_job(id_suffix: &str, priority: Priority) -> JobRecord {
        let mut job = JobRecord::new(format!("payload-{id_suffix}"), 10, priority);
        job.id = format!("job-{id_suffix}");
        job
    }

    /// Matches spawn in chunks spanning a chunk boundary: with 520 DLQ
    /// entries and `DLQ_CHUNK_SIZE = 500`, a naive `offset += CHUNK_SIZE`
    /// after removing matches from the first chunk would skip entries
    /// that shifted left across the boundary. Regression test for that.
    #[tokio::test]
    async fn dlq_requeue_finds_matches_spanning_a_chunk_boundary() {
        let codec = Codec::new(1 << 20);
        let mut target_ids = Vec::new();
        let mut raws = Vec::new();
        for i in 0..520 {
            let job = sample_job(&i.to_string(), Priority::low());
            if i < 50 || i == 505 {
                target_ids.push(job.id.clone());
            }
            raws.push(codec.encode(&job).unwrap());
        }
        assert_eq!(target_ids.len(), 51);

        let config = Arc::new(Config::default());
        let store = Arc::new(ListStore::with_list(&config.dead_letter_list, raws));
        let admin = Admin::new(config.clone(), store.clone());

        let requeued = admin.dlq_requeue(&target_ids, None).await.unwrap();
        assert_eq!(requeued, 51);
        assert_eq!(store.get(&config.dead_letter_list).len(), 520 - 51);

        let dest = store.get(&config.queue_key(&Priority::low()));
        assert_eq!(dest.len(), 51);
    }

    #[tokio::test]
    async fn dlq_purge_finds_matches_spanning_a_chunk_boundary() {
        let codec = Codec::new(1 << 20);
        let mut target_ids = Vec::new();
        let mut raws = Vec::new();
        for i in 0..520 {
            let job = sample_job(&i.to_string(), Priority::low());
            if i < 50 || i == 505 {
                target_ids.push(job.id.clone());
            }
            raws.push(codec.encode(&job).unwrap());
        }

        let config = Arc::new(Config::default());
        let store = Arc::new(ListStore::with_list(&config.dead_letter_list, raws));
        let admin = Admin::new(config.clone(), store.clone());

        let purged = admin.dlq_purge(&target_ids).await.unwrap();
        assert_eq!(purged, 51);
        assert_eq!(store.get(&config.dead_letter_list).len(), 520 - 51);
    }

    #[tokio::test]
    async fn peek_returns_tail_side_records_without_removing_them() {
        let codec = Codec::new(1 << 20);
        let config = Arc::new(Config::default());
        let jobs: Vec<JobRecord> = (0..5)
            .map(|i| sample_job(&i.to_string(), Priority::high()))
            .collect();
        let raws: Vec<String> = jobs.iter().map(|j| codec.encode(j).unwrap()).collect();
        // ListStore::enqueue inserts at index 0 (head), so pushing in order
        // 0..5 leaves the list as [4,3,2,1,0] — tail (index 4) is job "0",
        // the next one a worker would actually consume.
        let store = Arc::new(ListStore::default());
        for raw in &raws {
            store.enqueue(&config.queue_key(&Priority::high()), raw).await.unwrap();
        }
        let admin = Admin::new(config.clone(), store.clone());

        let peeked = admin.peek("high", 2).await.unwrap();
        assert_eq!(peeked.len(), 2);
        assert_eq!(peeked[0].id, "job-0");
        assert_eq!(peeked[1].id, "job-1");
        assert_eq!(store.get(&config.queue_key(&Priority::high())).len(), 5);
    }

    #[tokio::test]
    async fn peek_rejects_unknown_queue_alias() {
        let config = Arc::new(Config::default());
        let store = Arc::new(ListStore::default());
        let admin = Admin::new(config, store);
        let err = admin.peek("not-a-real-queue", 1).await.unwrap_err();
        assert!(matches!(err, AdminError::UnknownQueueAlias(_)));
    }

    #[tokio::test]
    async fn workers_correlates_heartbeat_and_current_job() {
        let codec = Codec::new(1 << 20);
        let config = Arc::new(Config::default());
        let job = sample_job("active", Priority::high());
        let raw = codec.encode(&job).unwrap();

        let store = Arc::new(
            ListStore::with_list(&config.workers_key(), vec!["worker-busy".to_string(), "worker-idle".to_string()])
                .with_heartbeat(&config.heartbeat_key("worker-busy")),
        );
        store.lists.lock().unwrap().insert(config.processing_key("worker-busy"), vec![raw]);

        let admin = Admin::new(config.clone(), store);
        let mut workers = admin.workers().await.unwrap();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].id, "worker-busy");
        assert!(workers[0].last_heartbeat.is_some());
        assert_eq!(workers[0].current_job_id.as_deref(), Some("job-active"));

        assert_eq!(workers[1].id, "worker-idle");
        assert!(workers[1].last_heartbeat.is_none());
        assert_eq!(workers[1].current_job_id, None);
    }

    #[test]
    fn queue_stats_totals_pending_across_priorities() {
        let stats = QueueStats {
            pending_by_priority: vec![(Priority::high(), 3), (Priority::low(), 7)],
            processing_total: 2,
            dead_letter_total: 1,
            worker_count: 4,
        };
        assert_eq!(stats.total_pending(), 10);
    }

    #[test]
    fn percentile_of_empty_slice_is_zero() {
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn percentile_picks_expected_rank() {
        let latencies = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(percentile(&latencies, 0.50), 30.0);
        assert_eq!(percentile(&latencies, 0.95), 50.0);
    }

    #[test]
    fn dlq_item_carries_record_fields() {
        let mut job = JobRecord::new("/tmp/x", 10, Priority::low());
        job.retries = 2;
        job.last_error = Some("boom".to_string());
        let item = DlqItem::from(job.clone());
        assert_eq!(item.id, job.id);
        assert_eq!(item.retries, 2);
        assert_eq!(item.last_error.as_deref(), Some("boom"));
    }
}
