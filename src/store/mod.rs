//! Store adapter: the thin Redis-compatible command surface the rest of
//! this crate is built on (spec section 4.1).
//!
//! [`Store`] is a trait so workers, the reaper, the producer, and admin
//! operations can all be exercised against an in-memory fake in tests
//! without a live Redis instance — the same seam this codebase's other
//! Redis-backed components (`JobQueue`) would benefit from but don't yet
//! have, since they're only ever constructed against a real connection.

mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

use scripts::Scripts;

/// Errors raised by a [`Store`] implementation.
///
/// Every Redis error is classified into one of these two subkinds (spec
/// section 4.1, section 7) so callers can decide whether to retry locally
/// or surface the failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_timeout() || err.is_io_error() {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Fatal(err.to_string())
        }
    }
}

/// Outcome of a blocking claim attempt.
///
/// A timed-out claim is a normal, expected outcome (an empty queue), never
/// an error — distinguished from [`StoreError`] per spec section 4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(String),
    Timeout,
}

/// Outcome of a guarded reap move for a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The record was moved to its destination queue.
    Moved,
    /// The worker's heartbeat had reappeared; nothing was touched.
    StillAlive,
    /// The heartbeat was absent but the record was no longer present
    /// (already claimed by a concurrent reap attempt, or acked/failed
    /// between the reaper's `LRANGE` and this call).
    NotFound,
}

/// The Redis-compatible command surface the engine is built on.
///
/// Every method takes fully-qualified key strings; callers (worker,
/// reaper, producer, admin) derive those keys from [`crate::config::Config`].
#[async_trait]
pub trait Store: Send + Sync {
    /// `LPUSH raw` onto `queue_key`.
    async fn enqueue(&self, queue_key: &str, raw: &str) -> Result<(), StoreError>;

    /// Non-blocking atomic move of one record from `queue_key`'s tail to
    /// `processing_key`'s head. Used to poll higher priorities without
    /// blocking on them (spec section 4.3 step 2).
    async fn try_claim(
        &self,
        queue_key: &str,
        processing_key: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Blocking atomic move, waking after `timeout` with
    /// [`ClaimOutcome::Timeout`] if nothing arrived.
    async fn blocking_claim(
        &self,
        queue_key: &str,
        processing_key: &str,
        timeout: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Removes one exact-match occurrence of `raw` from `processing_key`
    /// and, if `completed_key` is given, appends it there.
    async fn ack(
        &self,
        processing_key: &str,
        raw: &str,
        completed_key: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Atomically moves a record from `processing_key` to `dest_queue_key`
    /// (the job's priority queue, with `retries` already incremented in
    /// `new_raw`).
    async fn fail_requeue(
        &self,
        processing_key: &str,
        old_raw: &str,
        dest_queue_key: &str,
        new_raw: &str,
    ) -> Result<(), StoreError>;

    /// Atomically moves a record from `processing_key` to `dlq_key`.
    async fn fail_dlq(
        &self,
        processing_key: &str,
        old_raw: &str,
        dlq_key: &str,
        new_raw: &str,
    ) -> Result<(), StoreError>;

    /// `SET heartbeat_key <worker marker> EX ttl`.
    async fn set_heartbeat(&self, heartbeat_key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Resets the heartbeat's TTL without changing its value.
    async fn refresh_heartbeat(&self, heartbeat_key: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Whether a heartbeat key currently exists.
    async fn heartbeat_exists(&self, heartbeat_key: &str) -> Result<bool, StoreError>;

    /// Deletes a key outright (used for processing-list cleanup after a
    /// reap, and by `PurgeAll`).
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError>;

    /// Full `SCAN` cursor sweep for keys matching `pattern`.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Removes one exact-match occurrence of `raw` from `key`. Returns
    /// whether a record was actually removed.
    async fn lrem(&self, key: &str, raw: &str) -> Result<bool, StoreError>;

    /// Server-side guarded move used by the reaper: re-checks
    /// `heartbeat_key` is absent before moving `old_raw` from
    /// `processing_key` to `dest_key` as `new_raw`.
    async fn guarded_reap_move(
        &self,
        heartbeat_key: &str,
        processing_key: &str,
        old_raw: &str,
        dest_key: &str,
        new_raw: &str,
    ) -> Result<ReapOutcome, StoreError>;

    /// `INCR key`; if the result is `1`, also `EXPIRE key window`. Returns
    /// the post-increment value. Used by the rate limiter (spec section
    /// 4.5, invariant I4) — intentionally two commands, not a script: only
    /// one caller can ever observe the post-increment value `1` for a
    /// given window, so the race the spec calls out is bounded to that.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// `SADD workers_key worker_id` for the roster optimization in spec
    /// section 9 (not required for correctness; `Workers()` also falls
    /// back to `SCAN`).
    async fn register_worker(&self, workers_key: &str, worker_id: &str) -> Result<(), StoreError>;

    async fn unregister_worker(&self, workers_key: &str, worker_id: &str)
        -> Result<(), StoreError>;

    async fn scard(&self, workers_key: &str) -> Result<u64, StoreError>;

    async fn smembers(&self, workers_key: &str) -> Result<Vec<String>, StoreError>;
}

/// Redis-backed [`Store`] implementation.
///
/// Holds a cheap-clone [`ConnectionManager`] rather than a checked-out
/// pooled connection (spec section 4.1/5): every call clones the handle,
/// the same sharing model `JobQueue` uses for its Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Scripts,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Fatal(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            scripts: Scripts::default(),
        })
    }

    pub fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Scripts::default(),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn enqueue(&self, queue_key: &str, raw: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue_key, raw).await?;
        Ok(())
    }

    async fn try_claim(
        &self,
        queue_key: &str,
        processing_key: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let moved: Option<String> = conn.rpoplpush(queue_key, processing_key).await?;
        Ok(moved)
    }

    async fn blocking_claim(
        &self,
        queue_key: &str,
        processing_key: &str,
        timeout: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let moved: Option<String> = conn
            .brpoplpush(queue_key, processing_key, timeout.as_secs_f64())
            .await?;
        Ok(match moved {
            Some(raw) => ClaimOutcome::Claimed(raw),
            None => ClaimOutcome::Timeout,
        })
    }

    async fn ack(
        &self,
        processing_key: &str,
        raw: &str,
        completed_key: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match completed_key {
            Some(dest) => {
                self.scripts
                    .atomic_move
                    .key(processing_key)
                    .key(dest)
                    .arg(raw)
                    .arg(raw)
                    .invoke_async::<_, i64>(&mut conn)
                    .await?;
            }
            None => {
                conn.lrem::<_, _, ()>(processing_key, 1, raw).await?;
            }
        }
        Ok(())
    }

    async fn fail_requeue(
        &self,
        processing_key: &str,
        old_raw: &str,
        dest_queue_key: &str,
        new_raw: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.scripts
            .atomic_move
            .key(processing_key)
            .key(dest_queue_key)
            .arg(old_raw)
            .arg(new_raw)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail_dlq(
        &self,
        processing_key: &str,
        old_raw: &str,
        dlq_key: &str,
        new_raw: &str,
    ) -> Result<(), StoreError> {
        // Same shape as fail_requeue; kept as a distinct method so call
        // sites read as "this is a terminal transition", not a requeue.
        self.fail_requeue(processing_key, old_raw, dlq_key, new_raw)
            .await
    }

    async fn set_heartbeat(&self, heartbeat_key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(heartbeat_key, "1", ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn refresh_heartbeat(
        &self,
        heartbeat_key: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.set_heartbeat(heartbeat_key, ttl).await
    }

    async fn heartbeat_exists(&self, heartbeat_key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(heartbeat_key).await?;
        Ok(exists)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(items)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(found)
    }

    async fn lrem(&self, key: &str, raw: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(key, 1, raw).await?;
        Ok(removed == 1)
    }

    async fn guarded_reap_move(
        &self,
        heartbeat_key: &str,
        processing_key: &str,
        old_raw: &str,
        dest_key: &str,
        new_raw: &str,
    ) -> Result<ReapOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .scripts
            .guarded_reap_move
            .key(heartbeat_key)
            .key(processing_key)
            .key(dest_key)
            .arg(old_raw)
            .arg(new_raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(match result {
            -1 => ReapOutcome::StillAlive,
            1 => ReapOutcome::Moved,
            _ => ReapOutcome::NotFound,
        })
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: u64 = conn.incr(key, 1u64).await?;
        if value == 1 {
            conn.expire::<_, ()>(key, window.as_secs().max(1) as i64)
                .await?;
        }
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let secs: i64 = conn.ttl(key).await?;
        Ok(if secs > 0 {
            Some(Duration::from_secs(secs as u64))
        } else {
            None
        })
    }

    async fn register_worker(&self, workers_key: &str, worker_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(workers_key, worker_id).await?;
        Ok(())
    }

    async fn unregister_worker(
        &self,
        workers_key: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(workers_key, worker_id).await?;
        Ok(())
    }

    async fn scard(&self, workers_key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.scard(workers_key).await?;
        Ok(count)
    }

    async fn smembers(&self, workers_key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(workers_key).await?;
        Ok(members)
    }
}
