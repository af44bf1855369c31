//! Producer: validates, rate-limits, and enqueues jobs (spec section 4.5).
//!
//! Grounded on `JobQueue::enqueue`/`enqueue_batch` for the push shape;
//! the rate limiting itself lives in [`crate::ratelimiter`].

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::job::{Codec, CodecError, JobRecord, Priority};
use crate::metrics::MetricsSink;
use crate::ratelimiter::RateLimiter;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("job encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Accepts new work, applying the configured rate limit before every push.
pub struct Producer {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    metrics: Arc<dyn MetricsSink>,
    limiter: RateLimiter,
    codec: Codec,
}

impl Producer {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>, metrics: Arc<dyn MetricsSink>) -> Self {
        let limiter = RateLimiter::new(
            store.clone(),
            config.rate_limit_key.clone(),
            config.enqueue_rate_per_sec,
            std::time::Duration::from_secs(1),
            config.rate_limit_jitter,
        );
        let codec = Codec::new(config.max_job_bytes);
        Self {
            config,
            store,
            metrics,
            limiter,
            codec,
        }
    }

    /// Blocks on the rate limiter, then pushes one job onto its priority's
    /// queue. Returns the record actually enqueued (with its assigned id).
    pub async fn enqueue(&self, payload: String, priority: Priority) -> Result<JobRecord, ProducerError> {
        self.limiter.acquire().await?;
        let size = payload.len() as u64;
        let job = JobRecord::new(payload, size, priority);
        let raw = self.codec.encode(&job)?;
        let queue_key = self.config.queue_key(&job.priority);
        self.store.enqueue(&queue_key, &raw).await?;
        self.metrics.record_job_enqueued(&job.priority);
        Ok(job)
    }

    /// Same as [`Producer::enqueue`] but with an already-built record
    /// (e.g. one resubmitted from a DLQ peek).
    pub async fn enqueue_job(&self, job: &JobRecord) -> Result<(), ProducerError> {
        self.limiter.acquire().await?;
        let raw = self.codec.encode(job)?;
        let queue_key = self.config.queue_key(&job.priority);
        self.store.enqueue(&queue_key, &raw).await?;
        self.metrics.record_job_enqueued(&job.priority);
        Ok(())
    }

    /// Enqueues many payloads of the same priority, applying the rate
    /// limit to each individually (no burst exemption for batches).
    pub async fn enqueue_batch(
        &self,
        payloads: Vec<String>,
        priority: Priority,
    ) -> Result<Vec<JobRecord>, ProducerError> {
        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            jobs.push(self.enqueue(payload, priority.clone()).await?);
        }
        Ok(jobs)
    }
}

/// Demonstration classifier: payloads under 4KiB are treated as
/// high-priority (cheap, likely interactive), everything else low. Callers
/// needing real routing logic should classify before calling
/// [`Producer::enqueue`] — this exists to exercise the multi-priority path
/// end to end without requiring a caller-supplied classifier.
pub fn classify_priority_by_size(size: u64) -> Priority {
    const SMALL_PAYLOAD_THRESHOLD: u64 = 4 * 1024;
    if size <= SMALL_PAYLOAD_THRESHOLD {
        Priority::high()
    } else {
        Priority::low()
    }
}
