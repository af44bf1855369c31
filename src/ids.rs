//! Job and worker identifier generation.

use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Generates a new opaque job id.
///
/// Plain UUIDv4; the codec treats job ids as opaque strings so any unique
/// scheme works, but v4 avoids leaking creation order the way v1/v7 would.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Builds a worker id of the form `host-pid-index-startNanos`.
///
/// Including the process start time in nanoseconds means two workers with
/// the same hostname and the same process-local index (e.g. after a
/// container restart that reuses both) never collide, per spec §9.
pub fn new_worker_id(index: usize) -> String {
    let host = hostname();
    let pid = process::id();
    let start_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    format!("{host}-{pid}-{index}-{start_nanos}")
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}
