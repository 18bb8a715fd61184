//! Queue payload definitions and job-key derivation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload enqueued onto `scan_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJobPayload {
    pub repo_id: Uuid,
}

/// Payload enqueued onto `improve_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproveJobPayload {
    pub job_id: Uuid,
}

/// Idempotence key for a scan enqueue: `"scan-" + repo_id + "-" + monotonic_ts`.
///
/// `monotonic_ts` is passed in by the caller (milliseconds since the epoch)
/// rather than sampled here, so callers that need a stable key for testing
/// can supply one deterministically.
pub fn scan_job_key(repo_id: Uuid, monotonic_ts_millis: i64) -> String {
    format!("scan-{repo_id}-{monotonic_ts_millis}")
}

/// Idempotence key for an improvement enqueue: the job id itself.
pub fn improve_job_key(job_id: Uuid) -> String {
    job_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_job_key_begins_with_scan_prefix() {
        let id = Uuid::new_v4();
        let key = scan_job_key(id, 1234);
        assert!(key.starts_with(&format!("scan-{id}-")));
    }

    #[test]
    fn improve_job_key_equals_job_id() {
        let id = Uuid::new_v4();
        assert_eq!(improve_job_key(id), id.to_string());
    }
}
