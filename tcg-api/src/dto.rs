//! Request/response bodies for the HTTP façade. Entity responses reuse
//! `tcg_common`'s camelCase-serialized domain types directly; only the
//! request bodies and the small `{queued, repoId}`/`{message}` shapes need
//! dedicated types here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRepoRequest {
    pub repository_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub repository_url: String,
    pub file_path: String,
    pub target_coverage: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanQueuedResponse {
    pub queued: bool,
    pub repo_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}
