use serde::{Deserialize, Serialize};

/// Lifecycle of a job on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// States a fresh submission may legitimately come back with.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Body of `GET /status/<job_id>`.
///
/// All telemetry fields default to zero because workers omit them until the
/// encode has produced its first progress sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: JobState,
    #[serde(default)]
    pub fps: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub out_time_ms: i64,
    #[serde(default)]
    pub frame: u64,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Body of a `POST /transcode` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: JobState,
    #[serde(default)]
    pub error: Option<String>,
}
