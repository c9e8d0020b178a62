use std::path::PathBuf;

/// Error kinds the cartridge distinguishes.
///
/// Network and worker failures are recovered locally by the dispatchers
/// (retry, reassign); configuration and self-heal failures are fatal and
/// surface as a non-zero exit with one line on stderr.
#[derive(Debug, thiserror::Error)]
pub enum BeamError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("worker rejected job {job_id}: {message}")]
    WorkerRejected { job_id: String, message: String },

    #[error("job {job_id} failed on worker: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no usable transcoder backup near {0}")]
    SelfHeal(PathBuf),

    #[error("argument parse error: {0}")]
    Invocation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BeamError>;
