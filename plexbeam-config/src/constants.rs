//! Variable names, defaults, and state-file names in one place.

/// Dispatch strategy for the multi-worker path. `A` = simple chunked,
/// `B` = weighted big-split, `C` = BitTorrent-style.
pub const ENV_MULTI_MODE: &str = "PLEXBEAM_MULTI_MODE";
pub const ENV_CHUNK_DURATION: &str = "PLEXBEAM_CHUNK_DURATION";
pub const ENV_UPLOAD_RATE: &str = "PLEXBEAM_UPLOAD_RATE";
pub const ENV_BEAM_DIRECT: &str = "PLEXBEAM_BEAM_DIRECT";
pub const ENV_WORKER_POOL: &str = "PLEXBEAM_WORKER_POOL";
pub const ENV_REMOTE_WORKER_URL: &str = "PLEXBEAM_REMOTE_WORKER_URL";
pub const ENV_PULL_PROXY_URL: &str = "PLEXBEAM_PULL_PROXY_URL";
pub const ENV_PULL_DIR: &str = "PLEXBEAM_PULL_DIR";
pub const ENV_STAGED_UPLOAD: &str = "PLEXBEAM_STAGED_UPLOAD";
pub const ENV_API_KEY: &str = "PLEXBEAM_API_KEY";
pub const ENV_SOURCE: &str = "PLEXBEAM_SOURCE";
pub const ENV_STATE_DIR: &str = "PLEXBEAM_STATE_DIR";
pub const ENV_LOG: &str = "PLEXBEAM_LOG";
pub const ENV_FFMPEG: &str = "PLEXBEAM_FFMPEG";
pub const ENV_FFPROBE: &str = "PLEXBEAM_FFPROBE";
pub const ENV_REAL_TRANSCODER: &str = "PLEXBEAM_REAL_TRANSCODER";
pub const ENV_SHARED_SEGMENT_DIR: &str = "PLEXBEAM_SHARED_SEGMENT_DIR";
pub const ENV_CALLBACK_URL: &str = "PLEXBEAM_CALLBACK_URL";
pub const ENV_ENV_FILE: &str = "PLEXBEAM_ENV_FILE";

pub const DEFAULT_CHUNK_DURATION_SECS: u64 = 300;
pub const DEFAULT_STATE_DIR: &str = "/var/lib/plexbeam";
pub const DEFAULT_PULL_DIR: &str = "/tmp/plexbeam-pull";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_FFPROBE: &str = "ffprobe";

/// Installer-baked env file loaded (if present) before the environment is
/// read. The installer writes worker URL, API key, shared segment dir, and
/// callback URL here.
pub const DEFAULT_ENV_FILE: &str = "/etc/plexbeam.env";

// Global (per-install) state file names, rooted at the state dir.
pub const EVENTS_LOG: &str = "cartridge_events.log";
pub const MASTER_LOG: &str = "master.log";
pub const BINARY_FINGERPRINT: &str = ".binary_fingerprint";
pub const INSTALL_META: &str = ".install_meta";
pub const PLEX_VERSION_HISTORY: &str = ".plex_version_history";

// Per-session artifact names, rooted at the session dir.
pub const SESSION_LOG: &str = "00_session.log";
pub const JOB_REQUEST_JSON: &str = "01_job_request.json";
pub const JOB_RESPONSE_JSON: &str = "02_job_response.json";
pub const JOB_COMPLETED_JSON: &str = "03_job_completed.json";
pub const JOB_FAILED_JSON: &str = "03_job_failed.json";
pub const STDERR_LOG: &str = "stderr.log";
pub const CHUNK_DEBUG_LOG: &str = "chunk_download.log";
