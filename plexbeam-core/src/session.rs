use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plexbeam_config::paths::SessionLayout;
use plexbeam_config::StateLayout;

use crate::Result;

/// One cartridge run: a unique id plus the directory its artifacts land in.
///
/// The id embeds both a UTC compact timestamp and the pid, which is what
/// makes re-invocations with identical argv produce fresh job ids on the
/// workers instead of colliding with a finished session.
#[derive(Debug)]
pub struct Session {
    id: String,
    layout: SessionLayout,
}

impl Session {
    pub fn create(state: &StateLayout) -> Result<Self> {
        let id = format!(
            "{}_{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id()
        );
        let dir = state.session_dir(&id);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            id,
            layout: SessionLayout::new(dir),
        })
    }

    /// Open an existing session directory (used by tests).
    pub fn attach(id: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            id: id.into(),
            layout: SessionLayout::new(dir),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Job id for the media chunk `c` of this session.
    pub fn chunk_job_id(&self, chunk: usize) -> String {
        format!("{}_c{}", self.id, chunk)
    }

    /// Job id for worker `i`'s calibration probe.
    pub fn calibration_job_id(&self, worker: usize) -> String {
        format!("{}_cal{}", self.id, worker)
    }

    /// Job id for a prefetch upload of chunk `c`.
    pub fn prefetch_job_id(&self, chunk: usize) -> String {
        format!("{}_pre{}", self.id, chunk)
    }

    /// Job id for an endgame duplicate of chunk `c`.
    pub fn duplicate_job_id(&self, chunk: usize) -> String {
        format!("{}_dup{}", self.id, chunk)
    }

    /// Job id for worker `i`'s slice in big-split mode.
    pub fn split_job_id(&self, worker: usize) -> String {
        format!("{}_w{}", self.id, worker)
    }

    /// Persist a JSON artifact (`01_job_request.json` and friends).
    pub fn write_json(&self, path: &Path, value: &impl Serialize) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        std::fs::write(path, body)?;
        Ok(())
    }
}

/// Route `tracing` output to the session's narrative log.
///
/// Process stderr is strictly reserved for the forged FFmpeg progress lines
/// the media server parses, so the subscriber writes to `00_session.log`
/// instead. Returns an error only if the log file cannot be created.
pub fn init_tracing(session: &Session, filter: Option<&str>) -> Result<()> {
    let file: File = OpenOptions::new()
        .create(true)
        .append(true)
        .open(session.layout().session_log())?;

    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::new("info"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .init();

    info!(session = %session.id(), "session started");
    Ok(())
}
