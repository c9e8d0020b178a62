use std::path::{Path, PathBuf};

use crate::constants::*;

/// On-disk layout of the cartridge's global state directory.
///
/// Sessions get a subdirectory each; the append-only event and master logs
/// plus the fingerprint files live at the root.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    pub fn events_log(&self) -> PathBuf {
        self.root.join(EVENTS_LOG)
    }

    pub fn master_log(&self) -> PathBuf {
        self.root.join(MASTER_LOG)
    }

    pub fn binary_fingerprint(&self) -> PathBuf {
        self.root.join(BINARY_FINGERPRINT)
    }

    pub fn install_meta(&self) -> PathBuf {
        self.root.join(INSTALL_META)
    }

    pub fn plex_version_history(&self) -> PathBuf {
        self.root.join(PLEX_VERSION_HISTORY)
    }
}

/// Per-session artifact paths inside one session directory.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    dir: PathBuf,
}

impl SessionLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_log(&self) -> PathBuf {
        self.dir.join(SESSION_LOG)
    }

    pub fn job_request_json(&self) -> PathBuf {
        self.dir.join(JOB_REQUEST_JSON)
    }

    pub fn job_response_json(&self) -> PathBuf {
        self.dir.join(JOB_RESPONSE_JSON)
    }

    pub fn job_completed_json(&self) -> PathBuf {
        self.dir.join(JOB_COMPLETED_JSON)
    }

    pub fn job_failed_json(&self) -> PathBuf {
        self.dir.join(JOB_FAILED_JSON)
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.dir.join(STDERR_LOG)
    }

    pub fn chunk_debug_log(&self) -> PathBuf {
        self.dir.join(CHUNK_DEBUG_LOG)
    }

    /// Staging area for one chunk's downloaded segments before in-order
    /// emission into the output directory.
    pub fn chunk_stage_dir(&self, chunk_index: usize) -> PathBuf {
        self.dir.join(format!("chunks/c{chunk_index}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = StateLayout::new("/var/lib/plexbeam");
        assert_eq!(
            layout.session_dir("20260801T120000_77"),
            PathBuf::from("/var/lib/plexbeam/sessions/20260801T120000_77")
        );
        assert!(layout.events_log().ends_with(EVENTS_LOG));

        let session = SessionLayout::new(layout.session_dir("s"));
        assert!(session.session_log().ends_with(SESSION_LOG));
        assert!(session
            .chunk_stage_dir(3)
            .ends_with(Path::new("chunks/c3")));
    }
}
