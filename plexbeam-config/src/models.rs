use std::path::PathBuf;

use url::Url;

/// Multi-worker dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiMode {
    /// Fixed-size chunks, one shared FIFO.
    Simple,
    /// One big split per worker, weighted by calibrated fps.
    BigSplit,
    /// Chunked with calibration, per-worker queues, prefetch, stealing, and
    /// endgame duplication.
    #[default]
    Torrent,
}

impl MultiMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" | "SIMPLE" => Some(Self::Simple),
            "B" | "BIGSPLIT" | "BIG_SPLIT" => Some(Self::BigSplit),
            "C" | "TORRENT" => Some(Self::Torrent),
            _ => None,
        }
    }

    pub fn as_letter(&self) -> &'static str {
        match self {
            Self::Simple => "A",
            Self::BigSplit => "B",
            Self::Torrent => "C",
        }
    }
}

/// Which media server this install intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    Plex,
    Jellyfin,
}

impl Source {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "plex" => Some(Self::Plex),
            "jellyfin" => Some(Self::Jellyfin),
            _ => None,
        }
    }
}

/// Fully resolved cartridge configuration.
///
/// Everything comes from the environment (optionally seeded from the
/// installer-baked env file); there is no config file format of its own.
#[derive(Debug, Clone)]
pub struct Config {
    pub multi_mode: MultiMode,
    pub chunk_duration_secs: u64,
    /// Beam-upload throttle in bytes/s; 0 = unlimited.
    pub upload_rate: u64,
    pub beam_direct: bool,
    pub worker_pool: Option<String>,
    pub remote_worker_url: Option<Url>,
    pub pull_proxy_url: Option<Url>,
    pub pull_dir: PathBuf,
    pub staged_upload: bool,
    pub api_key: Option<String>,
    pub source: Source,
    pub state_dir: PathBuf,
    pub log_filter: Option<String>,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Installer-recorded path of the real transcoder backup.
    pub real_transcoder: Option<PathBuf>,
    pub shared_segment_dir: Option<PathBuf>,
    pub callback_url: Option<String>,
}

impl Config {
    /// True when any remote dispatch target is configured at all.
    pub fn has_remote(&self) -> bool {
        self.worker_pool.is_some() || self.remote_worker_url.is_some()
    }
}
