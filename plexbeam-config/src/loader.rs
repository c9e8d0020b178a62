use std::path::PathBuf;

use url::Url;

use crate::constants::*;
use crate::models::{Config, MultiMode, Source};
use crate::util::{parse_bool, var_nonempty};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("invalid URL in {name}: {source}")]
    Url {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
}

/// Load the cartridge configuration from the environment.
///
/// The installer-baked env file (default `/etc/plexbeam.env`, overridable via
/// `PLEXBEAM_ENV_FILE`) is loaded first without clobbering variables already
/// present, so the live environment always wins.
pub fn load() -> Result<Config, ConfigError> {
    let env_file = var_nonempty(ENV_ENV_FILE).unwrap_or_else(|| DEFAULT_ENV_FILE.to_string());
    let _ = dotenvy::from_path(&env_file);

    let multi_mode = match var_nonempty(ENV_MULTI_MODE) {
        Some(raw) => MultiMode::parse(&raw).ok_or(ConfigError::Invalid {
            name: ENV_MULTI_MODE,
            value: raw,
        })?,
        None => MultiMode::default(),
    };

    let chunk_duration_secs = match var_nonempty(ENV_CHUNK_DURATION) {
        Some(raw) => raw
            .parse::<u64>()
            .ok()
            .filter(|&secs| secs > 0)
            .ok_or(ConfigError::Invalid {
                name: ENV_CHUNK_DURATION,
                value: raw,
            })?,
        None => DEFAULT_CHUNK_DURATION_SECS,
    };

    let upload_rate = match var_nonempty(ENV_UPLOAD_RATE) {
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
            name: ENV_UPLOAD_RATE,
            value: raw,
        })?,
        None => 0,
    };

    let beam_direct = parse_bool_var(ENV_BEAM_DIRECT)?.unwrap_or(false);
    let staged_upload = parse_bool_var(ENV_STAGED_UPLOAD)?.unwrap_or(false);

    let source = match var_nonempty(ENV_SOURCE) {
        Some(raw) => Source::parse(&raw).ok_or(ConfigError::Invalid {
            name: ENV_SOURCE,
            value: raw,
        })?,
        None => Source::default(),
    };

    Ok(Config {
        multi_mode,
        chunk_duration_secs,
        upload_rate,
        beam_direct,
        worker_pool: var_nonempty(ENV_WORKER_POOL),
        remote_worker_url: parse_url_var(ENV_REMOTE_WORKER_URL)?,
        pull_proxy_url: parse_url_var(ENV_PULL_PROXY_URL)?,
        pull_dir: var_nonempty(ENV_PULL_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PULL_DIR)),
        staged_upload,
        api_key: var_nonempty(ENV_API_KEY),
        source,
        state_dir: var_nonempty(ENV_STATE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
        log_filter: var_nonempty(ENV_LOG),
        ffmpeg_path: var_nonempty(ENV_FFMPEG)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
        ffprobe_path: var_nonempty(ENV_FFPROBE)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFPROBE)),
        real_transcoder: var_nonempty(ENV_REAL_TRANSCODER).map(PathBuf::from),
        shared_segment_dir: var_nonempty(ENV_SHARED_SEGMENT_DIR).map(PathBuf::from),
        callback_url: var_nonempty(ENV_CALLBACK_URL),
    })
}

fn parse_bool_var(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match var_nonempty(name) {
        Some(raw) => parse_bool(&raw)
            .map(Some)
            .ok_or(ConfigError::Invalid { name, value: raw }),
        None => Ok(None),
    }
}

fn parse_url_var(name: &'static str) -> Result<Option<Url>, ConfigError> {
    match var_nonempty(name) {
        Some(raw) => Url::parse(&raw)
            .map(Some)
            .map_err(|source| ConfigError::Url { name, source }),
        None => Ok(None),
    }
}
