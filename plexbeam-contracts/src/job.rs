use serde::{Deserialize, Serialize};

/// Which media server spawned the cartridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Plex,
    Jellyfin,
}

impl MediaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plex => "plex",
            Self::Jellyfin => "jellyfin",
        }
    }
}

/// `POST /transcode` body submitted to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub input: JobInput,
    pub output: JobOutput,
    pub arguments: JobArguments,
    pub source: MediaSource,
    pub beam_stream: bool,
    pub pull_url: Option<String>,
    pub staged_input: Option<String>,
    pub callback_url: Option<String>,
    pub metadata: JobMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

impl JobInput {
    /// Worker reads the path from its own disk.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: "file".into(),
            path: path.into(),
        }
    }

    /// Worker receives the bytes over `POST /beam/stream/<job>`.
    pub fn stream(path: impl Into<String>) -> Self {
        Self {
            kind: "stream".into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub segment_duration: u32,
}

/// Semantic transcode parameters extracted from the intercepted argv.
///
/// `raw_args` is the verbatim argv with hex stream specifiers decimalized
/// and, in multi-worker mode, the trailing output token rewritten to the
/// `"dash"` sentinel that workers resolve against their own temp dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobArguments {
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: Option<String>,
    pub resolution: Option<String>,
    pub seek: f64,
    pub tone_mapping: bool,
    pub subtitle: SubtitleArgs,
    pub raw_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleArgs {
    pub mode: String,
}

impl SubtitleArgs {
    pub fn none() -> Self {
        Self {
            mode: "none".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub cartridge_version: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_info: Option<SplitInfo>,
}

/// Present only for big-split jobs so workers can log their slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitInfo {
    pub worker_index: usize,
    pub worker_count: usize,
    pub ss: f64,
    pub t: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> JobRequest {
        JobRequest {
            job_id: "20260801T120000_4242_c0".into(),
            input: JobInput::stream("/m/film.mkv"),
            output: JobOutput {
                kind: "dash".into(),
                path: "dash".into(),
                segment_duration: 4,
            },
            arguments: JobArguments {
                video_codec: "h264".into(),
                audio_codec: "aac".into(),
                video_bitrate: Some("4000k".into()),
                resolution: Some("1920x1080".into()),
                seek: 0.0,
                tone_mapping: false,
                subtitle: SubtitleArgs::none(),
                raw_args: vec!["-i".into(), "/m/film.mkv".into(), "dash".into()],
            },
            source: MediaSource::Plex,
            beam_stream: true,
            pull_url: None,
            staged_input: None,
            callback_url: None,
            metadata: JobMetadata {
                cartridge_version: "0.4.2".into(),
                session_id: "20260801T120000_4242".into(),
                split_info: None,
            },
        }
    }

    #[test]
    fn job_request_serializes_contract_keys() {
        let value = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(value["input"]["type"], "stream");
        assert_eq!(value["output"]["type"], "dash");
        assert_eq!(value["source"], "plex");
        assert_eq!(value["beam_stream"], true);
        assert!(value["pull_url"].is_null());
        // Absent split_info must not appear at all.
        assert!(value["metadata"].get("split_info").is_none());
    }

    #[test]
    fn split_info_round_trips() {
        let mut req = sample_request();
        req.metadata.split_info = Some(SplitInfo {
            worker_index: 1,
            worker_count: 3,
            ss: 300.0,
            t: 180.0,
        });
        let json = serde_json::to_string(&req).unwrap();
        let back: JobRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata.split_info.unwrap().worker_count, 3);
    }
}
