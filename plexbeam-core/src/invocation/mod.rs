//! Parsing of the intercepted transcoder command line.
//!
//! The cartridge never validates the argv the way FFmpeg would; it extracts
//! the fields dispatch decisions need and carries everything else verbatim
//! in `raw_args` for forwarding to workers.

pub mod dialect;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{BeamError, Result};

/// Streaming packaging the media server asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Dash,
    Hls,
    Unknown,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dash => "dash",
            Self::Hls => "hls",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubtitleMode {
    #[default]
    None,
    Burn,
    Embed,
}

impl SubtitleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Burn => "burn",
            Self::Embed => "embed",
        }
    }
}

/// The semantic view of one intercepted invocation.
#[derive(Debug, Clone)]
pub struct ParsedInvocation {
    pub input_path: String,
    pub output_target: PathBuf,
    pub output_dir: PathBuf,
    pub output_kind: OutputKind,
    pub video_codec_out: Option<String>,
    pub audio_codec_out: Option<String>,
    pub bitrate: Option<String>,
    pub resolution: Option<String>,
    pub segment_duration_sec: u32,
    pub seek_sec: f64,
    pub subtitle_mode: SubtitleMode,
    pub tone_map: bool,
    pub hw_accel_hint: Option<String>,
    pub manifest_callback_url: Option<String>,
    pub progress_url: Option<String>,
    /// 0 when absent; ≥ 1 when the player wants numbering to start
    /// mid-stream.
    pub skip_to_segment: u64,
    /// Original argv with hex stream specifiers decimalized and the output
    /// target absolutized in place. Otherwise verbatim.
    pub raw_args: Vec<String>,
}

fn scale_wh_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"scale=w=(\d+):h=(\d+)").expect("scale regex"))
}

impl ParsedInvocation {
    /// Parse an argv slice (program name already stripped).
    ///
    /// Relative output targets are resolved against `cwd` and the same
    /// substitution is applied inside `raw_args` so forwarding stays
    /// consistent.
    pub fn parse(argv: &[String], cwd: &Path) -> Result<Self> {
        if argv.is_empty() {
            return Err(BeamError::Invocation("empty argv".into()));
        }

        let mut raw_args = dialect::decimalize_args(argv);

        let mut input_path: Option<String> = None;
        let mut video_codec_out: Option<String> = None;
        let mut audio_codec_out: Option<String> = None;
        let mut bitrate: Option<String> = None;
        let mut resolution: Option<String> = None;
        let mut segment_duration_sec: u32 = 4;
        let mut seek_sec: f64 = 0.0;
        let mut subtitle_mode = SubtitleMode::None;
        let mut tone_map = false;
        let mut hw_accel_hint: Option<String> = None;
        let mut manifest_callback_url: Option<String> = None;
        let mut progress_url: Option<String> = None;
        let mut skip_to_segment: u64 = 0;
        let mut format: Option<String> = None;

        let mut i = 0;
        while i < raw_args.len() {
            let flag = raw_args[i].as_str();
            let value = raw_args.get(i + 1).cloned();
            match flag {
                "-i" => {
                    if let Some(v) = value {
                        if input_path.is_none() {
                            input_path = Some(v);
                        }
                        i += 1;
                    }
                }
                "-ss" => {
                    if let Some(v) = value {
                        if seek_sec == 0.0 {
                            seek_sec = parse_clock_or_seconds(&v).unwrap_or(0.0);
                        }
                        i += 1;
                    }
                }
                "-c:v" | "-vcodec" | "-codec:0" | "-c:v:0" => {
                    if let Some(v) = value {
                        video_codec_out = Some(normalize_video_codec(&v));
                        i += 1;
                    }
                }
                "-c:a" | "-acodec" | "-codec:1" | "-c:a:0" => {
                    if let Some(v) = value {
                        audio_codec_out =
                            Some(dialect::substitute_codec_name(&v).to_string());
                        i += 1;
                    }
                }
                "-b:v" | "-b:v:0" | "-maxrate" | "-maxrate:0" => {
                    if let Some(v) = value {
                        if bitrate.is_none() || flag.starts_with("-b:v") {
                            bitrate = Some(v);
                        }
                        i += 1;
                    }
                }
                "-filter_complex" | "-vf" => {
                    if let Some(v) = value {
                        if let Some(caps) = scale_wh_re().captures(&v) {
                            resolution = Some(format!("{}x{}", &caps[1], &caps[2]));
                        }
                        if v.contains("tonemap") {
                            tone_map = true;
                        }
                        if v.contains("subtitles=") || v.contains("overlay") {
                            subtitle_mode = SubtitleMode::Burn;
                        }
                        i += 1;
                    }
                }
                "-seg_duration" | "-hls_time" => {
                    if let Some(v) = value {
                        if let Ok(secs) = v.parse::<f64>() {
                            if secs > 0.0 {
                                segment_duration_sec = secs.round() as u32;
                            }
                        }
                        i += 1;
                    }
                }
                "-progressurl" => {
                    if let Some(v) = value {
                        progress_url = Some(v);
                        i += 1;
                    }
                }
                "-manifest_name" => {
                    if let Some(v) = value {
                        manifest_callback_url = Some(v);
                        i += 1;
                    }
                }
                "-skip_to_segment" => {
                    if let Some(v) = value {
                        skip_to_segment = v.parse().unwrap_or(0);
                        i += 1;
                    }
                }
                "-hwaccel" => {
                    if let Some(v) = value {
                        hw_accel_hint = Some(v);
                        i += 1;
                    }
                }
                "-f" => {
                    if let Some(v) = value {
                        format = Some(v);
                        i += 1;
                    }
                }
                "-c:s" | "-scodec" => {
                    if let Some(v) = value {
                        if v != "none" {
                            subtitle_mode = SubtitleMode::Embed;
                        }
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }

        let input_path =
            input_path.ok_or_else(|| BeamError::Invocation("no -i input in argv".into()))?;

        // The trailing positional is the output target. Relative targets are
        // resolved against the working directory, and raw_args gets the same
        // substitution so workers and the local fallback agree on the path.
        let last_index = raw_args.len() - 1;
        let trailing = raw_args[last_index].clone();
        if trailing.starts_with('-') {
            return Err(BeamError::Invocation(format!(
                "trailing argv token is a flag, not an output target: {trailing}"
            )));
        }
        let output_target = if Path::new(&trailing).is_absolute() {
            PathBuf::from(&trailing)
        } else {
            let absolute = cwd.join(&trailing);
            raw_args[last_index] = absolute.to_string_lossy().into_owned();
            absolute
        };
        let output_dir = output_target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());

        let output_kind = match format.as_deref() {
            Some("dash") => OutputKind::Dash,
            Some("hls") => OutputKind::Hls,
            Some(_) => OutputKind::Unknown,
            None => match output_target.extension().and_then(|e| e.to_str()) {
                Some("mpd") => OutputKind::Dash,
                Some("m3u8") => OutputKind::Hls,
                _ => OutputKind::Unknown,
            },
        };

        Ok(Self {
            input_path,
            output_target,
            output_dir,
            output_kind,
            video_codec_out,
            audio_codec_out,
            bitrate,
            resolution,
            segment_duration_sec,
            seek_sec,
            subtitle_mode,
            tone_map,
            hw_accel_hint,
            manifest_callback_url,
            progress_url,
            skip_to_segment,
            raw_args,
        })
    }

    /// Player-requested starting segment number minus one.
    pub fn skip_base(&self) -> u64 {
        self.skip_to_segment.saturating_sub(1)
    }

    pub fn input_is_url(&self) -> bool {
        self.input_path.starts_with("http://") || self.input_path.starts_with("https://")
    }

    /// argv to forward to a worker: verbatim `raw_args` with the trailing
    /// output token replaced by the `"dash"` sentinel the worker resolves
    /// against its own temp dir.
    pub fn worker_raw_args(&self) -> Vec<String> {
        let mut args = self.raw_args.clone();
        if let Some(last) = args.last_mut() {
            *last = "dash".to_string();
        }
        args
    }
}

/// Collapse encoder spellings down to the codec family workers expect.
fn normalize_video_codec(raw: &str) -> String {
    match raw {
        "libx264" | "h264" | "h264_nvenc" | "h264_qsv" | "h264_vaapi" => "h264".into(),
        "libx265" | "hevc" | "h265" | "hevc_nvenc" | "hevc_qsv" | "hevc_vaapi" => "hevc".into(),
        other => other.to_string(),
    }
}

/// Accept both `HH:MM:SS.ff` clock strings and plain fractional seconds.
fn parse_clock_or_seconds(raw: &str) -> Option<f64> {
    if let Ok(seconds) = raw.parse::<f64>() {
        return Some(seconds);
    }
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() == 3 {
        let hours = parts[0].parse::<f64>().ok()?;
        let minutes = parts[1].parse::<f64>().ok()?;
        let seconds = parts[2].parse::<f64>().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    } else {
        None
    }
}
