//! Rewrite a CPU-encoder argv for the host GPU.
//!
//! The input is the media server's verbatim argv (hex specifiers already
//! decimalized); the output is an argv a stock FFmpeg with NVENC or QSV
//! support accepts. Dialect-only tokens are stripped here because the local
//! system encoder, unlike the workers, does not speak Plex's fork.

use std::sync::OnceLock;

use regex::Regex;

use crate::invocation::dialect;
use crate::local::gpu::GpuKind;

fn scale_filter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[0:0\]scale=w=(\d+):h=(\d+)").expect("scale filter regex"))
}

fn clamp_quality(value: i64) -> i64 {
    value.clamp(1, 51)
}

/// Map a codec token to its GPU encoder, or pass it through.
fn map_codec(token: &str, gpu: GpuKind) -> Option<&'static str> {
    match (token, gpu) {
        ("libx264", GpuKind::Nvenc) => Some("h264_nvenc"),
        ("libx264", GpuKind::Qsv) => Some("h264_qsv"),
        ("libx265", GpuKind::Nvenc) => Some("hevc_nvenc"),
        ("libx265", GpuKind::Qsv) => Some("hevc_qsv"),
        _ => None,
    }
}

/// Rewrite the software scale filter for the GPU pipeline.
fn map_filter(value: &str, gpu: GpuKind) -> String {
    let substituted = dialect::substitute_filter_params(value);
    match gpu {
        GpuKind::Qsv => scale_filter_re()
            .replace_all(&substituted, |caps: &regex::Captures<'_>| {
                format!(
                    "[0:0]format=nv12,hwupload=extra_hw_frames=64,scale_qsv=w={}:h={}",
                    &caps[1], &caps[2]
                )
            })
            .into_owned(),
        GpuKind::Nvenc => scale_filter_re()
            .replace_all(&substituted, |caps: &regex::Captures<'_>| {
                format!(
                    "[0:0]scale=w={}:h={},format=nv12,hwupload_cuda",
                    &caps[1], &caps[2]
                )
            })
            .into_owned(),
    }
}

/// Produce the GPU argv for a local run.
pub fn rewrite_for_gpu(args: &[String], gpu: GpuKind) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(args.len() + 8);
    out.push("-loglevel".into());
    out.push("warning".into());
    match gpu {
        GpuKind::Qsv => {
            out.push("-init_hw_device".into());
            out.push("qsv=hw".into());
            out.push("-filter_hw_device".into());
            out.push("hw".into());
        }
        GpuKind::Nvenc => {
            out.push("-hwaccel".into());
            out.push("cuda".into());
            out.push("-hwaccel_output_format".into());
            out.push("cuda".into());
        }
    }

    let mut i = 0;
    while i < args.len() {
        let token = args[i].as_str();
        let has_value = i + 1 < args.len();

        // The prefix already set the log level.
        if token == "-loglevel" && has_value {
            i += 2;
            continue;
        }
        if dialect::is_plex_value_flag(token) && has_value {
            i += 2;
            continue;
        }
        if dialect::is_software_tuning_flag(token) && has_value {
            i += 2;
            continue;
        }
        if token == "-crf" && has_value {
            if let Ok(crf) = args[i + 1].parse::<i64>() {
                match gpu {
                    GpuKind::Nvenc => {
                        out.push("-qp".into());
                        out.push(clamp_quality(crf).to_string());
                    }
                    GpuKind::Qsv => {
                        out.push("-global_quality".into());
                        out.push(clamp_quality(crf + 2).to_string());
                    }
                }
            }
            i += 2;
            continue;
        }
        if (token == "-filter_complex" || token == "-vf") && has_value {
            out.push(token.to_string());
            out.push(map_filter(&args[i + 1], gpu));
            i += 2;
            continue;
        }

        if let Some(encoder) = map_codec(token, gpu) {
            out.push(encoder.to_string());
        } else {
            out.push(dialect::substitute_codec_name(token).to_string());
        }
        i += 1;
    }

    out
}
