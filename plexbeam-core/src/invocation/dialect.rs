//! Normalization of the two argv dialects the cartridge ingests.
//!
//! Plex and Jellyfin both hand us mostly standard FFmpeg argv, but Plex
//! diverges in a handful of tokens that its private FFmpeg fork understands
//! and a stock encoder does not. Everything here is a small rewrite pass
//! over tokens; unknown tokens pass through verbatim.

use std::sync::OnceLock;

use regex::Regex;

fn hex_spec_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#0[xX]([0-9a-fA-F]+)").expect("hex spec regex"))
}

/// Rewrite hex stream specifiers (`#0xNN`) to decimal (`#N`) anywhere in a
/// token. Already-decimal input comes back unchanged, so the pass is
/// idempotent.
pub fn decimalize_stream_specifiers(token: &str) -> String {
    hex_spec_re()
        .replace_all(token, |caps: &regex::Captures<'_>| {
            match u64::from_str_radix(&caps[1], 16) {
                Ok(value) => format!("#{value}"),
                // Unparseable hex: leave the token alone.
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

pub fn decimalize_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| decimalize_stream_specifiers(arg))
        .collect()
}

/// Plex-only flags (each followed by one value) that a stock FFmpeg rejects.
const PLEX_VALUE_FLAGS: &[&str] = &[
    "-loglevel_plex",
    "-progressurl",
    "-time_delta",
    "-delete_removed",
    "-skip_to_segment",
    "-manifest_name",
];

pub fn is_plex_value_flag(flag: &str) -> bool {
    PLEX_VALUE_FLAGS.contains(&flag)
}

/// Flags (with one value) dropped whenever the GPU rewrite replaces the
/// software encoder: presets and encoder-private option blobs.
pub fn is_software_tuning_flag(flag: &str) -> bool {
    flag.starts_with("-preset") || flag == "-x264opts" || flag == "-x265-params"
}

/// Plex's private codec spelling for low-complexity AAC.
pub fn substitute_codec_name(token: &str) -> &str {
    if token == "aac_lc" {
        "aac"
    } else {
        token
    }
}

/// Plex's private `ochl=` filter parameter; stock FFmpeg spells it
/// `out_chlayout=`.
pub fn substitute_filter_params(filter: &str) -> String {
    filter.replace("ochl=", "out_chlayout=")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_specs_become_decimal() {
        assert_eq!(decimalize_stream_specifiers("0:#0x2d"), "0:#45");
        assert_eq!(decimalize_stream_specifiers("[0:#0x1]"), "[0:#1]");
        assert_eq!(
            decimalize_stream_specifiers("-map=0:#0xA,0:#0x2"),
            "-map=0:#10,0:#2"
        );
    }

    #[test]
    fn decimalization_is_idempotent() {
        let once = decimalize_stream_specifiers("0:#0x2d");
        assert_eq!(decimalize_stream_specifiers(&once), once);
        // Plain decimal input is a no-op.
        assert_eq!(decimalize_stream_specifiers("0:#45"), "0:#45");
        assert_eq!(decimalize_stream_specifiers("-map"), "-map");
    }

    #[test]
    fn plex_flags_are_recognized() {
        assert!(is_plex_value_flag("-progressurl"));
        assert!(is_plex_value_flag("-skip_to_segment"));
        assert!(!is_plex_value_flag("-ss"));
    }

    #[test]
    fn software_tuning_flags() {
        assert!(is_software_tuning_flag("-preset"));
        assert!(is_software_tuning_flag("-preset:0"));
        assert!(is_software_tuning_flag("-x264opts"));
        assert!(is_software_tuning_flag("-x265-params"));
        assert!(!is_software_tuning_flag("-b:v"));
    }

    #[test]
    fn codec_and_filter_substitutions() {
        assert_eq!(substitute_codec_name("aac_lc"), "aac");
        assert_eq!(substitute_codec_name("aac"), "aac");
        assert_eq!(
            substitute_filter_params("[0:1]aresample=ochl=stereo[a]"),
            "[0:1]aresample=out_chlayout=stereo[a]"
        );
    }
}
