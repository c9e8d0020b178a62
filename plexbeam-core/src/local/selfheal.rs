//! Guarding the interception point.
//!
//! On a Plex deployment the cartridge occupies the `Plex Transcoder` path
//! and the real binary lives beside it under a backup name. Host upgrades
//! replace the whole directory, so before every dispatch the cartridge
//! re-validates that its backup still exists and is a native executable,
//! and tracks its content fingerprint to spot upgrades.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use plexbeam_config::{Source, StateLayout};

use crate::error::{BeamError, Result};
use crate::events::{read_fingerprint, write_fingerprint, EventLog};

/// Backup names probed next to the intercepted binary, in order.
const BACKUP_SUFFIXES: &[&str] = &[".real", ".backup"];

/// True when the file starts with an ELF or Mach-O magic number.
pub fn is_native_binary(path: &Path) -> bool {
    let Ok(bytes) = std::fs::read(path) else {
        return false;
    };
    if bytes.len() < 4 {
        return false;
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    matches!(
        magic,
        [0x7f, b'E', b'L', b'F']
            | [0xfe, 0xed, 0xfa, 0xce]
            | [0xfe, 0xed, 0xfa, 0xcf]
            | [0xce, 0xfa, 0xed, 0xfe]
            | [0xcf, 0xfa, 0xed, 0xfe]
            | [0xca, 0xfe, 0xba, 0xbe]
    )
}

/// Locate the real transcoder for this invocation.
///
/// Jellyfin installs intercept through a separate shim, so the configured
/// path is authoritative there. Plex installs search the usual backup spots
/// when the configured path has gone missing (a host upgrade rewrote the
/// install dir).
pub fn resolve_real_transcoder(
    configured: Option<&Path>,
    intercepted: &Path,
    source: Source,
    events: &EventLog,
) -> Result<PathBuf> {
    if let Some(path) = configured {
        if is_native_binary(path) {
            return Ok(path.to_path_buf());
        }
        if source == Source::Jellyfin {
            return Err(BeamError::SelfHeal(path.to_path_buf()));
        }
        warn!(path = %path.display(), "configured transcoder backup is gone, searching siblings");
        events.alert(
            "selfheal_search",
            &format!("configured backup missing: {}", path.display()),
        );
    } else if source == Source::Jellyfin {
        return Err(BeamError::SelfHeal(intercepted.to_path_buf()));
    }

    for suffix in BACKUP_SUFFIXES {
        let mut candidate = intercepted.as_os_str().to_owned();
        candidate.push(suffix);
        let candidate = PathBuf::from(candidate);
        if is_native_binary(&candidate) {
            info!(path = %candidate.display(), "recovered transcoder backup");
            events.info(
                "selfheal_recovered",
                &candidate.display().to_string(),
            );
            return Ok(candidate);
        }
    }

    // Last resort: any native executable in the parent directory whose name
    // carries the intercepted binary's stem.
    if let (Some(dir), Some(stem)) = (
        intercepted.parent(),
        intercepted.file_name().and_then(|n| n.to_str()),
    ) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path == intercepted {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(stem) && is_native_binary(&path) {
                    info!(path = %path.display(), "recovered transcoder from parent scan");
                    events.info("selfheal_recovered", &path.display().to_string());
                    return Ok(path);
                }
            }
        }
    }

    events.alert(
        "selfheal_failed",
        &format!("no backup near {}", intercepted.display()),
    );
    Err(BeamError::SelfHeal(intercepted.to_path_buf()))
}

/// Track the backup's content fingerprint; a change means the host upgraded
/// the real transcoder underneath us.
pub fn check_fingerprint(backup: &Path, state: &StateLayout, events: &EventLog) {
    let Ok(bytes) = std::fs::read(backup) else {
        return;
    };
    let digest = format!("{:x}", md5::compute(&bytes));
    let fingerprint_path = state.binary_fingerprint();
    match read_fingerprint(&fingerprint_path) {
        Some(previous) if previous == digest => {}
        Some(previous) => {
            info!(old = %previous, new = %digest, "transcoder fingerprint changed");
            events.info(
                "host_upgrade",
                &format!("transcoder fingerprint {previous} -> {digest}"),
            );
            append_version_history(state, &previous, &digest);
            write_fingerprint(&fingerprint_path, &digest);
        }
        None => write_fingerprint(&fingerprint_path, &digest),
    }
}

/// One line per observed host upgrade in `.plex_version_history`.
fn append_version_history(state: &StateLayout, previous: &str, current: &str) {
    use std::io::Write;
    let path = state.plex_version_history();
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        let _ = writeln!(
            file,
            "{} {previous} -> {current}",
            chrono::Utc::now().to_rfc3339()
        );
    }
}
