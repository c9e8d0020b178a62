use std::path::Path;

use tokio::process::Command;

use crate::error::{BeamError, Result};

/// Ask the local `ffprobe` for the container duration in seconds.
///
/// Used when no `@local` worker can answer `GET /probe` for us; the
/// multi-worker timeline split cannot run without a duration.
pub async fn container_duration_seconds(ffprobe: &Path, input: &str) -> Result<f64> {
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=nw=1:nk=1")
        .arg(input)
        .output()
        .await?;

    if !output.status.success() {
        return Err(BeamError::Protocol(format!(
            "ffprobe failed for {input}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap_or_default().trim();
    first.parse::<f64>().map_err(|_| {
        BeamError::Protocol(format!("unparseable ffprobe duration '{first}' for {input}"))
    })
}
