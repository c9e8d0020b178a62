use std::path::Path;
use std::process::Stdio;

use tracing::info;

use crate::error::Result;

/// Run the real transcoder locally with the given argv, stdio inherited so
/// the media server sees its genuine progress output.
///
/// Returns the child's exit code; a signal death maps to 1 so the cartridge
/// always has a concrete code for `master.log`.
pub async fn run_local_transcoder(real: &Path, args: &[String]) -> Result<i32> {
    info!(transcoder = %real.display(), argc = args.len(), "running local transcoder");
    let status = tokio::process::Command::new(real)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await?;
    Ok(status.code().unwrap_or(1))
}
