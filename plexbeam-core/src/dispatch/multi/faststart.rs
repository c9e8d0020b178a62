use std::path::Path;
use std::process::Stdio;

use tokio::process::Child;
use tracing::info;

use crate::error::Result;

/// Launch the real transcoder with the unmodified argv.
///
/// Its only purpose is to put the first media-server-visible segments on
/// disk within seconds so the session survives its startup timeout; the
/// distributed pipeline overwrites its output as chunks land. The child is
/// killed at successful completion (and by `kill_on_drop` otherwise).
pub fn spawn(real: &Path, args: &[String]) -> Result<Child> {
    info!(transcoder = %real.display(), "fast-start transcoder launched");
    let child = tokio::process::Command::new(real)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}
