//! Dispatch strategies: one worker, or many.

pub mod multi;
pub mod single;

use std::time::Duration;

/// Main-loop cadence shared by every dispatcher.
pub const TICK: Duration = Duration::from_millis(250);

/// Poll cap for the single-worker loop (~2 h at one poll per tick).
pub const MAX_POLLS: u32 = 28_800;

/// What a dispatch strategy produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A complete output was emitted; the cartridge exits 0.
    Completed,
    /// The strategy ran and gave up; the next strategy (or the local
    /// fallback) takes over.
    Failed,
    /// Preconditions were not met (no live workers, unknown duration);
    /// nothing was submitted anywhere.
    Unavailable,
}

/// Did a failed dispatch leave a playable partial stream behind?
///
/// A dispatch that already put an init segment and at least one media
/// segment into the output directory is reported as a success (exit 0):
/// the media server tolerates a short stream far better than a dead
/// transcoder, and a local fallback restarted on top of the partial output
/// would only corrupt it.
pub fn partial_output_salvageable(out_dir: &std::path::Path) -> bool {
    let (has_init, has_media) = crate::aggregate::output_has_init_and_media(out_dir);
    has_init && has_media
}

/// Ignore SIGPIPE for the rest of the process.
///
/// In BitTorrent-style dispatch the media server closing our stderr must not
/// kill the coordinator while remote chunks are still in flight; stderr
/// writes degrade to EPIPE errors the progress reporter already swallows.
#[cfg(unix)]
pub fn mask_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // Safety: SigIgn installs no Rust callback, so no reentrancy concerns.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

#[cfg(not(unix))]
pub fn mask_sigpipe() {}
