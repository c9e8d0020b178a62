//! Progressive chunk-0 download.
//!
//! A dedicated background loop that starts copying chunk 0's segments into
//! the output directory (skip-base offset applied) while the chunk is still
//! encoding, and POSTs the offset-rewritten manifest as soon as an init
//! segment and one media segment exist locally. It is the second safety net
//! for the player's startup window, alongside the fast-start child.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use plexbeam_contracts::prelude::JobState;

use crate::aggregate::manifest::ManifestGate;
use crate::aggregate::{download_job_segments, SegmentSink};
use crate::client::WorkerClient;

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct ProgressiveChunk0 {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl ProgressiveChunk0 {
    /// Signal the loop to finish and drop it.
    pub fn stop(self) {
        let _ = self.stop.send(true);
        self.handle.abort();
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    client: WorkerClient,
    job_id: String,
    stage: PathBuf,
    out_dir: PathBuf,
    skip_to_segment: u64,
    manifest_callback_url: Option<String>,
    http: reqwest::Client,
) -> ProgressiveChunk0 {
    let (stop, mut stopped) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let skip_base = skip_to_segment.saturating_sub(1);
        let mut sink = SegmentSink::new(out_dir, skip_base);
        let mut gate = ManifestGate::new(http, manifest_callback_url, skip_to_segment);
        let mut seen: HashSet<String> = HashSet::new();
        let mut manifest_path: Option<PathBuf> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                _ = stopped.changed() => {
                    if *stopped.borrow() {
                        return;
                    }
                }
            }

            let done = match client.status(&job_id).await {
                Ok(status) => matches!(
                    status.status,
                    JobState::Completed | JobState::Failed | JobState::Cancelled
                ),
                Err(error) => {
                    debug!(%error, "progressive status poll failed");
                    false
                }
            };

            match download_job_segments(&client, &job_id, &stage, &mut seen).await {
                Ok(download) => {
                    for (stream, name) in &download.inits {
                        if let Err(error) = sink.emit_init(&stage.join(name), *stream).await {
                            warn!(%error, "progressive init emit failed");
                        }
                    }
                    for segment in &download.media {
                        if let Err(error) = sink
                            .emit_media(&stage.join(&segment.name), segment.stream, segment.number)
                            .await
                        {
                            warn!(%error, "progressive media emit failed");
                        }
                    }
                    if let Some(name) = &download.manifest {
                        let src = stage.join(name);
                        let dest = sink.out_dir().join(name);
                        if src.exists() {
                            let _ = tokio::fs::copy(&src, &dest).await;
                        }
                        manifest_path = Some(dest);
                    }
                    if let Some(manifest) = &manifest_path {
                        let _ = gate.offer(manifest, sink.out_dir()).await;
                    }
                }
                Err(error) => debug!(%error, "progressive sweep failed"),
            }

            if done {
                debug!("progressive chunk-0 loop finished");
                return;
            }
        }
    });

    ProgressiveChunk0 { handle, stop }
}
