//! Mode B: calibrate every worker on a 15-second probe, then hand each one
//! a single proportional slice of the timeline.
//!
//! There is no reassignment in this mode; a failed slice fails the whole
//! dispatch and the caller moves on to the next strategy.

use futures::future::join_all;
use tracing::{info, warn};

use plexbeam_contracts::prelude::*;

use crate::beam::{self, RemuxInterval};
use crate::dispatch::multi::chunks::{proportional_spans, Chunk, ChunkState};
use crate::dispatch::multi::runtime::MultiRuntime;
use crate::dispatch::{DispatchOutcome, TICK};
use crate::error::Result;

/// Calibration probe length and fallback rate.
const CALIBRATION_SECS: f64 = 15.0;
const CALIBRATION_DEFAULT_FPS: u32 = 30;
/// Give a probe up to 60 s of polling before falling back.
const CALIBRATION_MAX_POLLS: u32 = 240;

/// Per-slice floor so a slow worker still gets a meaningful span.
const SPAN_FLOOR_SECS: f64 = 30.0;

const MAX_TICKS: u64 = 28_800;

pub async fn run(
    runtime: &mut MultiRuntime<'_>,
    total_duration: f64,
) -> Result<DispatchOutcome> {
    runtime
        .events
        .info("dispatch_start", &format!("mode=B workers={}", runtime.workers.len()));

    let weights = calibrate_all(runtime).await;
    info!(?weights, "calibration complete");
    runtime.events.info(
        "calibrated_all",
        &weights
            .iter()
            .enumerate()
            .map(|(i, fps)| format!("w{i}={fps}"))
            .collect::<Vec<_>>()
            .join(" "),
    );

    let spans = proportional_spans(
        &weights,
        total_duration,
        runtime.invocation.seek_sec,
        SPAN_FLOOR_SECS,
    );
    if spans.len() < 2 {
        // Not enough timeline to split; the single-worker path serves this
        // better.
        return Ok(DispatchOutcome::Unavailable);
    }
    runtime.chunks = spans
        .iter()
        .enumerate()
        .map(|(index, &(ss, t))| Chunk::new(index, ss, t))
        .collect();

    for index in 0..runtime.chunks.len() {
        let job_id = runtime.session.split_job_id(index);
        if !runtime.assign_chunk_as(index, index, job_id).await {
            warn!(worker = index, "big-split submission failed");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Failed);
        }
    }

    let mut ticks: u64 = 0;
    loop {
        tokio::time::sleep(TICK).await;
        ticks += 1;

        runtime.poll_busy_workers(false).await;
        runtime.pump_emission().await?;

        if ticks % 4 == 0 {
            runtime.emit_progress().await;
        }

        if runtime.all_completed() {
            runtime.reporter.emit_terminal(0).await;
            runtime.events.info("dispatch_done", "mode=B");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Completed);
        }
        // Any slice falling back to pending means its worker failed it.
        if runtime
            .chunks
            .iter()
            .any(|chunk| chunk.state == ChunkState::Pending)
        {
            warn!("big-split slice failed, aborting mode B");
            runtime.events.alert("fail_fast", "mode=B slice failed");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Failed);
        }
        if ticks >= MAX_TICKS {
            runtime.events.alert("poll_cap", "mode=B");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Failed);
        }
    }
}

/// Run one 15-second probe per worker, concurrently, and record each
/// worker's first observed non-zero fps (default 30).
async fn calibrate_all(runtime: &mut MultiRuntime<'_>) -> Vec<u32> {
    let probes: Vec<_> = (0..runtime.workers.len())
        .map(|worker_index| {
            let job_id = runtime.session.calibration_job_id(worker_index);
            let beam_stream = runtime.workers[worker_index].needs_beam();
            let request =
                runtime.build_window_request(&job_id, worker_index, beam_stream, 0.0, CALIBRATION_SECS);
            let client = runtime.workers[worker_index].worker.client.clone();
            let ffmpeg = runtime.config.ffmpeg_path.clone();
            let input = runtime.invocation.input_path.clone();
            let rate = runtime.config.upload_rate;
            (worker_index, job_id, request, client, beam_stream, ffmpeg, input, rate)
        })
        .collect();

    let futures = probes.into_iter().map(
        |(worker_index, job_id, request, client, beam_stream, ffmpeg, input, rate)| async move {
            match client.submit(&request).await {
                Ok(response) if response.status.is_accepted() => {}
                _ => {
                    warn!(worker = worker_index, "calibration submission failed");
                    return (worker_index, CALIBRATION_DEFAULT_FPS);
                }
            }

            let upload = if beam_stream {
                beam::start_beam_upload(
                    client.clone(),
                    job_id.clone(),
                    &ffmpeg,
                    &input,
                    RemuxInterval::window(0.0, CALIBRATION_SECS),
                    rate,
                )
                .ok()
            } else {
                None
            };

            let mut fps = 0u32;
            for _ in 0..CALIBRATION_MAX_POLLS {
                tokio::time::sleep(TICK).await;
                let Ok(status) = client.status(&job_id).await else {
                    continue;
                };
                if status.fps > 0.0 {
                    fps = status.fps.round() as u32;
                }
                match status.status {
                    JobState::Completed | JobState::Failed | JobState::Cancelled => break,
                    _ if fps > 0 => break,
                    _ => {}
                }
            }

            if let Some(upload) = upload {
                if !upload.is_finished() {
                    upload.abort();
                }
            }
            let _ = client.cancel_job(&job_id).await;

            if fps == 0 {
                fps = CALIBRATION_DEFAULT_FPS;
            }
            (worker_index, fps)
        },
    );

    let mut weights = vec![CALIBRATION_DEFAULT_FPS; runtime.workers.len()];
    for (worker_index, fps) in join_all(futures).await {
        weights[worker_index] = fps;
        runtime.workers[worker_index].calibrated_fps = Some(fps);
    }
    weights
}
