//! Multi-worker dispatch: strategy selection and shared preconditions.

pub mod bigsplit;
pub mod chunk0;
pub mod chunks;
pub mod faststart;
pub mod runtime;
pub mod simple;
pub mod torrent;

use std::path::Path;

use tracing::{info, warn};

use plexbeam_config::{Config, MultiMode};

use crate::dispatch::DispatchOutcome;
use crate::error::Result;
use crate::events::EventLog;
use crate::invocation::ParsedInvocation;
use crate::pool::{ffprobe, Worker, WorkerTag};
use crate::session::Session;

use self::chunks::plan_chunks;
use self::runtime::MultiRuntime;

/// Run the configured multi-worker strategy.
///
/// Returns `Unavailable` without submitting anything when fewer than two
/// workers are live, the input duration cannot be discovered, or the
/// timeline is too short to split.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    invocation: &ParsedInvocation,
    config: &Config,
    session: &Session,
    events: &EventLog,
    http: reqwest::Client,
    workers: Vec<Worker>,
    real_transcoder: Option<&Path>,
) -> Result<DispatchOutcome> {
    if workers.len() < 2 {
        return Ok(DispatchOutcome::Unavailable);
    }

    let Some(duration) = discover_duration(&workers, invocation, config).await else {
        warn!("input duration unknown, skipping multi-worker dispatch");
        events.info("multi_skipped", "no duration");
        return Ok(DispatchOutcome::Unavailable);
    };
    info!(duration, seek = invocation.seek_sec, "input duration discovered");

    match config.multi_mode {
        MultiMode::Simple | MultiMode::Torrent => {
            let chunk_plan = plan_chunks(duration, invocation.seek_sec, config.chunk_duration_secs);
            if chunk_plan.len() <= 1 {
                // One chunk is just single-worker dispatch with extra steps.
                events.info("multi_skipped", "timeline too short to split");
                return Ok(DispatchOutcome::Unavailable);
            }
            let mut runtime = MultiRuntime::new(
                invocation, config, session, events, http, workers, chunk_plan,
            );
            match config.multi_mode {
                MultiMode::Simple => simple::run(&mut runtime).await,
                _ => torrent::run(&mut runtime, real_transcoder).await,
            }
        }
        MultiMode::BigSplit => {
            let mut runtime = MultiRuntime::new(
                invocation,
                config,
                session,
                events,
                http,
                workers,
                Vec::new(),
            );
            bigsplit::run(&mut runtime, duration).await
        }
    }
}

/// Input duration: ask an `@local` worker's probe endpoint first, fall back
/// to the local ffprobe.
async fn discover_duration(
    workers: &[Worker],
    invocation: &ParsedInvocation,
    config: &Config,
) -> Option<f64> {
    for worker in workers
        .iter()
        .filter(|worker| worker.tag == WorkerTag::Local)
    {
        match worker.client.probe_duration(&invocation.input_path).await {
            Ok(duration) if duration > 0.0 => return Some(duration),
            Ok(_) => {}
            Err(error) => {
                warn!(worker = %worker.url(), %error, "worker probe failed");
            }
        }
    }

    match ffprobe::container_duration_seconds(&config.ffprobe_path, &invocation.input_path).await
    {
        Ok(duration) if duration > 0.0 => Some(duration),
        Ok(_) => None,
        Err(error) => {
            warn!(%error, "local ffprobe failed");
            None
        }
    }
}
