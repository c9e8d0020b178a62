//! # plexbeam cartridge
//!
//! The binary a media server invokes believing it is its transcoder. One
//! invocation, one dispatch: parse the argv, try the remote worker pool
//! (multi-worker first, then single), and fall back to running the encode
//! on the local GPU or the real transcoder when no remote capacity answers.
//!
//! Exit code policy: 0 when any dispatch strategy emitted a complete
//! output, the local child's exit code when the fallback ran, 1 on a
//! configured-no-fallback failure.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};

use plexbeam_config::{Config, StateLayout};
use plexbeam_core::client::build_http_client;
use plexbeam_core::dispatch::{
    multi, partial_output_salvageable, single::SingleWorkerDispatcher, DispatchOutcome,
};
use plexbeam_core::events::EventLog;
use plexbeam_core::invocation::ParsedInvocation;
use plexbeam_core::local::{gpu, rewrite_for_gpu, run::run_local_transcoder, selfheal};
use plexbeam_core::pool::{parse_pool_spec, probe_pool, PoolEntry, WorkerTag};
use plexbeam_core::session::{init_tracing, Session};

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("plexbeam: runtime init failed: {error}");
            std::process::exit(1);
        }
    };
    let code = match runtime.block_on(run()) {
        Ok(code) => code,
        Err(error) => {
            // Single-line surface for config/argument errors; details are in
            // the session log when one exists.
            eprintln!("plexbeam: {error}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let config = plexbeam_config::load().context("configuration")?;
    let state = StateLayout::new(&config.state_dir);
    let session = Session::create(&state).context("session directory")?;
    let _ = init_tracing(&session, config.log_filter.as_deref());
    let events = EventLog::new(&state, session.id());

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cwd = std::env::current_dir().context("working directory")?;
    info!(argc = argv.len(), cwd = %cwd.display(), "cartridge invoked");

    // Guard the interception point before anything else on Plex; a host
    // upgrade may have replaced the install dir underneath us.
    let intercepted = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("plexbeam"));
    let real_transcoder = match selfheal::resolve_real_transcoder(
        config.real_transcoder.as_deref(),
        &intercepted,
        config.source,
        &events,
    ) {
        Ok(path) => {
            selfheal::check_fingerprint(&path, &state, &events);
            Some(path)
        }
        Err(error) => {
            warn!(%error, "no local transcoder available");
            None
        }
    };

    let invocation = match ParsedInvocation::parse(&argv, &cwd) {
        Ok(invocation) => invocation,
        Err(error) => {
            events.alert("bad_argv", &error.to_string());
            events.log_session_exit("none", 1);
            anyhow::bail!("cannot parse transcoder argv: {error}");
        }
    };
    info!(
        input = %invocation.input_path,
        output = %invocation.output_target.display(),
        kind = invocation.output_kind.as_str(),
        "invocation parsed"
    );

    let http = build_http_client();
    let workers = probe_configured_workers(&config, &http, &events).await?;
    info!(live = workers.len(), "worker pool probed");

    if workers.len() >= 2 {
        match multi::run(
            &invocation,
            &config,
            &session,
            &events,
            http.clone(),
            workers.clone(),
            real_transcoder.as_deref(),
        )
        .await
        {
            Ok(DispatchOutcome::Completed) => {
                events.log_session_exit("multi", 0);
                return Ok(0);
            }
            Ok(outcome) => info!(?outcome, "multi-worker dispatch did not complete"),
            Err(error) => warn!(%error, "multi-worker dispatch errored"),
        }
    }

    if let Some(worker) = workers.first() {
        let dispatcher =
            SingleWorkerDispatcher::new(worker, &invocation, &config, &session, &events, http);
        match dispatcher.run().await {
            Ok(DispatchOutcome::Completed) => {
                events.log_session_exit("single", 0);
                return Ok(0);
            }
            Ok(outcome) => info!(?outcome, "single-worker dispatch did not complete"),
            Err(error) => warn!(%error, "single-worker dispatch errored"),
        }
    }

    // A dispatch that failed after emitting segments still gave the player
    // a stream; report success rather than restarting on top of it.
    if partial_output_salvageable(&invocation.output_dir) {
        info!("partial output already emitted, reporting success");
        events.info("partial_success", "segments emitted before abort");
        events.log_session_exit("partial", 0);
        return Ok(0);
    }

    // Local fallback. A GPU plus a software encoder in the argv gets the
    // rewritten pipeline on the system FFmpeg; anything else replays the
    // verbatim argv through the real transcoder.
    let code = if let Some(kind) = gpu::detect() {
        if gpu::uses_software_encoder(&invocation.raw_args) {
            let rewritten = rewrite_for_gpu(&invocation.raw_args, kind);
            info!(gpu = kind.as_str(), "running GPU-rewritten local encode");
            events.info("local_fallback", &format!("gpu={}", kind.as_str()));
            run_local_transcoder(&config.ffmpeg_path, &rewritten).await?
        } else {
            run_real_or_fail(real_transcoder, &argv, &events).await?
        }
    } else {
        run_real_or_fail(real_transcoder, &argv, &events).await?
    };

    events.log_session_exit("local", code);
    Ok(code)
}

async fn run_real_or_fail(
    real_transcoder: Option<PathBuf>,
    argv: &[String],
    events: &EventLog,
) -> anyhow::Result<i32> {
    match real_transcoder {
        Some(real) => {
            events.info("local_fallback", "passthrough");
            Ok(run_local_transcoder(&real, argv).await?)
        }
        None => {
            events.alert("no_fallback", "no workers and no local transcoder");
            events.log_session_exit("none", 1);
            anyhow::bail!("no remote workers responded and no local transcoder was found");
        }
    }
}

/// Parse the pool spec plus the optional single-worker URL, then probe.
async fn probe_configured_workers(
    config: &Config,
    http: &reqwest::Client,
    events: &EventLog,
) -> anyhow::Result<Vec<plexbeam_core::pool::Worker>> {
    let mut entries: Vec<PoolEntry> = Vec::new();
    if let Some(pool_spec) = &config.worker_pool {
        match parse_pool_spec(pool_spec) {
            Ok(parsed) => entries.extend(parsed),
            Err(error) => {
                events.alert("bad_pool_spec", &error.to_string());
                events.log_session_exit("none", 1);
                anyhow::bail!("worker pool spec: {error}");
            }
        }
    }
    if let Some(url) = &config.remote_worker_url {
        if entries.iter().all(|entry| &entry.url != url) {
            entries.push(PoolEntry {
                url: url.clone(),
                tag: WorkerTag::Remote,
            });
        }
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    Ok(probe_pool(entries.as_slice(), http, config.api_key.as_deref()).await)
}
