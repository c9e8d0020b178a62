//! Single-worker dispatch: one job, streamed input if needed, a 250 ms poll
//! loop, and incremental segment aggregation into the output directory.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{error, info, warn};

use plexbeam_config::Config;
use plexbeam_contracts::prelude::*;

use crate::aggregate::manifest::ManifestGate;
use crate::aggregate::{download_job_segments, SegmentSink};
use crate::beam::{self, RemuxInterval, Upload};
use crate::client::PullProxyClient;
use crate::dispatch::{DispatchOutcome, MAX_POLLS, TICK};
use crate::error::Result;
use crate::events::EventLog;
use crate::invocation::ParsedInvocation;
use crate::pool::{Worker, WorkerTag};
use crate::progress::ProgressReporter;
use crate::session::Session;
use crate::CARTRIDGE_VERSION;

/// How often the poll loop emits progress and sweeps segments (every Nth
/// poll at 250 ms = 1 Hz).
const REPORT_EVERY: u32 = 4;

/// How the input reaches this worker.
#[derive(Debug)]
enum InputPlan {
    /// Worker reads the path from its own disk.
    Direct,
    /// Chunked remux upload to `/beam/stream/<job>`.
    BeamStream,
    /// Full file staged onto the worker before submission.
    Staged { stage_id: String },
    /// Staged through the S3 pull proxy; worker pulls `url`.
    PullProxy { url: String, object: String },
}

/// Resolve the input-handling row for this worker/input combination.
fn plan_input(worker: &Worker, invocation: &ParsedInvocation, config: &Config) -> InputPlan {
    match worker.tag {
        WorkerTag::Local => InputPlan::Direct,
        WorkerTag::Beam | WorkerTag::Remote
            if config.staged_upload && !invocation.input_is_url() =>
        {
            // Filled in by the caller before submission.
            InputPlan::Staged {
                stage_id: String::new(),
            }
        }
        WorkerTag::Beam => InputPlan::BeamStream,
        WorkerTag::Remote => {
            if invocation.input_path.starts_with("https://") && config.pull_proxy_url.is_some() {
                // Filled in by the caller once the proxy upload finishes.
                InputPlan::PullProxy {
                    url: String::new(),
                    object: String::new(),
                }
            } else {
                InputPlan::BeamStream
            }
        }
    }
}

pub struct SingleWorkerDispatcher<'a> {
    worker: &'a Worker,
    invocation: &'a ParsedInvocation,
    config: &'a Config,
    session: &'a Session,
    events: &'a EventLog,
    http: reqwest::Client,
}

impl std::fmt::Debug for SingleWorkerDispatcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleWorkerDispatcher")
            .field("worker", &self.worker.url().as_str())
            .finish_non_exhaustive()
    }
}

impl<'a> SingleWorkerDispatcher<'a> {
    pub fn new(
        worker: &'a Worker,
        invocation: &'a ParsedInvocation,
        config: &'a Config,
        session: &'a Session,
        events: &'a EventLog,
        http: reqwest::Client,
    ) -> Self {
        Self {
            worker,
            invocation,
            config,
            session,
            events,
            http,
        }
    }

    /// Build the job payload for this invocation.
    fn build_request(&self, job_id: &str, plan: &InputPlan) -> JobRequest {
        let (input, beam_stream, pull_url, staged_input) = match plan {
            InputPlan::Direct => (
                JobInput::file(self.invocation.input_path.clone()),
                false,
                None,
                None,
            ),
            InputPlan::BeamStream => (
                JobInput::stream(self.invocation.input_path.clone()),
                true,
                None,
                None,
            ),
            InputPlan::Staged { stage_id } => (
                JobInput::stream(self.invocation.input_path.clone()),
                false,
                None,
                Some(stage_id.clone()),
            ),
            InputPlan::PullProxy { url, .. } => (
                JobInput::stream(self.invocation.input_path.clone()),
                false,
                Some(url.clone()),
                None,
            ),
        };

        JobRequest {
            job_id: job_id.to_string(),
            input,
            output: JobOutput {
                kind: self.invocation.output_kind.as_str().to_string(),
                path: "dash".into(),
                segment_duration: self.invocation.segment_duration_sec,
            },
            arguments: JobArguments {
                video_codec: self
                    .invocation
                    .video_codec_out
                    .clone()
                    .unwrap_or_else(|| "h264".into()),
                audio_codec: self
                    .invocation
                    .audio_codec_out
                    .clone()
                    .unwrap_or_else(|| "aac".into()),
                video_bitrate: self.invocation.bitrate.clone(),
                resolution: self.invocation.resolution.clone(),
                seek: self.invocation.seek_sec,
                tone_mapping: self.invocation.tone_map,
                subtitle: SubtitleArgs {
                    mode: self.invocation.subtitle_mode.as_str().to_string(),
                },
                raw_args: self.invocation.worker_raw_args(),
            },
            source: match self.config.source {
                plexbeam_config::Source::Plex => MediaSource::Plex,
                plexbeam_config::Source::Jellyfin => MediaSource::Jellyfin,
            },
            beam_stream,
            pull_url,
            staged_input,
            callback_url: self.config.callback_url.clone(),
            metadata: JobMetadata {
                cartridge_version: CARTRIDGE_VERSION.into(),
                session_id: self.session.id().to_string(),
                split_info: None,
            },
        }
    }

    /// Run the dispatch to completion or failure. Every exit path cancels
    /// the upload, cancels the worker job, and removes staged objects.
    pub async fn run(&self) -> Result<DispatchOutcome> {
        let job_id = self.session.chunk_job_id(0);
        let mut plan = plan_input(self.worker, self.invocation, self.config);

        // Staging happens before submission so the job body can carry the
        // stage id or pull URL.
        if let InputPlan::Staged { .. } = plan {
            let stage_id = format!("{job_id}_stage");
            match beam::staged_upload(
                &self.worker.client,
                &stage_id,
                std::path::Path::new(&self.invocation.input_path),
            )
            .await
            {
                Ok(()) => plan = InputPlan::Staged { stage_id },
                Err(error) => {
                    warn!(%error, "staged upload failed, falling back to beam stream");
                    plan = InputPlan::BeamStream;
                }
            }
        }
        if let InputPlan::PullProxy { .. } = plan {
            let Some(proxy_url) = self.config.pull_proxy_url.clone() else {
                return Ok(DispatchOutcome::Unavailable);
            };
            let proxy = PullProxyClient::new(self.http.clone(), proxy_url);
            let object = format!("{job_id}.mkv");
            match beam::upload_via_pull_proxy(
                &proxy,
                &object,
                &self.config.ffmpeg_path,
                &self.invocation.input_path,
                RemuxInterval::whole(),
                self.config.upload_rate,
            )
            .await
            {
                Ok(url) => plan = InputPlan::PullProxy { url, object },
                Err(error) => {
                    error!(%error, "pull proxy staging failed");
                    self.events
                        .alert("staging_failed", &error.to_string());
                    return Ok(DispatchOutcome::Failed);
                }
            }
        }

        let request = self.build_request(&job_id, &plan);
        self.session
            .write_json(&self.session.layout().job_request_json(), &request)?;

        let response = match self.worker.client.submit(&request).await {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "job submission failed");
                self.events.alert("submit_failed", &error.to_string());
                self.cleanup(&job_id, None, &plan).await;
                return Ok(DispatchOutcome::Failed);
            }
        };
        self.session
            .write_json(&self.session.layout().job_response_json(), &response)?;

        if !response.status.is_accepted() {
            warn!(status = ?response.status, "worker did not accept job");
            self.cleanup(&job_id, None, &plan).await;
            return Ok(DispatchOutcome::Failed);
        }
        info!(job = %job_id, status = ?response.status, "job accepted");

        // Kick the upload off only after the worker knows the job id. With
        // `beam_direct` set and a plain file input, the raw bytes go up
        // as-is instead of through a remux child.
        let upload = match plan {
            InputPlan::BeamStream => {
                let started = if self.config.beam_direct && !self.invocation.input_is_url() {
                    beam::start_direct_upload(
                        self.worker.client.clone(),
                        job_id.clone(),
                        std::path::Path::new(&self.invocation.input_path),
                        self.config.upload_rate,
                    )
                } else {
                    beam::start_beam_upload(
                        self.worker.client.clone(),
                        job_id.clone(),
                        &self.config.ffmpeg_path,
                        &self.invocation.input_path,
                        RemuxInterval::whole(),
                        self.config.upload_rate,
                    )
                };
                match started {
                    Ok(upload) => Some(upload),
                    Err(error) => {
                        error!(%error, "beam upload failed to start");
                        self.cleanup(&job_id, None, &plan).await;
                        return Ok(DispatchOutcome::Failed);
                    }
                }
            }
            _ => None,
        };

        let outcome = self.poll_loop(&job_id).await;
        self.cleanup(&job_id, upload, &plan).await;
        outcome
    }

    async fn poll_loop(&self, job_id: &str) -> Result<DispatchOutcome> {
        let mut sink = SegmentSink::new(
            self.invocation.output_dir.clone(),
            self.invocation.skip_base(),
        );
        let mut gate = ManifestGate::new(
            self.http.clone(),
            self.invocation.manifest_callback_url.clone(),
            self.invocation.skip_to_segment,
        );
        let mut reporter = ProgressReporter::to_stderr(
            self.http.clone(),
            self.invocation.progress_url.clone(),
        );
        let stage = self.session.layout().chunk_stage_dir(0);
        let mut seen: HashSet<String> = HashSet::new();
        let mut manifest_name: Option<PathBuf> = None;
        let mut last_out_time_us: i64 = 0;

        for poll in 0..MAX_POLLS {
            tokio::time::sleep(TICK).await;

            let status = match self.worker.client.status(job_id).await {
                Ok(status) => status,
                Err(error) => {
                    // One failed health probe during dispatch means dead.
                    warn!(%error, "status poll failed, probing health");
                    if self.worker.client.health().await.is_err() {
                        self.events.alert("worker_dead", self.worker.url().as_str());
                        return Ok(DispatchOutcome::Failed);
                    }
                    continue;
                }
            };

            match status.status {
                JobState::Pending | JobState::Queued => continue,
                JobState::Running => {
                    if poll % REPORT_EVERY != 0 {
                        continue;
                    }
                    last_out_time_us = status.out_time_ms * 1000;
                    reporter
                        .emit(ProgressBody {
                            frame: status.frame,
                            fps: status.fps,
                            speed: status.speed,
                            out_time_us: last_out_time_us,
                        })
                        .await;
                    if let Err(error) = self
                        .sweep(job_id, &stage, &mut seen, &mut sink, &mut manifest_name)
                        .await
                    {
                        warn!(%error, "segment sweep failed");
                    }
                    if let Some(manifest) = &manifest_name {
                        let _ = gate.offer(manifest, sink.out_dir()).await;
                    }
                }
                JobState::Completed => {
                    if let Err(error) = self
                        .sweep(job_id, &stage, &mut seen, &mut sink, &mut manifest_name)
                        .await
                    {
                        warn!(%error, "final segment sweep failed");
                    }
                    if let Some(manifest) = &manifest_name {
                        let _ = gate.offer(manifest, sink.out_dir()).await;
                    }
                    reporter.emit_terminal(last_out_time_us).await;
                    self.session.write_json(
                        &self.session.layout().job_completed_json(),
                        &status,
                    )?;
                    info!(job = %job_id, "single-worker dispatch completed");
                    return Ok(DispatchOutcome::Completed);
                }
                JobState::Failed | JobState::Cancelled => {
                    let message = status.error.clone().unwrap_or_else(|| "unknown".into());
                    error!(job = %job_id, %message, "worker job failed");
                    self.events.alert("job_failed", &message);
                    self.session
                        .write_json(&self.session.layout().job_failed_json(), &status)?;
                    return Ok(DispatchOutcome::Failed);
                }
            }
        }

        warn!(job = %job_id, "poll cap reached");
        self.events.alert("poll_cap", job_id);
        Ok(DispatchOutcome::Failed)
    }

    /// One aggregation pass: pull fresh files into the stage dir and emit
    /// them under their renumbered names.
    async fn sweep(
        &self,
        job_id: &str,
        stage: &std::path::Path,
        seen: &mut HashSet<String>,
        sink: &mut SegmentSink,
        manifest_name: &mut Option<PathBuf>,
    ) -> Result<()> {
        let download =
            download_job_segments(&self.worker.client, job_id, stage, seen).await?;
        for (stream, name) in &download.inits {
            sink.emit_init(&stage.join(name), *stream).await?;
        }
        for segment in &download.media {
            sink.emit_media(&stage.join(&segment.name), segment.stream, segment.number)
                .await?;
        }
        if let Some(name) = &download.manifest {
            let dest = sink.out_dir().join(name);
            let src = stage.join(name);
            if src.exists() {
                tokio::fs::copy(&src, &dest).await?;
            }
            *manifest_name = Some(dest);
        }
        Ok(())
    }

    /// Best-effort teardown used on every exit path.
    async fn cleanup(&self, job_id: &str, upload: Option<Upload>, plan: &InputPlan) {
        if let Some(upload) = upload {
            if !upload.is_finished() {
                upload.abort();
            }
        }
        let _ = self.worker.client.cancel_job(job_id).await;
        match plan {
            InputPlan::Staged { stage_id } if !stage_id.is_empty() => {
                let _ = self.worker.client.delete_stage(stage_id).await;
            }
            InputPlan::PullProxy { object, .. } if !object.is_empty() => {
                if let Some(proxy_url) = self.config.pull_proxy_url.clone() {
                    let proxy = PullProxyClient::new(self.http.clone(), proxy_url);
                    let _ = proxy.delete(object).await;
                }
            }
            _ => {}
        }
    }
}
