//! Shared machinery for the multi-worker strategies.
//!
//! One `MultiRuntime` owns the chunk table, the worker slots, the segment
//! sink, and every background task a strategy spawns. The strategies differ
//! only in *assignment policy*; submission, polling, downloading, in-order
//! emission, progress, and teardown all live here.
//!
//! State discipline: only the main-loop tick mutates chunks and worker
//! slots. Background downloads communicate completion exclusively through
//! sentinel files in the chunk's staging directory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use plexbeam_config::Config;
use plexbeam_contracts::prelude::*;

use crate::aggregate::manifest::ManifestGate;
use crate::aggregate::{
    download_job_segments, read_done_sentinel, scan_stage_dir, write_done_sentinel, SegmentSink,
};
use crate::beam::{self, RemuxInterval, Upload};
use crate::client::WorkerClient;
use crate::dispatch::multi::chunks::{Chunk, ChunkState};
use crate::error::Result;
use crate::events::EventLog;
use crate::invocation::ParsedInvocation;
use crate::pool::{Worker, WorkerTag};
use crate::progress::{approx_out_time_us, ProgressReporter};
use crate::session::Session;
use crate::CARTRIDGE_VERSION;

/// Marker a failed background download leaves for the tick to find.
const DOWNLOAD_FAILED_MARKER: &str = ".download_failed";

/// Nominal frame rate used only for the forged frame counter.
const NOMINAL_FPS: f64 = 24.0;

/// An upload racing ahead of its chunk's assignment.
#[derive(Debug)]
pub struct Prefetch {
    pub chunk: usize,
    pub job_id: String,
    pub upload: Upload,
}

/// The job a worker is currently encoding.
#[derive(Debug)]
pub struct RunningJob {
    pub chunk: usize,
    pub job_id: String,
    pub upload: Option<Upload>,
}

/// Mutable per-worker dispatch state layered over the probed [`Worker`].
#[derive(Debug)]
pub struct WorkerSlot {
    pub worker: Worker,
    pub alive: bool,
    pub current: Option<RunningJob>,
    pub calibrated_fps: Option<u32>,
    pub queue: VecDeque<usize>,
    pub prefetch: Option<Prefetch>,
    pub last_fps: f64,
    pub last_speed: f64,
}

impl WorkerSlot {
    pub fn new(worker: Worker) -> Self {
        Self {
            worker,
            alive: true,
            current: None,
            calibrated_fps: None,
            queue: VecDeque::new(),
            prefetch: None,
            last_fps: 0.0,
            last_speed: 0.0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.alive && self.current.is_none()
    }

    pub fn needs_beam(&self) -> bool {
        !matches!(self.worker.tag, WorkerTag::Local)
    }
}

pub struct MultiRuntime<'a> {
    pub invocation: &'a ParsedInvocation,
    pub config: &'a Config,
    pub session: &'a Session,
    pub events: &'a EventLog,
    pub http: reqwest::Client,
    pub workers: Vec<WorkerSlot>,
    pub chunks: Vec<Chunk>,
    pub sink: SegmentSink,
    pub gate: ManifestGate,
    pub reporter: ProgressReporter,
    downloads: HashMap<usize, JoinHandle<()>>,
    pub next_processable: usize,
    pub failures: u32,
    tracked: Vec<(usize, String)>,
    manifest_path: Option<PathBuf>,
}

impl std::fmt::Debug for MultiRuntime<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiRuntime")
            .field("workers", &self.workers.len())
            .field("chunks", &self.chunks.len())
            .field("next_processable", &self.next_processable)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl<'a> MultiRuntime<'a> {
    pub fn new(
        invocation: &'a ParsedInvocation,
        config: &'a Config,
        session: &'a Session,
        events: &'a EventLog,
        http: reqwest::Client,
        workers: Vec<Worker>,
        chunks: Vec<Chunk>,
    ) -> Self {
        let sink = SegmentSink::new(invocation.output_dir.clone(), invocation.skip_base());
        let gate = ManifestGate::new(
            http.clone(),
            invocation.manifest_callback_url.clone(),
            invocation.skip_to_segment,
        );
        let reporter = ProgressReporter::to_stderr(http.clone(), invocation.progress_url.clone());
        Self {
            invocation,
            config,
            session,
            events,
            http,
            workers: workers.into_iter().map(WorkerSlot::new).collect(),
            chunks,
            sink,
            gate,
            reporter,
            downloads: HashMap::new(),
            next_processable: 0,
            failures: 0,
            tracked: Vec::new(),
            manifest_path: None,
        }
    }

    /// Fail-fast threshold: `2 * n_chunks` cumulative chunk failures.
    pub fn failure_limit(&self) -> u32 {
        2 * self.chunks.len() as u32
    }

    pub fn over_failure_limit(&self) -> bool {
        self.failures >= self.failure_limit()
    }

    pub fn all_completed(&self) -> bool {
        self.chunks
            .iter()
            .all(|chunk| chunk.state == ChunkState::Completed)
    }

    pub fn pending_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Pending)
            .map(|c| c.index)
            .collect()
    }

    pub fn all_calibrated(&self) -> bool {
        self.workers
            .iter()
            .filter(|w| w.alive)
            .all(|w| w.calibrated_fps.is_some())
    }

    /// Build the job payload for one chunk on one worker.
    pub fn build_chunk_request(
        &self,
        chunk_index: usize,
        job_id: &str,
        worker_index: usize,
        beam_stream: bool,
    ) -> JobRequest {
        let chunk = &self.chunks[chunk_index];
        self.build_window_request(job_id, worker_index, beam_stream, chunk.ss, chunk.t)
    }

    /// Build a job payload for an arbitrary `[ss, ss+t)` window; calibration
    /// probes use this before any chunk exists.
    pub fn build_window_request(
        &self,
        job_id: &str,
        worker_index: usize,
        beam_stream: bool,
        ss: f64,
        t: f64,
    ) -> JobRequest {
        let invocation = self.invocation;
        JobRequest {
            job_id: job_id.to_string(),
            input: if beam_stream {
                JobInput::stream(invocation.input_path.clone())
            } else {
                JobInput::file(invocation.input_path.clone())
            },
            output: JobOutput {
                kind: invocation.output_kind.as_str().to_string(),
                path: "dash".into(),
                segment_duration: invocation.segment_duration_sec,
            },
            arguments: JobArguments {
                video_codec: invocation
                    .video_codec_out
                    .clone()
                    .unwrap_or_else(|| "h264".into()),
                audio_codec: invocation
                    .audio_codec_out
                    .clone()
                    .unwrap_or_else(|| "aac".into()),
                video_bitrate: invocation.bitrate.clone(),
                resolution: invocation.resolution.clone(),
                seek: ss,
                tone_mapping: invocation.tone_map,
                subtitle: SubtitleArgs {
                    mode: invocation.subtitle_mode.as_str().to_string(),
                },
                raw_args: invocation.worker_raw_args(),
            },
            source: match self.config.source {
                plexbeam_config::Source::Plex => MediaSource::Plex,
                plexbeam_config::Source::Jellyfin => MediaSource::Jellyfin,
            },
            beam_stream,
            pull_url: None,
            staged_input: None,
            callback_url: self.config.callback_url.clone(),
            metadata: JobMetadata {
                cartridge_version: CARTRIDGE_VERSION.into(),
                session_id: self.session.id().to_string(),
                split_info: Some(SplitInfo {
                    worker_index,
                    worker_count: self.workers.len(),
                    ss,
                    t,
                }),
            },
        }
    }

    /// Submit a chunk to a worker and start its interval upload.
    ///
    /// Returns false on any failure; the chunk is already back in `Pending`
    /// and the failure counted by then.
    pub async fn assign_chunk(&mut self, worker_index: usize, chunk_index: usize) -> bool {
        let job_id = self.session.chunk_job_id(chunk_index);
        self.assign_chunk_as(worker_index, chunk_index, job_id).await
    }

    /// Like [`Self::assign_chunk`] but with an explicit job id (big-split
    /// `_w<i>` jobs, endgame duplicates).
    pub async fn assign_chunk_as(
        &mut self,
        worker_index: usize,
        chunk_index: usize,
        job_id: String,
    ) -> bool {
        let beam_stream = self.workers[worker_index].needs_beam();
        let request = self.build_chunk_request(chunk_index, &job_id, worker_index, beam_stream);

        let client = self.workers[worker_index].worker.client.clone();
        match client.submit(&request).await {
            Ok(response) if response.status.is_accepted() => {}
            Ok(response) => {
                warn!(job = %job_id, status = ?response.status, "chunk submission rejected");
                self.count_chunk_failure(chunk_index);
                return false;
            }
            Err(error) => {
                warn!(job = %job_id, %error, "chunk submission failed");
                self.mark_worker_dead_if_unreachable(worker_index).await;
                self.count_chunk_failure(chunk_index);
                return false;
            }
        }

        let upload = if beam_stream {
            let chunk = &self.chunks[chunk_index];
            match beam::start_beam_upload(
                client,
                job_id.clone(),
                &self.config.ffmpeg_path,
                &self.invocation.input_path,
                RemuxInterval::window(chunk.ss, chunk.t),
                self.config.upload_rate,
            ) {
                Ok(upload) => Some(upload),
                Err(error) => {
                    error!(job = %job_id, %error, "interval upload failed to start");
                    self.count_chunk_failure(chunk_index);
                    return false;
                }
            }
        } else {
            None
        };

        self.activate(worker_index, chunk_index, job_id, upload);
        true
    }

    /// Race an endgame duplicate of an in-flight chunk on an idle worker.
    ///
    /// Unlike [`Self::assign_chunk_as`], this leaves the primary assignment
    /// untouched; the chunk record only learns the duplicate's identity so
    /// first-completion adjudication can cancel the loser.
    pub async fn assign_duplicate(&mut self, worker_index: usize, chunk_index: usize) -> bool {
        let job_id = self.session.duplicate_job_id(chunk_index);
        let beam_stream = self.workers[worker_index].needs_beam();
        let request = self.build_chunk_request(chunk_index, &job_id, worker_index, beam_stream);

        let client = self.workers[worker_index].worker.client.clone();
        match client.submit(&request).await {
            Ok(response) if response.status.is_accepted() => {}
            _ => {
                debug!(chunk = chunk_index, "endgame duplicate submission failed");
                return false;
            }
        }

        let upload = if beam_stream {
            let chunk = &self.chunks[chunk_index];
            match beam::start_beam_upload(
                client,
                job_id.clone(),
                &self.config.ffmpeg_path,
                &self.invocation.input_path,
                RemuxInterval::window(chunk.ss, chunk.t),
                self.config.upload_rate,
            ) {
                Ok(upload) => Some(upload),
                Err(error) => {
                    debug!(chunk = chunk_index, %error, "duplicate upload failed to start");
                    return false;
                }
            }
        } else {
            None
        };

        let chunk = &mut self.chunks[chunk_index];
        chunk.endgame_duped = true;
        chunk.duplicate = Some((worker_index, job_id.clone()));
        self.tracked.push((worker_index, job_id.clone()));
        self.workers[worker_index].current = Some(RunningJob {
            chunk: chunk_index,
            job_id: job_id.clone(),
            upload,
        });
        info!(worker = worker_index, chunk = chunk_index, job = %job_id, "endgame duplicate racing");
        self.events
            .info("endgame", &format!("chunk={chunk_index} dup_worker={worker_index}"));
        true
    }

    /// Promote a prefetched upload into the worker's current job.
    pub fn promote_prefetch(&mut self, worker_index: usize) -> Option<usize> {
        let prefetch = self.workers[worker_index].prefetch.take()?;
        if self.chunks[prefetch.chunk].state != ChunkState::Pending {
            // Someone else took the chunk while the upload was in flight.
            prefetch.upload.abort();
            return None;
        }
        let chunk_index = prefetch.chunk;
        debug!(worker = worker_index, chunk = chunk_index, "promoting prefetch");
        self.workers[worker_index]
            .queue
            .retain(|&queued| queued != chunk_index);
        self.activate(
            worker_index,
            chunk_index,
            prefetch.job_id,
            Some(prefetch.upload),
        );
        Some(chunk_index)
    }

    fn activate(
        &mut self,
        worker_index: usize,
        chunk_index: usize,
        job_id: String,
        upload: Option<Upload>,
    ) {
        let chunk = &mut self.chunks[chunk_index];
        chunk.state = ChunkState::Encoding;
        chunk.worker = Some(worker_index);
        chunk.job_id = Some(job_id.clone());
        chunk.started = Some(Instant::now());
        self.tracked.push((worker_index, job_id.clone()));
        self.workers[worker_index].current = Some(RunningJob {
            chunk: chunk_index,
            job_id,
            upload,
        });
        info!(worker = worker_index, chunk = chunk_index, "chunk encoding");
    }

    fn count_chunk_failure(&mut self, chunk_index: usize) {
        let chunk = &mut self.chunks[chunk_index];
        chunk.state = ChunkState::Pending;
        chunk.worker = None;
        chunk.job_id = None;
        self.failures += 1;
        self.events.info(
            "chunk_failure",
            &format!("chunk={chunk_index} failures={}", self.failures),
        );
    }

    async fn mark_worker_dead_if_unreachable(&mut self, worker_index: usize) {
        if self.workers[worker_index].worker.client.health().await.is_ok() {
            return;
        }
        self.mark_worker_dead(worker_index);
    }

    /// Worker death: current chunk back to pending, prefetch cancelled, own
    /// queue left alone so stealing drains it.
    pub fn mark_worker_dead(&mut self, worker_index: usize) {
        let slot = &mut self.workers[worker_index];
        if !slot.alive {
            return;
        }
        slot.alive = false;
        warn!(worker = worker_index, url = %slot.worker.url(), "worker died");
        self.events
            .alert("worker_dead", self.workers[worker_index].worker.url().as_str());

        if let Some(running) = self.workers[worker_index].current.take() {
            if let Some(upload) = running.upload {
                upload.abort();
            }
            if self.chunks[running.chunk].state == ChunkState::Encoding {
                let chunk = &mut self.chunks[running.chunk];
                chunk.state = ChunkState::Pending;
                chunk.worker = None;
                chunk.job_id = None;
            }
        }
        if let Some(prefetch) = self.workers[worker_index].prefetch.take() {
            prefetch.upload.abort();
        }
    }

    /// Poll every busy worker's job once. Calibration (mode C) reads the
    /// fps a worker reports on its first completed chunk.
    pub async fn poll_busy_workers(&mut self, calibrate: bool) {
        for worker_index in 0..self.workers.len() {
            let Some((chunk_index, job_id)) = self.workers[worker_index]
                .current
                .as_ref()
                .map(|r| (r.chunk, r.job_id.clone()))
            else {
                continue;
            };

            let status = match self.workers[worker_index].worker.client.status(&job_id).await {
                Ok(status) => status,
                Err(error) => {
                    debug!(worker = worker_index, %error, "status poll failed");
                    self.mark_worker_dead_if_unreachable(worker_index).await;
                    continue;
                }
            };

            match status.status {
                JobState::Pending | JobState::Queued => {}
                JobState::Running => {
                    let slot = &mut self.workers[worker_index];
                    if status.fps > 0.0 {
                        slot.last_fps = status.fps;
                    }
                    if status.speed > 0.0 {
                        slot.last_speed = status.speed;
                    }
                }
                JobState::Completed => {
                    if calibrate && self.workers[worker_index].calibrated_fps.is_none() {
                        let fps = self.workers[worker_index].last_fps.max(status.fps);
                        // 0 fps degrades to 1 so weighting never divides by
                        // zero.
                        let fps = (fps.round() as u32).max(1);
                        self.workers[worker_index].calibrated_fps = Some(fps);
                        info!(worker = worker_index, fps, "worker calibrated");
                        self.events
                            .info("calibrated", &format!("worker={worker_index} fps={fps}"));
                    }
                    self.handle_completion(worker_index, chunk_index).await;
                }
                JobState::Failed | JobState::Cancelled => {
                    let message = status.error.unwrap_or_else(|| "unknown".into());
                    warn!(worker = worker_index, chunk = chunk_index, %message, "chunk job failed");
                    self.release_worker(worker_index);
                    // A dead duplicate leaves the primary racing alone.
                    if let Some((_, dup_job)) = &self.chunks[chunk_index].duplicate {
                        if dup_job == &job_id {
                            self.chunks[chunk_index].duplicate = None;
                            continue;
                        }
                    }
                    // A racing duplicate may still win this chunk.
                    if self.chunks[chunk_index].state == ChunkState::Encoding
                        && !self.duplicate_still_running(chunk_index, &job_id)
                    {
                        self.count_chunk_failure(chunk_index);
                    }
                }
            }
        }
    }

    fn duplicate_still_running(&self, chunk_index: usize, failed_job: &str) -> bool {
        match &self.chunks[chunk_index].duplicate {
            Some((_, dup_job)) if dup_job != failed_job => true,
            _ => {
                // The primary may still be running while the duplicate died.
                self.chunks[chunk_index]
                    .job_id
                    .as_deref()
                    .is_some_and(|primary| primary != failed_job)
            }
        }
    }

    fn release_worker(&mut self, worker_index: usize) {
        if let Some(running) = self.workers[worker_index].current.take() {
            if let Some(upload) = running.upload {
                if !upload.is_finished() {
                    upload.abort();
                }
            }
        }
    }

    /// First completion wins a duplicated chunk; the loser is cancelled.
    async fn handle_completion(&mut self, worker_index: usize, chunk_index: usize) {
        let winner_job = match self.workers[worker_index].current.as_ref() {
            Some(running) => running.job_id.clone(),
            None => return,
        };
        self.release_worker(worker_index);

        if self.chunks[chunk_index].state != ChunkState::Encoding {
            // The other contender already won; cancel our copy.
            let client = self.workers[worker_index].worker.client.clone();
            let _ = client.cancel_job(&winner_job).await;
            return;
        }

        // Adopt the winner and cancel the loser, if a race was on.
        let loser = {
            let chunk = &mut self.chunks[chunk_index];
            let loser = match chunk.duplicate.take() {
                Some((dup_worker, dup_job)) if dup_job != winner_job => {
                    // Primary won; duplicate loses.
                    Some((dup_worker, dup_job))
                }
                Some(_) => {
                    // Duplicate won; primary loses.
                    chunk
                        .worker
                        .zip(chunk.job_id.clone())
                        .filter(|(_, job)| job != &winner_job)
                }
                None => None,
            };
            chunk.worker = Some(worker_index);
            chunk.job_id = Some(winner_job);
            chunk.state = ChunkState::Downloading;
            loser
        };
        if let Some((loser_worker, loser_job)) = loser {
            info!(chunk = chunk_index, "endgame race settled, cancelling loser");
            let client = self.workers[loser_worker].worker.client.clone();
            let _ = client.cancel_job(&loser_job).await;
            self.release_worker(loser_worker);
        }

        self.spawn_download(chunk_index);
    }

    /// Background download of one finished chunk into its staging dir.
    pub fn spawn_download(&mut self, chunk_index: usize) {
        let Some(worker_index) = self.chunks[chunk_index].worker else {
            return;
        };
        let Some(job_id) = self.chunks[chunk_index].job_id.clone() else {
            return;
        };
        let client: WorkerClient = self.workers[worker_index].worker.client.clone();
        let stage = self.session.layout().chunk_stage_dir(chunk_index);
        let debug_log = self.session.layout().chunk_debug_log();

        let handle = tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            let mut attempt = 0;
            loop {
                attempt += 1;
                match download_job_segments(&client, &job_id, &stage, &mut seen).await {
                    Ok(download) => {
                        append_debug_line(
                            &debug_log,
                            &format!(
                                "chunk stage {} done: vid={} aud={}",
                                stage.display(),
                                download.counts.video(),
                                download.counts.audio()
                            ),
                        );
                        if let Err(error) = write_done_sentinel(&stage, &download.counts) {
                            warn!(%error, "sentinel write failed");
                        }
                        return;
                    }
                    Err(error) if attempt < 5 => {
                        warn!(job = %job_id, attempt, %error, "chunk download retry");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                    Err(error) => {
                        error!(job = %job_id, %error, "chunk download failed");
                        append_debug_line(
                            &debug_log,
                            &format!("chunk stage {} FAILED: {error}", stage.display()),
                        );
                        let _ = std::fs::write(stage.join(DOWNLOAD_FAILED_MARKER), b"");
                        return;
                    }
                }
            }
        });
        self.downloads.insert(chunk_index, handle);
    }

    /// Emit finished chunks strictly in index order.
    ///
    /// Chunk `c` reaches the output directory only when `c ==
    /// next_processable`; downloads completing out of order wait their turn
    /// here. Init segments and the manifest come from chunk 0 only.
    pub async fn pump_emission(&mut self) -> Result<()> {
        while self.next_processable < self.chunks.len() {
            let index = self.next_processable;
            if self.chunks[index].state != ChunkState::Downloading {
                break;
            }
            let stage = self.session.layout().chunk_stage_dir(index);

            if stage.join(DOWNLOAD_FAILED_MARKER).exists() {
                let _ = std::fs::remove_file(stage.join(DOWNLOAD_FAILED_MARKER));
                self.events
                    .alert("protocol", &format!("chunk {index} download failed"));
                self.count_chunk_failure(index);
                break;
            }
            let Some(counts) = read_done_sentinel(&stage) else {
                break;
            };

            let download = scan_stage_dir(&stage, counts.clone());
            let include_init = index == 0;
            self.sink.emit_chunk(&stage, &download, include_init).await?;

            if include_init {
                if let Some(manifest) = &download.manifest {
                    let dest = self.sink.out_dir().join(manifest);
                    let src = stage.join(manifest);
                    if src.exists() {
                        tokio::fs::copy(&src, &dest).await?;
                    }
                    self.manifest_path = Some(dest);
                }
            }
            if let Some(manifest) = self.manifest_path.clone() {
                let _ = self.gate.offer(&manifest, self.sink.out_dir()).await;
            }

            let chunk = &mut self.chunks[index];
            chunk.counts = Some(counts);
            chunk.state = ChunkState::Completed;
            self.downloads.remove(&index);
            self.next_processable += 1;
            info!(chunk = index, "chunk emitted");
        }
        Ok(())
    }

    /// Defense-in-depth against races in the steal/prefetch paths: re-link
    /// any encoding chunk its worker stopped tracking.
    pub async fn orphan_sweep(&mut self) {
        for chunk_index in 0..self.chunks.len() {
            if self.chunks[chunk_index].state != ChunkState::Encoding {
                continue;
            }
            let Some(worker_index) = self.chunks[chunk_index].worker else {
                self.chunks[chunk_index].state = ChunkState::Pending;
                continue;
            };
            let tracked = self.workers[worker_index]
                .current
                .as_ref()
                .is_some_and(|running| running.chunk == chunk_index);
            if tracked {
                continue;
            }
            let Some(job_id) = self.chunks[chunk_index].job_id.clone() else {
                self.chunks[chunk_index].state = ChunkState::Pending;
                continue;
            };

            debug!(chunk = chunk_index, "orphan sweep re-linking");
            match self.workers[worker_index].worker.client.status(&job_id).await {
                Ok(status) => match status.status {
                    JobState::Completed => {
                        self.chunks[chunk_index].state = ChunkState::Downloading;
                        self.spawn_download(chunk_index);
                    }
                    JobState::Running | JobState::Pending | JobState::Queued => {
                        if self.workers[worker_index].is_idle() {
                            self.workers[worker_index].current = Some(RunningJob {
                                chunk: chunk_index,
                                job_id,
                                upload: None,
                            });
                        }
                    }
                    JobState::Failed | JobState::Cancelled => {
                        self.count_chunk_failure(chunk_index);
                    }
                },
                Err(error) => {
                    debug!(chunk = chunk_index, %error, "orphan status poll failed");
                }
            }
        }
    }

    /// Forged progress: whole completed chunks plus wall progress on the
    /// earliest running chunk.
    pub async fn emit_progress(&mut self) {
        let completed = self
            .chunks
            .iter()
            .filter(|c| c.state == ChunkState::Completed)
            .count() as u64;
        let earliest_running = self
            .chunks
            .iter()
            .filter(|c| c.state == ChunkState::Encoding)
            .filter_map(|c| c.started)
            .min()
            .map(|started| started.elapsed());
        let chunk_duration =
            std::time::Duration::from_secs(self.config.chunk_duration_secs);
        let out_time_us = approx_out_time_us(completed, chunk_duration, earliest_running);

        let fps: f64 = self
            .workers
            .iter()
            .filter(|w| w.current.is_some())
            .map(|w| w.last_fps)
            .sum();
        let speed: f64 = self
            .workers
            .iter()
            .filter(|w| w.current.is_some())
            .map(|w| w.last_speed)
            .sum();
        let frame = (out_time_us as f64 / 1_000_000.0 * NOMINAL_FPS) as u64;

        self.reporter
            .emit(ProgressBody {
                frame,
                fps,
                speed,
                out_time_us,
            })
            .await;
    }

    /// Best-effort teardown: abort every background task, cancel every job
    /// the session ever submitted, clear session objects under the pull dir.
    pub async fn shutdown(&mut self) {
        for slot in &mut self.workers {
            if let Some(running) = slot.current.take() {
                if let Some(upload) = running.upload {
                    upload.abort();
                }
            }
            if let Some(prefetch) = slot.prefetch.take() {
                prefetch.upload.abort();
            }
        }
        for (_, handle) in self.downloads.drain() {
            handle.abort();
        }

        let cancels = self.tracked.iter().map(|(worker_index, job_id)| {
            let client = self.workers[*worker_index].worker.client.clone();
            let job_id = job_id.clone();
            async move {
                let _ = client.cancel_job(&job_id).await;
            }
        });
        futures::future::join_all(cancels).await;

        // Remove anything this session staged under the pull dir.
        if let Ok(entries) = std::fs::read_dir(&self.config.pull_dir) {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .contains(self.session.id())
                {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    /// Record a job id for teardown bookkeeping.
    pub fn track_job(&mut self, worker_index: usize, job_id: String) {
        self.tracked.push((worker_index, job_id));
    }
}

fn append_debug_line(path: &std::path::Path, line: &str) {
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        let _ = writeln!(file, "{line}");
    }
}
