//! Mode C: chunked dispatch with calibration, per-worker queues, prefetch,
//! work stealing, and endgame duplication.
//!
//! Lifecycle: seed one chunk per worker round-robin; calibrate each worker
//! on its first completed chunk; distribute the remaining chunks into
//! per-worker queues proportional to calibrated fps; then keep every worker
//! saturated through its queue, stealing from the longest queue when its
//! own runs dry, and duplicating the slowest in-flight chunk once the
//! pending set empties. Emission order stays strictly by chunk index no
//! matter how the races resolve.

use std::collections::VecDeque;

use tracing::{info, warn};

use crate::beam::{self, RemuxInterval};
use crate::dispatch::multi::chunks::{proportional_counts, ChunkState};
use crate::dispatch::multi::runtime::{MultiRuntime, Prefetch};
use crate::dispatch::multi::{chunk0, faststart};
use crate::dispatch::{mask_sigpipe, DispatchOutcome, TICK};
use crate::error::Result;

const MAX_TICKS: u64 = 28_800;

/// Partition pending chunk indices into per-worker queues by weight.
///
/// Workers receive consecutive runs of the (ascending) pending list, so a
/// fast worker ends up owning an early contiguous span rather than a comb
/// of interleaved indices.
fn split_pending(pending: &[usize], weights: &[u32]) -> Vec<Vec<usize>> {
    let counts = proportional_counts(weights, pending.len());
    let mut queues = Vec::with_capacity(weights.len());
    let mut cursor = 0;
    for count in counts {
        let end = (cursor + count).min(pending.len());
        queues.push(pending[cursor..end].to_vec());
        cursor = end;
    }
    queues
}

/// Choose the steal victim: the other worker with the longest queue.
fn pick_victim(queue_lengths: &[usize], thief: usize) -> Option<usize> {
    queue_lengths
        .iter()
        .enumerate()
        .filter(|&(index, &len)| index != thief && len > 0)
        .max_by_key(|&(_, &len)| len)
        .map(|(index, _)| index)
}

pub async fn run(
    runtime: &mut MultiRuntime<'_>,
    real_transcoder: Option<&std::path::Path>,
) -> Result<DispatchOutcome> {
    // The media server closing stderr must not kill us mid-swarm.
    mask_sigpipe();

    let n_chunks = runtime.chunks.len();
    let n_workers = runtime.workers.len();
    info!(chunks = n_chunks, workers = n_workers, "torrent dispatch starting");
    runtime.events.info(
        "dispatch_start",
        &format!("mode=C chunks={n_chunks} workers={n_workers}"),
    );

    // Fast-start: the real transcoder fills the first player-visible
    // segments while the swarm spins up.
    let mut fast_start = match real_transcoder {
        Some(real) => match faststart::spawn(real, &runtime.invocation.raw_args) {
            Ok(child) => Some(child),
            Err(error) => {
                warn!(%error, "fast-start launch failed");
                None
            }
        },
        None => None,
    };

    // Seed: chunk i to worker i.
    let seed_count = n_workers.min(n_chunks);
    for index in 0..seed_count {
        runtime.assign_chunk(index, index).await;
    }

    // Progressive chunk-0 downloader, keyed to chunk 0's seeded job.
    let progressive = runtime.chunks[0].worker.map(|worker_index| {
        chunk0::spawn(
            runtime.workers[worker_index].worker.client.clone(),
            runtime.session.chunk_job_id(0),
            runtime.session.layout().chunk_stage_dir(0).join("progressive"),
            runtime.invocation.output_dir.clone(),
            runtime.invocation.skip_to_segment,
            runtime.invocation.manifest_callback_url.clone(),
            runtime.http.clone(),
        )
    });

    let mut distribution_done = false;
    let mut ticks: u64 = 0;
    let outcome = loop {
        tokio::time::sleep(TICK).await;
        ticks += 1;

        runtime.poll_busy_workers(true).await;
        runtime.orphan_sweep().await;
        runtime.pump_emission().await?;

        if !distribution_done && runtime.all_calibrated() && seeds_dispatched(runtime, seed_count)
        {
            distribute(runtime);
            distribution_done = true;
        }

        service_idle_workers(runtime, distribution_done, seed_count).await;
        if distribution_done {
            start_prefetches(runtime).await;
        }
        maybe_endgame(runtime).await;

        if ticks % 4 == 0 {
            runtime.emit_progress().await;
        }

        if runtime.all_completed() {
            runtime.reporter.emit_terminal(0).await;
            runtime.events.info("dispatch_done", "mode=C");
            break DispatchOutcome::Completed;
        }
        if runtime.over_failure_limit() {
            warn!(failures = runtime.failures, "failure limit reached");
            runtime.events.alert("fail_fast", "mode=C");
            break DispatchOutcome::Failed;
        }
        if runtime.workers.iter().all(|slot| !slot.alive) {
            warn!("every worker died mid-dispatch");
            runtime.events.alert("all_workers_dead", "mode=C");
            break DispatchOutcome::Failed;
        }
        if ticks >= MAX_TICKS {
            runtime.events.alert("poll_cap", "mode=C");
            break DispatchOutcome::Failed;
        }
    };

    if let Some(progressive) = progressive {
        progressive.stop();
    }
    if let Some(child) = fast_start.as_mut() {
        let _ = child.kill().await;
    }
    runtime.shutdown().await;
    Ok(outcome)
}

/// Seed chunks must all have left `Pending` before distribution.
fn seeds_dispatched(runtime: &MultiRuntime<'_>, seed_count: usize) -> bool {
    runtime.chunks[..seed_count]
        .iter()
        .all(|chunk| chunk.state != ChunkState::Pending)
}

/// Hand every remaining pending chunk to a worker queue, proportional to
/// calibrated fps; the fastest worker absorbs the rounding leftover.
fn distribute(runtime: &mut MultiRuntime<'_>) {
    let pending = runtime.pending_indices();
    if pending.is_empty() {
        return;
    }
    let weights: Vec<u32> = runtime
        .workers
        .iter()
        .map(|slot| {
            if slot.alive {
                slot.calibrated_fps.unwrap_or(1)
            } else {
                0
            }
        })
        .collect();
    let queues = split_pending(&pending, &weights);

    let mut decision = Vec::with_capacity(queues.len());
    for (worker_index, queue) in queues.into_iter().enumerate() {
        decision.push(format!("w{worker_index}<-{}", queue.len()));
        runtime.workers[worker_index].queue = VecDeque::from(queue);
    }
    info!(pending = pending.len(), plan = ?decision, "distribution complete");
    runtime
        .events
        .info("distribute", &decision.join(" "));
}

/// Idle workers take, in order: a promotable prefetch, their own queue
/// head, a stray pending chunk (failed work that left every queue), then a
/// steal from the longest queue.
///
/// Before distribution only the seeded index range is eligible for stray
/// pickup; re-seeding a failed seed chunk is what lets its worker
/// eventually calibrate.
async fn service_idle_workers(
    runtime: &mut MultiRuntime<'_>,
    distribution_done: bool,
    seed_count: usize,
) {
    for worker_index in 0..runtime.workers.len() {
        if !runtime.workers[worker_index].is_idle() {
            continue;
        }

        if runtime.promote_prefetch(worker_index).is_some() {
            continue;
        }

        let mut assigned = false;
        while let Some(chunk_index) = runtime.workers[worker_index].queue.pop_front() {
            if runtime.chunks[chunk_index].state == ChunkState::Pending {
                runtime.assign_chunk(worker_index, chunk_index).await;
                assigned = true;
                break;
            }
        }
        if assigned {
            continue;
        }

        let queued: Vec<usize> = runtime
            .workers
            .iter()
            .flat_map(|slot| slot.queue.iter().copied())
            .collect();
        let stray = runtime
            .pending_indices()
            .into_iter()
            .filter(|&index| distribution_done || index < seed_count)
            .find(|index| !queued.contains(index));
        if let Some(stray) = stray {
            runtime.assign_chunk(worker_index, stray).await;
            continue;
        }
        if !distribution_done {
            continue;
        }

        let queue_lengths: Vec<usize> = runtime
            .workers
            .iter()
            .map(|slot| slot.queue.len())
            .collect();
        if let Some(victim) = pick_victim(&queue_lengths, worker_index) {
            if let Some(stolen) = runtime.workers[victim].queue.pop_back() {
                if runtime.chunks[stolen].state == ChunkState::Pending {
                    info!(thief = worker_index, victim, chunk = stolen, "stole chunk");
                    runtime.assign_chunk(worker_index, stolen).await;
                }
                // A stolen chunk that is no longer pending was already
                // dequeued by the victim; discard silently and retry next
                // tick.
            }
        }
    }
}

/// Keep an upload in flight for each busy beam worker's queue head.
async fn start_prefetches(runtime: &mut MultiRuntime<'_>) {
    for worker_index in 0..runtime.workers.len() {
        let slot = &runtime.workers[worker_index];
        if !slot.alive
            || slot.current.is_none()
            || slot.prefetch.is_some()
            || !slot.needs_beam()
        {
            continue;
        }
        let Some(&head) = slot.queue.front() else {
            continue;
        };
        if runtime.chunks[head].state != ChunkState::Pending {
            continue;
        }

        let job_id = runtime.session.prefetch_job_id(head);
        let request = runtime.build_chunk_request(head, &job_id, worker_index, true);
        let client = runtime.workers[worker_index].worker.client.clone();
        match client.submit(&request).await {
            Ok(response) if response.status.is_accepted() => {}
            _ => continue,
        }

        let chunk = &runtime.chunks[head];
        match beam::start_beam_upload(
            client,
            job_id.clone(),
            &runtime.config.ffmpeg_path,
            &runtime.invocation.input_path,
            RemuxInterval::window(chunk.ss, chunk.t),
            runtime.config.upload_rate,
        ) {
            Ok(upload) => {
                info!(worker = worker_index, chunk = head, "prefetch upload started");
                runtime.track_job(worker_index, job_id.clone());
                runtime.workers[worker_index].prefetch = Some(Prefetch {
                    chunk: head,
                    job_id,
                    upload,
                });
            }
            Err(error) => {
                warn!(worker = worker_index, chunk = head, %error, "prefetch upload failed");
            }
        }
    }
}

/// Pending set empty, chunks still encoding, workers idle: duplicate the
/// chunk owned by the slowest worker onto one idle worker. Once per chunk.
async fn maybe_endgame(runtime: &mut MultiRuntime<'_>) {
    if !runtime.pending_indices().is_empty() {
        return;
    }
    if runtime.workers.iter().any(|slot| !slot.queue.is_empty()) {
        return;
    }
    let Some(idle_worker) = runtime
        .workers
        .iter()
        .position(|slot| slot.is_idle())
    else {
        return;
    };

    let candidate = runtime
        .chunks
        .iter()
        .filter(|chunk| {
            chunk.state == ChunkState::Encoding
                && !chunk.endgame_duped
                && chunk.duplicate.is_none()
        })
        .min_by_key(|chunk| {
            chunk
                .worker
                .and_then(|w| runtime.workers[w].calibrated_fps)
                .unwrap_or(1)
        })
        .map(|chunk| chunk.index);

    if let Some(chunk_index) = candidate {
        runtime.assign_duplicate(idle_worker, chunk_index).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pending_is_contiguous_and_complete() {
        let pending: Vec<usize> = (2..10).collect();
        let queues = split_pending(&pending, &[200, 120]);
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0], vec![2, 3, 4, 5, 6]);
        assert_eq!(queues[1], vec![7, 8, 9]);
        let total: usize = queues.iter().map(Vec::len).sum();
        assert_eq!(total, pending.len());
    }

    #[test]
    fn split_pending_gives_dead_workers_nothing_real() {
        // A dead worker enters with weight 0, which degrades to 1; it still
        // receives close to nothing relative to live peers.
        let pending: Vec<usize> = (0..20).collect();
        let queues = split_pending(&pending, &[0, 500]);
        assert!(queues[0].len() <= 1);
        assert!(queues[1].len() >= 19);
    }

    #[test]
    fn victim_is_the_longest_other_queue() {
        assert_eq!(pick_victim(&[0, 3, 7], 0), Some(2));
        assert_eq!(pick_victim(&[5, 3, 7], 2), Some(0));
        // Nothing to steal anywhere.
        assert_eq!(pick_victim(&[0, 0, 0], 1), None);
        // Own queue never counts.
        assert_eq!(pick_victim(&[9, 0], 0), None);
    }
}
