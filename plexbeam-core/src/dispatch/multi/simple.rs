//! Mode A: fixed-size chunks, one shared FIFO, no calibration.
//!
//! Any idle worker takes the lowest-indexed pending chunk. Failures return
//! the chunk to pending; the shared fail-fast threshold aborts a dispatch
//! that keeps burning attempts.

use tracing::{info, warn};

use crate::dispatch::multi::runtime::MultiRuntime;
use crate::dispatch::{DispatchOutcome, TICK};
use crate::error::Result;

/// Tick cap (~2 h) so a wedged worker cannot pin the session forever.
const MAX_TICKS: u64 = 28_800;

pub async fn run(runtime: &mut MultiRuntime<'_>) -> Result<DispatchOutcome> {
    info!(
        chunks = runtime.chunks.len(),
        workers = runtime.workers.len(),
        "simple chunked dispatch starting"
    );
    runtime
        .events
        .info("dispatch_start", &format!("mode=A chunks={}", runtime.chunks.len()));

    let mut ticks: u64 = 0;
    loop {
        tokio::time::sleep(TICK).await;
        ticks += 1;

        runtime.poll_busy_workers(false).await;

        // Lowest pending chunks to idle workers, one attempt per tick so a
        // failing submission cannot spin inside a single tick.
        let idle: Vec<usize> = runtime
            .workers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_idle())
            .map(|(index, _)| index)
            .collect();
        let mut pending = runtime.pending_indices().into_iter();
        for worker_index in idle {
            let Some(chunk_index) = pending.next() else {
                break;
            };
            runtime.assign_chunk(worker_index, chunk_index).await;
        }

        runtime.pump_emission().await?;

        if ticks % 4 == 0 {
            runtime.emit_progress().await;
        }

        if runtime.all_completed() {
            runtime.reporter.emit_terminal(0).await;
            runtime.events.info("dispatch_done", "mode=A");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Completed);
        }
        if runtime.over_failure_limit() {
            warn!(failures = runtime.failures, "failure limit reached");
            runtime.events.alert("fail_fast", "mode=A");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Failed);
        }
        if runtime.workers.iter().all(|slot| !slot.alive) {
            warn!("every worker died mid-dispatch");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Failed);
        }
        if ticks >= MAX_TICKS {
            warn!("dispatch wall clock exhausted");
            runtime.events.alert("poll_cap", "mode=A");
            runtime.shutdown().await;
            return Ok(DispatchOutcome::Failed);
        }
    }
}
