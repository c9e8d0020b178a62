//! Timeline partitioning and weight math for multi-worker dispatch.

use std::time::Instant;

use crate::aggregate::DownloadCounts;

/// Chunk lifecycle. Transitions are strictly forward except the failure
/// path `Encoding -> Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Encoding,
    Downloading,
    Completed,
}

/// One slice of the encode timeline.
#[derive(Debug)]
pub struct Chunk {
    pub index: usize,
    pub ss: f64,
    pub t: f64,
    pub state: ChunkState,
    /// Worker currently (or last) responsible for the chunk.
    pub worker: Option<usize>,
    pub job_id: Option<String>,
    pub started: Option<Instant>,
    /// Per-stream counts once the download finished.
    pub counts: Option<DownloadCounts>,
    /// Endgame duplication happens at most once per chunk.
    pub endgame_duped: bool,
    /// The racing duplicate, while one exists: (worker index, job id).
    pub duplicate: Option<(usize, String)>,
}

impl Chunk {
    pub fn new(index: usize, ss: f64, t: f64) -> Self {
        Self {
            index,
            ss,
            t,
            state: ChunkState::Pending,
            worker: None,
            job_id: None,
            started: None,
            counts: None,
            endgame_duped: false,
            duplicate: None,
        }
    }
}

/// Divide the remaining duration (after `seek`) into fixed-size chunks.
///
/// The last chunk absorbs the remainder, so every chunk except the last is
/// exactly `chunk_secs` and the last is in `[chunk_secs, 2*chunk_secs)`.
/// A computed `t <= 0` produces no chunk at all.
pub fn plan_chunks(total_duration: f64, seek: f64, chunk_secs: u64) -> Vec<Chunk> {
    let remaining = total_duration - seek;
    if remaining <= 0.0 || chunk_secs == 0 {
        return Vec::new();
    }
    let chunk = chunk_secs as f64;
    let full = (remaining / chunk).floor() as usize;
    let n_chunks = full.max(1);

    let mut chunks = Vec::with_capacity(n_chunks);
    for index in 0..n_chunks {
        let ss = seek + index as f64 * chunk;
        let t = if index + 1 == n_chunks {
            remaining - index as f64 * chunk
        } else {
            chunk
        };
        if t <= 0.0 {
            continue;
        }
        chunks.push(Chunk::new(index, ss, t));
    }
    chunks
}

/// Split `total` items across weights, proportionally.
///
/// Rounding leftovers all go to the heaviest weight (the fastest worker),
/// and a zero weight degrades to one so nothing ever divides by zero.
pub fn proportional_counts(weights: &[u32], total: usize) -> Vec<usize> {
    if weights.is_empty() {
        return Vec::new();
    }
    let weights: Vec<u64> = weights.iter().map(|&w| u64::from(w.max(1))).collect();
    let sum: u64 = weights.iter().sum();
    let mut counts: Vec<usize> = weights
        .iter()
        .map(|&w| ((total as u64 * w) / sum) as usize)
        .collect();
    let assigned: usize = counts.iter().sum();
    let leftover = total - assigned;
    if leftover > 0 {
        let fastest = weights
            .iter()
            .enumerate()
            .max_by_key(|(_, &w)| w)
            .map(|(i, _)| i)
            .unwrap_or(0);
        counts[fastest] += leftover;
    }
    counts
}

/// Split a duration across weights with a floor, for big-split mode.
///
/// Every slice gets at least `floor_secs`; the last worker absorbs the
/// rounding remainder. Returns `(ss, t)` pairs offset from `seek`.
pub fn proportional_spans(
    weights: &[u32],
    total_duration: f64,
    seek: f64,
    floor_secs: f64,
) -> Vec<(f64, f64)> {
    let remaining = total_duration - seek;
    if weights.is_empty() || remaining <= 0.0 {
        return Vec::new();
    }
    let weights: Vec<f64> = weights.iter().map(|&w| f64::from(w.max(1))).collect();
    let sum: f64 = weights.iter().sum();

    let mut spans = Vec::with_capacity(weights.len());
    let mut cursor = seek;
    for (i, weight) in weights.iter().enumerate() {
        let raw = remaining * weight / sum;
        let t = if i + 1 == weights.len() {
            (seek + remaining) - cursor
        } else {
            raw.max(floor_secs)
        };
        if t <= 0.0 {
            break;
        }
        spans.push((cursor, t));
        cursor += t;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_with_absorbed_remainder() {
        let chunks = plan_chunks(600.0, 0.0, 300);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ss, 0.0);
        assert_eq!(chunks[0].t, 300.0);
        assert_eq!(chunks[1].ss, 300.0);
        assert_eq!(chunks[1].t, 300.0);

        // 700 s: the 100 s remainder folds into the second chunk.
        let chunks = plan_chunks(700.0, 0.0, 300);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].t, 400.0);
    }

    #[test]
    fn seek_shortens_the_plan() {
        let chunks = plan_chunks(900.0, 600.0, 300);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ss, 600.0);
        assert_eq!(chunks[0].t, 300.0);
    }

    #[test]
    fn short_remainder_is_a_single_chunk() {
        let chunks = plan_chunks(120.0, 0.0, 300);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].t, 120.0);
    }

    #[test]
    fn nothing_left_means_no_chunks() {
        assert!(plan_chunks(300.0, 300.0, 300).is_empty());
        assert!(plan_chunks(300.0, 400.0, 300).is_empty());
    }

    #[test]
    fn proportional_counts_favor_the_fast_worker() {
        // fps 200 vs 120 over 8 chunks: 5 + 3 after the leftover lands on
        // the faster worker.
        let counts = proportional_counts(&[200, 120], 8);
        assert_eq!(counts.iter().sum::<usize>(), 8);
        assert_eq!(counts, vec![5, 3]);
    }

    #[test]
    fn zero_weight_degrades_to_one() {
        let counts = proportional_counts(&[0, 100], 4);
        assert_eq!(counts.iter().sum::<usize>(), 4);
        assert!(counts[1] >= counts[0]);
    }

    #[test]
    fn spans_cover_the_timeline_exactly() {
        let spans = proportional_spans(&[200, 120], 600.0, 0.0, 30.0);
        assert_eq!(spans.len(), 2);
        let total: f64 = spans.iter().map(|(_, t)| t).sum();
        assert!((total - 600.0).abs() < 1e-6);
        assert!(spans[0].1 > spans[1].1);
        assert_eq!(spans[1].0, spans[0].1);
    }

    #[test]
    fn span_floor_is_respected() {
        let spans = proportional_spans(&[1000, 1], 120.0, 0.0, 30.0);
        assert!(spans[0].1 >= 30.0);
        let total: f64 = spans.iter().map(|(_, t)| t).sum();
        assert!((total - 120.0).abs() < 1e-6);
    }
}
