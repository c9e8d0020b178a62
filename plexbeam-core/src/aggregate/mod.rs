//! Segment classification, download, renumbering, and emission.
//!
//! Workers number their segments locally from 1; the aggregator is what
//! turns per-chunk numbering into the single contiguous sequence the player
//! sees. Media segments are sorted by `(segment_number, stream_id)` before
//! emission so audio interleaves with video; sorting by filename would list
//! all of stream 0 before stream 1 and starve the audio timeline.

pub mod manifest;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::WorkerClient;
use crate::error::{BeamError, Result};

/// Parallelism for media-segment downloads.
const DOWNLOAD_BATCH: usize = 8;

const DONE_SENTINEL: &str = ".download_done.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Manifest,
    Init { stream: u32 },
    Media { stream: u32, number: u64 },
}

fn init_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^init-stream(\d+)\.m4s$").expect("init regex"))
}

fn media_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^chunk-stream(\d+)-(\d+)\.m4s$").expect("media regex"))
}

/// Classify a worker-produced filename.
pub fn classify(name: &str) -> Option<SegmentKind> {
    if name.ends_with(".mpd") || name.ends_with(".m3u8") {
        return Some(SegmentKind::Manifest);
    }
    if let Some(caps) = init_re().captures(name) {
        return caps[1].parse().ok().map(|stream| SegmentKind::Init { stream });
    }
    if let Some(caps) = media_re().captures(name) {
        let stream = caps[1].parse().ok()?;
        let number = caps[2].parse().ok()?;
        return Some(SegmentKind::Media { stream, number });
    }
    None
}

/// A media segment as listed by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSegment {
    pub stream: u32,
    pub number: u64,
    pub name: String,
}

/// Sort media segments for emission: by number first, stream second.
pub fn sort_for_emission(segments: &mut [MediaSegment]) {
    segments.sort_by_key(|seg| (seg.number, seg.stream));
}

/// Per-stream segment counts of one downloaded chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadCounts {
    pub by_stream: HashMap<u32, u64>,
}

impl DownloadCounts {
    pub fn video(&self) -> u64 {
        self.by_stream.get(&0).copied().unwrap_or(0)
    }

    pub fn audio(&self) -> u64 {
        self.by_stream.get(&1).copied().unwrap_or(0)
    }

    fn record(&mut self, stream: u32, number: u64) {
        let entry = self.by_stream.entry(stream).or_insert(0);
        // Counts are the highest raw number seen, not the file count: a
        // worker may re-list a segment the downloader already has.
        if number > *entry {
            *entry = number;
        }
    }
}

/// Everything one listing pass pulled down for a job.
///
/// `media` and `inits` hold only the files fetched by *this* pass; `counts`
/// reflects the worker's full listing. A first pass over a finished job
/// therefore sees everything, while repeated sweeps stay incremental.
#[derive(Debug, Default)]
pub struct ChunkDownload {
    pub manifest: Option<String>,
    pub inits: Vec<(u32, String)>,
    pub media: Vec<MediaSegment>,
    pub counts: DownloadCounts,
}

/// Download every not-yet-seen file of a job into `dest`.
///
/// Init segments and the manifest come down synchronously; media segments
/// are fetched with bounded concurrency. `seen` is updated with every file
/// that landed.
pub async fn download_job_segments(
    client: &WorkerClient,
    job_id: &str,
    dest: &Path,
    seen: &mut HashSet<String>,
) -> Result<ChunkDownload> {
    tokio::fs::create_dir_all(dest).await?;
    let listing = client
        .segments(job_id)
        .await
        .map_err(|e| BeamError::Protocol(format!("segment listing for {job_id}: {e}")))?;

    let mut download = ChunkDownload::default();
    let mut fresh_media: Vec<MediaSegment> = Vec::new();

    for name in &listing.files {
        match classify(name) {
            Some(SegmentKind::Manifest) => {
                if !seen.contains(name) {
                    client
                        .download_segment(job_id, name, &dest.join(name))
                        .await
                        .map_err(|e| BeamError::Protocol(e.to_string()))?;
                    seen.insert(name.clone());
                }
                download.manifest = Some(name.clone());
            }
            Some(SegmentKind::Init { stream }) => {
                if !seen.contains(name) {
                    client
                        .download_segment(job_id, name, &dest.join(name))
                        .await
                        .map_err(|e| BeamError::Protocol(e.to_string()))?;
                    seen.insert(name.clone());
                    download.inits.push((stream, name.clone()));
                }
            }
            Some(SegmentKind::Media { stream, number }) => {
                download.counts.record(stream, number);
                if !seen.contains(name) {
                    fresh_media.push(MediaSegment {
                        stream,
                        number,
                        name: name.clone(),
                    });
                }
            }
            None => debug!(file = %name, "ignoring unclassifiable worker file"),
        }
    }

    sort_for_emission(&mut fresh_media);
    let fetch_list = fresh_media.clone();
    let fetches = futures::stream::iter(fetch_list.into_iter().map(|segment| {
        let client = client.clone();
        let job_id = job_id.to_string();
        let dest = dest.join(&segment.name);
        let name = segment.name.clone();
        async move {
            client
                .download_segment(&job_id, &name, &dest)
                .await
                .map(|_| name)
        }
    }))
    .buffer_unordered(DOWNLOAD_BATCH)
    .collect::<Vec<_>>()
    .await;

    for result in fetches {
        match result {
            Ok(name) => {
                seen.insert(name);
            }
            Err(error) => {
                return Err(BeamError::Protocol(format!(
                    "media segment download for {job_id}: {error}"
                )))
            }
        }
    }

    download.media = fresh_media;
    Ok(download)
}

/// Rebuild a [`ChunkDownload`] from a fully staged directory.
///
/// Emission runs on the main-loop tick, which only learns of a finished
/// background download through the sentinel file; the segment inventory is
/// reconstructed from the staged filenames.
pub fn scan_stage_dir(dir: &Path, counts: DownloadCounts) -> ChunkDownload {
    let mut download = ChunkDownload {
        counts,
        ..ChunkDownload::default()
    };
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match classify(name) {
                Some(SegmentKind::Manifest) => download.manifest = Some(name.to_string()),
                Some(SegmentKind::Init { stream }) => {
                    download.inits.push((stream, name.to_string()))
                }
                Some(SegmentKind::Media { stream, number }) => download.media.push(MediaSegment {
                    stream,
                    number,
                    name: name.to_string(),
                }),
                None => {}
            }
        }
    }
    sort_for_emission(&mut download.media);
    download
}

/// Atomically record that a chunk's download finished, with its counts.
pub fn write_done_sentinel(dir: &Path, counts: &DownloadCounts) -> Result<()> {
    let body = serde_json::to_vec(counts)?;
    let tmp = dir.join(format!("{DONE_SENTINEL}.tmp"));
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, dir.join(DONE_SENTINEL))?;
    Ok(())
}

/// Non-blocking check the main-loop tick polls.
pub fn read_done_sentinel(dir: &Path) -> Option<DownloadCounts> {
    let raw = std::fs::read(dir.join(DONE_SENTINEL)).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Cumulative per-stream renumbering state across emitted chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamOffsets {
    offsets: HashMap<u32, u64>,
}

impl StreamOffsets {
    pub fn offset(&self, stream: u32) -> u64 {
        self.offsets.get(&stream).copied().unwrap_or(0)
    }

    /// Fold one emitted chunk's counts into the running offsets.
    pub fn advance(&mut self, counts: &DownloadCounts) {
        for (&stream, &count) in &counts.by_stream {
            *self.offsets.entry(stream).or_insert(0) += count;
        }
    }
}

/// Writes renumbered segments into the directory the media server watches.
///
/// This is the only component that writes the output directory; the strict
/// in-index-order emission contract of the dispatchers rides on that.
#[derive(Debug)]
pub struct SegmentSink {
    out_dir: PathBuf,
    skip_base: u64,
    offsets: StreamOffsets,
    init_emitted: HashSet<u32>,
}

impl SegmentSink {
    pub fn new(out_dir: impl Into<PathBuf>, skip_base: u64) -> Self {
        Self {
            out_dir: out_dir.into(),
            skip_base,
            offsets: StreamOffsets::default(),
            init_emitted: HashSet::new(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn emitted_name(&self, stream: u32, raw_number: u64) -> String {
        let emitted = raw_number + self.offsets.offset(stream) + self.skip_base;
        format!("chunk-stream{stream}-{emitted:05}.m4s")
    }

    /// Place an init segment; only the first copy per stream is kept.
    pub async fn emit_init(&mut self, src: &Path, stream: u32) -> Result<bool> {
        if self.init_emitted.contains(&stream) {
            return Ok(false);
        }
        let dest = self.out_dir.join(format!("init-stream{stream}.m4s"));
        move_file(src, &dest).await?;
        self.init_emitted.insert(stream);
        Ok(true)
    }

    /// Place one media segment under its renumbered name.
    pub async fn emit_media(&mut self, src: &Path, stream: u32, raw_number: u64) -> Result<()> {
        let dest = self.out_dir.join(self.emitted_name(stream, raw_number));
        move_file(src, &dest).await
    }

    /// Emit a fully downloaded chunk from its staging dir, in interleaved
    /// order, then advance the offsets by the chunk's counts.
    pub async fn emit_chunk(
        &mut self,
        stage_dir: &Path,
        download: &ChunkDownload,
        include_init: bool,
    ) -> Result<()> {
        if include_init {
            for (stream, name) in &download.inits {
                self.emit_init(&stage_dir.join(name), *stream).await?;
            }
        }
        let mut media = download.media.clone();
        sort_for_emission(&mut media);
        for segment in &media {
            let src = stage_dir.join(&segment.name);
            if !src.exists() {
                warn!(file = %segment.name, "listed segment missing from stage dir");
                continue;
            }
            self.emit_media(&src, segment.stream, segment.number).await?;
        }
        self.offsets.advance(&download.counts);
        Ok(())
    }

    pub fn offsets(&self) -> &StreamOffsets {
        &self.offsets
    }

    pub fn has_init(&self, stream: u32) -> bool {
        self.init_emitted.contains(&stream)
    }
}

/// Rename with a copy fallback for cross-device stage/output splits.
async fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dest).await?;
    let _ = tokio::fs::remove_file(src).await;
    Ok(())
}

/// Scan an output directory for the manifest-gate preconditions.
pub fn output_has_init_and_media(dir: &Path) -> (bool, bool) {
    let mut has_init = false;
    let mut has_media = false;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                match classify(name) {
                    Some(SegmentKind::Init { .. }) => has_init = true,
                    Some(SegmentKind::Media { .. }) => has_media = true,
                    _ => {}
                }
            }
            if has_init && has_media {
                break;
            }
        }
    }
    (has_init, has_media)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(classify("out.mpd"), Some(SegmentKind::Manifest));
        assert_eq!(classify("media.m3u8"), Some(SegmentKind::Manifest));
        assert_eq!(
            classify("init-stream0.m4s"),
            Some(SegmentKind::Init { stream: 0 })
        );
        assert_eq!(
            classify("chunk-stream1-00042.m4s"),
            Some(SegmentKind::Media {
                stream: 1,
                number: 42
            })
        );
        assert_eq!(classify("ffmpeg.log"), None);
        assert_eq!(classify("chunk-stream1-abc.m4s"), None);
    }

    #[test]
    fn emission_order_interleaves_streams() {
        let mut segments = vec![
            MediaSegment { stream: 0, number: 1, name: "chunk-stream0-00001.m4s".into() },
            MediaSegment { stream: 0, number: 2, name: "chunk-stream0-00002.m4s".into() },
            MediaSegment { stream: 0, number: 3, name: "chunk-stream0-00003.m4s".into() },
            MediaSegment { stream: 1, number: 1, name: "chunk-stream1-00001.m4s".into() },
            MediaSegment { stream: 1, number: 2, name: "chunk-stream1-00002.m4s".into() },
        ];
        sort_for_emission(&mut segments);
        let order: Vec<(u64, u32)> = segments.iter().map(|s| (s.number, s.stream)).collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0), (2, 1), (3, 0)]);
    }

    #[test]
    fn offsets_accumulate_per_stream() {
        let mut offsets = StreamOffsets::default();
        let mut counts = DownloadCounts::default();
        counts.record(0, 75);
        counts.record(1, 75);
        offsets.advance(&counts);
        assert_eq!(offsets.offset(0), 75);

        let mut second = DownloadCounts::default();
        second.record(0, 73);
        offsets.advance(&second);
        assert_eq!(offsets.offset(0), 148);
        assert_eq!(offsets.offset(1), 75);
        // A stream never seen has offset zero.
        assert_eq!(offsets.offset(2), 0);
    }

    #[test]
    fn counts_take_the_max_raw_number() {
        let mut counts = DownloadCounts::default();
        counts.record(0, 3);
        counts.record(0, 1);
        counts.record(0, 7);
        assert_eq!(counts.video(), 7);
        assert_eq!(counts.audio(), 0);
    }

    #[tokio::test]
    async fn sink_renumbers_with_skip_base_and_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let stage = tmp.path().join("stage");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&stage).unwrap();
        std::fs::create_dir_all(&out).unwrap();

        // skip_to_segment=5 -> skip_base=4
        let mut sink = SegmentSink::new(&out, 4);
        assert_eq!(sink.emitted_name(0, 1), "chunk-stream0-00005.m4s");

        std::fs::write(stage.join("init-stream0.m4s"), b"init").unwrap();
        std::fs::write(stage.join("chunk-stream0-00001.m4s"), b"a").unwrap();
        std::fs::write(stage.join("chunk-stream0-00002.m4s"), b"b").unwrap();

        let mut download = ChunkDownload {
            manifest: None,
            inits: vec![(0, "init-stream0.m4s".into())],
            media: vec![
                MediaSegment { stream: 0, number: 1, name: "chunk-stream0-00001.m4s".into() },
                MediaSegment { stream: 0, number: 2, name: "chunk-stream0-00002.m4s".into() },
            ],
            counts: DownloadCounts::default(),
        };
        download.counts.record(0, 2);

        sink.emit_chunk(&stage, &download, true).await.unwrap();
        assert!(out.join("init-stream0.m4s").exists());
        assert!(out.join("chunk-stream0-00005.m4s").exists());
        assert!(out.join("chunk-stream0-00006.m4s").exists());
        // Next chunk's raw 1 lands after this chunk's segments.
        assert_eq!(sink.emitted_name(0, 1), "chunk-stream0-00007.m4s");

        let (has_init, has_media) = output_has_init_and_media(&out);
        assert!(has_init && has_media);
    }

    #[tokio::test]
    async fn duplicate_init_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let src1 = tmp.path().join("init-stream0.m4s");
        std::fs::write(&src1, b"first").unwrap();
        let src2 = tmp.path().join("other-init-stream0.m4s");
        std::fs::write(&src2, b"second").unwrap();

        let mut sink = SegmentSink::new(&out, 0);
        assert!(sink.emit_init(&src1, 0).await.unwrap());
        assert!(!sink.emit_init(&src2, 0).await.unwrap());
        assert_eq!(
            std::fs::read(out.join("init-stream0.m4s")).unwrap(),
            b"first"
        );
    }

    #[test]
    fn done_sentinel_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_done_sentinel(tmp.path()).is_none());
        let mut counts = DownloadCounts::default();
        counts.record(0, 75);
        counts.record(1, 74);
        write_done_sentinel(tmp.path(), &counts).unwrap();
        let back = read_done_sentinel(tmp.path()).unwrap();
        assert_eq!(back.video(), 75);
        assert_eq!(back.audio(), 74);
    }
}
