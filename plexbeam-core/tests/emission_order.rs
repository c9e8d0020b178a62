//! Emission ordering across out-of-order chunk downloads.
//!
//! Downloads may finish in any order; the output directory must still fill
//! strictly by chunk index, with init segments taken from chunk 0 only and
//! later chunks renumbered past the earlier chunks' counts.

use std::path::Path;

use plexbeam_config::{Config, MultiMode, Source, StateLayout};
use plexbeam_core::aggregate::{write_done_sentinel, DownloadCounts};
use plexbeam_core::client::{build_http_client, WorkerClient};
use plexbeam_core::dispatch::multi::chunks::{plan_chunks, ChunkState};
use plexbeam_core::dispatch::multi::runtime::MultiRuntime;
use plexbeam_core::events::EventLog;
use plexbeam_core::invocation::ParsedInvocation;
use plexbeam_core::pool::{EncoderClass, Worker, WorkerTag};
use plexbeam_core::session::Session;

fn fake_worker() -> Worker {
    Worker {
        client: WorkerClient::new(
            build_http_client(),
            url::Url::parse("http://127.0.0.1:1/").unwrap(),
            None,
        ),
        tag: WorkerTag::Local,
        encoder_class: EncoderClass::Unknown,
    }
}

fn test_config(state_dir: &Path) -> Config {
    Config {
        multi_mode: MultiMode::Torrent,
        chunk_duration_secs: 300,
        upload_rate: 0,
        beam_direct: false,
        worker_pool: None,
        remote_worker_url: None,
        pull_proxy_url: None,
        pull_dir: state_dir.join("pull"),
        staged_upload: false,
        api_key: None,
        source: Source::Plex,
        state_dir: state_dir.to_path_buf(),
        log_filter: None,
        ffmpeg_path: "ffmpeg".into(),
        ffprobe_path: "ffprobe".into(),
        real_transcoder: None,
        shared_segment_dir: None,
        callback_url: None,
    }
}

/// Put a fake downloaded chunk into its staging dir: one video + one audio
/// segment, plus init/manifest so chunk 0 has something to contribute.
fn stage_chunk(session: &Session, index: usize, tag: &str) {
    let stage = session.layout().chunk_stage_dir(index);
    std::fs::create_dir_all(&stage).unwrap();
    std::fs::write(stage.join("init-stream0.m4s"), format!("{tag}-init0")).unwrap();
    std::fs::write(stage.join("init-stream1.m4s"), format!("{tag}-init1")).unwrap();
    std::fs::write(stage.join("out.mpd"), format!("{tag}-mpd")).unwrap();
    std::fs::write(
        stage.join("chunk-stream0-00001.m4s"),
        format!("{tag}-v1"),
    )
    .unwrap();
    std::fs::write(
        stage.join("chunk-stream1-00001.m4s"),
        format!("{tag}-a1"),
    )
    .unwrap();
    let mut counts = DownloadCounts::default();
    counts.by_stream.insert(0, 1);
    counts.by_stream.insert(1, 1);
    write_done_sentinel(&stage, &counts).unwrap();
}

#[tokio::test]
async fn chunks_emit_in_index_order_with_chunk0_init_only() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();

    let argv: Vec<String> = [
        "-i",
        "/m/film.mkv",
        out_dir.join("dash").to_str().unwrap(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let invocation = ParsedInvocation::parse(&argv, tmp.path()).unwrap();

    let config = test_config(tmp.path());
    let state = StateLayout::new(tmp.path());
    let session = Session::attach("20260801T000000_9", state.session_dir("s")).unwrap();
    let events = EventLog::new(&state, session.id());

    let chunks = plan_chunks(900.0, 0.0, 300);
    assert_eq!(chunks.len(), 3);

    let mut runtime = MultiRuntime::new(
        &invocation,
        &config,
        &session,
        &events,
        build_http_client(),
        vec![fake_worker(), fake_worker()],
        chunks,
    );

    // Chunks 1 and 2 finish downloading before chunk 0 does.
    for index in [1, 2] {
        stage_chunk(&session, index, &format!("c{index}"));
        runtime.chunks[index].state = ChunkState::Downloading;
    }
    runtime.pump_emission().await.unwrap();
    assert!(
        std::fs::read_dir(&out_dir).unwrap().next().is_none(),
        "nothing may emit before chunk 0"
    );

    // Chunk 0 lands; the whole backlog drains in order.
    stage_chunk(&session, 0, "c0");
    runtime.chunks[0].state = ChunkState::Downloading;
    runtime.pump_emission().await.unwrap();

    assert_eq!(runtime.next_processable, 3);
    assert!(runtime.all_completed());

    // Init segments and manifest come from chunk 0 only.
    assert_eq!(
        std::fs::read_to_string(out_dir.join("init-stream0.m4s")).unwrap(),
        "c0-init0"
    );
    assert_eq!(
        std::fs::read_to_string(out_dir.join("out.mpd")).unwrap(),
        "c0-mpd"
    );

    // Renumbering: raw 1 of chunk N lands at N * count + 1.
    assert_eq!(
        std::fs::read_to_string(out_dir.join("chunk-stream0-00001.m4s")).unwrap(),
        "c0-v1"
    );
    assert_eq!(
        std::fs::read_to_string(out_dir.join("chunk-stream0-00002.m4s")).unwrap(),
        "c1-v1"
    );
    assert_eq!(
        std::fs::read_to_string(out_dir.join("chunk-stream0-00003.m4s")).unwrap(),
        "c2-v1"
    );
    assert_eq!(
        std::fs::read_to_string(out_dir.join("chunk-stream1-00002.m4s")).unwrap(),
        "c1-a1"
    );
}
