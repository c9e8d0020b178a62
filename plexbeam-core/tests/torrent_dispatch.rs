//! Two workers, BitTorrent-style dispatch, end to end against mock workers.
//!
//! A 600 s source with 300 s chunks yields two chunks: chunk 0 seeds on the
//! first (fastest-ranked) worker, chunk 1 on the second. Both workers are
//! `@local` so no beam uploads run and the test needs no ffmpeg. Segments
//! are byte-stamped per job so the test can prove which worker's output
//! landed where and that chunk 1 was renumbered past chunk 0's counts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use plexbeam_config::{Config, MultiMode, Source, StateLayout};
use plexbeam_core::client::build_http_client;
use plexbeam_core::dispatch::{multi, partial_output_salvageable, DispatchOutcome};
use plexbeam_core::events::EventLog;
use plexbeam_core::invocation::ParsedInvocation;
use plexbeam_core::pool::{parse_pool_spec, probe_pool};
use plexbeam_core::session::Session;

/// Status polls a job stays `running` before reporting `completed`.
const POLLS_UNTIL_DONE: u32 = 3;

#[derive(Clone)]
struct MockWorker {
    hw_accel: &'static str,
    fps: f64,
    /// Fail every job except chunk 0's after a few running polls.
    fail_tail: bool,
    polls: Arc<Mutex<HashMap<String, Arc<AtomicU32>>>>,
    cancelled: Arc<Mutex<Vec<String>>>,
}

impl MockWorker {
    fn new(hw_accel: &'static str, fps: f64) -> Self {
        Self {
            hw_accel,
            fps,
            fail_tail: false,
            polls: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn with_failing_tail(hw_accel: &'static str, fps: f64) -> Self {
        Self {
            fail_tail: true,
            ..Self::new(hw_accel, fps)
        }
    }

    fn poll_counter(&self, job: &str) -> Arc<AtomicU32> {
        self.polls
            .lock()
            .unwrap()
            .entry(job.to_string())
            .or_default()
            .clone()
    }
}

fn chunk_listing() -> Vec<String> {
    vec![
        "out.mpd".into(),
        "init-stream0.m4s".into(),
        "init-stream1.m4s".into(),
        "chunk-stream0-00001.m4s".into(),
        "chunk-stream0-00002.m4s".into(),
        "chunk-stream1-00001.m4s".into(),
        "chunk-stream1-00002.m4s".into(),
    ]
}

async fn serve_mock(state: MockWorker) -> String {
    let app = Router::new()
        .route(
            "/health",
            get(|State(state): State<MockWorker>| async move {
                Json(json!({"status":"healthy","hw_accel":state.hw_accel}))
            }),
        )
        .route(
            "/probe",
            get(|| async { Json(json!({"duration": 600.0})) }),
        )
        .route(
            "/transcode",
            post(|Json(_body): Json<Value>| async move { Json(json!({"status":"queued"})) }),
        )
        .route(
            "/status/{job}",
            get(|State(state): State<MockWorker>, UrlPath(job): UrlPath<String>| async move {
                let polls = state.poll_counter(&job).fetch_add(1, Ordering::SeqCst);
                if state.fail_tail && !job.ends_with("_c0") {
                    // Linger long enough for chunk 0 to finish, then die on
                    // every retry.
                    return if polls < 4 {
                        Json(json!({
                            "status": "running",
                            "fps": state.fps,
                            "speed": state.fps / 24.0,
                            "out_time_ms": 1_000 * u64::from(polls),
                            "frame": 24 * u64::from(polls),
                        }))
                    } else {
                        Json(json!({"status": "failed", "error": "encoder crashed"}))
                    };
                }
                if polls < POLLS_UNTIL_DONE {
                    Json(json!({
                        "status": "running",
                        "fps": state.fps,
                        "speed": state.fps / 24.0,
                        "out_time_ms": 1_000 * u64::from(polls),
                        "frame": 24 * u64::from(polls),
                    }))
                } else {
                    Json(json!({"status": "completed", "fps": state.fps, "progress": 1.0}))
                }
            }),
        )
        .route(
            "/beam/segments/{job}",
            get(|UrlPath(_job): UrlPath<String>| async move {
                Json(json!({ "files": chunk_listing() }))
            }),
        )
        .route(
            "/beam/segment/{job}/{name}",
            get(
                |UrlPath((job, name)): UrlPath<(String, String)>| async move {
                    if name.ends_with(".mpd") {
                        format!(r#"<MPD job="{job}"><SegmentTemplate startNumber="1"/></MPD>"#)
                    } else {
                        format!("{job}:{name}")
                    }
                },
            ),
        )
        .route(
            "/job/{job}",
            delete(|State(state): State<MockWorker>, UrlPath(job): UrlPath<String>| async move {
                state.cancelled.lock().unwrap().push(job);
                Json(json!({"status":"cancelled"}))
            }),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
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

#[tokio::test]
async fn two_worker_torrent_dispatch_reassembles_the_timeline() {
    // nvenc ranks ahead of qsv, so the nvenc mock must own chunk 0.
    let fast = MockWorker::new("nvenc", 200.0);
    let slow = MockWorker::new("qsv", 120.0);
    let fast_base = serve_mock(fast.clone()).await;
    let slow_base = serve_mock(slow.clone()).await;

    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();

    let argv: Vec<String> = [
        "-i",
        "/m/film.mkv",
        "-codec:0",
        "libx264",
        "-f",
        "dash",
        out_dir.join("dash").to_str().unwrap(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let invocation = ParsedInvocation::parse(&argv, tmp.path()).unwrap();

    let config = test_config(tmp.path());
    let state = StateLayout::new(&config.state_dir);
    let session = Session::attach("20260801T000000_2", state.session_dir("s2")).unwrap();
    let events = EventLog::new(&state, session.id());

    // Declare both as @local: duration comes from /probe and no beam
    // uploads are attempted.
    let spec = format!("{slow_base}@local,{fast_base}@local");
    let entries = parse_pool_spec(&spec).unwrap();
    let http = build_http_client();
    let workers = probe_pool(&entries, &http, None).await;
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].url().as_str(), format!("{fast_base}/"));

    let outcome = multi::run(
        &invocation,
        &config,
        &session,
        &events,
        http,
        workers,
        None,
    )
    .await
    .unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    let c0_job = session.chunk_job_id(0);
    let c1_job = session.chunk_job_id(1);

    // Init segments and the manifest come from chunk 0's worker.
    let init0 = std::fs::read_to_string(out_dir.join("init-stream0.m4s")).unwrap();
    assert_eq!(init0, format!("{c0_job}:init-stream0.m4s"));
    let manifest = std::fs::read_to_string(out_dir.join("out.mpd")).unwrap();
    assert!(manifest.contains(&c0_job));

    // Chunk 0 keeps raw numbering; chunk 1 is renumbered past chunk 0's
    // two segments per stream.
    for (name, job, raw) in [
        ("chunk-stream0-00001.m4s", &c0_job, "chunk-stream0-00001.m4s"),
        ("chunk-stream0-00002.m4s", &c0_job, "chunk-stream0-00002.m4s"),
        ("chunk-stream0-00003.m4s", &c1_job, "chunk-stream0-00001.m4s"),
        ("chunk-stream0-00004.m4s", &c1_job, "chunk-stream0-00002.m4s"),
        ("chunk-stream1-00003.m4s", &c1_job, "chunk-stream1-00001.m4s"),
    ] {
        let body = std::fs::read_to_string(out_dir.join(name))
            .unwrap_or_else(|_| panic!("missing {name}"));
        assert_eq!(body, format!("{job}:{raw}"), "wrong origin for {name}");
    }

    // Teardown cancelled every tracked job on both workers.
    let fast_cancelled = fast.cancelled.lock().unwrap().clone();
    let slow_cancelled = slow.cancelled.lock().unwrap().clone();
    assert!(
        fast_cancelled.iter().any(|job| job == &c0_job),
        "chunk 0 job not cancelled on its worker"
    );
    assert!(
        slow_cancelled.iter().any(|job| job == &c1_job),
        "chunk 1 job not cancelled on its worker"
    );
}

/// An aborted dispatch that already emitted chunk 0 counts as a success.
///
/// Chunk 1 fails on every attempt until the fail-fast threshold kills the
/// dispatch, but by then chunk 0's init segments, media segments, and
/// manifest are in the output directory. With no local transcoder
/// configured the cartridge must still exit 0: a short stream beats a dead
/// transcoder from the media server's point of view.
#[tokio::test]
async fn aborted_dispatch_with_emitted_segments_is_a_partial_success() {
    let fast = MockWorker::with_failing_tail("nvenc", 200.0);
    let slow = MockWorker::with_failing_tail("qsv", 120.0);
    let fast_base = serve_mock(fast.clone()).await;
    let slow_base = serve_mock(slow.clone()).await;

    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();

    let argv: Vec<String> = [
        "-i",
        "/m/film.mkv",
        "-codec:0",
        "libx264",
        "-f",
        "dash",
        out_dir.join("dash").to_str().unwrap(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let invocation = ParsedInvocation::parse(&argv, tmp.path()).unwrap();

    let config = test_config(tmp.path());
    let state = StateLayout::new(&config.state_dir);
    let session = Session::attach("20260801T000000_3", state.session_dir("s3")).unwrap();
    let events = EventLog::new(&state, session.id());

    let spec = format!("{slow_base}@local,{fast_base}@local");
    let entries = parse_pool_spec(&spec).unwrap();
    let http = build_http_client();
    let workers = probe_pool(&entries, &http, None).await;
    assert_eq!(workers.len(), 2);

    let outcome = multi::run(
        &invocation,
        &config,
        &session,
        &events,
        http,
        workers,
        None,
    )
    .await
    .unwrap();
    assert_eq!(outcome, DispatchOutcome::Failed);

    // Chunk 0 made it out before the abort.
    let c0_job = session.chunk_job_id(0);
    let init0 = std::fs::read_to_string(out_dir.join("init-stream0.m4s")).unwrap();
    assert_eq!(init0, format!("{c0_job}:init-stream0.m4s"));
    assert!(out_dir.join("chunk-stream0-00001.m4s").exists());

    // This is the check the cartridge runs before its no-fallback bail;
    // true here means the process exits 0 instead of 1.
    assert!(partial_output_salvageable(&invocation.output_dir));
}
