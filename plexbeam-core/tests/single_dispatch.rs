//! End-to-end single-worker dispatch against an in-process mock worker.
//!
//! The mock implements the slice of the worker HTTP contract the dispatcher
//! touches: health, submission, status polling, segment listing/serving,
//! and job cancellation. The worker is tagged `@local` so the test stays
//! hermetic (no remux child, no upload).

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use plexbeam_config::{Config, MultiMode, Source, StateLayout};
use plexbeam_core::client::build_http_client;
use plexbeam_core::dispatch::single::SingleWorkerDispatcher;
use plexbeam_core::dispatch::DispatchOutcome;
use plexbeam_core::events::EventLog;
use plexbeam_core::invocation::ParsedInvocation;
use plexbeam_core::pool::{parse_pool_spec, probe_pool, EncoderClass};
use plexbeam_core::session::Session;

#[derive(Clone)]
struct MockWorker {
    status_polls: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
    submitted: Arc<std::sync::Mutex<Option<Value>>>,
}

impl MockWorker {
    fn new() -> Self {
        Self {
            status_polls: Arc::new(AtomicU32::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            submitted: Arc::new(std::sync::Mutex::new(None)),
        }
    }
}

const SEGMENT_FILES: &[&str] = &[
    "out.mpd",
    "init-stream0.m4s",
    "init-stream1.m4s",
    "chunk-stream0-00001.m4s",
    "chunk-stream1-00001.m4s",
    "chunk-stream0-00002.m4s",
];

async fn serve_mock(state: MockWorker) -> String {
    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(json!({"status":"healthy","hw_accel":"nvenc"})) }),
        )
        .route(
            "/transcode",
            post(
                |State(state): State<MockWorker>, Json(body): Json<Value>| async move {
                    *state.submitted.lock().unwrap() = Some(body);
                    Json(json!({"status":"pending"}))
                },
            ),
        )
        .route(
            "/status/{job}",
            get(|State(state): State<MockWorker>, UrlPath(_job): UrlPath<String>| async move {
                let polls = state.status_polls.fetch_add(1, Ordering::SeqCst);
                if polls < 9 {
                    Json(json!({
                        "status": "running",
                        "fps": 120.0,
                        "speed": 4.0,
                        "out_time_ms": 10_000,
                        "frame": 240,
                        "progress": 0.1,
                    }))
                } else {
                    Json(json!({"status": "completed", "progress": 1.0}))
                }
            }),
        )
        .route(
            "/beam/segments/{job}",
            get(|UrlPath(_job): UrlPath<String>| async move {
                Json(json!({ "files": SEGMENT_FILES }))
            }),
        )
        .route(
            "/beam/segment/{job}/{name}",
            get(
                |UrlPath((_job, name)): UrlPath<(String, String)>| async move {
                    if name.ends_with(".mpd") {
                        r#"<MPD><SegmentTemplate startNumber="1"/></MPD>"#.to_string()
                    } else {
                        format!("bytes-of-{name}")
                    }
                },
            ),
        )
        .route(
            "/job/{job}",
            delete(|State(state): State<MockWorker>, UrlPath(_job): UrlPath<String>| async move {
                state.cancelled.store(true, Ordering::SeqCst);
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

fn test_config(state_dir: &Path, pull_dir: &Path) -> Config {
    Config {
        multi_mode: MultiMode::Torrent,
        chunk_duration_secs: 300,
        upload_rate: 0,
        beam_direct: false,
        worker_pool: None,
        remote_worker_url: None,
        pull_proxy_url: None,
        pull_dir: pull_dir.to_path_buf(),
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
async fn probe_ranks_live_workers() {
    let mock = MockWorker::new();
    let base = serve_mock(mock).await;

    let spec = format!("{base}@local,http://127.0.0.1:9/dead");
    let entries = parse_pool_spec(&spec).unwrap();
    let workers = probe_pool(&entries, &build_http_client(), None).await;

    assert_eq!(workers.len(), 1, "dead worker must be dropped");
    assert_eq!(workers[0].encoder_class, EncoderClass::Nvenc);
}

#[tokio::test]
async fn single_worker_happy_path_emits_all_segments() {
    let mock = MockWorker::new();
    let base = serve_mock(mock.clone()).await;

    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("Transcode/Sessions/abc");
    std::fs::create_dir_all(&out_dir).unwrap();
    let output_target = out_dir.join("dash");

    let argv: Vec<String> = [
        "-i",
        "/m/film.mkv",
        "-codec:0",
        "libx264",
        "-codec:1",
        "aac",
        "-f",
        "dash",
        output_target.to_str().unwrap(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let invocation = ParsedInvocation::parse(&argv, tmp.path()).unwrap();

    let config = test_config(tmp.path(), &tmp.path().join("pull"));
    let state = StateLayout::new(&config.state_dir);
    let session = Session::attach("20260801T000000_1", state.session_dir("s1")).unwrap();
    let events = EventLog::new(&state, session.id());

    let entries = parse_pool_spec(&format!("{base}@local")).unwrap();
    let http = build_http_client();
    let workers = probe_pool(&entries, &http, None).await;
    assert_eq!(workers.len(), 1);

    let dispatcher =
        SingleWorkerDispatcher::new(&workers[0], &invocation, &config, &session, &events, http);
    let outcome = dispatcher.run().await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Completed);

    // Everything the worker listed must land in the output dir, raw
    // numbering preserved (no skip_to_segment in the argv).
    for name in [
        "init-stream0.m4s",
        "init-stream1.m4s",
        "chunk-stream0-00001.m4s",
        "chunk-stream1-00001.m4s",
        "chunk-stream0-00002.m4s",
        "out.mpd",
    ] {
        assert!(out_dir.join(name).exists(), "missing {name}");
    }

    // The submitted job carried the contract fields for a local worker.
    let submitted = mock.submitted.lock().unwrap().clone().unwrap();
    assert_eq!(submitted["input"]["type"], "file");
    assert_eq!(submitted["beam_stream"], false);
    assert_eq!(submitted["source"], "plex");
    assert_eq!(submitted["metadata"]["session_id"], "20260801T000000_1");
    let raw_args = submitted["arguments"]["raw_args"].as_array().unwrap();
    assert_eq!(raw_args.last().unwrap(), "dash");

    // Teardown cancels the job even after success.
    assert!(mock.cancelled.load(Ordering::SeqCst));

    // Session artifacts were captured.
    assert!(session.layout().job_request_json().exists());
    assert!(session.layout().job_response_json().exists());
    assert!(session.layout().job_completed_json().exists());
}
