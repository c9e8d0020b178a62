//! Copy-remux children and the upload paths that feed workers.
//!
//! A "beam" is a Matroska copy-remux of an input time range, streamed over
//! HTTP to a worker that cannot read the source file itself. The remux child
//! writes to stdout; we wrap that pipe in a chunked request body, optionally
//! throttled to `PLEXBEAM_UPLOAD_RATE` bytes per second.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::client::{ClientError, ClientResult, PullProxyClient, WorkerClient};
use crate::error::{BeamError, Result};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Interval of the source to remux.
#[derive(Debug, Clone, Copy)]
pub struct RemuxInterval {
    pub ss: f64,
    pub t: Option<f64>,
}

impl RemuxInterval {
    pub fn whole() -> Self {
        Self { ss: 0.0, t: None }
    }

    pub fn window(ss: f64, t: f64) -> Self {
        Self { ss, t: Some(t) }
    }
}

/// Spawn `ffmpeg -ss .. -i input -t .. -map 0 -c copy -f matroska -`.
///
/// `kill_on_drop` is set so an aborted upload task reliably tears the remux
/// down with it.
pub fn spawn_remux(ffmpeg: &Path, input: &str, interval: RemuxInterval) -> Result<Child> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    if interval.ss > 0.0 {
        cmd.arg("-ss").arg(format!("{:.3}", interval.ss));
    }
    cmd.arg("-i").arg(input);
    if let Some(t) = interval.t {
        cmd.arg("-t").arg(format!("{t:.3}"));
    }
    cmd.arg("-map")
        .arg("0")
        .arg("-c")
        .arg("copy")
        .arg("-f")
        .arg("matroska")
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    Ok(cmd.spawn()?)
}

/// Wrap an async reader in a chunked request body.
///
/// With a non-zero rate the body paces itself so `bytes_sent / elapsed`
/// never exceeds the configured bytes-per-second.
pub fn upload_body<R>(reader: R, rate: u64) -> reqwest::Body
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    if rate == 0 {
        return reqwest::Body::wrap_stream(ReaderStream::with_capacity(
            reader,
            UPLOAD_CHUNK_BYTES,
        ));
    }

    let stream = async_stream::stream! {
        let mut reader = reader;
        let started = tokio::time::Instant::now();
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    sent += n as u64;
                    let due = Duration::from_secs_f64(sent as f64 / rate as f64);
                    let elapsed = started.elapsed();
                    if due > elapsed {
                        tokio::time::sleep(due - elapsed).await;
                    }
                    yield Ok::<Vec<u8>, std::io::Error>(buf[..n].to_vec());
                }
                Err(error) => {
                    yield Err(error);
                    break;
                }
            }
        }
    };
    reqwest::Body::wrap_stream(stream)
}

/// Body for a remux child's stdout.
pub fn remux_body(stdout: ChildStdout, rate: u64) -> reqwest::Body {
    upload_body(stdout, rate)
}

/// A beam upload running in the background.
///
/// The remux child lives inside the task, so aborting the handle kills the
/// child through `kill_on_drop`.
#[derive(Debug)]
pub struct Upload {
    handle: JoinHandle<ClientResult<()>>,
    pub job_id: String,
}

impl Upload {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Join the task; aborted uploads report as failures.
    pub async fn finish(self) -> ClientResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) => {
                debug!(%join_error, "upload task did not complete");
                Err(ClientError::Body {
                    url: String::new(),
                    message: "upload task aborted".into(),
                })
            }
        }
    }
}

/// Start a background chunked upload of `interval` to
/// `POST /beam/stream/<job_id>`.
pub fn start_beam_upload(
    client: WorkerClient,
    job_id: String,
    ffmpeg: &Path,
    input: &str,
    interval: RemuxInterval,
    rate: u64,
) -> Result<Upload> {
    let mut child = spawn_remux(ffmpeg, input, interval)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BeamError::Protocol("remux child has no stdout pipe".into()))?;
    let body = remux_body(stdout, rate);

    let id = job_id.clone();
    let handle = tokio::spawn(async move {
        let result = client.beam_stream(&id, body).await;
        match child.wait().await {
            Ok(status) if !status.success() => {
                warn!(job = %id, %status, "remux child exited non-zero");
            }
            Err(error) => warn!(job = %id, %error, "remux child wait failed"),
            _ => {}
        }
        result
    });

    Ok(Upload { handle, job_id })
}

/// Upload the remuxed input through the S3 pull proxy and return the
/// pre-signed URL to hand the worker as `pull_url`.
pub async fn upload_via_pull_proxy(
    proxy: &PullProxyClient,
    object: &str,
    ffmpeg: &Path,
    input: &str,
    interval: RemuxInterval,
    rate: u64,
) -> Result<String> {
    let mut child = spawn_remux(ffmpeg, input, interval)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BeamError::Protocol("remux child has no stdout pipe".into()))?;
    let body = remux_body(stdout, rate);

    let url = proxy
        .upload(object, body)
        .await
        .map_err(|e| BeamError::Protocol(format!("pull proxy upload failed: {e}")))?;
    let status = child.wait().await?;
    if !status.success() {
        return Err(BeamError::Protocol(format!(
            "remux child exited {status} during staged upload"
        )));
    }
    Ok(url)
}

/// Full-file staged upload to `PUT /beam/stage/<id>`.
pub async fn staged_upload(client: &WorkerClient, stage_id: &str, input: &Path) -> Result<()> {
    let file = tokio::fs::File::open(input).await?;
    let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, UPLOAD_CHUNK_BYTES));
    client
        .stage_upload(stage_id, body)
        .await
        .map_err(|e| BeamError::Protocol(format!("staged upload failed: {e}")))?;
    Ok(())
}

/// Background upload of the raw source bytes, no remux.
///
/// Used when `PLEXBEAM_BEAM_DIRECT` is set and the whole file is wanted
/// anyway; interval uploads always remux because a byte range of a
/// container is not a playable stream.
pub fn start_direct_upload(
    client: WorkerClient,
    job_id: String,
    input: &Path,
    rate: u64,
) -> Result<Upload> {
    let input = input.to_path_buf();
    let id = job_id.clone();
    let handle = tokio::spawn(async move {
        let file = match tokio::fs::File::open(&input).await {
            Ok(file) => file,
            Err(error) => {
                warn!(job = %id, %error, "direct upload cannot open input");
                return Err(ClientError::Body {
                    url: String::new(),
                    message: error.to_string(),
                });
            }
        };
        let body = upload_body(file, rate);
        client.beam_stream(&id, body).await
    });
    Ok(Upload { handle, job_id })
}
