//! Forged FFmpeg telemetry that keeps the media server's session alive.
//!
//! The media server watches two channels: stderr lines shaped exactly like
//! FFmpeg's own `frame= ... speed=` status output, and a form-encoded POST
//! to its progress callback. Both must keep flowing at ~1 Hz even when
//! `out_time_us` is 0 (seeks), or the session is reaped after ~60 s.

use std::io::Write;
use std::time::Duration;

use tracing::debug;

use plexbeam_contracts::progress::ProgressBody;

/// `HH:MM:SS.ff` with centisecond precision, FFmpeg style.
pub fn format_clock(out_time_us: i64) -> String {
    let total_cs = (out_time_us.max(0)) / 10_000;
    let cs = total_cs % 100;
    let total_secs = total_cs / 100;
    let secs = total_secs % 60;
    let mins = (total_secs / 60) % 60;
    let hours = total_secs / 3600;
    format!("{hours:02}:{mins:02}:{secs:02}.{cs:02}")
}

/// One status line in the exact shape FFmpeg prints on stderr.
///
/// `speed` carries one decimal because that is what FFmpeg itself prints
/// and what the media server's parser is written against; the terminal
/// line must read exactly `speed=0.0x`.
pub fn format_stderr_line(body: &ProgressBody) -> String {
    format!(
        "frame={} fps={:.1} q=-1.0 size=N/A time={} bitrate=N/A speed={:.1}x",
        body.frame,
        body.fps,
        format_clock(body.out_time_us),
        body.speed
    )
}

/// The multi-worker `out_time_us` approximation: whole completed chunks plus
/// the wall-clock progress of the earliest still-running chunk, capped at
/// one chunk. Monotonic as long as completed-chunk count never regresses.
pub fn approx_out_time_us(
    completed_chunks: u64,
    chunk_duration: Duration,
    earliest_running_elapsed: Option<Duration>,
) -> i64 {
    let running = earliest_running_elapsed
        .unwrap_or(Duration::ZERO)
        .min(chunk_duration);
    ((completed_chunks as u128 * chunk_duration.as_micros()) + running.as_micros()) as i64
}

/// Emits the stderr line and the progress POST.
pub struct ProgressReporter {
    http: reqwest::Client,
    progress_url: Option<String>,
    sink: Box<dyn Write + Send>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("progress_url", &self.progress_url)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(
        http: reqwest::Client,
        progress_url: Option<String>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            http,
            progress_url,
            sink,
        }
    }

    pub fn to_stderr(http: reqwest::Client, progress_url: Option<String>) -> Self {
        Self::new(http, progress_url, Box::new(std::io::stderr()))
    }

    /// Emit one snapshot on both channels.
    ///
    /// stderr write failures (the media server closed the pipe) are ignored:
    /// dying on EPIPE mid-dispatch would orphan every remote job.
    pub async fn emit(&mut self, body: ProgressBody) {
        let line = format_stderr_line(&body);
        let _ = writeln!(self.sink, "{line}");
        let _ = self.sink.flush();

        if let Some(url) = &self.progress_url {
            let result = self
                .http
                .post(url)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .timeout(Duration::from_secs(5))
                .body(body.to_form())
                .send()
                .await;
            if let Err(error) = result {
                debug!(%error, "progress callback POST failed");
            }
        }
    }

    /// The final line a real FFmpeg prints when it stops.
    pub async fn emit_terminal(&mut self, out_time_us: i64) {
        self.emit(ProgressBody {
            frame: 9999,
            fps: 0.0,
            speed: 0.0,
            out_time_us,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_formatting() {
        assert_eq!(format_clock(0), "00:00:00.00");
        assert_eq!(format_clock(41_360_000), "00:00:41.36");
        assert_eq!(format_clock(3_661_500_000), "01:01:01.50");
        assert_eq!(format_clock(-5), "00:00:00.00");
    }

    #[test]
    fn stderr_line_shape() {
        let body = ProgressBody {
            frame: 1034,
            fps: 187.5,
            speed: 6.5,
            out_time_us: 41_360_000,
        };
        assert_eq!(
            format_stderr_line(&body),
            "frame=1034 fps=187.5 q=-1.0 size=N/A time=00:00:41.36 bitrate=N/A speed=6.5x"
        );
    }

    #[test]
    fn terminal_line_shape() {
        let body = ProgressBody {
            frame: 9999,
            fps: 0.0,
            speed: 0.0,
            out_time_us: 0,
        };
        let line = format_stderr_line(&body);
        assert!(line.starts_with("frame=9999 "));
        assert!(line.ends_with("speed=0.0x"));
    }

    #[test]
    fn out_time_approximation_is_capped_and_monotonic() {
        let chunk = Duration::from_secs(300);
        // Two completed chunks, third running for 40 s.
        assert_eq!(
            approx_out_time_us(2, chunk, Some(Duration::from_secs(40))),
            640_000_000
        );
        // Running chunk overshooting its duration is capped.
        assert_eq!(
            approx_out_time_us(2, chunk, Some(Duration::from_secs(900))),
            900_000_000
        );
        // No running chunk.
        assert_eq!(approx_out_time_us(1, chunk, None), 300_000_000);
    }

    #[tokio::test]
    async fn emit_writes_the_sink() {
        struct Shared(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut reporter = ProgressReporter::new(
            reqwest::Client::new(),
            None,
            Box::new(Shared(buffer.clone())),
        );
        reporter
            .emit(ProgressBody {
                frame: 10,
                fps: 30.0,
                speed: 1.0,
                out_time_us: 0,
            })
            .await;
        let written = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(written.starts_with("frame=10 fps=30.0"));
    }
}
