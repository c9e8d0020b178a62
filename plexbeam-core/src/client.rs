//! Typed HTTP clients for the worker contract and the localhost pull proxy.
//!
//! One `reqwest::Client` (2 s connect timeout, no global deadline) is shared
//! across every worker; each call sets its own overall timeout so a slow
//! status poll can never stall the dispatch tick for more than 5 s while a
//! beam upload is still allowed its two hours.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use url::Url;

use plexbeam_contracts::prelude::*;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const BEAM_UPLOAD_TIMEOUT: Duration = Duration::from_secs(7_200);
pub const STAGED_UPLOAD_TIMEOUT: Duration = Duration::from_secs(14_400);
pub const SEGMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unexpected body from {url}: {message}")]
    Body { url: String, message: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Build the shared HTTP client with the cartridge's connect policy.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .expect("reqwest client construction cannot fail with static options")
}

/// One worker endpoint.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

impl WorkerClient {
    pub fn new(http: reqwest::Client, base: Url, api_key: Option<String>) -> Self {
        Self {
            http,
            base,
            api_key,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn apply_key(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    pub async fn health(&self) -> ClientResult<HealthResponse> {
        let url = self.endpoint("health");
        let response = self
            .apply_key(self.http.get(&url))
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        decode_json(url, response).await
    }

    pub async fn submit(&self, job: &JobRequest) -> ClientResult<SubmitResponse> {
        let url = self.endpoint("transcode");
        let response = self
            .apply_key(self.http.post(&url))
            .timeout(SUBMIT_TIMEOUT)
            .json(job)
            .send()
            .await?;
        decode_json(url, response).await
    }

    pub async fn status(&self, job_id: &str) -> ClientResult<StatusResponse> {
        let url = self.endpoint(&format!("status/{job_id}"));
        let response = self
            .apply_key(self.http.get(&url))
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        decode_json(url, response).await
    }

    pub async fn segments(&self, job_id: &str) -> ClientResult<SegmentListing> {
        let url = self.endpoint(&format!("beam/segments/{job_id}"));
        let response = self
            .apply_key(self.http.get(&url))
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        decode_json(url, response).await
    }

    /// Stream one produced segment to `dest`; returns the byte count.
    pub async fn download_segment(
        &self,
        job_id: &str,
        name: &str,
        dest: &Path,
    ) -> ClientResult<u64> {
        let url = self.endpoint(&format!("beam/segment/{job_id}/{name}"));
        let response = self
            .apply_key(self.http.get(&url))
            .timeout(SEGMENT_TIMEOUT)
            .send()
            .await?;
        let response = expect_ok(&url, response)?;

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            ClientError::Body {
                url: url.clone(),
                message: format!("cannot create {}: {e}", dest.display()),
            }
        })?;
        let mut stream = response;
        let mut written = 0u64;
        while let Some(bytes) = stream.chunk().await? {
            written += bytes.len() as u64;
            file.write_all(&bytes).await.map_err(|e| ClientError::Body {
                url: url.clone(),
                message: format!("short write to {}: {e}", dest.display()),
            })?;
        }
        file.flush().await.map_err(|e| ClientError::Body {
            url,
            message: e.to_string(),
        })?;
        Ok(written)
    }

    /// Fetch a small text artifact (the manifest) into memory.
    pub async fn fetch_text(&self, job_id: &str, name: &str) -> ClientResult<String> {
        let url = self.endpoint(&format!("beam/segment/{job_id}/{name}"));
        let response = self
            .apply_key(self.http.get(&url))
            .timeout(SEGMENT_TIMEOUT)
            .send()
            .await?;
        let response = expect_ok(&url, response)?;
        Ok(response.text().await?)
    }

    /// Chunked upload of a remux stream to `POST /beam/stream/<job>`.
    pub async fn beam_stream(&self, job_id: &str, body: reqwest::Body) -> ClientResult<()> {
        let url = self.endpoint(&format!("beam/stream/{job_id}"));
        let response = self
            .apply_key(self.http.post(&url))
            .timeout(BEAM_UPLOAD_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "video/x-matroska")
            .body(body)
            .send()
            .await?;
        expect_ok(&url, response).map(|_| ())
    }

    /// Full-file staged upload to `PUT /beam/stage/<id>`.
    pub async fn stage_upload(&self, stage_id: &str, body: reqwest::Body) -> ClientResult<()> {
        let url = self.endpoint(&format!("beam/stage/{stage_id}"));
        let response = self
            .apply_key(self.http.put(&url))
            .timeout(STAGED_UPLOAD_TIMEOUT)
            .body(body)
            .send()
            .await?;
        expect_ok(&url, response).map(|_| ())
    }

    pub async fn delete_stage(&self, stage_id: &str) -> ClientResult<()> {
        let url = self.endpoint(&format!("beam/stage/{stage_id}"));
        let response = self
            .apply_key(self.http.delete(&url))
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        expect_ok(&url, response).map(|_| ())
    }

    /// Best-effort job cancellation; callers ignore the result on teardown.
    pub async fn cancel_job(&self, job_id: &str) -> ClientResult<()> {
        let url = self.endpoint(&format!("job/{job_id}"));
        let response = self
            .apply_key(self.http.delete(&url))
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        expect_ok(&url, response).map(|_| ())
    }

    /// `GET /probe?path=` duration query, available on `@local` workers.
    pub async fn probe_duration(&self, path: &str) -> ClientResult<f64> {
        #[derive(Deserialize)]
        struct ProbeResponse {
            duration: f64,
        }
        let url = self.endpoint("probe");
        let response = self
            .apply_key(self.http.get(&url).query(&[("path", path)]))
            .timeout(POLL_TIMEOUT)
            .send()
            .await?;
        let body: ProbeResponse = decode_json(url, response).await?;
        Ok(body.duration)
    }
}

/// The localhost S3 pull proxy.
#[derive(Debug, Clone)]
pub struct PullProxyClient {
    http: reqwest::Client,
    base: Url,
}

impl PullProxyClient {
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    fn endpoint(&self, object: &str) -> String {
        format!(
            "{}/upload/{object}",
            self.base.as_str().trim_end_matches('/')
        )
    }

    /// Upload the remux stream; the proxy answers with a pre-signed GET URL
    /// the worker pulls from.
    pub async fn upload(&self, object: &str, body: reqwest::Body) -> ClientResult<String> {
        let url = self.endpoint(object);
        let response = self
            .http
            .put(&url)
            .timeout(STAGED_UPLOAD_TIMEOUT)
            .body(body)
            .send()
            .await?;
        let body: StagedUploadResponse = decode_json(url, response).await?;
        Ok(body.url)
    }

    pub async fn delete(&self, object: &str) -> ClientResult<()> {
        let url = self.endpoint(object);
        let response = self.http.delete(&url).timeout(POLL_TIMEOUT).send().await?;
        expect_ok(&url, response).map(|_| ())
    }
}

fn expect_ok(url: &str, response: reqwest::Response) -> ClientResult<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(ClientError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        })
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    url: String,
    response: reqwest::Response,
) -> ClientResult<T> {
    let response = expect_ok(&url, response)?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Body {
        url,
        message: e.to_string(),
    })
}
