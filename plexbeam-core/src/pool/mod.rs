//! Worker pool parsing, probing, and ranking.

pub mod ffprobe;
pub mod spec;

pub use spec::{parse_pool_spec, PoolEntry, WorkerTag};

use futures::future::join_all;
use tracing::{info, warn};
use url::Url;

use crate::client::WorkerClient;

/// Hardware encoder family a worker advertises on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderClass {
    Nvenc,
    Qsv,
    Vaapi,
    Unknown,
}

impl EncoderClass {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "nvenc" | "cuda" => Self::Nvenc,
            "qsv" => Self::Qsv,
            "vaapi" => Self::Vaapi,
            _ => Self::Unknown,
        }
    }

    /// Sort key: lower is faster. Chunk 0 carries the init segments and the
    /// base manifest, so the fastest class must finish first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Nvenc => 0,
            Self::Qsv => 1,
            Self::Vaapi => 2,
            Self::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvenc => "nvenc",
            Self::Qsv => "qsv",
            Self::Vaapi => "vaapi",
            Self::Unknown => "unknown",
        }
    }
}

/// A live worker, post-probe.
#[derive(Debug, Clone)]
pub struct Worker {
    pub client: WorkerClient,
    pub tag: WorkerTag,
    pub encoder_class: EncoderClass,
}

impl Worker {
    pub fn url(&self) -> &Url {
        self.client.base()
    }
}

/// Probe every pool entry concurrently and keep the responders, sorted by
/// encoder class (nvenc > qsv > vaapi > other). Order within a class keeps
/// the pool-spec order, so operators can still bias the seeding.
pub async fn probe_pool(
    entries: &[PoolEntry],
    http: &reqwest::Client,
    api_key: Option<&str>,
) -> Vec<Worker> {
    let probes = entries.iter().map(|entry| {
        let client = WorkerClient::new(
            http.clone(),
            entry.url.clone(),
            api_key.map(str::to_string),
        );
        let tag = entry.tag;
        async move {
            match client.health().await {
                Ok(health) if health.is_healthy() => {
                    let encoder_class = EncoderClass::parse(&health.hw_accel_or_none());
                    info!(
                        worker = %client.base(),
                        class = encoder_class.as_str(),
                        tag = tag.as_str(),
                        "worker is live"
                    );
                    Some(Worker {
                        client,
                        tag,
                        encoder_class,
                    })
                }
                Ok(health) => {
                    warn!(worker = %client.base(), status = %health.status, "worker unhealthy");
                    None
                }
                Err(error) => {
                    warn!(worker = %client.base(), %error, "health probe failed");
                    None
                }
            }
        }
    });

    let mut workers: Vec<Worker> = join_all(probes).await.into_iter().flatten().collect();
    workers.sort_by_key(|worker| worker.encoder_class.rank());
    workers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_ranking_order() {
        assert!(EncoderClass::Nvenc.rank() < EncoderClass::Qsv.rank());
        assert!(EncoderClass::Qsv.rank() < EncoderClass::Vaapi.rank());
        assert!(EncoderClass::Vaapi.rank() < EncoderClass::Unknown.rank());
    }

    #[test]
    fn parse_classes() {
        assert_eq!(EncoderClass::parse("nvenc"), EncoderClass::Nvenc);
        assert_eq!(EncoderClass::parse("cuda"), EncoderClass::Nvenc);
        assert_eq!(EncoderClass::parse("qsv"), EncoderClass::Qsv);
        assert_eq!(EncoderClass::parse("vaapi"), EncoderClass::Vaapi);
        assert_eq!(EncoderClass::parse("none"), EncoderClass::Unknown);
    }
}
