//! The manifest gate: when and what to POST to the media server.
//!
//! First POST is held back until the output directory holds at least one
//! init segment and one media segment, because players treat a manifest
//! whose referenced files 404 as a hard error. After that, re-POSTs happen
//! only when the on-disk manifest's md5 moves.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::aggregate::output_has_init_and_media;
use crate::error::Result;

fn start_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"startNumber="1""#).expect("startNumber regex"))
}

/// Rewrite `startNumber="1"` to the player-requested starting segment.
///
/// Applying it twice is a no-op: after the first rewrite there is no
/// `startNumber="1"` left to match.
pub fn rewrite_start_number(manifest: &str, skip_to_segment: u64) -> String {
    if skip_to_segment <= 1 {
        return manifest.to_string();
    }
    start_number_re()
        .replace_all(manifest, format!(r#"startNumber="{skip_to_segment}""#).as_str())
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    NoManifest,
    ReadyNotPosted,
    Posted,
}

/// State machine guarding the manifest callback.
#[derive(Debug)]
pub struct ManifestGate {
    http: reqwest::Client,
    callback_url: Option<String>,
    skip_to_segment: u64,
    state: GateState,
    last_md5: Option<String>,
}

impl ManifestGate {
    pub fn new(
        http: reqwest::Client,
        callback_url: Option<String>,
        skip_to_segment: u64,
    ) -> Self {
        Self {
            http,
            callback_url,
            skip_to_segment,
            state: GateState::NoManifest,
            last_md5: None,
        }
    }

    pub fn is_posted(&self) -> bool {
        self.state == GateState::Posted
    }

    /// Offer the current on-disk manifest to the gate.
    ///
    /// `manifest_path` is where the aggregator put the fetched manifest;
    /// `out_dir` is scanned for the init + media precondition. Returns true
    /// when a POST actually went out.
    pub async fn offer(&mut self, manifest_path: &Path, out_dir: &Path) -> Result<bool> {
        let raw = match std::fs::read_to_string(manifest_path) {
            Ok(raw) => raw,
            Err(_) => return Ok(false),
        };
        let body = rewrite_start_number(&raw, self.skip_to_segment);
        let digest = format!("{:x}", md5::compute(body.as_bytes()));

        if self.state == GateState::NoManifest {
            let (has_init, has_media) = output_has_init_and_media(out_dir);
            if !(has_init && has_media) {
                debug!(has_init, has_media, "manifest gate still closed");
                return Ok(false);
            }
            self.state = GateState::ReadyNotPosted;
        }

        if self.state == GateState::Posted && self.last_md5.as_deref() == Some(digest.as_str()) {
            return Ok(false);
        }

        let Some(url) = self.callback_url.clone() else {
            // No callback configured; the on-disk manifest is the product.
            self.state = GateState::Posted;
            self.last_md5 = Some(digest);
            return Ok(false);
        };

        match self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/dash+xml")
            .body(body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(md5 = %digest, "manifest posted");
                self.state = GateState::Posted;
                self.last_md5 = Some(digest);
                Ok(true)
            }
            Ok(response) => {
                warn!(status = %response.status(), "manifest callback rejected POST");
                Ok(false)
            }
            Err(error) => {
                warn!(%error, "manifest callback unreachable");
                Ok(false)
            }
        }
    }
}
