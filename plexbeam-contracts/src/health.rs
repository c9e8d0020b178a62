use serde::{Deserialize, Serialize};

/// Body of `GET /health` on a worker.
///
/// Workers report at least `status` and the hardware acceleration family
/// their encoder runs on; unknown extra fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub hw_accel: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }

    /// The advertised encoder family, lowercased, or "none".
    pub fn hw_accel_or_none(&self) -> String {
        self.hw_accel
            .as_deref()
            .unwrap_or("none")
            .to_ascii_lowercase()
    }
}
