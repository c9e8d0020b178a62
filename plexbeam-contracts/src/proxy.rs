use serde::{Deserialize, Serialize};

/// Body of a successful `PUT <proxy>/upload/<id>.mkv`: the pre-signed GET
/// URL a worker can pull the staged object from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedUploadResponse {
    pub url: String,
}
