//! Wire types shared between the plexbeam cartridge and its collaborators.
//!
//! Everything in this crate is a plain serde shape: the worker HTTP contract
//! (health, job submission, status, segment listings), the localhost pull
//! proxy, and the form body posted to the media server's progress callback.
//! No I/O lives here; the cartridge's client layer owns transport concerns.

pub mod health;
pub mod job;
pub mod progress;
pub mod proxy;
pub mod segments;
pub mod status;

/// Commonly imported contract types.
pub mod prelude {
    pub use super::health::HealthResponse;
    pub use super::job::{
        JobArguments, JobInput, JobMetadata, JobOutput, JobRequest, MediaSource, SplitInfo,
        SubtitleArgs,
    };
    pub use super::progress::ProgressBody;
    pub use super::proxy::StagedUploadResponse;
    pub use super::segments::SegmentListing;
    pub use super::status::{JobState, StatusResponse, SubmitResponse};
}
