use serde::{Deserialize, Serialize};

/// Body of `GET /beam/segments/<job_id>`: the files a worker has produced so
/// far for a job, in whatever order its filesystem listed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentListing {
    #[serde(default)]
    pub files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing() {
        let body: SegmentListing = serde_json::from_str(
            r#"{"files":["init-stream0.m4s","chunk-stream0-00001.m4s","out.mpd"]}"#,
        )
        .unwrap();
        assert_eq!(body.files.len(), 3);
    }

    #[test]
    fn empty_body_is_empty_listing() {
        let body: SegmentListing = serde_json::from_str("{}").unwrap();
        assert!(body.files.is_empty());
    }
}
