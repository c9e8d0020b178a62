use serde::{Deserialize, Serialize};

/// Progress telemetry posted to the media server's progress callback.
///
/// The wire format is `application/x-www-form-urlencoded`, not JSON, and the
/// media server is picky about it: `speed` carries a trailing `x` and the
/// final key is always `progress=continue`. [`ProgressBody::to_form`]
/// produces the exact body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressBody {
    pub frame: u64,
    pub fps: f64,
    pub speed: f64,
    pub out_time_us: i64,
}

impl ProgressBody {
    pub fn to_form(&self) -> String {
        // One decimal on speed, matching the precision FFmpeg itself
        // reports and the stderr channel uses.
        format!(
            "frame={}&fps={:.1}&speed={:.1}x&out_time_us={}&progress=continue",
            self.frame, self.fps, self.speed, self.out_time_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_body_shape() {
        let body = ProgressBody {
            frame: 1034,
            fps: 187.5,
            speed: 6.5,
            out_time_us: 41_360_000,
        };
        assert_eq!(
            body.to_form(),
            "frame=1034&fps=187.5&speed=6.5x&out_time_us=41360000&progress=continue"
        );
    }

    #[test]
    fn zero_out_time_is_still_a_valid_body() {
        // Posted during seeks; the media server times the session out if the
        // cartridge goes quiet instead.
        let body = ProgressBody {
            frame: 0,
            fps: 0.0,
            speed: 0.0,
            out_time_us: 0,
        };
        assert_eq!(
            body.to_form(),
            "frame=0&fps=0.0&speed=0.0x&out_time_us=0&progress=continue"
        );
    }
}
