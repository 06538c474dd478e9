use crate::error::{MattingError, MattingResult};
use crate::tracking::PromptPoint;
use serde::{Deserialize, Serialize};

/// Coordinate convention of the prompt points in a matting request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVersion {
    /// Pixels of the uploaded video's native resolution
    NativePixels,
    /// Fractions of the frame in `[0, 1]`
    #[default]
    UnitInterval,
}

impl ProtocolVersion {
    /// Map request points into working-resolution pixels
    ///
    /// Every point of a request is interpreted with the same convention.
    pub fn normalize(
        self,
        points: &[[f32; 2]],
        native: (u32, u32),
        working: (u32, u32),
    ) -> MattingResult<Vec<PromptPoint>> {
        if points.is_empty() {
            return Err(MattingError::validation("at least one prompt point is required"));
        }
        if native.0 == 0 || native.1 == 0 {
            return Err(MattingError::validation(format!(
                "session has an empty native resolution {}x{}",
                native.0, native.1
            )));
        }

        let (limit_x, limit_y) = match self {
            Self::NativePixels => (native.0 as f32, native.1 as f32),
            Self::UnitInterval => (1.0, 1.0),
        };

        points
            .iter()
            .map(|&[x, y]| {
                let inside = |v: f32, limit: f32| v.is_finite() && (0.0..=limit).contains(&v);
                if !inside(x, limit_x) || !inside(y, limit_y) {
                    return Err(MattingError::validation(format!(
                        "point ({x}, {y}) is outside the {self:?} range {limit_x}x{limit_y}"
                    )));
                }

                let point = match self {
                    Self::NativePixels => PromptPoint::new(
                        x / native.0 as f32 * working.0 as f32,
                        y / native.1 as f32 * working.1 as f32,
                    ),
                    Self::UnitInterval => {
                        PromptPoint::new(x * working.0 as f32, y * working.1 as f32)
                    }
                };
                Ok(point)
            })
            .collect()
    }
}

/// Parse the `[[x, y], ...]` JSON the clients send
pub fn parse_points(raw: &str) -> MattingResult<Vec<[f32; 2]>> {
    serde_json::from_str(raw)
        .map_err(|e| MattingError::validation(format!("points must be a list of [x, y] pairs: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKING: (u32, u32) = (768, 432);

    #[test]
    fn unit_interval_center_maps_to_working_center() {
        let points = ProtocolVersion::UnitInterval
            .normalize(&[[0.5, 0.5]], (1920, 1080), WORKING)
            .unwrap();
        assert_eq!(points, vec![PromptPoint::new(384.0, 216.0)]);
    }

    #[test]
    fn native_pixels_are_rescaled_through_the_resolution_ratio() {
        let points = ProtocolVersion::NativePixels
            .normalize(&[[960.0, 270.0], [0.0, 1080.0]], (1920, 1080), WORKING)
            .unwrap();
        assert_eq!(
            points,
            vec![PromptPoint::new(384.0, 108.0), PromptPoint::new(0.0, 432.0)]
        );
    }

    #[test]
    fn out_of_range_points_are_rejected() {
        let err = ProtocolVersion::UnitInterval
            .normalize(&[[0.2, 0.2], [1.5, 0.2]], (1920, 1080), WORKING)
            .unwrap_err();
        assert!(matches!(err, MattingError::Validation(_)));

        assert!(ProtocolVersion::NativePixels
            .normalize(&[[f32::NAN, 1.0]], (1920, 1080), WORKING)
            .is_err());
        assert!(ProtocolVersion::UnitInterval
            .normalize(&[], (1920, 1080), WORKING)
            .is_err());
    }

    #[test]
    fn parses_point_lists() {
        assert_eq!(parse_points("[[0.1, 0.2], [1, 0]]").unwrap(), vec![[0.1, 0.2], [1.0, 0.0]]);
        assert!(parse_points("[[0.1]]").is_err());
        assert!(parse_points("nope").is_err());
    }
}
