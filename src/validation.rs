//! Frame validation utilities for test pattern verification.
//!
//! This module provides functions to validate that captured frames contain
//! expected test patterns. Useful for integration testing with virtual cameras.

use thiserror::Error;

use crate::traits::{FormatDescriptor, Frame, FrameMetadata};

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the integer converter's output for the 100% bar YUV values
/// used by the mock device's color bar pattern.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 255, 11),  // Yellow
    (12, 104, 237),  // Cyan
    (13, 165, 13),   // Green
    (237, 85, 237),  // Magenta
    (238, 146, 13),  // Red
    (15, 0, 239),    // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for driver pattern differences).
const COLOR_TOLERANCE: i32 = 15;

/// Why a frame does not show the expected pattern.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// The sample position lies outside the frame data.
    #[error("failed to get pixel at ({x}, {y})")]
    PixelOutOfRange {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// A color bar has the wrong color.
    #[error("color bar {bar} mismatch at ({x}, {y}): expected RGB{expected:?}, got RGB{actual:?}")]
    ColorMismatch {
        /// Bar index, 0 is leftmost.
        bar: usize,
        /// Sample column.
        x: u32,
        /// Sample row.
        y: u32,
        /// Expected color.
        expected: (u8, u8, u8),
        /// Sampled color.
        actual: (u8, u8, u8),
    },
    /// Luminance decreases from left to right.
    #[error("gradient not monotonically increasing at x={x}: luminance {luminance} < previous {previous}")]
    NotMonotonic {
        /// Sample column.
        x: u32,
        /// Luminance at `x`.
        luminance: f32,
        /// Luminance at the previous sample.
        previous: f32,
    },
    /// Luminance barely changes across the frame.
    #[error("insufficient luminance change for gradient: {change} (expected at least 50.0)")]
    FlatGradient {
        /// Right minus left luminance.
        change: f32,
    },
    /// No frames to check.
    #[error("cannot validate empty frame sequence")]
    EmptySequence,
    /// Sequence numbers skip or repeat.
    #[error("frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Position in the checked slice.
        index: usize,
        /// Expected sequence number.
        expected: u32,
        /// Actual sequence number.
        actual: u32,
    },
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// This function checks 8 vertical stripes at their center positions,
/// verifying that each stripe contains the expected color with a tolerance
/// for pattern generator differences.
///
/// # Errors
///
/// Returns an error if a sample lies outside the frame or any color bar
/// doesn't match the expected color within tolerance.
pub fn validate_color_bars(frame: &Frame<'_>, format: &FormatDescriptor) -> Result<(), ValidationError> {
    let width = format.width;
    let bar_width = width / 8;
    let center_y = format.height / 2;

    for (bar, expected) in SMPTE_COLOR_BARS.iter().enumerate() {
        // Sample the center of each bar
        #[allow(clippy::cast_possible_truncation)]
        let x = (bar as u32 * bar_width) + (bar_width / 2);

        let actual = frame
            .pixel_at(x, center_y, width)
            .ok_or(ValidationError::PixelOutOfRange { x, y: center_y })?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(ValidationError::ColorMismatch {
                bar,
                x,
                y: center_y,
                expected: *expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center row every 10 pixels and checks that luminance
/// increases from left to right by a significant amount overall.
///
/// # Errors
///
/// Returns an error if a sample lies outside the frame, luminance drops
/// between samples, or the total change is too small (solid color).
pub fn validate_gradient(frame: &Frame<'_>, format: &FormatDescriptor) -> Result<(), ValidationError> {
    let width = format.width;
    let center_y = format.height / 2;

    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..width).step_by(10) {
        let (r, g, b) = frame
            .pixel_at(x, center_y, width)
            .ok_or(ValidationError::PixelOutOfRange { x, y: center_y })?;

        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = previous {
            // Allow small decreases due to rounding
            if luminance < prev - 1.0 {
                return Err(ValidationError::NotMonotonic {
                    x,
                    luminance,
                    previous: prev,
                });
            }
        }

        first.get_or_insert(luminance);
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let change = last - first;
        if change < 50.0 {
            return Err(ValidationError::FlatGradient { change });
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by 1 with no gaps.
///
/// # Errors
///
/// Returns an error if `frames` is empty or any sequence number doesn't
/// increment by exactly 1 from the previous.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (offset, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        let expected = prev.sequence.wrapping_add(1);
        if curr.sequence != expected {
            return Err(ValidationError::SequenceGap {
                index: offset + 1,
                expected,
                actual: curr.sequence,
            });
        }
    }

    Ok(())
}

/// Whether all three channels are within `tolerance` of each other.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: i32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    let r_diff = i32::from(ar).abs_diff(i32::from(er));
    let g_diff = i32::from(ag).abs_diff(i32::from(eg));
    let b_diff = i32::from(ab).abs_diff(i32::from(eb));

    #[allow(clippy::cast_sign_loss)]
    let tol = tolerance as u32;

    r_diff <= tol && g_diff <= tol && b_diff <= tol
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::mock::{MockDevice, TestPattern};

    fn streaming_camera(pattern: TestPattern) -> Camera<MockDevice> {
        let mut camera = Camera::with_backend("/dev/mock0", MockDevice::new().with_pattern(pattern))
            .expect("mock camera");
        camera.start().expect("start failed");
        camera
    }

    #[test]
    fn test_validate_color_bars_success() {
        let mut camera = streaming_camera(TestPattern::ColorBars);
        let format = camera.negotiated_format().clone();
        let frame = camera.capture_frame().expect("capture failed");

        let result = validate_color_bars(&frame, &format);
        assert!(
            result.is_ok(),
            "Color bars validation should succeed: {result:?}"
        );
    }

    #[test]
    fn test_validate_color_bars_wrong_pattern() {
        let mut camera = streaming_camera(TestPattern::Gradient);
        let format = camera.negotiated_format().clone();
        let frame = camera.capture_frame().expect("capture failed");

        let result = validate_color_bars(&frame, &format);
        assert!(
            matches!(result, Err(ValidationError::ColorMismatch { .. })),
            "Color bars validation should fail for gradient pattern"
        );
    }

    #[test]
    fn test_validate_gradient_success() {
        let mut camera = streaming_camera(TestPattern::Gradient);
        let format = camera.negotiated_format().clone();
        let frame = camera.capture_frame().expect("capture failed");

        let result = validate_gradient(&frame, &format);
        assert!(
            result.is_ok(),
            "Gradient validation should succeed: {result:?}"
        );
    }

    #[test]
    fn test_validate_gradient_wrong_pattern() {
        let mut camera = streaming_camera(TestPattern::Solid(128, 128, 128));
        let format = camera.negotiated_format().clone();
        let frame = camera.capture_frame().expect("capture failed");

        let result = validate_gradient(&frame, &format);
        assert!(
            matches!(result, Err(ValidationError::FlatGradient { .. })),
            "Gradient validation should fail for solid pattern"
        );
    }

    #[test]
    fn test_validate_frame_sequence_success() {
        let mut camera = streaming_camera(TestPattern::ColorBars);
        let frames: Vec<FrameMetadata> = (0..5)
            .map(|_| {
                camera
                    .capture_frame()
                    .expect("capture failed")
                    .metadata
                    .clone()
            })
            .collect();

        let result = validate_frame_sequence(&frames);
        assert!(
            result.is_ok(),
            "Frame sequence validation should succeed: {result:?}"
        );
    }

    #[test]
    fn test_validate_frame_sequence_empty() {
        assert_eq!(
            validate_frame_sequence(&[]),
            Err(ValidationError::EmptySequence)
        );
    }

    #[test]
    fn test_validate_frame_sequence_with_gap() {
        let mut camera = streaming_camera(TestPattern::ColorBars);
        let mut capture = || {
            camera
                .capture_frame()
                .expect("capture failed")
                .metadata
                .clone()
        };

        let mut frames = vec![capture(), capture()];
        // Skip a frame to create a gap
        let _ = capture();
        frames.push(capture());

        let result = validate_frame_sequence(&frames);
        assert!(
            matches!(result, Err(ValidationError::SequenceGap { index: 2, .. })),
            "Frame sequence validation should fail with gap"
        );
    }

    #[test]
    fn test_colors_match_exact() {
        assert!(colors_match((100, 150, 200), (100, 150, 200), 10));
    }

    #[test]
    fn test_colors_match_within_tolerance() {
        assert!(colors_match((100, 150, 200), (105, 155, 205), 10));
    }

    #[test]
    fn test_colors_match_outside_tolerance() {
        assert!(!colors_match((100, 150, 200), (120, 150, 200), 10));
    }
}
