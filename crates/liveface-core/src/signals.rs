//! Biometric signals derived from a single landmark frame.
//!
//! Three signals drive every liveness decision:
//!
//! - **EAR** (eye aspect ratio): drops sharply while the eyes close.
//! - **Mouth ratio**: mouth width over the outer-lip opening; rises on a smile
//!   because the corners spread while the lips stay together.
//! - **Head offset**: nose tip position relative to the midpoint between the
//!   eyes, normalised by inter-eye distance. Grows in magnitude as the head
//!   turns or tilts away from the camera axis.
//!
//! Extraction is pure and allocation-free; a frame that cannot produce all
//! three signals is rejected with [`SignalExtractionError`] and skipped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{LandmarkFrame, Point, LANDMARK_COUNT};

/// Added to the mouth opening so a closed mouth never divides by zero.
const MOUTH_EPSILON: f32 = 1e-6;

/// Inter-eye spans below this are treated as zero and replaced by 1.0.
const SPAN_EPSILON: f32 = 1e-6;

/// Index of the nose tip within the nose landmark group.
const NOSE_TIP: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalExtractionError {
    #[error("expected {expected} landmarks, got {got}")]
    LandmarkCount { expected: usize, got: usize },
    #[error("landmark {0} has a non-finite coordinate")]
    NonFinite(usize),
    #[error("all landmarks collapse onto a single point")]
    Collapsed,
}

/// Normalised nose-tip displacement from the eye midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadOffset {
    pub x: f32,
    pub y: f32,
}

/// The three signals extracted from one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalSample {
    pub ear: f32,
    pub mouth_ratio: f32,
    pub head_offset: HeadOffset,
}

/// Extract EAR, mouth ratio and head offset from a detected face.
pub fn extract(frame: &LandmarkFrame) -> Result<SignalSample, SignalExtractionError> {
    validate_landmarks(&frame.landmarks)?;

    // validate_landmarks guarantees the full 68-point layout, so every region exists.
    let (Some(left_eye), Some(right_eye), Some(nose), Some(mouth)) = (
        frame.left_eye(),
        frame.right_eye(),
        frame.nose(),
        frame.mouth(),
    ) else {
        return Err(SignalExtractionError::LandmarkCount {
            expected: LANDMARK_COUNT,
            got: frame.landmarks.len(),
        });
    };

    let ear = (eye_aspect_ratio(left_eye) + eye_aspect_ratio(right_eye)) / 2.0;

    Ok(SignalSample {
        ear,
        mouth_ratio: mouth_ratio(mouth),
        head_offset: head_offset(left_eye, right_eye, nose[NOSE_TIP]),
    })
}

/// Eye aspect ratio for six ordered eye points `p0..p5`:
/// `(|p1 p5| + |p2 p4|) / (2 |p0 p3|)`.
///
/// Returns 0.0 when the eye has zero width or fewer than six points.
pub fn eye_aspect_ratio(eye: &[Point]) -> f32 {
    let [p0, p1, p2, p3, p4, p5] = match eye {
        [p0, p1, p2, p3, p4, p5, ..] => [*p0, *p1, *p2, *p3, *p4, *p5],
        _ => return 0.0,
    };

    let width = p0.distance(p3);
    if width == 0.0 {
        return 0.0;
    }

    (p1.distance(p5) + p2.distance(p4)) / (2.0 * width)
}

/// Mouth width (outer corners) over outer-lip opening (upper/lower midpoints).
///
/// `mouth` is the 20-point mouth group; indices 0/6 are the corners and 3/9
/// the outer upper and lower lip midpoints.
pub fn mouth_ratio(mouth: &[Point]) -> f32 {
    if mouth.len() < 10 {
        return 0.0;
    }
    let width = mouth[0].distance(mouth[6]);
    let height = mouth[3].distance(mouth[9]);
    width / (height + MOUTH_EPSILON)
}

/// Arithmetic mean of a group of points.
pub fn centroid(points: &[Point]) -> Point {
    if points.is_empty() {
        return Point::default();
    }
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
    let n = points.len() as f32;
    Point::new(sx / n, sy / n)
}

/// Nose tip offset from the eye midpoint, normalised per axis by the
/// horizontal and vertical inter-eye spans.
pub fn head_offset(left_eye: &[Point], right_eye: &[Point], nose_tip: Point) -> HeadOffset {
    let left = centroid(left_eye);
    let right = centroid(right_eye);
    let mid = Point::new((left.x + right.x) / 2.0, (left.y + right.y) / 2.0);

    HeadOffset {
        x: (nose_tip.x - mid.x) / span_or_one(right.x - left.x),
        y: (nose_tip.y - mid.y) / span_or_one(right.y - left.y),
    }
}

fn span_or_one(span: f32) -> f32 {
    let span = span.abs();
    if span < SPAN_EPSILON {
        1.0
    } else {
        span
    }
}

fn validate_landmarks(landmarks: &[Point]) -> Result<(), SignalExtractionError> {
    if landmarks.len() != LANDMARK_COUNT {
        return Err(SignalExtractionError::LandmarkCount {
            expected: LANDMARK_COUNT,
            got: landmarks.len(),
        });
    }
    if let Some(idx) = landmarks.iter().position(|p| !p.is_finite()) {
        return Err(SignalExtractionError::NonFinite(idx));
    }
    let first = landmarks[0];
    if landmarks.iter().all(|p| *p == first) {
        return Err(SignalExtractionError::Collapsed);
    }
    Ok(())
}
