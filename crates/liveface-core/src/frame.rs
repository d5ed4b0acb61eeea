//! Per-frame detector output.
//!
//! A [`LandmarkFrame`] is what the external face detector hands us for every
//! processed video frame that contains a face. Frames without a face are
//! represented by `None` at the call sites, never by an empty frame.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Number of points in the 68-point landmark layout.
pub const LANDMARK_COUNT: usize = 68;

/// Descriptor length produced by the detector's recognition network.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

const NOSE: Range<usize> = 27..36;
const LEFT_EYE: Range<usize> = 36..42;
const RIGHT_EYE: Range<usize> = 42..48;
const MOUTH: Range<usize> = 48..68;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance between two points.
    pub fn distance(self, other: Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One detected face: score, box, 68 landmarks and an optional descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LandmarkFrame {
    pub detection_score: f32,
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    pub landmarks: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Vec<f32>>,
}

impl LandmarkFrame {
    pub fn left_eye(&self) -> Option<&[Point]> {
        self.landmarks.get(LEFT_EYE)
    }

    pub fn right_eye(&self) -> Option<&[Point]> {
        self.landmarks.get(RIGHT_EYE)
    }

    pub fn nose(&self) -> Option<&[Point]> {
        self.landmarks.get(NOSE)
    }

    pub fn mouth(&self) -> Option<&[Point]> {
        self.landmarks.get(MOUTH)
    }
}

/// Synthetic faces with controllable eye openness, mouth shape and head turn.
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures {
    use super::*;

    const EYE_HALF_WIDTH: f32 = 15.0;
    const MOUTH_HALF_WIDTH: f32 = 20.0;
    const LEFT_EYE_CENTRE: Point = Point::new(100.0, 100.0);
    const RIGHT_EYE_CENTRE: Point = Point::new(160.0, 100.0);
    const MOUTH_CENTRE: Point = Point::new(130.0, 160.0);

    /// Build a frame whose extracted signals are approximately `ear`,
    /// `mouth_ratio` and a horizontal head offset of `turn`.
    pub fn face(ear: f32, mouth_ratio: f32, turn: f32) -> LandmarkFrame {
        let mut points = vec![Point::default(); LANDMARK_COUNT];

        // Jaw and brows: spread out so the face never looks collapsed.
        for (i, p) in points.iter_mut().enumerate().take(27) {
            *p = Point::new(70.0 + i as f32 * 5.0, 60.0 + (i % 5) as f32 * 3.0);
        }

        // Nose bridge and base around the tip at index 30.
        let inter_eye = RIGHT_EYE_CENTRE.x - LEFT_EYE_CENTRE.x;
        let tip = Point::new(130.0 + turn * inter_eye, 130.0);
        for (offset, p) in points[NOSE].iter_mut().enumerate() {
            *p = Point::new(tip.x + offset as f32 - 3.0, tip.y - 12.0 + offset as f32 * 2.0);
        }
        points[30] = tip;

        write_eye(&mut points[LEFT_EYE], LEFT_EYE_CENTRE, ear);
        write_eye(&mut points[RIGHT_EYE], RIGHT_EYE_CENTRE, ear);

        let half_height = MOUTH_HALF_WIDTH / mouth_ratio.max(1e-3);
        for (offset, p) in points[MOUTH].iter_mut().enumerate() {
            *p = Point::new(
                MOUTH_CENTRE.x - MOUTH_HALF_WIDTH + offset as f32 * 2.0,
                MOUTH_CENTRE.y + (offset % 3) as f32,
            );
        }
        points[48] = Point::new(MOUTH_CENTRE.x - MOUTH_HALF_WIDTH, MOUTH_CENTRE.y);
        points[54] = Point::new(MOUTH_CENTRE.x + MOUTH_HALF_WIDTH, MOUTH_CENTRE.y);
        points[51] = Point::new(MOUTH_CENTRE.x, MOUTH_CENTRE.y - half_height);
        points[57] = Point::new(MOUTH_CENTRE.x, MOUTH_CENTRE.y + half_height);

        LandmarkFrame {
            detection_score: 0.95,
            bounding_box: BoundingBox {
                x: 60.0,
                y: 50.0,
                width: 150.0,
                height: 160.0,
            },
            landmarks: points,
            descriptor: None,
        }
    }

    /// Neutral face: open eyes (EAR 0.30), relaxed mouth (ratio 1.5), centred.
    pub fn neutral() -> LandmarkFrame {
        face(0.30, 1.5, 0.0)
    }

    pub fn with_descriptor(mut frame: LandmarkFrame, descriptor: Vec<f32>) -> LandmarkFrame {
        frame.descriptor = Some(descriptor);
        frame
    }

    // EAR for this shape is 4h / (4 * half_width), so h = ear * half_width.
    fn write_eye(eye: &mut [Point], centre: Point, ear: f32) {
        let h = ear * EYE_HALF_WIDTH;
        eye[0] = Point::new(centre.x - EYE_HALF_WIDTH, centre.y);
        eye[1] = Point::new(centre.x - 5.0, centre.y - h);
        eye[2] = Point::new(centre.x + 5.0, centre.y - h);
        eye[3] = Point::new(centre.x + EYE_HALF_WIDTH, centre.y);
        eye[4] = Point::new(centre.x + 5.0, centre.y + h);
        eye[5] = Point::new(centre.x - 5.0, centre.y + h);
    }
}
