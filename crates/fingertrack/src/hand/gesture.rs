//! Single-frame gesture classification.
//!
//! Classification is a fixed-threshold heuristic on the fingertip positions of one hand. It has no
//! memory of previous frames, so the result can flicker when a hand sits near a threshold.

use std::fmt;

use serde::Serialize;

use crate::landmark::{Landmark, Landmarks};

use super::{LandmarkIdx, NUM_LANDMARKS};

/// Thumb and index fingertips closer than this (in normalized coordinates) are a pinch.
pub const PINCH_DISTANCE: f32 = 0.035;

/// Minimum thumb/index fingertip distance required for an open palm.
///
/// Note that this is larger than [`PINCH_DISTANCE`], so there is a band of distances in which a
/// hand that is neither a fist nor pointing is classified as [`Gesture::None`].
pub const OPEN_PALM_MIN_DISTANCE: f32 = 0.05;

/// A coarse hand pose.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    #[default]
    None,
    Pinch,
    Fist,
    Point,
    OpenPalm,
}

impl Gesture {
    /// Returns the label used for this gesture in the HTTP API.
    pub fn as_str(self) -> &'static str {
        match self {
            Gesture::None => "none",
            Gesture::Pinch => "pinch",
            Gesture::Fist => "fist",
            Gesture::Point => "point",
            Gesture::OpenPalm => "open_palm",
        }
    }
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Tips {
    thumb: Landmark,
    index: Landmark,
    middle: Landmark,
    ring: Landmark,
    pinky: Landmark,
}

impl Tips {
    fn of(landmarks: &Landmarks) -> Option<Self> {
        if landmarks.len() < NUM_LANDMARKS {
            return None;
        }
        let get = |idx: LandmarkIdx| landmarks.get(idx as usize);
        Some(Self {
            thumb: get(LandmarkIdx::ThumbTip)?,
            index: get(LandmarkIdx::IndexFingerTip)?,
            middle: get(LandmarkIdx::MiddleFingerTip)?,
            ring: get(LandmarkIdx::RingFingerTip)?,
            pinky: get(LandmarkIdx::PinkyTip)?,
        })
    }

    /// Fingertips are progressively lower in the image from index to pinky.
    fn is_fist(&self) -> bool {
        self.index.y() > self.middle.y()
            && self.middle.y() > self.ring.y()
            && self.ring.y() > self.pinky.y()
    }

    /// Index fingertip is above the other fingertips, and above the thumb tip.
    fn is_pointing(&self) -> bool {
        let index = self.index.y();
        index < self.middle.y()
            && index < self.ring.y()
            && index < self.pinky.y()
            && self.thumb.y() > index
    }
}

/// Classifies the pose of one hand.
///
/// `landmarks` are expected in [`LandmarkIdx`] order. Hands with fewer than [`NUM_LANDMARKS`]
/// landmarks are classified as [`Gesture::None`].
///
/// Checks are applied in priority order, the first match wins: pinch, fist, point, open palm.
pub fn classify(landmarks: &Landmarks) -> Gesture {
    let Some(tips) = Tips::of(landmarks) else {
        return Gesture::None;
    };

    let pinch_distance = tips.thumb.planar_distance(&tips.index);
    let is_fist = tips.is_fist();
    let is_pointing = tips.is_pointing();
    let is_open_palm = !is_fist && !is_pointing && pinch_distance > OPEN_PALM_MIN_DISTANCE;

    if pinch_distance < PINCH_DISTANCE {
        Gesture::Pinch
    } else if is_fist {
        Gesture::Fist
    } else if is_pointing {
        Gesture::Point
    } else if is_open_palm {
        Gesture::OpenPalm
    } else {
        Gesture::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a hand with all non-tip landmarks at the wrist and tips at the given positions.
    fn hand(thumb: [f32; 2], index: [f32; 2], middle: f32, ring: f32, pinky: f32) -> Landmarks {
        let mut lms = Landmarks::new(NUM_LANDMARKS);
        lms.map_positions(|_| [0.5, 0.9, 0.0]);
        let mut put = |idx: LandmarkIdx, x: f32, y: f32| {
            lms.set(idx as usize, Landmark::new([x, y, 0.0]));
        };
        put(LandmarkIdx::ThumbTip, thumb[0], thumb[1]);
        put(LandmarkIdx::IndexFingerTip, index[0], index[1]);
        put(LandmarkIdx::MiddleFingerTip, 0.55, middle);
        put(LandmarkIdx::RingFingerTip, 0.6, ring);
        put(LandmarkIdx::PinkyTip, 0.65, pinky);
        lms
    }

    #[test]
    fn pinch_takes_priority() {
        // Fingertips ordered like a fist, but thumb and index touch.
        let lms = hand([0.5, 0.61], [0.51, 0.6], 0.5, 0.4, 0.3);
        assert_eq!(classify(&lms), Gesture::Pinch);

        // Same for a pointing hand.
        let lms = hand([0.5, 0.32], [0.5, 0.3], 0.5, 0.5, 0.5);
        assert_eq!(classify(&lms), Gesture::Pinch);
    }

    #[test]
    fn fist() {
        let lms = hand([0.2, 0.5], [0.5, 0.6], 0.5, 0.4, 0.3);
        assert_eq!(classify(&lms), Gesture::Fist);
    }

    #[test]
    fn fist_requires_strict_ordering() {
        let lms = hand([0.2, 0.5], [0.5, 0.6], 0.5, 0.5, 0.3);
        assert_ne!(classify(&lms), Gesture::Fist);
    }

    #[test]
    fn point() {
        let lms = hand([0.3, 0.6], [0.5, 0.2], 0.5, 0.5, 0.5);
        assert_eq!(classify(&lms), Gesture::Point);
    }

    #[test]
    fn point_requires_thumb_below_index() {
        // Thumb tip above the index tip, far enough away to not be a pinch.
        let lms = hand([0.2, 0.1], [0.5, 0.2], 0.5, 0.5, 0.5);
        assert_eq!(classify(&lms), Gesture::OpenPalm);
    }

    #[test]
    fn open_palm() {
        let lms = hand([0.2, 0.5], [0.5, 0.3], 0.3, 0.3, 0.3);
        assert_eq!(classify(&lms), Gesture::OpenPalm);
    }

    #[test]
    fn between_thresholds_is_none() {
        // Neither fist nor pointing, thumb/index distance 0.04.
        let lms = hand([0.5, 0.34], [0.5, 0.3], 0.3, 0.3, 0.3);
        assert_eq!(classify(&lms), Gesture::None);
    }

    #[test]
    fn malformed_hand_is_none() {
        assert_eq!(classify(&Landmarks::new(0)), Gesture::None);
        assert_eq!(classify(&Landmarks::new(20)), Gesture::None);
    }

    #[test]
    fn labels() {
        assert_eq!(Gesture::default(), Gesture::None);
        assert_eq!(Gesture::OpenPalm.to_string(), "open_palm");
        assert_eq!(
            serde_json::to_string(&Gesture::OpenPalm).unwrap(),
            "\"open_palm\""
        );
    }
}
