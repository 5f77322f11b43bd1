//! Hand landmarks and everything derived from them.

pub mod gesture;
pub mod landmarker;
pub mod palm;

use crate::landmark::{Landmark, Landmarks};

/// Number of landmarks in a complete hand.
pub const NUM_LANDMARKS: usize = 21;

/// A single detected hand.
///
/// Landmark coordinates are normalized to the image the hand was detected in. Hands are produced
/// fresh by every detection and are not tracked across frames.
#[derive(Debug, Clone)]
pub struct Hand {
    landmarks: Landmarks,
    presence: f32,
    handedness: Handedness,
}

impl Hand {
    /// Creates a [`Hand`] from a list of landmarks.
    ///
    /// The landmarks are expected to be ordered according to [`LandmarkIdx`]. Fewer than
    /// [`NUM_LANDMARKS`] landmarks are accepted, since detectors may hand back malformed results;
    /// accessors return [`None`] for missing landmarks in that case.
    pub fn new(landmarks: Landmarks) -> Self {
        Self {
            landmarks,
            presence: 1.0,
            handedness: Handedness::Right,
        }
    }

    pub fn with_presence(self, presence: f32) -> Self {
        Self { presence, ..self }
    }

    pub fn with_handedness(self, handedness: Handedness) -> Self {
        Self { handedness, ..self }
    }

    #[inline]
    pub fn landmarks(&self) -> &Landmarks {
        &self.landmarks
    }

    /// Returns the landmark named by `idx`, if the hand has it.
    pub fn landmark(&self, idx: LandmarkIdx) -> Option<Landmark> {
        self.landmarks.get(idx as usize)
    }

    /// Returns the tip of the index finger, which is used as the pointer position.
    pub fn index_finger_tip(&self) -> Option<Landmark> {
        self.landmark(LandmarkIdx::IndexFingerTip)
    }

    /// Returns whether all [`NUM_LANDMARKS`] landmarks are present.
    pub fn is_complete(&self) -> bool {
        self.landmarks.len() >= NUM_LANDMARKS
    }

    /// Confidence that the hand is actually present, in range 0.0 to 1.0.
    #[inline]
    pub fn presence(&self) -> f32 {
        self.presence
    }

    /// Returns the estimated handedness of the hand in the image.
    ///
    /// This is only meaningful for images that were not mirrored.
    #[inline]
    pub fn handedness(&self) -> Handedness {
        self.handedness
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

/// Names for the hand pose landmarks.
///
/// # Terminology
///
/// - **CMC**: [Carpometacarpal joint], the lowest joint of the thumb, located near the wrist.
/// - **MCP**: [Metacarpophalangeal joint], the lower joint forming the knuckles near the palm of
///   the hand.
/// - **PIP**: Proximal Interphalangeal joint, the joint between the MCP and DIP.
/// - **DIP**: Distal Interphalangeal joint, the highest joint of a finger.
/// - **Tip**: This landmark is just placed on the tip of the finger, above the DIP.
///
/// [Carpometacarpal joint]: https://en.wikipedia.org/wiki/Carpometacarpal_joint
/// [Metacarpophalangeal joint]: https://en.wikipedia.org/wiki/Metacarpophalangeal_joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkIdx {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexFingerMcp,
    IndexFingerPip,
    IndexFingerDip,
    IndexFingerTip,
    MiddleFingerMcp,
    MiddleFingerPip,
    MiddleFingerDip,
    MiddleFingerTip,
    RingFingerMcp,
    RingFingerPip,
    RingFingerDip,
    RingFingerTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmark_indices() {
        assert_eq!(LandmarkIdx::Wrist as usize, 0);
        assert_eq!(LandmarkIdx::ThumbTip as usize, 4);
        assert_eq!(LandmarkIdx::IndexFingerTip as usize, 8);
        assert_eq!(LandmarkIdx::MiddleFingerTip as usize, 12);
        assert_eq!(LandmarkIdx::RingFingerTip as usize, 16);
        assert_eq!(LandmarkIdx::PinkyTip as usize, 20);
        assert_eq!(LandmarkIdx::PinkyTip as usize + 1, NUM_LANDMARKS);
    }

    #[test]
    fn truncated_hand() {
        let hand = Hand::new(Landmarks::new(5));
        assert!(!hand.is_complete());
        assert!(hand.landmark(LandmarkIdx::ThumbTip).is_some());
        assert!(hand.index_finger_tip().is_none());
    }
}
