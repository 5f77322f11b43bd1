//! The published fingertip state.

use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::hand::gesture::Gesture;

/// Fingertip position and gesture derived from one successfully processed frame.
///
/// `x` and `y` are normalized to the frame size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FingerState {
    pub x: f32,
    pub y: f32,
    pub gesture: Gesture,
}

/// The center of the image, with no gesture.
impl Default for FingerState {
    fn default() -> Self {
        Self {
            x: 0.5,
            y: 0.5,
            gesture: Gesture::None,
        }
    }
}

/// Holds the most recently published [`FingerState`].
///
/// Writes replace the whole value at once, so readers never see the position of one frame mixed
/// with the gesture of another. Reads only ever wait for an in-progress copy, never for a new
/// frame.
#[derive(Debug, Default)]
pub struct TrackingState {
    current: Mutex<FingerState>,
}

impl TrackingState {
    /// Creates a state holding [`FingerState::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current state, discarding the previous value.
    pub fn publish(&self, state: FingerState) {
        // `FingerState` is `Copy` and assigned in one step, so a poisoned lock still guards a
        // consistent value.
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Returns a snapshot of the last published state.
    pub fn read(&self) -> FingerState {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
