//! The boundary to hand landmark detectors.
//!
//! A [`LandmarkSource`] turns an RGB image into zero or more [`Hand`]s. In video mode, detectors
//! are allowed to keep state between frames (for example to track a region of interest), which is
//! why they require strictly increasing timestamps.

use std::{
    error::Error,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use image::RgbImage;

use crate::hand::Hand;

/// Selects how a detector is going to be fed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RunningMode {
    /// Independent single images. [`LandmarkSource::detect_for_video`] is rejected.
    Image,
    /// Consecutive frames of a video stream with strictly increasing timestamps.
    #[default]
    Video,
}

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    model_path: PathBuf,
    palm_model_path: PathBuf,
    running_mode: RunningMode,
    num_hands: usize,
    min_hand_detection_confidence: f32,
    min_tracking_confidence: f32,
}

impl DetectorOptions {
    pub const DEFAULT_NUM_HANDS: usize = 2;
    pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
    pub const DEFAULT_PALM_MODEL: &'static str = "palm_detection_full.onnx";

    /// Creates detector options that load the hand landmark model asset at `model_path`.
    ///
    /// The palm detection model defaults to [`Self::DEFAULT_PALM_MODEL`].
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            palm_model_path: PathBuf::from(Self::DEFAULT_PALM_MODEL),
            running_mode: RunningMode::default(),
            num_hands: Self::DEFAULT_NUM_HANDS,
            min_hand_detection_confidence: Self::DEFAULT_MIN_CONFIDENCE,
            min_tracking_confidence: Self::DEFAULT_MIN_CONFIDENCE,
        }
    }

    /// Sets the palm detection model asset used to find hands that are not tracked yet.
    #[inline]
    pub fn palm_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.palm_model_path = path.into();
        self
    }

    #[inline]
    pub fn running_mode(mut self, mode: RunningMode) -> Self {
        self.running_mode = mode;
        self
    }

    /// Sets the maximum number of hands to report per image.
    #[inline]
    pub fn num_hands(mut self, num_hands: usize) -> Self {
        self.num_hands = num_hands;
        self
    }

    /// Sets the palm detection confidence a hand needs to be reported when it is searched for in
    /// the whole image.
    #[inline]
    pub fn min_hand_detection_confidence(mut self, confidence: f32) -> Self {
        self.min_hand_detection_confidence = confidence;
        self
    }

    /// Sets the landmark network's hand presence below which a hand is discarded, or considered
    /// lost while tracking.
    #[inline]
    pub fn min_tracking_confidence(mut self, confidence: f32) -> Self {
        self.min_tracking_confidence = confidence;
        self
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn palm_model_path(&self) -> &Path {
        &self.palm_model_path
    }

    pub fn mode(&self) -> RunningMode {
        self.running_mode
    }

    pub fn max_hands(&self) -> usize {
        self.num_hands
    }

    pub fn detection_confidence(&self) -> f32 {
        self.min_hand_detection_confidence
    }

    pub fn tracking_confidence(&self) -> f32 {
        self.min_tracking_confidence
    }
}

/// Errors returned by [`LandmarkSource`]s.
#[derive(Debug)]
pub enum DetectError {
    /// A video frame was passed with a timestamp that is not larger than the previous one.
    InvalidTemporalOrder { previous: u64, current: u64 },
    /// The detector was configured for a different [`RunningMode`].
    WrongRunningMode(RunningMode),
    /// Running the underlying model failed.
    Inference(anyhow::Error),
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::InvalidTemporalOrder { previous, current } => write!(
                f,
                "timestamp {current}ms is not larger than the previous timestamp {previous}ms"
            ),
            DetectError::WrongRunningMode(mode) => {
                write!(f, "operation not supported in {mode:?} running mode")
            }
            DetectError::Inference(e) => write!(f, "inference failed: {e:#}"),
        }
    }
}

impl Error for DetectError {}

impl From<anyhow::Error> for DetectError {
    fn from(e: anyhow::Error) -> Self {
        DetectError::Inference(e)
    }
}

/// A hand landmark detector.
///
/// Returned hands are ordered by prominence: the first hand is the one the detector is most
/// confident about.
pub trait LandmarkSource: Send {
    /// Detects hands in a single, independent image.
    ///
    /// This must not affect any state used by [`LandmarkSource::detect_for_video`].
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Hand>, DetectError>;

    /// Detects hands in a frame of a video stream.
    ///
    /// `timestamp_ms` has to be strictly larger than the timestamp passed in the previous call,
    /// otherwise [`DetectError::InvalidTemporalOrder`] is returned.
    fn detect_for_video(
        &mut self,
        image: &RgbImage,
        timestamp_ms: u64,
    ) -> Result<Vec<Hand>, DetectError>;
}

/// Enforces strictly increasing video timestamps.
#[derive(Debug, Default)]
pub struct TimestampGuard {
    last: Option<u64>,
}

impl TimestampGuard {
    /// Records `timestamp_ms`, or fails if it does not advance past the last accepted timestamp.
    ///
    /// Rejected timestamps are not recorded.
    pub fn advance(&mut self, timestamp_ms: u64) -> Result<(), DetectError> {
        match self.last {
            Some(previous) if timestamp_ms <= previous => Err(DetectError::InvalidTemporalOrder {
                previous,
                current: timestamp_ms,
            }),
            _ => {
                self.last = Some(timestamp_ms);
                Ok(())
            }
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// A [`LandmarkSource`] shared between the publisher thread and HTTP request handlers.
///
/// Detectors are not assumed to support concurrent use, so every call is serialized behind a
/// mutex. This is a cheaply [`Clone`]able handle.
#[derive(Clone)]
pub struct SharedDetector {
    inner: Arc<Mutex<Box<dyn LandmarkSource>>>,
}

impl SharedDetector {
    pub fn new<S: LandmarkSource + 'static>(source: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(source))),
        }
    }

    /// Locks the detector and runs [`LandmarkSource::detect`].
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Hand>, DetectError> {
        // A panic inside a detector leaves it in whatever state it was in. That is no worse than
        // an inference error, so the poison is ignored.
        let mut source = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        source.detect(image)
    }

    /// Locks the detector and runs [`LandmarkSource::detect_for_video`].
    pub fn detect_for_video(
        &self,
        image: &RgbImage,
        timestamp_ms: u64,
    ) -> Result<Vec<Hand>, DetectError> {
        let mut source = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        source.detect_for_video(image, timestamp_ms)
    }
}
