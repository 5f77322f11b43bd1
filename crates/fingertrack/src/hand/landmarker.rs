//! Hand tracking with MediaPipe-style ONNX palm detection and hand landmark networks.
//!
//! Hands are found in two stages. The palm detector looks at the whole image and yields a region
//! of interest (RoI) per palm. The landmark network then looks at each RoI and outputs 21
//! landmarks in the crop's pixel coordinates, a hand presence score, and a handedness score.
//!
//! In video mode, the bounding box of a hand's landmarks is used as its RoI in the next frame, so
//! palm detection only has to run while fewer than the maximum number of hands are tracked.

use anyhow::{bail, Context};
use image::RgbImage;

use crate::{
    detection::Detection,
    detector::{DetectError, DetectorOptions, LandmarkSource, RunningMode, TimestampGuard},
    landmark::{Landmark, Landmarks},
    nn::{Cnn, NeuralNetwork, Outputs},
    rect::Rect,
    resolution::Resolution,
    timer::{RateLog, Timer},
};

use super::{
    palm::{hand_roi, PalmDetector},
    Hand, Handedness, NUM_LANDMARKS,
};

/// Relative padding added on every side of the landmark bounding box to get the next RoI.
pub const ROI_PADDING: f32 = 0.3;

/// A [`LandmarkSource`] backed by a palm detection and a hand landmark network.
///
/// Up to [`DetectorOptions::max_hands`] hands are reported per image, most present first.
pub struct HandLandmarker {
    stages: Box<dyn Stages>,
    options: DetectorOptions,
    tracked: Vec<Roi>,
    timestamps: TimestampGuard,
    rate: RateLog,
}

/// The networks behind a [`HandLandmarker`].
trait Stages: Send {
    /// Finds palms in the whole image, most confident first.
    fn palms(&self, image: &RgbImage) -> anyhow::Result<Vec<Detection>>;

    /// Estimates the landmarks of the hand inside of `roi`.
    fn landmarks(&self, image: &RgbImage, roi: Rect) -> anyhow::Result<Estimate>;

    fn timers(&self) -> Vec<&Timer>;
}

struct Networks {
    palm: PalmDetector,
    landmark: Cnn,
    t_infer: Timer,
    t_extract: Timer,
}

impl Stages for Networks {
    fn palms(&self, image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        self.palm.detect(image)
    }

    fn landmarks(&self, image: &RgbImage, roi: Rect) -> anyhow::Result<Estimate> {
        let input_res = self.landmark.input_resolution();
        let aspect = input_res.width() as f32 / input_res.height() as f32;
        let rect = roi.grow_to_fit_aspect(aspect);

        let outputs = self.t_infer.time(|| self.landmark.estimate(image, rect))?;
        log::trace!("inference result: {:?}", outputs);

        let image_res = Resolution::new(image.width(), image.height());
        self.t_extract
            .time(|| extract(&outputs, input_res, rect, image_res))
    }

    fn timers(&self) -> Vec<&Timer> {
        let mut timers = self.palm.timers().to_vec();
        timers.extend([&self.t_infer, &self.t_extract]);
        timers
    }
}

#[derive(Debug, Clone, Copy)]
struct Roi {
    image_res: Resolution,
    rect: Rect,
}

struct Estimate {
    landmarks: Landmarks,
    presence: f32,
    raw_handedness: f32,
}

impl Estimate {
    fn into_hand(self) -> Hand {
        let handedness = if self.raw_handedness > 0.5 {
            Handedness::Right
        } else {
            Handedness::Left
        };
        Hand::new(self.landmarks)
            .with_presence(self.presence)
            .with_handedness(handedness)
    }
}

impl HandLandmarker {
    /// Loads the model assets named in `options`.
    ///
    /// This fails if a model cannot be read or does not look like the network it should be.
    pub fn new(options: DetectorOptions) -> anyhow::Result<Self> {
        let mut palm = PalmDetector::new(options.palm_model_path())?;
        palm.set_threshold(options.detection_confidence());

        let nn = NeuralNetwork::from_path(options.model_path()).with_context(|| {
            format!(
                "failed to load hand landmark model from {}",
                options.model_path().display()
            )
        })?;
        Self::from_networks(palm, nn, options)
    }

    /// Creates a landmarker from an already loaded palm detector and landmark network.
    pub fn from_networks(
        palm: PalmDetector,
        nn: NeuralNetwork,
        options: DetectorOptions,
    ) -> anyhow::Result<Self> {
        if nn.num_outputs() < 3 {
            bail!(
                "hand landmark network needs at least 3 outputs (landmarks, presence, handedness), \
                this one has {}",
                nn.num_outputs()
            );
        }
        let landmark = Cnn::new(nn)?;
        log::info!(
            "loaded hand landmark model {} ({} input, {:?} mode, up to {} hands)",
            options.model_path().display(),
            landmark.input_resolution(),
            options.mode(),
            options.max_hands(),
        );

        let networks = Networks {
            palm,
            landmark,
            t_infer: Timer::new("infer"),
            t_extract: Timer::new("extract"),
        };
        Ok(Self::with_stages(Box::new(networks), options))
    }

    fn with_stages(stages: Box<dyn Stages>, options: DetectorOptions) -> Self {
        Self {
            stages,
            options,
            tracked: Vec::new(),
            timestamps: TimestampGuard::default(),
            rate: RateLog::new("hand tracking"),
        }
    }

    /// Runs palm detection and estimates the hands of up to `max` palms.
    ///
    /// Palms whose center lies in one of the `known` regions are skipped, and so are palms whose
    /// hand presence is below the tracking confidence.
    fn acquire(
        &self,
        image: &RgbImage,
        known: &[Rect],
        max: usize,
    ) -> anyhow::Result<Vec<Estimate>> {
        let mut found = Vec::new();
        if max == 0 {
            return Ok(found);
        }

        let mut claimed = known.to_vec();
        let palms = self.stages.palms(image)?;
        for palm in palms {
            if found.len() >= max {
                break;
            }
            if palm.confidence() < self.options.detection_confidence() {
                continue;
            }
            if claimed.iter().any(|rect| rect.contains(palm.rect().center())) {
                continue;
            }

            let roi = hand_roi(&palm);
            let estimate = self.stages.landmarks(image, roi)?;
            if estimate.presence < self.options.tracking_confidence() {
                log::trace!(
                    "palm at {:?} rejected, hand presence {}",
                    palm.rect(),
                    estimate.presence
                );
                continue;
            }
            claimed.push(roi);
            found.push(estimate);
        }
        Ok(found)
    }

    fn report(&self, mut hands: Vec<Hand>) -> Vec<Hand> {
        hands.sort_by(|a, b| b.presence().total_cmp(&a.presence()));
        hands.truncate(self.options.max_hands());
        hands
    }

    fn track(&mut self, image: &RgbImage, timestamp_ms: u64) -> Result<Vec<Hand>, DetectError> {
        let image_res = Resolution::new(image.width(), image.height());
        let previous = std::mem::take(&mut self.tracked);

        let mut hands = Vec::new();
        let mut tracked: Vec<Roi> = Vec::new();
        for roi in previous.into_iter().filter(|roi| roi.image_res == image_res) {
            let estimate = self.stages.landmarks(image, roi.rect)?;
            if estimate.presence < self.options.tracking_confidence() {
                log::trace!(
                    "{timestamp_ms}ms: presence {} below tracking threshold {} -> LOST",
                    estimate.presence,
                    self.options.tracking_confidence(),
                );
                continue;
            }

            let next = next_roi(&estimate.landmarks, image_res);
            if let Some(next) = next {
                // Two RoIs that converged on the same hand.
                if tracked.iter().any(|t| t.rect.contains(next.rect.center())) {
                    continue;
                }
                tracked.push(next);
            }
            hands.push(estimate.into_hand());
        }

        let missing = self.options.max_hands().saturating_sub(hands.len());
        if missing > 0 {
            let known: Vec<Rect> = tracked.iter().map(|roi| roi.rect).collect();
            for estimate in self.acquire(image, &known, missing)? {
                if let Some(next) = next_roi(&estimate.landmarks, image_res) {
                    log::trace!("{timestamp_ms}ms: start tracking at {:?}", next.rect);
                    tracked.push(next);
                }
                hands.push(estimate.into_hand());
            }
        }

        self.tracked = tracked;
        Ok(self.report(hands))
    }
}

impl LandmarkSource for HandLandmarker {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Hand>, DetectError> {
        let found = self.acquire(image, &[], self.options.max_hands())?;
        Ok(self.report(found.into_iter().map(Estimate::into_hand).collect()))
    }

    fn detect_for_video(
        &mut self,
        image: &RgbImage,
        timestamp_ms: u64,
    ) -> Result<Vec<Hand>, DetectError> {
        if self.options.mode() != RunningMode::Video {
            return Err(DetectError::WrongRunningMode(self.options.mode()));
        }
        self.timestamps.advance(timestamp_ms)?;

        let result = self.track(image, timestamp_ms);
        let timers = self.stages.timers();
        self.rate.frame(&timers);
        result
    }
}

/// Computes the region of interest for the next frame from normalized landmarks.
fn next_roi(landmarks: &Landmarks, image_res: Resolution) -> Option<Roi> {
    let (w, h) = (image_res.width() as f32, image_res.height() as f32);
    let rect = Rect::bounding(landmarks.iter().map(|lm| [lm.x() * w, lm.y() * h]))?;
    if rect.width() <= 0.0 || rect.height() <= 0.0 {
        return None;
    }
    Some(Roi {
        image_res,
        rect: rect.grow_rel(ROI_PADDING),
    })
}

/// Maps the raw network outputs to landmarks normalized to the full image.
fn extract(
    outputs: &Outputs,
    input_res: Resolution,
    rect: Rect,
    image_res: Resolution,
) -> anyhow::Result<Estimate> {
    if outputs.len() < 3 {
        bail!("expected 3 network outputs, got {}", outputs.len());
    }
    let screen_landmarks = &outputs[0];
    if screen_landmarks.as_slice().len() != NUM_LANDMARKS * 3 {
        bail!(
            "unexpected landmark output shape {:?}",
            screen_landmarks.shape()
        );
    }
    let presence = *outputs[1]
        .as_slice()
        .first()
        .context("empty hand presence output")?;
    let raw_handedness = *outputs[2]
        .as_slice()
        .first()
        .context("empty handedness output")?;

    let (in_w, in_h) = (input_res.width() as f32, input_res.height() as f32);
    let (img_w, img_h) = (image_res.width() as f32, image_res.height() as f32);
    let landmarks = screen_landmarks
        .as_slice()
        .chunks_exact(3)
        .map(|xyz| {
            let [x, y] = rect.transform_out(xyz[0] / in_w, xyz[1] / in_h);
            Landmark::new([x / img_w, y / img_h, xyz[2] / in_w])
        })
        .collect();

    Ok(Estimate {
        landmarks,
        presence,
        raw_handedness,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use approx::assert_relative_eq;

    use crate::{hand::LandmarkIdx, nn::Output};

    use super::*;

    fn outputs(landmark: [f32; 3], presence: f32, handedness: f32) -> Outputs {
        let screen = landmark
            .iter()
            .copied()
            .cycle()
            .take(NUM_LANDMARKS * 3)
            .collect();
        [
            Output::new(vec![1, 63], screen),
            Output::new(vec![1, 1], vec![presence]),
            Output::new(vec![1, 1], vec![handedness]),
        ]
        .into_iter()
        .collect()
    }

    /// A 200x200 scene with palms and hands at fixed pixel positions.
    #[derive(Default)]
    struct Scene {
        /// Centers of the palms the palm detector reports.
        palms: Vec<[f32; 2]>,
        /// Hand centers and their presence scores.
        hands: Vec<([f32; 2], f32)>,
        palm_runs: usize,
        landmark_rois: Vec<Rect>,
    }

    const SCENE_SIZE: u32 = 200;

    struct SceneStages(Arc<Mutex<Scene>>);

    impl Stages for SceneStages {
        fn palms(&self, _: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            let mut scene = self.0.lock().unwrap();
            scene.palm_runs += 1;
            Ok(scene
                .palms
                .iter()
                .map(|&[x, y]| {
                    // Upright palm: wrist below, middle finger above the center.
                    let mut keypoints = vec![[x, y]; 7];
                    keypoints[0] = [x, y + 10.0];
                    keypoints[2] = [x, y - 10.0];
                    Detection::new(0.9, Rect::from_center(x, y, 20.0, 20.0), keypoints)
                })
                .collect())
        }

        fn landmarks(&self, _: &RgbImage, roi: Rect) -> anyhow::Result<Estimate> {
            let mut scene = self.0.lock().unwrap();
            scene.landmark_rois.push(roi);
            let size = SCENE_SIZE as f32;
            let Some(&([x, y], presence)) = scene.hands.iter().find(|(c, _)| roi.contains(*c))
            else {
                return Ok(Estimate {
                    landmarks: Landmarks::new(NUM_LANDMARKS),
                    presence: 0.0,
                    raw_handedness: 0.0,
                });
            };
            // Landmarks on the corners of a 20x20 box around the hand center. The index
            // fingertip ends up in the top left corner.
            let landmarks = (0..NUM_LANDMARKS)
                .map(|i| {
                    let dx = if i % 2 == 0 { -10.0 } else { 10.0 };
                    let dy = if (i / 2) % 2 == 0 { -10.0 } else { 10.0 };
                    Landmark::new([(x + dx) / size, (y + dy) / size, 0.0])
                })
                .collect();
            Ok(Estimate {
                landmarks,
                presence,
                raw_handedness: 0.0,
            })
        }

        fn timers(&self) -> Vec<&Timer> {
            Vec::new()
        }
    }

    fn with_scene(scene: Scene, options: DetectorOptions) -> (HandLandmarker, Arc<Mutex<Scene>>) {
        let scene = Arc::new(Mutex::new(scene));
        let stages = SceneStages(scene.clone());
        (HandLandmarker::with_stages(Box::new(stages), options), scene)
    }

    fn frame() -> RgbImage {
        RgbImage::new(SCENE_SIZE, SCENE_SIZE)
    }

    fn tip_x(hand: &Hand) -> f32 {
        hand.landmark(LandmarkIdx::IndexFingerTip).unwrap().x() * SCENE_SIZE as f32
    }

    #[test]
    fn extract_maps_to_full_image() {
        // 640x480 frame padded to a 640x640 square crop, network input 224x224.
        let image_res = Resolution::VGA;
        let rect = Rect::from_top_left(0.0, -80.0, 640.0, 640.0);
        let estimate = extract(
            &outputs([112.0, 112.0, 22.4], 0.9, 0.2),
            Resolution::new(224, 224),
            rect,
            image_res,
        )
        .unwrap();

        let hand = estimate.into_hand();
        let tip = hand.landmark(LandmarkIdx::IndexFingerTip).unwrap();
        assert_relative_eq!(tip.x(), 0.5);
        assert_relative_eq!(tip.y(), 0.5);
        assert_relative_eq!(tip.z(), 0.1, epsilon = 1e-6);
        assert_relative_eq!(hand.presence(), 0.9);
        assert_eq!(hand.handedness(), Handedness::Left);
    }

    #[test]
    fn extract_rejects_bad_outputs() {
        let short: Outputs = [Output::new(vec![1, 3], vec![0.0; 3])]
            .into_iter()
            .collect();
        let rect = Rect::from_top_left(0.0, 0.0, 10.0, 10.0);
        let res = Resolution::new(10, 10);
        assert!(extract(&short, res, rect, res).is_err());

        let wrong_len: Outputs = [
            Output::new(vec![1, 60], vec![0.0; 60]),
            Output::new(vec![1, 1], vec![1.0]),
            Output::new(vec![1, 1], vec![1.0]),
        ]
        .into_iter()
        .collect();
        assert!(extract(&wrong_len, res, rect, res).is_err());
    }

    #[test]
    fn roi_follows_landmarks() {
        let lms: Landmarks = [[0.25, 0.25, 0.0], [0.5, 0.75, 0.0]]
            .into_iter()
            .map(Landmark::new)
            .collect();
        let roi = next_roi(&lms, Resolution::new(100, 100)).unwrap();
        assert_eq!(roi.rect.center(), [37.5, 50.0]);
        assert_relative_eq!(roi.rect.width(), 25.0 * (1.0 + 2.0 * ROI_PADDING));
        assert_relative_eq!(roi.rect.height(), 50.0 * (1.0 + 2.0 * ROI_PADDING));
    }

    #[test]
    fn degenerate_roi_is_dropped() {
        let lms = Landmarks::new(NUM_LANDMARKS);
        assert!(next_roi(&lms, Resolution::new(100, 100)).is_none());
    }

    #[test]
    fn image_mode_reports_every_hand() {
        let scene = Scene {
            palms: vec![[50.0, 50.0], [150.0, 150.0]],
            hands: vec![([50.0, 50.0], 0.7), ([150.0, 150.0], 0.9)],
            ..Scene::default()
        };
        let options = DetectorOptions::new("hand.onnx").running_mode(RunningMode::Image);
        let (mut landmarker, scene) = with_scene(scene, options);

        let hands = landmarker.detect(&frame()).unwrap();
        assert_eq!(hands.len(), 2);
        // Most present hand first.
        assert_relative_eq!(hands[0].presence(), 0.9);
        assert_relative_eq!(tip_x(&hands[0]), 140.0, epsilon = 1e-4);
        assert_relative_eq!(tip_x(&hands[1]), 40.0, epsilon = 1e-4);
        assert_eq!(scene.lock().unwrap().palm_runs, 1);

        // Single images do not start tracking.
        assert!(landmarker.tracked.is_empty());
        assert!(matches!(
            landmarker.detect_for_video(&frame(), 1),
            Err(DetectError::WrongRunningMode(RunningMode::Image))
        ));
    }

    #[test]
    fn max_hands_limits_estimates() {
        let scene = Scene {
            palms: vec![[50.0, 50.0], [150.0, 150.0]],
            hands: vec![([50.0, 50.0], 0.7), ([150.0, 150.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, scene) =
            with_scene(scene, DetectorOptions::new("hand.onnx").num_hands(1));
        assert_eq!(landmarker.detect(&frame()).unwrap().len(), 1);
        assert_eq!(scene.lock().unwrap().landmark_rois.len(), 1);

        let scene = Scene {
            palms: vec![[50.0, 50.0]],
            hands: vec![([50.0, 50.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, scene) =
            with_scene(scene, DetectorOptions::new("hand.onnx").num_hands(0));
        assert!(landmarker.detect(&frame()).unwrap().is_empty());
        assert_eq!(scene.lock().unwrap().palm_runs, 0);
    }

    #[test]
    fn palms_without_hand_are_dropped() {
        let scene = Scene {
            palms: vec![[50.0, 50.0], [150.0, 150.0]],
            hands: vec![([50.0, 50.0], 0.3), ([150.0, 150.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, _) = with_scene(scene, DetectorOptions::new("hand.onnx"));
        let hands = landmarker.detect(&frame()).unwrap();
        assert_eq!(hands.len(), 1);
        assert_relative_eq!(hands[0].presence(), 0.9);
    }

    #[test]
    fn video_mode_tracks_without_palm_detection() {
        let scene = Scene {
            palms: vec![[100.0, 100.0]],
            hands: vec![([100.0, 100.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, scene) =
            with_scene(scene, DetectorOptions::new("hand.onnx").num_hands(1));

        let first = landmarker.detect_for_video(&frame(), 33).unwrap();
        assert_eq!(first.len(), 1);
        assert_relative_eq!(tip_x(&first[0]), 90.0, epsilon = 1e-4);

        let second = landmarker.detect_for_video(&frame(), 66).unwrap();
        assert_eq!(second.len(), 1);

        let scene = scene.lock().unwrap();
        assert_eq!(scene.palm_runs, 1);
        // The second frame looks at the padded landmark box of the first.
        let roi = scene.landmark_rois[1];
        assert_relative_eq!(roi.center()[0], 100.0, epsilon = 1e-4);
        assert_relative_eq!(roi.center()[1], 100.0, epsilon = 1e-4);
        assert_relative_eq!(roi.width(), 20.0 * (1.0 + 2.0 * ROI_PADDING), epsilon = 1e-3);
    }

    #[test]
    fn lost_hand_is_searched_again() {
        let scene = Scene {
            palms: vec![[100.0, 100.0]],
            hands: vec![([100.0, 100.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, scene) =
            with_scene(scene, DetectorOptions::new("hand.onnx").num_hands(1));
        assert_eq!(landmarker.detect_for_video(&frame(), 1).unwrap().len(), 1);

        scene.lock().unwrap().hands[0].1 = 0.2;
        assert!(landmarker.detect_for_video(&frame(), 2).unwrap().is_empty());
        assert_eq!(scene.lock().unwrap().palm_runs, 2);
        assert!(landmarker.tracked.is_empty());

        scene.lock().unwrap().hands[0].1 = 0.8;
        assert_eq!(landmarker.detect_for_video(&frame(), 3).unwrap().len(), 1);
        assert_eq!(scene.lock().unwrap().palm_runs, 3);
        assert_eq!(landmarker.tracked.len(), 1);
    }

    #[test]
    fn tracked_hand_is_not_detected_twice() {
        let scene = Scene {
            palms: vec![[100.0, 100.0]],
            hands: vec![([100.0, 100.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, scene) = with_scene(scene, DetectorOptions::new("hand.onnx"));
        assert_eq!(landmarker.detect_for_video(&frame(), 1).unwrap().len(), 1);

        // Room for a second hand, so palms are searched again, but the only palm is tracked.
        assert_eq!(landmarker.detect_for_video(&frame(), 2).unwrap().len(), 1);
        let scene = scene.lock().unwrap();
        assert_eq!(scene.palm_runs, 2);
        assert_eq!(scene.landmark_rois.len(), 2);
        assert_eq!(landmarker.tracked.len(), 1);
    }

    #[test]
    fn second_hand_joins_tracking() {
        let scene = Scene {
            palms: vec![[50.0, 50.0]],
            hands: vec![([50.0, 50.0], 0.6), ([150.0, 150.0], 0.9)],
            ..Scene::default()
        };
        let (mut landmarker, scene) = with_scene(scene, DetectorOptions::new("hand.onnx"));
        assert_eq!(landmarker.detect_for_video(&frame(), 1).unwrap().len(), 1);

        scene.lock().unwrap().palms.push([150.0, 150.0]);
        let hands = landmarker.detect_for_video(&frame(), 2).unwrap();
        assert_eq!(hands.len(), 2);
        assert_relative_eq!(hands[0].presence(), 0.9);
        assert_eq!(landmarker.tracked.len(), 2);

        // Both hands tracked: no more palm detection.
        assert_eq!(landmarker.detect_for_video(&frame(), 3).unwrap().len(), 2);
        assert_eq!(scene.lock().unwrap().palm_runs, 2);
    }

    #[test]
    fn timestamps_are_checked_before_inference() {
        let (mut landmarker, scene) =
            with_scene(Scene::default(), DetectorOptions::new("hand.onnx"));
        landmarker.detect_for_video(&frame(), 10).unwrap();
        assert!(matches!(
            landmarker.detect_for_video(&frame(), 10),
            Err(DetectError::InvalidTemporalOrder { .. })
        ));
        assert_eq!(scene.lock().unwrap().palm_runs, 1);
    }
}
