//! Palm detection using a MediaPipe-style ONNX palm detection network.
//!
//! Palms are easier to find than whole hands: they are roughly square and do not change shape
//! much when the fingers move. Each detected palm is turned into a region of interest for the
//! landmark network with [`hand_roi`].

use std::path::Path;

use anyhow::{bail, Context};
use image::RgbImage;

use crate::{
    detection::{non_max_suppression, Anchors, Detection, LayerInfo},
    nn::{Cnn, NeuralNetwork, Outputs},
    rect::Rect,
    resolution::Resolution,
    timer::Timer,
};

/// A keypoint of a palm [`Detection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keypoint {
    Wrist = 0,
    IndexFingerMcp = 1,
    MiddleFingerMcp = 2,
    RingFingerMcp = 3,
    PinkyMcp = 4,
    ThumbCmc = 5,
    ThumbMcp = 6,
}

const NUM_KEYPOINTS: usize = 7;
/// Box center, box size and one position per keypoint.
const BOX_PARAMS: usize = 4 + NUM_KEYPOINTS * 2;

const LAYERS: &[LayerInfo] = &[LayerInfo::new(2, 24, 24), LayerInfo::new(6, 12, 12)];

/// Detections overlapping by at least this much are merged.
pub const IOU_THRESH: f32 = 0.3;

/// Side length of a hand RoI, relative to the palm box.
pub const HAND_ROI_SCALE: f32 = 2.6;
/// Distance the hand RoI is moved towards the fingers, relative to the palm box.
pub const HAND_ROI_SHIFT: f32 = 0.5;

/// Returns the position of `keypoint` in a palm detection.
pub fn keypoint(palm: &Detection, keypoint: Keypoint) -> Option<[f32; 2]> {
    palm.keypoints().get(keypoint as usize).copied()
}

/// Computes the region the hand landmark network should look at for a detected palm.
///
/// The palm box is squared, enlarged, and moved from the wrist towards the middle finger, where
/// the rest of the hand is.
pub fn hand_roi(palm: &Detection) -> Rect {
    let rect = palm.rect();
    let palm_size = rect.width().max(rect.height());
    let direction = match (
        keypoint(palm, Keypoint::Wrist),
        keypoint(palm, Keypoint::MiddleFingerMcp),
    ) {
        (Some([wx, wy]), Some([mx, my])) => {
            let (dx, dy) = (mx - wx, my - wy);
            let len = dx.hypot(dy);
            if len > 0.0 {
                [dx / len, dy / len]
            } else {
                [0.0, -1.0]
            }
        }
        // Upright hand.
        _ => [0.0, -1.0],
    };

    let [cx, cy] = rect.center();
    let shift = palm_size * HAND_ROI_SHIFT;
    let size = palm_size * HAND_ROI_SCALE;
    Rect::from_center(
        cx + direction[0] * shift,
        cy + direction[1] * shift,
        size,
        size,
    )
}

/// Finds palms in images.
pub struct PalmDetector {
    cnn: Cnn,
    anchors: Anchors,
    threshold: f32,
    t_infer: Timer,
    t_extract: Timer,
    t_nms: Timer,
}

impl PalmDetector {
    /// Loads the palm detection model at `path`.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let nn = NeuralNetwork::from_path(path).with_context(|| {
            format!("failed to load palm detection model from {}", path.display())
        })?;
        let detector = Self::from_network(nn)?;
        log::info!(
            "loaded palm detection model {} ({} input)",
            path.display(),
            detector.cnn.input_resolution(),
        );
        Ok(detector)
    }

    /// Creates a palm detector from an already loaded network.
    pub fn from_network(nn: NeuralNetwork) -> anyhow::Result<Self> {
        if nn.num_outputs() < 2 {
            bail!(
                "palm detection network needs 2 outputs (boxes, scores), this one has {}",
                nn.num_outputs()
            );
        }
        Ok(Self {
            cnn: Cnn::new(nn)?,
            anchors: Anchors::calculate(LAYERS),
            threshold: 0.5,
            t_infer: Timer::new("palm infer"),
            t_extract: Timer::new("palm extract"),
            t_nms: Timer::new("palm nms"),
        })
    }

    /// Sets the minimum confidence of reported palms.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn timers(&self) -> [&Timer; 3] {
        [&self.t_infer, &self.t_extract, &self.t_nms]
    }

    /// Detects palms in `image`, most confident first.
    ///
    /// Detections are in the image's pixel coordinates.
    pub fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        let input_res = self.cnn.input_resolution();
        let aspect = input_res.width() as f32 / input_res.height() as f32;
        let view = Rect::from_top_left(0.0, 0.0, image.width() as f32, image.height() as f32)
            .grow_to_fit_aspect(aspect);

        let outputs = self.t_infer.time(|| self.cnn.estimate(image, view))?;
        let detections = self
            .t_extract
            .time(|| extract(&outputs, &self.anchors, input_res, self.threshold))?;
        let detections = self
            .t_nms
            .time(|| non_max_suppression(detections, IOU_THRESH));

        let (in_w, in_h) = (input_res.width() as f32, input_res.height() as f32);
        Ok(detections
            .into_iter()
            .map(|det| det.map_coords(|[x, y]| view.transform_out(x / in_w, y / in_h)))
            .collect())
    }
}

/// Decodes raw network outputs into detections in network input coordinates.
fn extract(
    outputs: &Outputs,
    anchors: &Anchors,
    input_res: Resolution,
    threshold: f32,
) -> anyhow::Result<Vec<Detection>> {
    if outputs.len() < 2 {
        bail!("expected 2 network outputs, got {}", outputs.len());
    }
    let (boxes, scores) = (&outputs[0], &outputs[1]);
    if boxes.as_slice().len() != anchors.len() * BOX_PARAMS
        || scores.as_slice().len() != anchors.len()
    {
        bail!(
            "palm detection output shapes {:?} and {:?} do not match {} anchors",
            boxes.shape(),
            scores.shape(),
            anchors.len(),
        );
    }

    let (in_w, in_h) = (input_res.width() as f32, input_res.height() as f32);
    let mut detections = Vec::new();
    for (index, (&score, params)) in scores
        .as_slice()
        .iter()
        .zip(boxes.as_slice().chunks_exact(BOX_PARAMS))
        .enumerate()
    {
        let confidence = sigmoid(score);
        if confidence < threshold {
            continue;
        }

        let anchor = &anchors[index];
        let (ax, ay) = (anchor.x_center() * in_w, anchor.y_center() * in_h);
        let rect = Rect::from_center(params[0] + ax, params[1] + ay, params[2], params[3]);
        let keypoints = params[4..]
            .chunks_exact(2)
            .map(|xy| [xy[0] + ax, xy[1] + ay])
            .collect();
        detections.push(Detection::new(confidence, rect, keypoints));
    }
    Ok(detections)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::nn::Output;

    use super::*;

    fn palm(center: [f32; 2], size: f32, wrist: [f32; 2], middle: [f32; 2]) -> Detection {
        let mut keypoints = vec![[0.0; 2]; NUM_KEYPOINTS];
        keypoints[Keypoint::Wrist as usize] = wrist;
        keypoints[Keypoint::MiddleFingerMcp as usize] = middle;
        Detection::new(
            0.9,
            Rect::from_center(center[0], center[1], size, size),
            keypoints,
        )
    }

    #[test]
    fn hand_roi_extends_towards_fingers() {
        let upright = hand_roi(&palm([100.0, 100.0], 20.0, [100.0, 110.0], [100.0, 90.0]));
        assert_eq!(upright.center(), [100.0, 90.0]);
        assert_relative_eq!(upright.width(), 52.0);
        assert_relative_eq!(upright.height(), 52.0);

        // Fingers pointing to the right.
        let sideways = hand_roi(&palm([100.0, 100.0], 20.0, [90.0, 100.0], [110.0, 100.0]));
        assert_eq!(sideways.center(), [110.0, 100.0]);
    }

    #[test]
    fn hand_roi_without_direction_assumes_upright() {
        let det = Detection::new(0.9, Rect::from_center(50.0, 50.0, 10.0, 20.0), Vec::new());
        let roi = hand_roi(&det);
        assert_eq!(roi.center(), [50.0, 40.0]);
        assert_relative_eq!(roi.width(), 52.0);
    }

    #[test]
    fn extract_offsets_from_anchors() {
        let anchors = Anchors::calculate(&[LayerInfo::new(1, 2, 1)]);
        let input_res = Resolution::new(100, 100);
        let mut boxes = vec![0.0; 2 * BOX_PARAMS];
        // Second anchor, centered at (75, 50).
        boxes[BOX_PARAMS..BOX_PARAMS + 6].copy_from_slice(&[5.0, -5.0, 20.0, 10.0, 1.0, 2.0]);
        let outputs: Outputs = [
            Output::new(vec![1, 2, BOX_PARAMS], boxes),
            Output::new(vec![1, 2, 1], vec![-10.0, 10.0]),
        ]
        .into_iter()
        .collect();

        let detections = extract(&outputs, &anchors, input_res, 0.5).unwrap();
        assert_eq!(detections.len(), 1);
        let det = &detections[0];
        assert!(det.confidence() > 0.99);
        assert_eq!(det.rect(), Rect::from_center(80.0, 45.0, 20.0, 10.0));
        assert_eq!(det.keypoints().len(), NUM_KEYPOINTS);
        assert_eq!(keypoint(det, Keypoint::Wrist), Some([76.0, 52.0]));
        assert_eq!(keypoint(det, Keypoint::ThumbMcp), Some([75.0, 50.0]));
    }

    #[test]
    fn extract_rejects_mismatched_outputs() {
        let anchors = Anchors::calculate(LAYERS);
        let outputs: Outputs = [
            Output::new(vec![1, 896, BOX_PARAMS], vec![0.0; 896 * BOX_PARAMS]),
            Output::new(vec![1, 896, 1], vec![0.0; 896]),
        ]
        .into_iter()
        .collect();
        assert!(extract(&outputs, &anchors, Resolution::new(192, 192), 0.5).is_err());
    }

    #[test]
    fn sigmoid_is_centered() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(-20.0) < 1e-6);
    }
}
