//! Single-Shot MultiBox Detector (SSD) building blocks.
//!
//! SSD networks predict a box for every *anchor*, a fixed point on one of several grids laid over
//! the input image, together with a confidence score. Box coordinates are offsets from the anchor
//! position. Many anchors usually fire for the same object, so the raw detections are merged with
//! [`non_max_suppression`].

use std::ops::Index;

use crate::rect::Rect;

/// One grid of anchors.
#[derive(Debug, Clone, Copy)]
pub struct LayerInfo {
    boxes_per_cell: u32,
    width: u32,
    height: u32,
}

impl LayerInfo {
    pub const fn new(boxes_per_cell: u32, width: u32, height: u32) -> Self {
        Self {
            boxes_per_cell,
            width,
            height,
        }
    }
}

/// An anchor position, relative to the network input (`0.0..=1.0`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    x_center: f32,
    y_center: f32,
}

impl Anchor {
    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    pub fn y_center(&self) -> f32 {
        self.y_center
    }
}

/// All anchors of a network, in the order of its outputs.
#[derive(Debug)]
pub struct Anchors {
    anchors: Vec<Anchor>,
}

impl Anchors {
    /// Computes the anchors for the given layers.
    ///
    /// Every layer contributes `boxes_per_cell` anchors at the center of each of its cells, row by
    /// row.
    pub fn calculate(layers: &[LayerInfo]) -> Self {
        let mut anchors = Vec::new();
        for layer in layers {
            let (w, h) = (layer.width as f32, layer.height as f32);
            for y in 0..layer.height {
                for x in 0..layer.width {
                    let anchor = Anchor {
                        x_center: (x as f32 + 0.5) / w,
                        y_center: (y as f32 + 0.5) / h,
                    };
                    anchors.extend((0..layer.boxes_per_cell).map(|_| anchor));
                }
            }
        }
        Self { anchors }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

impl Index<usize> for Anchors {
    type Output = Anchor;

    fn index(&self, index: usize) -> &Anchor {
        &self.anchors[index]
    }
}

/// A detected object with a confidence score, a bounding rectangle, and a list of keypoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    confidence: f32,
    rect: Rect,
    keypoints: Vec<[f32; 2]>,
}

impl Detection {
    pub fn new(confidence: f32, rect: Rect, keypoints: Vec<[f32; 2]>) -> Self {
        Self {
            confidence,
            rect,
            keypoints,
        }
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn keypoints(&self) -> &[[f32; 2]] {
        &self.keypoints
    }

    /// Applies `f` to the rectangle corners and every keypoint.
    ///
    /// `f` has to preserve axis alignment (a translation and/or scale).
    pub fn map_coords(self, f: impl Fn([f32; 2]) -> [f32; 2]) -> Self {
        let [x0, y0] = f([self.rect.x(), self.rect.y()]);
        let [x1, y1] = f([
            self.rect.x() + self.rect.width(),
            self.rect.y() + self.rect.height(),
        ]);
        Self {
            confidence: self.confidence,
            rect: Rect::from_top_left(x0, y0, x1 - x0, y1 - y0),
            keypoints: self.keypoints.into_iter().map(f).collect(),
        }
    }
}

/// Merges overlapping detections.
///
/// Detections are processed from the most to the least confident. Every detection whose
/// intersection over union with the current one is at least `iou_thresh` is merged into it: the
/// result has a confidence-weighted average of the rectangles and keypoints, and the confidence of
/// the most confident detection. The output is sorted by descending confidence.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    // Ascending, so that the most confident detection can be popped off the back.
    detections.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut out = Vec::new();
    while let Some(seed) = detections.pop() {
        let (overlapping, rest): (Vec<_>, Vec<_>) = detections
            .into_iter()
            .partition(|other| seed.rect.iou(&other.rect) >= iou_thresh);
        detections = rest;
        out.push(average(seed, &overlapping));
    }
    out
}

fn average(seed: Detection, overlapping: &[Detection]) -> Detection {
    if overlapping.is_empty() {
        return seed;
    }

    let group = || std::iter::once(&seed).chain(overlapping);
    let divisor: f32 = group().map(|det| det.confidence).sum();
    if divisor <= 0.0 {
        return seed;
    }

    let mut acc = [0.0; 4];
    let mut keypoints = vec![[0.0; 2]; seed.keypoints.len()];
    for det in group() {
        let factor = det.confidence / divisor;
        let [x, y] = det.rect.center();
        for (acc, value) in acc.iter_mut().zip([x, y, det.rect.width(), det.rect.height()]) {
            *acc += value * factor;
        }
        // Detections from the same network always have the same number of keypoints.
        for (acc, [x, y]) in keypoints.iter_mut().zip(&det.keypoints) {
            acc[0] += x * factor;
            acc[1] += y * factor;
        }
    }

    Detection {
        confidence: seed.confidence,
        rect: Rect::from_center(acc[0], acc[1], acc[2], acc[3]),
        keypoints,
    }
}
