// nms.rs — Greedy non-maximum suppression over detection boxes.
//
// Detections of one object cluster at neighbouring positions and scales.
// NMS keeps the best-scoring box of each cluster:
//
//   1. drop boxes scoring ≤ min_score
//   2. sort by descending score
//   3. for each box i (skipping suppressed ones in greedy mode), suppress
//      every later box j with a strictly lower score whose overlap
//      intersection / min(area_i, area_j) exceeds `overlap`
//   4. drop the suppressed boxes
//
// Overlap is measured against the smaller box, so a small box inside a
// large one counts as fully overlapping.
//
// Removal swaps the last box into the freed slot, so the output order is
// not meaningful; only the set of boxes is.

use serde::{Deserialize, Serialize};

/// Axis-aligned detection in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, score: f32) -> Self {
        BoundingBox { x, y, width, height, score }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection area divided by the smaller of the two areas.
    pub fn overlap_min(&self, other: &BoundingBox) -> f32 {
        let iw = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        if iw <= 0.0 {
            return 0.0;
        }
        let ih = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        if ih <= 0.0 {
            return 0.0;
        }
        iw * ih / self.area().min(other.area())
    }
}

/// NMS parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmsOptions {
    /// Overlap ratio above which the lower-scoring box is suppressed.
    pub overlap: f32,
    /// Suppressed boxes no longer suppress others.
    pub greedy: bool,
    /// Score floor; `None` uses the detection call's cascade threshold.
    pub min_score: Option<f32>,
}

impl Default for NmsOptions {
    fn default() -> Self {
        NmsOptions { overlap: 0.65, greedy: true, min_score: None }
    }
}

// Remove boxes[i] by moving the last box into its slot.
fn swap_remove_where(boxes: &mut Vec<BoundingBox>, mut drop: impl FnMut(usize, &BoundingBox) -> bool) {
    for i in (0..boxes.len()).rev() {
        if drop(i, &boxes[i]) {
            boxes.swap_remove(i);
        }
    }
}

/// Suppress overlapping boxes in place.
pub fn nms(boxes: &mut Vec<BoundingBox>, min_score: f32, overlap: f32, greedy: bool) {
    swap_remove_where(boxes, |_, b| b.score <= min_score);
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let n = boxes.len();
    let mut keep = vec![true; n];
    for i in 0..n {
        if greedy && !keep[i] {
            continue;
        }
        for j in i + 1..n {
            if !keep[j] || boxes[j].score >= boxes[i].score {
                continue;
            }
            if boxes[i].overlap_min(&boxes[j]) > overlap {
                keep[j] = false;
            }
        }
    }
    swap_remove_where(boxes, |i, _| !keep[i]);
}

impl NmsOptions {
    /// Run [`nms`] with these options, `casc_thr` standing in for an unset
    /// `min_score`.
    pub fn apply(&self, boxes: &mut Vec<BoundingBox>, casc_thr: f32) {
        nms(boxes, self.min_score.unwrap_or(casc_thr), self.overlap, self.greedy);
    }
}
