// classifier.rs — Boosted tree cascade: tables, validation and loading.
//
// A classifier is `num_weaks` depth-limited decision trees evaluated in
// order (the cascade). Each tree owns 8 node slots in three parallel
// tables, all `8 × num_weaks` matrices:
//
//   thrs  f32  split threshold of internal node k
//   fids  i32  feature id compared at internal node k
//   hs    f32  leaf values, leaf j at slot j
//
// Internal nodes use heap order: root 0, children 2k+1 (feature below the
// threshold) and 2k+2. After `depth` comparisons node k is a leaf and its
// value is `hs[t*8 + k - (2^depth - 1)]`. Depth is at most 3, which is
// exactly what fits in 8 slots (7 internal nodes, 8 leaves).
//
// Feature ids index the detector window: id m = (z, x, y) in the order
// z-major, then x, then y, where z is one of the 16 feature slots of a
// cell and (x, y) a cell inside the window. `lookup_table` turns ids into
// offsets into a concrete padded feature map.
//
// NEW RUST CONCEPTS:
// - `ClassifierRecord` mirrors the JSON file exactly; `into_classifier` is
//   the one place untrusted data is checked, returning a `Result` instead
//   of panicking like `Classifier::new`.
// - Shared vs owned tables: a `Classifier` built from `Matrix::shared`
//   aliases the caller's `Arc` storage; `deep_copy` detaches it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::DeviceBuffer;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels::{Trees, FEATURE_CHANNELS};
use crate::matrix::{ElemType, Matrix, Size};

/// Node slots per tree.
pub const NODES_PER_TREE: usize = 8;

/// Deepest tree that fits in [`NODES_PER_TREE`] slots.
pub const MAX_DEPTH: usize = 3;

/// Leaf value of tree `t` for a window whose features are read through
/// `feature(fid)`.
pub fn tree_leaf(
    thrs: &[f32],
    fids: &[i32],
    hs: &[f32],
    depth: usize,
    t: usize,
    feature: impl Fn(usize) -> f32,
) -> f32 {
    let base = t * NODES_PER_TREE;
    let mut k = 0;
    for _ in 0..depth {
        let node = base + k;
        k = if feature(fids[node] as usize) < thrs[node] { 2 * k + 1 } else { 2 * k + 2 };
    }
    hs[base + k - ((1 << depth) - 1)]
}

/// Feature lookup table for a window of `win` pixels at `shrink`, over a
/// padded feature map `padded` cells wide: entry m is the float offset of
/// feature id m relative to the window's top-left cell.
pub fn lookup_table(win: Size, shrink: usize, padded: Size) -> Vec<i32> {
    let (mw, mh) = (win.w / shrink, win.h / shrink);
    let mut cids = Vec::with_capacity(mw * mh * FEATURE_CHANNELS);
    for z in 0..FEATURE_CHANNELS {
        for x in 0..mw {
            for y in 0..mh {
                cids.push(((y * padded.w + x) * FEATURE_CHANNELS + z) as i32);
            }
        }
    }
    cids
}

/// A loaded cascade.
#[derive(Debug, Clone)]
pub struct Classifier {
    num_weaks: usize,
    depth: usize,
    shrink: usize,
    win: Size,
    org_win: Size,
    thrs: Matrix,
    fids: Matrix,
    hs: Matrix,
}

impl Classifier {
    /// Build a classifier from its tables.
    ///
    /// # Panics
    /// Panics if any dimension is zero, `depth` is not in `1..=3`, or the
    /// tables are not `8 × num_weaks` matrices of f32 / i32 / f32.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_weaks: usize,
        depth: usize,
        shrink: usize,
        win: Size,
        org_win: Size,
        thrs: Matrix,
        fids: Matrix,
        hs: Matrix,
    ) -> Self {
        assert!(num_weaks > 0, "classifier needs at least one weak learner");
        assert!((1..=MAX_DEPTH).contains(&depth), "tree depth {depth} outside 1..={MAX_DEPTH}");
        assert!(shrink > 0, "classifier shrink must be positive");
        assert!(win.is_positive() && org_win.is_positive(), "window sizes must be positive");
        let shape = Size::new(NODES_PER_TREE, num_weaks);
        for (name, m, elem) in [
            ("thresholds", &thrs, ElemType::F32),
            ("feature ids", &fids, ElemType::I32),
            ("leaf values", &hs, ElemType::F32),
        ] {
            assert_eq!(m.elem(), elem, "{name} must be {elem:?}");
            assert_eq!(m.size(), shape, "{name} must be {shape}");
        }
        Classifier { num_weaks, depth, shrink, win, org_win, thrs, fids, hs }
    }

    /// Parse a JSON classifier record.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let record: ClassifierRecord = serde_json::from_str(json)?;
        record.into_classifier()
    }

    /// Load a JSON classifier record from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn num_weaks(&self) -> usize {
        self.num_weaks
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn shrink(&self) -> usize {
        self.shrink
    }

    /// Detector window in pixels (including the context margin).
    pub fn window(&self) -> Size {
        self.win
    }

    /// Object size inside the window, used for output boxes.
    pub fn original_window(&self) -> Size {
        self.org_win
    }

    pub fn thresholds(&self) -> &[f32] {
        self.thrs.as_slice()
    }

    pub fn feature_ids(&self) -> &[i32] {
        self.fids.as_slice()
    }

    pub fn leaf_values(&self) -> &[f32] {
        self.hs.as_slice()
    }

    /// True if any table aliases caller-owned storage.
    pub fn is_borrowed(&self) -> bool {
        self.thrs.is_borrowed() || self.fids.is_borrowed() || self.hs.is_borrowed()
    }

    /// Copy with every table owned.
    pub fn deep_copy(&self) -> Self {
        Classifier {
            thrs: self.thrs.deep_copy(),
            fids: self.fids.deep_copy(),
            hs: self.hs.deep_copy(),
            ..self.clone()
        }
    }

    /// Leaf value of tree `t`.
    pub fn tree_leaf(&self, t: usize, feature: impl Fn(usize) -> f32) -> f32 {
        tree_leaf(self.thresholds(), self.feature_ids(), self.leaf_values(), self.depth, t, feature)
    }

    /// Full cascade score of one window: trees are summed in order and the
    /// sum is returned as soon as it drops to `casc_thr` or below.
    pub fn score(&self, casc_thr: f32, feature: impl Fn(usize) -> f32) -> f32 {
        let mut h = 0.0f32;
        for t in 0..self.num_weaks {
            h += self.tree_leaf(t, &feature);
            if h <= casc_thr {
                break;
            }
        }
        h
    }

    /// Number of feature ids a window has.
    pub fn num_features(&self) -> usize {
        (self.win.w / self.shrink) * (self.win.h / self.shrink) * FEATURE_CHANNELS
    }

    pub fn to_record(&self) -> ClassifierRecord {
        ClassifierRecord {
            num_weaks: self.num_weaks,
            depth: self.depth,
            shrink: self.shrink,
            win_sz_w: self.win.w,
            win_sz_h: self.win.h,
            org_win_w: self.org_win.w,
            org_win_h: self.org_win.h,
            thrs: self.thresholds().to_vec(),
            fids: self.feature_ids().to_vec(),
            hs: self.leaf_values().to_vec(),
        }
    }
}

/// On-disk form of a classifier. Tables are row-major `num_weaks × 8`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierRecord {
    pub num_weaks: usize,
    pub depth: usize,
    pub shrink: usize,
    pub win_sz_w: usize,
    pub win_sz_h: usize,
    pub org_win_w: usize,
    pub org_win_h: usize,
    pub thrs: Vec<f32>,
    pub fids: Vec<i32>,
    pub hs: Vec<f32>,
}

impl ClassifierRecord {
    /// Validate and convert into a [`Classifier`].
    pub fn into_classifier(self) -> Result<Classifier> {
        let invalid = |msg: String| Err(Error::InvalidClassifier(msg));
        if self.num_weaks == 0 {
            return invalid("num_weaks must be positive".into());
        }
        if !(1..=MAX_DEPTH).contains(&self.depth) {
            return invalid(format!("depth {} outside 1..={MAX_DEPTH}", self.depth));
        }
        if self.shrink == 0 {
            return invalid("shrink must be positive".into());
        }
        let win = Size::new(self.win_sz_w, self.win_sz_h);
        let org_win = Size::new(self.org_win_w, self.org_win_h);
        if win.w < self.shrink || win.h < self.shrink || !org_win.is_positive() {
            return invalid(format!("window {win} / object {org_win} too small for shrink {}", self.shrink));
        }
        let n = self.num_weaks * NODES_PER_TREE;
        for (name, len) in [("thrs", self.thrs.len()), ("fids", self.fids.len()), ("hs", self.hs.len())] {
            if len != n {
                return invalid(format!("{name} holds {len} values, expected {n}"));
            }
        }
        let nftrs = (win.w / self.shrink) * (win.h / self.shrink) * FEATURE_CHANNELS;
        let internal = (1 << self.depth) - 1;
        for (t, tree) in self.fids.chunks(NODES_PER_TREE).enumerate() {
            if let Some(&fid) = tree[..internal].iter().find(|&&f| f < 0 || f as usize >= nftrs) {
                return invalid(format!("tree {t} uses feature id {fid}, window has {nftrs}"));
            }
        }

        let (w, h) = (NODES_PER_TREE, self.num_weaks);
        Ok(Classifier::new(
            self.num_weaks,
            self.depth,
            self.shrink,
            win,
            org_win,
            Matrix::from_vec(w, h, ElemType::F32, self.thrs),
            Matrix::from_vec(w, h, ElemType::I32, self.fids),
            Matrix::from_vec(w, h, ElemType::F32, self.hs),
        ))
    }
}

/// A classifier together with its device-side tables.
///
/// The host tables are authoritative; `sync` uploads them.
pub(crate) struct DeviceClassifier {
    classifier: Classifier,
    thrs: DeviceBuffer,
    hs: DeviceBuffer,
    fids: DeviceBuffer,
}

impl DeviceClassifier {
    pub(crate) fn new(device: &Device, classifier: Classifier) -> Self {
        let mut dc = DeviceClassifier {
            classifier,
            thrs: DeviceBuffer::readonly(device, 0),
            hs: DeviceBuffer::readonly(device, 0),
            fids: DeviceBuffer::readonly(device, 0),
        };
        dc.sync();
        dc
    }

    /// Upload the host tables to the device.
    pub(crate) fn sync(&mut self) {
        let c = &self.classifier;
        for (buf, bytes) in [
            (&mut self.thrs, bytemuck::cast_slice::<f32, u8>(c.thresholds())),
            (&mut self.fids, bytemuck::cast_slice::<i32, u8>(c.feature_ids())),
            (&mut self.hs, bytemuck::cast_slice::<f32, u8>(c.leaf_values())),
        ] {
            buf.reserve(bytes.len());
            buf.upload(bytes);
        }
    }

    pub(crate) fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub(crate) fn trees(&self) -> Trees<'_> {
        Trees { thrs: &self.thrs, hs: &self.hs, fids: &self.fids }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // depth-2 stump layout over an 8x8 window, shrink 4 (2x2 cells).
    fn record() -> ClassifierRecord {
        let mut thrs = vec![0.0f32; 16];
        let mut fids = vec![0i32; 16];
        let mut hs = vec![0.0f32; 16];
        for t in 0..2 {
            thrs[t * 8..t * 8 + 3].copy_from_slice(&[0.5, 0.25, 0.75]);
            fids[t * 8..t * 8 + 3].copy_from_slice(&[0, 1, 2]);
            hs[t * 8..t * 8 + 4].copy_from_slice(&[-1.0, -0.5, 0.5, 1.0]);
        }
        ClassifierRecord {
            num_weaks: 2,
            depth: 2,
            shrink: 4,
            win_sz_w: 8,
            win_sz_h: 8,
            org_win_w: 6,
            org_win_h: 6,
            thrs,
            fids,
            hs,
        }
    }

    #[test]
    fn test_tree_leaf_walks_heap_order() {
        let c = record().into_classifier().unwrap();
        // f0 < 0.5 → node 1; f1 < 0.25 → node 3 → leaf 0.
        assert_eq!(c.tree_leaf(0, |_| 0.0), -1.0);
        // f0 >= 0.5 → node 2; f2 >= 0.75 → node 6 → leaf 3.
        assert_eq!(c.tree_leaf(0, |_| 1.0), 1.0);
        // f0 >= 0.5 → node 2; f2 = 0.6 < 0.75 → node 5 → leaf 2.
        assert_eq!(c.tree_leaf(1, |f| if f == 2 { 0.6 } else { 1.0 }), 0.5);
    }

    #[test]
    fn test_score_stops_below_threshold() {
        let c = record().into_classifier().unwrap();
        assert_eq!(c.score(-10.0, |_| 1.0), 2.0);
        // First tree already at -1 ≤ -0.5: the second is never added.
        assert_eq!(c.score(-0.5, |_| 0.0), -1.0);
    }

    #[test]
    fn test_lookup_table_order() {
        let cids = lookup_table(Size::new(8, 12), 4, Size::new(5, 7));
        // 2 x 3 cells, 16 slots each.
        assert_eq!(cids.len(), 2 * 3 * 16);
        assert_eq!(cids[0], 0);
        // y runs fastest: m = 1 is cell (0, 1).
        assert_eq!(cids[1], 5 * 16);
        // m = 3 is cell (1, 0).
        assert_eq!(cids[3], 16);
        // z = 1 starts after 6 cells.
        assert_eq!(cids[6], 1);
    }

    #[test]
    fn test_record_validation() {
        assert!(matches!(
            ClassifierRecord { depth: 4, ..record() }.into_classifier(),
            Err(Error::InvalidClassifier(_))
        ));
        assert!(matches!(
            ClassifierRecord { num_weaks: 0, ..record() }.into_classifier(),
            Err(Error::InvalidClassifier(_))
        ));
        let mut bad = record();
        bad.hs.pop();
        assert!(matches!(bad.into_classifier(), Err(Error::InvalidClassifier(_))));
        let mut bad = record();
        bad.fids[1] = 64;
        assert!(matches!(bad.into_classifier(), Err(Error::InvalidClassifier(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let c = record().into_classifier().unwrap();
        let json = serde_json::to_string(&c.to_record()).unwrap();
        let back = Classifier::from_json_str(&json).unwrap();
        assert_eq!(back.to_record(), record());
        assert!(matches!(Classifier::from_json_str("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_shared_tables_and_deep_copy() {
        use std::sync::Arc;
        let words: Arc<[u32]> = vec![0u32; 8].into();
        let c = Classifier::new(
            1,
            1,
            4,
            Size::new(4, 4),
            Size::new(4, 4),
            Matrix::shared(8, 1, ElemType::F32, words.clone()),
            Matrix::new(8, 1, ElemType::I32),
            Matrix::new(8, 1, ElemType::F32),
        );
        assert!(c.is_borrowed());
        assert!(!c.deep_copy().is_borrowed());
    }

    #[test]
    #[should_panic(expected = "must be")]
    fn test_mismatched_tables_panic() {
        Classifier::new(
            2,
            1,
            4,
            Size::new(4, 4),
            Size::new(4, 4),
            Matrix::new(8, 2, ElemType::F32),
            Matrix::new(8, 1, ElemType::I32),
            Matrix::new(8, 2, ElemType::F32),
        );
    }
}
