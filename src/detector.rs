// detector.rs — Cascade evaluation over every pyramid scale.
//
// A window is placed at every `stride` pixels of every scale. Scoring all
// of them with the full cascade is wasteful since almost all are rejected
// by the first tree or two, so evaluation runs in three phases:
//
//   filter   early_reject    first `early_weaks` trees at every window,
//                            (score, alive) per window
//   compact  early_scan      per row: dense list of surviving columns
//            early_prefix_sum per scale: inclusive sums of the row counts
//            (host)          per-scale totals → global candidate offsets
//            early_bbs       survivors → candidate records
//   refine   predict         every tree at every candidate
//            predict_sum     cascade sum → final score
//
// Every pass is one kernel launch on the device queue. The host blocks
// once, downloading the row sums, because the candidate buffer sizes and
// per-scale offsets depend on them. Scales without survivors launch
// nothing in the refine phase.
//
// BUFFER LAYOUT (one allocation shared by all scales, offsets per scale)
//   out   2 f32 per window    (score, alive)           out_off in windows
//   idx   1 i32 per window    compacted columns        same offsets
//   len   1 i32 per row       survivors per row        len_off in rows
//   sum   1 i32 per row       inclusive sums per scale same offsets
//   dsz   2 i32 per scale     (rows, first row)
//   bbs   5 f32 per candidate (x, y, 0, 0, score)      grid units until
//                                                      box conversion
//   hss   num_weaks f32 per candidate
//
// BOX CONVERSION
//   x' = (x·stride + shift_x) / scale_w,  w' = org_win.w / scale
//   y' = (y·stride + shift_y) / scale_h,  h' = org_win.h / scale
//   shift = (win - org_win) / 2 - pad

use serde::{Deserialize, Serialize};

use crate::alloc::{Allocator, ScratchArena};
use crate::buffer::DeviceBuffer;
use crate::classifier::{lookup_table, Classifier, DeviceClassifier};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::gpu::kernels::DetectorParams;
use crate::kernels;
use crate::matrix::Size;
use crate::nms::{BoundingBox, NmsOptions};
use crate::pyramid::{Pyramid, ScaleEntry};

const WORD: usize = 4;

/// Detector parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Trees evaluated by the early rejection pass.
    pub early_weaks: usize,
    /// Capacity of the host scratch ring for per-call tables.
    pub scratch_bytes: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        DetectorOptions { early_weaks: 1, scratch_bytes: 64 * 1024 }
    }
}

/// Counters of the last `predict` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectStats {
    /// Scales evaluated.
    pub scales: usize,
    /// Windows evaluated by early rejection.
    pub windows: usize,
    /// Windows that survived early rejection.
    pub candidates: usize,
    /// Candidates whose full cascade score cleared the threshold.
    pub survivors: usize,
    /// Scales with no early survivors.
    pub skipped_scales: usize,
    /// Boxes left after NMS.
    pub boxes: usize,
}

/// A feature map the detector can scan: one pyramid scale.
#[derive(Debug, Clone, Copy)]
pub struct FeatureMap<'a> {
    /// 16 floats per cell, `size` cells.
    pub data: &'a DeviceBuffer,
    pub size: Size,
    pub scale: f32,
    pub scale_w: f32,
    pub scale_h: f32,
}

impl<'a> From<&'a ScaleEntry> for FeatureMap<'a> {
    fn from(e: &'a ScaleEntry) -> Self {
        FeatureMap { data: e.data(), size: e.size(), scale: e.scale, scale_w: e.scale_w, scale_h: e.scale_h }
    }
}

// Lookup table of one scale, rebuilt when the scale's size changes.
struct ScaleLookup {
    size: Size,
    cids: DeviceBuffer,
}

// Per-scale placement inside the shared buffers.
#[derive(Debug, Clone, Copy)]
struct Placement {
    dims: Size,
    out_off: usize,
    len_off: usize,
}

/// Windows per axis for a map of `cells` at `shrink`.
///
/// # Panics
/// Panics if the window does not fit.
pub fn output_dims(cells: Size, shrink: usize, stride: usize, win: Size) -> Size {
    let axis = |n: usize, win: usize| {
        let span = (n * shrink) as i64 - win as i64 + 1;
        (span as f32 / stride as f32).ceil() as i64
    };
    let (w, h) = (axis(cells.w, win.w), axis(cells.h, win.h));
    assert!(w > 0 && h > 0, "window {win} does not fit a {cells} map at shrink {shrink}, stride {stride}");
    Size::new(w as usize, h as usize)
}

/// Cascade detector.
pub struct Detector {
    device: Device,
    opts: DetectorOptions,
    nms: NmsOptions,
    classifier: Option<DeviceClassifier>,
    dirty: bool,
    lookups: Vec<ScaleLookup>,
    dsz: DeviceBuffer,
    out: DeviceBuffer,
    idx: DeviceBuffer,
    len: DeviceBuffer,
    sum: DeviceBuffer,
    bbs: DeviceBuffer,
    hss: DeviceBuffer,
    scratch: ScratchArena,
    stats: DetectStats,
}

impl Detector {
    pub fn new(device: &Device, opts: DetectorOptions) -> Self {
        assert!(opts.early_weaks > 0, "early rejection needs at least one tree");
        let buf = || DeviceBuffer::create(device, 0);
        Detector {
            device: device.clone(),
            opts,
            nms: NmsOptions::default(),
            classifier: None,
            dirty: true,
            lookups: Vec::new(),
            dsz: buf(),
            out: buf(),
            idx: buf(),
            len: buf(),
            sum: buf(),
            bbs: buf(),
            hss: buf(),
            scratch: ScratchArena::new(opts.scratch_bytes),
            stats: DetectStats::default(),
        }
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.opts
    }

    pub fn nms_options(&self) -> &NmsOptions {
        &self.nms
    }

    pub fn set_nms_options(&mut self, nms: NmsOptions) {
        self.nms = nms;
    }

    /// Install a classifier. With `copy` the tables are deep-copied;
    /// otherwise shared tables stay aliased with the caller's.
    pub fn set_classifier(&mut self, classifier: Classifier, copy: bool) {
        let classifier = if copy { classifier.deep_copy() } else { classifier };
        tracing::info!(
            num_weaks = classifier.num_weaks(),
            depth = classifier.depth(),
            window = %classifier.window(),
            borrowed = classifier.is_borrowed(),
            "classifier loaded"
        );
        self.classifier = Some(DeviceClassifier::new(&self.device, classifier));
        self.dirty = true;
    }

    pub fn classifier(&self) -> Option<&Classifier> {
        self.classifier.as_ref().map(DeviceClassifier::classifier)
    }

    /// Counters of the last call.
    pub fn last_stats(&self) -> DetectStats {
        self.stats
    }

    /// Detect on a computed pyramid: cascade, box conversion and NMS.
    ///
    /// # Errors
    /// [`Error::ClassifierNotLoaded`] before `set_classifier`; device
    /// transfer failures as [`Error::Gpu`].
    pub fn predict(&mut self, pyramid: &Pyramid, stride: usize, casc_thr: f32) -> Result<Vec<BoundingBox>> {
        assert!(pyramid.device().same_as(&self.device), "pyramid lives on another device");
        if let Some(c) = self.classifier() {
            assert_eq!(c.shrink(), pyramid.shrink(), "classifier and pyramid shrink differ");
        }
        let maps: Vec<FeatureMap<'_>> = pyramid.scales().iter().map(FeatureMap::from).collect();
        let mut boxes = self.predict_maps(&maps, pyramid.options().pad, stride, casc_thr)?;
        self.nms.apply(&mut boxes, casc_thr);
        self.stats.boxes = boxes.len();
        tracing::debug!(stats = ?self.stats, "detection finished");
        Ok(boxes)
    }

    /// Run the cascade over `maps` (padded by `pad` pixels per side) and
    /// return every candidate that reached full prediction, before NMS.
    /// Candidates rejected mid-cascade carry their partial score.
    pub fn predict_maps(
        &mut self,
        maps: &[FeatureMap<'_>],
        pad: Size,
        stride: usize,
        casc_thr: f32,
    ) -> Result<Vec<BoundingBox>> {
        let dc = self.classifier.as_ref().ok_or(Error::ClassifierNotLoaded)?;
        let c = dc.classifier();
        let shrink = c.shrink();
        assert!(stride > 0 && stride % shrink == 0, "stride {stride} must be a positive multiple of shrink {shrink}");
        self.stats = DetectStats { scales: maps.len(), ..DetectStats::default() };
        if maps.is_empty() {
            return Ok(Vec::new());
        }

        // Lookup tables.
        if self.dirty || self.lookups.len() != maps.len() {
            self.lookups.truncate(maps.len());
            for l in &mut self.lookups {
                l.size = Size::ZERO;
            }
            while self.lookups.len() < maps.len() {
                self.lookups.push(ScaleLookup { size: Size::ZERO, cids: DeviceBuffer::readonly(&self.device, 0) });
            }
            self.dirty = false;
        }
        for (lookup, map) in self.lookups.iter_mut().zip(maps) {
            assert!(map.data.device().same_as(&self.device), "feature map lives on another device");
            if lookup.size != map.size {
                let cids = lookup_table(c.window(), shrink, map.size);
                lookup.cids.reserve(cids.len() * WORD);
                lookup.cids.upload_slice(&cids);
                lookup.size = map.size;
            }
        }

        // Placement of every scale in the shared buffers.
        let mut places = Vec::with_capacity(maps.len());
        let (mut cells, mut rows) = (0, 0);
        for map in maps {
            let dims = output_dims(map.size, shrink, stride, c.window());
            places.push(Placement { dims, out_off: cells, len_off: rows });
            cells += dims.area();
            rows += dims.h;
        }
        self.stats.windows = cells;

        let mut block = self.scratch.alloc(maps.len() * 2 * WORD);
        {
            let dsz: &mut [i32] = self.scratch.slice_mut(&mut block);
            for (i, p) in places.iter().enumerate() {
                dsz[i * 2] = p.dims.h as i32;
                dsz[i * 2 + 1] = p.len_off as i32;
            }
            self.dsz.reserve(maps.len() * 2 * WORD);
            self.dsz.upload_slice(&dsz[..maps.len() * 2]);
        }
        self.scratch.dealloc(block);
        self.out.reserve(cells * 2 * WORD);
        self.idx.reserve(cells * WORD);
        self.len.reserve(rows * WORD);
        self.sum.reserve(rows * WORD);

        let base = DetectorParams {
            depth: c.depth() as u32,
            to_org: (stride / shrink) as u32,
            num_weaks: c.num_weaks() as u32,
            early_weaks: self.opts.early_weaks as u32,
            num_scales: maps.len() as u32,
            casc_thr,
            ..DetectorParams::default()
        };
        let scale_params = |map: &FeatureMap<'_>, p: &Placement| DetectorParams {
            org_w: map.size.w as u32,
            dims_w: p.dims.w as u32,
            dims_h: p.dims.h as u32,
            out_off: p.out_off as u32,
            len_off: p.len_off as u32,
            ..base
        };

        // Filter.
        let trees = dc.trees();
        for ((map, p), lookup) in maps.iter().zip(&places).zip(&self.lookups) {
            let params = scale_params(map, p);
            kernels::early_reject(&params, map.data, &lookup.cids, &trees, &mut self.out);
            kernels::early_scan(&params, &self.out, &mut self.idx, &mut self.len);
        }
        kernels::early_prefix_sum(&base, &self.len, &mut self.sum, &self.dsz);

        // Compact: per-scale totals from the row sums.
        let mut block = self.scratch.alloc(rows * WORD);
        let totals = {
            let sums: &mut [i32] = self.scratch.slice_mut(&mut block);
            self.sum.download_slice(&mut sums[..rows]).map(|()| {
                places.iter().map(|p| sums[p.len_off + p.dims.h - 1] as usize).collect::<Vec<_>>()
            })
        };
        self.scratch.dealloc(block);
        let totals = totals?;
        let bbs_sz: usize = totals.iter().sum();
        self.stats.candidates = bbs_sz;
        self.stats.skipped_scales = totals.iter().filter(|&&t| t == 0).count();
        if bbs_sz == 0 {
            return Ok(Vec::new());
        }

        self.bbs.reserve(bbs_sz * 5 * WORD);
        self.hss.reserve(bbs_sz * c.num_weaks() * WORD);
        let mut bbs_off = 0;
        for (i, ((map, p), lookup)) in maps.iter().zip(&places).zip(&self.lookups).enumerate() {
            if totals[i] == 0 {
                tracing::trace!(scale = i, "no early survivors, scale skipped");
                continue;
            }
            let params = DetectorParams { bbs_off: bbs_off as u32, bbs_sz: totals[i] as u32, ..scale_params(map, p) };
            kernels::early_bbs(&params, &self.out, &self.idx, &self.sum, &mut self.bbs);
            kernels::predict(&params, map.data, &lookup.cids, &trees, &self.bbs, &mut self.hss);
            bbs_off += totals[i];
        }

        // Refine.
        kernels::predict_sum(&DetectorParams { bbs_sz: bbs_sz as u32, ..base }, &self.hss, &mut self.bbs);
        let raw = self.bbs.read_f32(bbs_sz * 5)?;

        let org = c.original_window();
        let win = c.window();
        let shift_x = (win.w as f32 - org.w as f32) / 2.0 - pad.w as f32;
        let shift_y = (win.h as f32 - org.h as f32) / 2.0 - pad.h as f32;
        let stride_f = stride as f32;
        let mut records = raw.chunks_exact(5);
        let mut boxes = Vec::with_capacity(bbs_sz);
        for (map, &total) in maps.iter().zip(&totals) {
            for b in records.by_ref().take(total) {
                boxes.push(BoundingBox {
                    x: (b[0] * stride_f + shift_x) / map.scale_w,
                    y: (b[1] * stride_f + shift_y) / map.scale_h,
                    width: org.w as f32 / map.scale,
                    height: org.h as f32 / map.scale,
                    score: b[4],
                });
            }
        }
        self.stats.survivors = boxes.iter().filter(|b| b.score > casc_thr).count();
        Ok(boxes)
    }
}
