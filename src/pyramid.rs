// pyramid.rs — Multi-scale channel feature pyramid.
//
// For every scale s the detector needs the image's channels at s × the
// input resolution, packed into one 16-float feature cell per shrink×shrink
// block. Computing channels from scratch at every scale is the expensive
// part, so only some scales are "real":
//
//   Real       resample the LUV image to the snapped size, run Channels
//   Approx(r)  resample real scale r's channels to this scale's size and
//              multiply each family by (s / s_r)^-lambda
//
// The lambdas encode how channel energy falls off with scale (colour is
// scale invariant, gradients decay), which is what makes the cheap
// approximation accurate.
//
// SCALE SELECTION (on input size change only):
//   n      = floor(per_oct * (oct_up + log2(min(w/min_ds.w, h/min_ds.h))) + 1)
//   s_i    = 2^(-i/per_oct + oct_up)
//   each s_i is then nudged inside ±0.25·shrink/d0 (d0 = min(w, h)) to
//   the value that minimizes the larger of the two shrink-grid rounding
//   errors of w·s and h·s, searching 101 evenly spaced candidates.
//   Near-equal scales (within 0.001) are dropped and the rest sorted in
//   descending order.
//
// REAL / APPROX ASSIGNMENT: every (num_approx + 1)-th scale is real. Scales
// in between use the nearer real scale, the preceding one on a tie, and
// never a real index past the end.
//
// NEW RUST CONCEPTS:
// - `ScaleKind::Approx(usize)` replaces an integer "-1 means real"
//   sentinel; `match` makes the two cases impossible to confuse.
// - Reusing device buffers across calls: `Vec::drain` hands the old
//   entries' buffers to the new ones when the scale list is rebuilt.

use serde::{Deserialize, Serialize};

use crate::buffer::DeviceBuffer;
use crate::channels::{ChannelOptions, Channels};
use crate::device::Device;
use crate::gradient::MAX_ORIENTS;
use crate::kernels::{self, FEATURE_CHANNELS};
use crate::matrix::{ElemType, Matrix, Size};

const F32: usize = std::mem::size_of::<f32>();

/// Candidates tried per scale by the snapping search.
const SEARCH_STEPS: usize = 100;

/// Relative tolerance below which two scales count as duplicates.
const DEDUP_TOLERANCE: f32 = 0.001;

/// Power-law exponents of the approximation, per channel family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lambdas {
    pub color: f32,
    pub mag: f32,
    pub hist: f32,
}

impl Default for Lambdas {
    fn default() -> Self {
        Lambdas { color: 0.0, mag: 0.1105, hist: 0.1105 }
    }
}

/// Pyramid construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidOptions {
    /// Padding per side in pixels, applied after shrinking (`pad / shrink`
    /// cells).
    pub pad: Size,
    /// Smallest downsampled image the scale range reaches.
    pub min_ds: Size,
    /// Approximated scales between real ones; -1 means `per_oct - 1`.
    pub num_approx: i32,
    pub per_oct: usize,
    /// Octaves above the input resolution.
    pub oct_up: usize,
    /// Triangle radius applied to each padded feature map (0 = none).
    pub smooth: usize,
    pub lambdas: Lambdas,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        PyramidOptions {
            pad: Size::ZERO,
            min_ds: Size::new(16, 16),
            num_approx: 0,
            per_oct: 8,
            oct_up: 0,
            smooth: 0,
            lambdas: Lambdas::default(),
        }
    }
}

impl PyramidOptions {
    /// `num_approx` with the -1 shorthand expanded.
    pub fn approx_per_real(&self) -> usize {
        assert!(self.num_approx >= -1, "num_approx must be -1 or non-negative");
        if self.num_approx == -1 {
            self.per_oct.saturating_sub(1)
        } else {
            self.num_approx as usize
        }
    }
}

/// How a scale's channels are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    /// Computed from the resampled input image.
    Real,
    /// Resampled from the real scale at this index.
    Approx(usize),
}

/// One pyramid scale and its feature map.
#[derive(Debug)]
pub struct ScaleEntry {
    /// Nominal scale factor.
    pub scale: f32,
    /// Per-axis factors snapping the input to the shrink grid.
    pub scale_w: f32,
    pub scale_h: f32,
    pub kind: ScaleKind,
    data_size: Size,
    size: Size,
    data: DeviceBuffer,
}

impl ScaleEntry {
    /// Feature map size in cells, padding included.
    pub fn size(&self) -> Size {
        self.size
    }

    /// Channel size in cells before padding.
    pub fn data_size(&self) -> Size {
        self.data_size
    }

    /// Feature map, 16 floats per cell.
    pub fn data(&self) -> &DeviceBuffer {
        &self.data
    }

    /// Download the feature map.
    pub fn features(&self) -> crate::Result<Vec<f32>> {
        self.data.read_f32(self.size.area() * FEATURE_CHANNELS)
    }
}

fn rint(v: f32) -> f32 {
    v.round_ties_even()
}

/// Scale factors for an input of `size`, sorted in descending order.
pub fn select_scales(size: Size, shrink: usize, opts: &PyramidOptions) -> Vec<f32> {
    assert!(size.is_positive() && opts.min_ds.is_positive(), "scale selection needs positive sizes");
    assert!(opts.per_oct > 0, "per_oct must be positive");
    let (w, h) = (size.w as f32, size.h as f32);
    let sh = shrink as f32;
    let per_oct = opts.per_oct as f32;
    let ratio = (w / opts.min_ds.w as f32).min(h / opts.min_ds.h as f32);
    let n = (per_oct * (opts.oct_up as f32 + ratio.log2()) + 1.0) as i64;
    let n = n.max(0) as usize;

    let (d0, d1) = if size.w < size.h { (w, h) } else { (h, w) };
    let grid_error = |d: f32, s: f32| {
        let v = d * s;
        (v - rint(v / sh) * sh).abs()
    };

    let mut scales: Vec<f32> = (0..n)
        .map(|i| {
            let s = 2f32.powf(-(i as f32) / per_oct + opts.oct_up as f32);
            let base = rint(d0 * s / sh) * sh;
            let s0 = (base - 0.25 * sh) / d0;
            let s1 = (base + 0.25 * sh) / d0;
            let mut best = s0;
            let mut min_err = f32::INFINITY;
            // Candidate j of the search table (not the outer scale index i).
            for j in 0..=SEARCH_STEPS {
                let ss = (j as f32 / SEARCH_STEPS as f32) * (s1 - s0) + s0;
                let err = grid_error(d0, ss).max(grid_error(d1, ss));
                if j == 0 || err < min_err {
                    best = ss;
                    min_err = err;
                }
            }
            best
        })
        .collect();

    scales.sort_by(|a, b| b.total_cmp(a));
    for i in (1..scales.len()).rev() {
        let (a, b) = (scales[i - 1], scales[i]);
        if a - DEDUP_TOLERANCE < b && a + DEDUP_TOLERANCE > b {
            scales.remove(i - 1);
        }
    }
    scales
}

/// Per-axis factors making `size * scale` an exact multiple of `shrink`.
pub fn snap_scale(size: Size, shrink: usize, scale: f32) -> (f32, f32) {
    let sh = shrink as f32;
    let (w, h) = (size.w as f32, size.h as f32);
    (rint(w * scale / sh) * sh / w, rint(h * scale / sh) * sh / h)
}

/// Mark every `(num_approx + 1)`-th scale real and point the others at
/// their nearest real scale.
pub fn assign_kinds(num_scales: usize, num_approx: usize) -> Vec<ScaleKind> {
    let step = num_approx + 1;
    let half = num_approx / 2 + num_approx % 2;
    (0..num_scales)
        .map(|i| {
            let prev = i - i % step;
            if prev == i {
                ScaleKind::Real
            } else if i <= prev + half || prev + step >= num_scales {
                ScaleKind::Approx(prev)
            } else {
                ScaleKind::Approx(prev + step)
            }
        })
        .collect()
}

/// Host kernel: pack colour, magnitude and histogram into padded
/// 16-float cells.
pub(crate) fn conpad_host(
    out: &mut [f32],
    color: &[f32],
    mag: &[f32],
    hist: &[f32],
    size: Size,
    pad: Size,
) {
    let out_w = size.w + 2 * pad.w;
    let out_h = size.h + 2 * pad.h;
    for oy in 0..out_h {
        for ox in 0..out_w {
            let sx = ox as isize - pad.w as isize;
            let sy = oy as isize - pad.h as isize;
            let inside = sx >= 0 && sy >= 0 && (sx as usize) < size.w && (sy as usize) < size.h;
            let cx = sx.clamp(0, size.w as isize - 1) as usize;
            let cy = sy.clamp(0, size.h as isize - 1) as usize;
            let s = cy * size.w + cx;
            let o = (oy * out_w + ox) * FEATURE_CHANNELS;
            let cell = &mut out[o..o + FEATURE_CHANNELS];
            cell.fill(0.0);
            cell[..3].copy_from_slice(&color[s * 4..s * 4 + 3]);
            if inside {
                cell[3] = mag[s];
                cell[4..4 + MAX_ORIENTS].copy_from_slice(&hist[s * MAX_ORIENTS..(s + 1) * MAX_ORIENTS]);
            }
        }
    }
}

/// Feature pyramid builder. Buffers persist across `compute` calls and
/// only grow.
pub struct Pyramid {
    opts: PyramidOptions,
    num_approx: usize,
    device: Device,
    channels: Channels,
    last_size: Size,
    scales: Vec<ScaleEntry>,
    rgba: DeviceBuffer,
    img: DeviceBuffer,
    small: DeviceBuffer,
    tmp: DeviceBuffer,
    color: DeviceBuffer,
    mag: DeviceBuffer,
    hist: DeviceBuffer,
    apx_color: DeviceBuffer,
    apx_mag: DeviceBuffer,
    apx_hist: DeviceBuffer,
}

impl Pyramid {
    pub fn new(device: &Device, channel_opts: ChannelOptions, opts: PyramidOptions) -> Self {
        let num_approx = opts.approx_per_real();
        let buf = || DeviceBuffer::create(device, 0);
        Pyramid {
            opts,
            num_approx,
            device: device.clone(),
            channels: Channels::new(device, channel_opts),
            last_size: Size::ZERO,
            scales: Vec::new(),
            rgba: buf(),
            img: buf(),
            small: buf(),
            tmp: buf(),
            color: buf(),
            mag: buf(),
            hist: buf(),
            apx_color: buf(),
            apx_mag: buf(),
            apx_hist: buf(),
        }
    }

    pub fn options(&self) -> &PyramidOptions {
        &self.opts
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn shrink(&self) -> usize {
        self.channels.options().shrink
    }

    /// Padding per side in cells.
    pub fn pad_cells(&self) -> Size {
        let shrink = self.shrink();
        Size::new(self.opts.pad.w / shrink, self.opts.pad.h / shrink)
    }

    /// Scales of the last computed image, largest first.
    pub fn scales(&self) -> &[ScaleEntry] {
        &self.scales
    }

    /// Size of the last computed image.
    pub fn image_size(&self) -> Size {
        self.last_size
    }

    /// Build every scale's feature map for `image` (RGBA8).
    ///
    /// # Panics
    /// Panics if `image` is empty or not `U8x4`.
    pub fn compute(&mut self, image: &Matrix) {
        let size = image.size();
        assert!(size.is_positive(), "pyramid input must be non-empty");
        assert_eq!(image.elem(), ElemType::U8x4, "pyramid input must be RGBA8");
        if size != self.last_size {
            self.rebuild_scales(size);
            self.last_size = size;
        }

        self.rgba.reserve(size.area() * 4);
        self.rgba.upload_2d(image.as_bytes(), size, 4, size.w * 4);
        self.img.reserve(size.area() * 4 * F32);
        kernels::rgba_to_luv(&mut self.img, &self.rgba, size);

        let shrink = self.shrink();
        let pad = self.pad_cells();
        let lambdas = self.opts.lambdas;
        let mut last_real: Option<usize> = None;
        let mut real_size = Size::ZERO;

        for i in 0..self.scales.len() {
            let s = self.scales[i].scale;
            let approx = match self.scales[i].kind {
                ScaleKind::Real => None,
                ScaleKind::Approx(r) => Some(r),
            };
            let real = approx.unwrap_or(i);
            if last_real != Some(real) {
                let real_scale = self.scales[real].scale;
                real_size = self.compute_real(size, real_scale);
                self.scales[real].data_size = real_size;
                last_real = Some(real);
            }

            let data_size = match approx {
                None => real_size,
                Some(r) => {
                    let small = Size::new(
                        rint(size.w as f32 * s / shrink as f32) as usize,
                        rint(size.h as f32 * s / shrink as f32) as usize,
                    );
                    let ratio = s / self.scales[r].scale;
                    let n = small.area();
                    self.apx_color.reserve(n * 4 * F32);
                    self.apx_mag.reserve(n * F32);
                    self.apx_hist.reserve(n * MAX_ORIENTS * F32);
                    kernels::resample(
                        &mut self.apx_color,
                        small,
                        &self.color,
                        real_size,
                        4,
                        ratio.powf(-lambdas.color),
                    );
                    kernels::resample(&mut self.apx_mag, small, &self.mag, real_size, 1, ratio.powf(-lambdas.mag));
                    kernels::resample(
                        &mut self.apx_hist,
                        small,
                        &self.hist,
                        real_size,
                        MAX_ORIENTS,
                        ratio.powf(-lambdas.hist),
                    );
                    small
                }
            };

            let padded = Size::new(data_size.w + 2 * pad.w, data_size.h + 2 * pad.h);
            let entry = &mut self.scales[i];
            entry.data_size = data_size;
            entry.size = padded;
            entry.data.reserve(padded.area() * FEATURE_CHANNELS * F32);
            let (color, mag, hist) = if approx.is_some() {
                (&self.apx_color, &self.apx_mag, &self.apx_hist)
            } else {
                (&self.color, &self.mag, &self.hist)
            };
            kernels::conpad(&mut entry.data, color, mag, hist, data_size, pad);
            if self.opts.smooth > 0 {
                self.tmp.reserve(padded.area() * FEATURE_CHANNELS * F32);
                kernels::conv_tri(&mut entry.data, &mut self.tmp, padded, FEATURE_CHANNELS, self.opts.smooth);
            }
        }
    }

    fn rebuild_scales(&mut self, size: Size) {
        let shrink = self.shrink();
        let values = select_scales(size, shrink, &self.opts);
        let kinds = assign_kinds(values.len(), self.num_approx);
        let mut pool: Vec<DeviceBuffer> = self.scales.drain(..).map(|e| e.data).collect();
        self.scales = values
            .iter()
            .zip(kinds)
            .map(|(&scale, kind)| {
                let (scale_w, scale_h) = snap_scale(size, shrink, scale);
                ScaleEntry {
                    scale,
                    scale_w,
                    scale_h,
                    kind,
                    data_size: Size::ZERO,
                    size: Size::ZERO,
                    data: pool.pop().unwrap_or_else(|| DeviceBuffer::create(&self.device, 0)),
                }
            })
            .collect();
        let real = self.scales.iter().filter(|e| e.kind == ScaleKind::Real).count();
        tracing::debug!(
            image = %size,
            scales = self.scales.len(),
            real,
            first = ?values.first(),
            last = ?values.last(),
            "pyramid scales selected"
        );
    }

    // Channels of the input resampled to scale `s`; returns their size in
    // cells.
    fn compute_real(&mut self, size: Size, s: f32) -> Size {
        let shrink = self.shrink();
        let sh = shrink as f32;
        let small = Size::new(
            rint(size.w as f32 * s / sh) as usize * shrink,
            rint(size.h as f32 * s / sh) as usize * shrink,
        );
        // Channels presmooth their input in place, so the LUV image is
        // always copied (identity resample at equal size) to keep it intact
        // for later scales.
        self.small.reserve(small.area() * 4 * F32);
        kernels::resample(&mut self.small, small, &self.img, size, 4, 1.0);
        self.channels.prepare(small, &mut self.color, &mut self.mag, &mut self.hist);
        self.channels.compute(&mut self.small, &mut self.tmp, &mut self.color, &mut self.mag, &mut self.hist);
        self.channels.data_size()
    }
}
