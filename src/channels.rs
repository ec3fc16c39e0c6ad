// channels.rs — Aggregated channel computation at one resolution.
//
// Given a LUV0 image already on the device, produce the three channel
// families the detector reads, all at `data = crop / shrink` resolution:
//
//   color  4 floats per cell   presmoothed LUV, area-downsampled
//   mag    1 float per cell    normalized gradient magnitude, downsampled
//   hist   8 floats per cell   orientation histogram (num_orients used)
//
// Pipeline (every step is one kernel from kernels.rs):
//
//   img ──conv_tri(smooth)──► img ──resample──────────────────► color
//                              │
//                              └─grad_mag─► mag ─mag_norm─► mag ─resample─► mag
//                                           angle ─scale_angle─► angle
//                                   (mag, angle) ─hist @ crop/bin─► hist
//                                                 (resampled to data if bin ≠ shrink)
//
// Gradients are taken on the full-resolution smoothed image; only the
// finished channels are downsampled.
//
// BUFFERS: the full-resolution magnitude, orientation and (when bin_size
// differs from shrink) histogram planes live here and only ever grow.
// `prepare` with a size that fits the current capacity allocates nothing.

use serde::{Deserialize, Serialize};

use crate::buffer::DeviceBuffer;
use crate::device::Device;
use crate::gradient::MAX_ORIENTS;
use crate::kernels;
use crate::matrix::Size;

const F32: usize = std::mem::size_of::<f32>();

/// Channel computation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Downsampling factor from pixels to feature cells.
    pub shrink: usize,
    /// Triangle radius of the presmoothing filter (0 = none).
    pub smooth: usize,
    /// Triangle radius of the magnitude normalization filter.
    pub norm_radius: usize,
    /// Constant added to the local energy before dividing.
    pub norm_const: f32,
    /// Histogram cell size in pixels; 0 means `shrink`.
    pub bin_size: usize,
    /// Orientation bins, at most 8.
    pub num_orients: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            shrink: 4,
            smooth: 1,
            norm_radius: 5,
            norm_const: 0.005,
            bin_size: 0,
            num_orients: 6,
        }
    }
}

/// Channel computer with reusable full-resolution intermediates.
pub struct Channels {
    opts: ChannelOptions,
    device: Device,
    capacity: Size,
    crop: Size,
    data: Size,
    hist_size: Size,
    mag: DeviceBuffer,
    angle: DeviceBuffer,
    hist: DeviceBuffer,
    reallocations: usize,
}

impl Channels {
    /// # Panics
    /// Panics if `shrink` is zero or more than 8 orientations are asked for.
    pub fn new(device: &Device, opts: ChannelOptions) -> Self {
        assert!(opts.shrink > 0, "shrink must be positive");
        assert!(
            (1..=MAX_ORIENTS).contains(&opts.num_orients),
            "orientation count {} outside 1..={MAX_ORIENTS}",
            opts.num_orients
        );
        let opts = ChannelOptions {
            bin_size: if opts.bin_size == 0 { opts.shrink } else { opts.bin_size },
            ..opts
        };
        Channels {
            opts,
            device: device.clone(),
            capacity: Size::ZERO,
            crop: Size::ZERO,
            data: Size::ZERO,
            hist_size: Size::ZERO,
            mag: DeviceBuffer::create(device, 0),
            angle: DeviceBuffer::create(device, 0),
            hist: DeviceBuffer::create(device, 0),
            reallocations: 0,
        }
    }

    /// Options with `bin_size` resolved.
    pub fn options(&self) -> &ChannelOptions {
        &self.opts
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Input size after cropping to a multiple of `shrink`.
    pub fn crop_size(&self) -> Size {
        self.crop
    }

    /// Output channel resolution.
    pub fn data_size(&self) -> Size {
        self.data
    }

    /// Histogram resolution before resampling to `data_size`.
    pub fn hist_size(&self) -> Size {
        self.hist_size
    }

    /// Largest crop the intermediate buffers currently hold.
    pub fn capacity(&self) -> Size {
        self.capacity
    }

    /// How many times the intermediate buffers were re-created.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Size the computer (and the caller's output buffers) for an input
    /// of `size` pixels.
    ///
    /// # Panics
    /// Panics if `size` is empty, smaller than `shrink`, or its crop is not
    /// divisible by the histogram bin size.
    pub fn prepare(
        &mut self,
        size: Size,
        color: &mut DeviceBuffer,
        mag: &mut DeviceBuffer,
        hist: &mut DeviceBuffer,
    ) {
        assert!(size.is_positive(), "channel input size {size} must be positive");
        let shrink = self.opts.shrink;
        let bin = self.opts.bin_size;
        self.crop = Size::new(size.w - size.w % shrink, size.h - size.h % shrink);
        assert!(self.crop.is_positive(), "input {size} is smaller than shrink {shrink}");
        assert!(
            self.crop.w % bin == 0 && self.crop.h % bin == 0,
            "crop {} is not divisible by bin size {bin}",
            self.crop
        );
        self.data = Size::new(self.crop.w / shrink, self.crop.h / shrink);
        self.hist_size = Size::new(self.crop.w / bin, self.crop.h / bin);

        if !self.capacity.contains(self.crop) {
            let cap = Size::new(self.capacity.w.max(self.crop.w), self.capacity.h.max(self.crop.h));
            let cap_hist = Size::new(cap.w / bin, cap.h / bin);
            self.mag.reserve(cap.area() * F32);
            self.angle.reserve(cap.area() * F32);
            self.hist.reserve(cap_hist.area() * MAX_ORIENTS * F32);
            self.capacity = cap;
            self.reallocations += 1;
            tracing::debug!(capacity = %cap, "channel buffers reallocated");
        }

        let n = self.data.area();
        color.reserve(n * 4 * F32);
        mag.reserve(n * F32);
        hist.reserve(n * MAX_ORIENTS * F32);
    }

    /// Compute the channels of `img` (LUV0, `crop_size()` pixels, modified
    /// in place by the presmoothing). `tmp` is scratch.
    ///
    /// # Panics
    /// Panics if `prepare` was never called or a buffer is too small.
    pub fn compute(
        &mut self,
        img: &mut DeviceBuffer,
        tmp: &mut DeviceBuffer,
        color: &mut DeviceBuffer,
        mag: &mut DeviceBuffer,
        hist: &mut DeviceBuffer,
    ) {
        assert!(self.crop.is_positive(), "Channels::compute before prepare");
        let (crop, data) = (self.crop, self.data);
        let o = self.opts;
        tmp.reserve(crop.area() * 4 * F32);

        // colour
        kernels::conv_tri(img, tmp, crop, 4, o.smooth);
        kernels::resample(color, data, img, crop, 4, 1.0);

        // gradient magnitude
        kernels::grad_mag(&mut self.mag, &mut self.angle, img, crop);
        kernels::mag_norm(&mut self.mag, tmp, crop, o.norm_radius, o.norm_const);
        kernels::resample(mag, data, &self.mag, crop, 1, 1.0);

        // gradient histogram
        kernels::scale_angle(&mut self.angle, crop, o.num_orients);
        if self.hist_size == data {
            kernels::hist(hist, &self.mag, &self.angle, data, crop.w, o.bin_size, o.num_orients);
        } else {
            kernels::hist(
                &mut self.hist,
                &self.mag,
                &self.angle,
                self.hist_size,
                crop.w,
                o.bin_size,
                o.num_orients,
            );
            kernels::resample(hist, data, &self.hist, self.hist_size, MAX_ORIENTS, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(dev: &Device) -> (DeviceBuffer, DeviceBuffer, DeviceBuffer) {
        (DeviceBuffer::create(dev, 0), DeviceBuffer::create(dev, 0), DeviceBuffer::create(dev, 0))
    }

    #[test]
    fn test_prepare_crops_to_shrink() {
        let dev = Device::host();
        let mut ch = Channels::new(&dev, ChannelOptions::default());
        let (mut c, mut m, mut h) = buffers(&dev);
        ch.prepare(Size::new(33, 18), &mut c, &mut m, &mut h);
        assert_eq!(ch.crop_size(), Size::new(32, 16));
        assert_eq!(ch.data_size(), Size::new(8, 4));
        assert_eq!(ch.hist_size(), Size::new(8, 4));
        assert_eq!(ch.options().bin_size, 4);
        assert!(c.capacity() >= 8 * 4 * 16);
        assert!(h.capacity() >= 8 * 4 * 32);
    }

    #[test]
    fn test_prepare_same_size_does_not_reallocate() {
        let dev = Device::host();
        let mut ch = Channels::new(&dev, ChannelOptions::default());
        let (mut c, mut m, mut h) = buffers(&dev);
        ch.prepare(Size::new(64, 48), &mut c, &mut m, &mut h);
        ch.prepare(Size::new(64, 48), &mut c, &mut m, &mut h);
        assert_eq!(ch.reallocations(), 1);
        // Smaller inputs fit too.
        ch.prepare(Size::new(32, 48), &mut c, &mut m, &mut h);
        assert_eq!(ch.reallocations(), 1);
        assert_eq!(ch.capacity(), Size::new(64, 48));
        ch.prepare(Size::new(80, 16), &mut c, &mut m, &mut h);
        assert_eq!(ch.reallocations(), 2);
        assert_eq!(ch.capacity(), Size::new(80, 48));
    }

    #[test]
    fn test_uniform_image_has_no_gradient() {
        let dev = Device::host();
        let size = Size::new(16, 8);
        let mut ch = Channels::new(&dev, ChannelOptions::default());
        let (mut color, mut mag, mut hist) = buffers(&dev);
        ch.prepare(size, &mut color, &mut mag, &mut hist);
        let mut img = DeviceBuffer::create(&dev, size.area() * 16);
        img.upload_slice(&vec![[0.3f32, 0.4, 0.5, 0.0]; size.area()]);
        let mut tmp = DeviceBuffer::create(&dev, 0);
        ch.compute(&mut img, &mut tmp, &mut color, &mut mag, &mut hist);

        let n = ch.data_size().area();
        let c = color.read_f32(n * 4).unwrap();
        for px in c.chunks(4) {
            assert!((px[0] - 0.3).abs() < 1e-5 && (px[2] - 0.5).abs() < 1e-5);
        }
        assert!(mag.read_f32(n).unwrap().iter().all(|&v| v == 0.0));
        assert!(hist.read_f32(n * 8).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_compute_is_deterministic_and_resamples_hist() {
        let dev = Device::host();
        let size = Size::new(16, 16);
        let opts = ChannelOptions { bin_size: 2, ..ChannelOptions::default() };
        let mut ch = Channels::new(&dev, opts);
        let (mut color, mut mag, mut hist) = buffers(&dev);
        ch.prepare(size, &mut color, &mut mag, &mut hist);
        assert_eq!(ch.hist_size(), Size::new(8, 8));

        let luv: Vec<[f32; 4]> = (0..size.area())
            .map(|i| [(i % 16) as f32 / 16.0, (i / 16) as f32 / 16.0, 0.2, 0.0])
            .collect();
        let run = |ch: &mut Channels, color: &mut DeviceBuffer, mag: &mut DeviceBuffer, hist: &mut DeviceBuffer| {
            let mut img = DeviceBuffer::create(&dev, size.area() * 16);
            img.upload_slice(&luv);
            let mut tmp = DeviceBuffer::create(&dev, 0);
            ch.compute(&mut img, &mut tmp, color, mag, hist);
            let n = ch.data_size().area();
            (mag.read_f32(n).unwrap(), hist.read_f32(n * 8).unwrap())
        };
        let first = run(&mut ch, &mut color, &mut mag, &mut hist);
        let second = run(&mut ch, &mut color, &mut mag, &mut hist);
        assert_eq!(first, second);
        assert!(first.0.iter().any(|&v| v > 0.0));
        assert!(first.1.iter().any(|&v| v > 0.0));
        // Bins past num_orients stay empty.
        assert!(first.1.chunks(8).all(|cell| cell[6] == 0.0 && cell[7] == 0.0));
    }

    #[test]
    #[should_panic(expected = "orientation count")]
    fn test_too_many_orients_panics() {
        let opts = ChannelOptions { num_orients: 9, ..ChannelOptions::default() };
        Channels::new(&Device::host(), opts);
    }
}
