// kernels.rs — Backend dispatch for every elementwise kernel.
//
// Each function here is one kernel launch over an explicit 2-D grid. It
// checks the operand contracts (same device, capacities large enough)
// once, then either runs the host reference inline or enqueues the WGSL
// version on the device queue. Callers never see which backend ran.
//
// CONTRACTS:
// Capacities are in bytes; sizes are in elements of the stated channel
// count. A violated contract is a caller bug and panics.

use crate::buffer::DeviceBuffer;
use crate::cascade;
use crate::color;
use crate::convolution;
use crate::device::Backend;
use crate::gpu::kernels::{
    ColorParams, ConpadParams, ConvParams, DetectorParams, GradParams, ResampleParams,
};
use crate::gradient::{self, MAX_ORIENTS};
use crate::matrix::Size;
use crate::resample as rs;

/// Floats per concatenated feature cell.
pub const FEATURE_CHANNELS: usize = 16;

const F32: usize = std::mem::size_of::<f32>();

fn same_device(a: &DeviceBuffer, b: &DeviceBuffer) {
    assert!(a.device().same_as(b.device()), "kernel operands live on different devices");
}

fn need(buf: &DeviceBuffer, bytes: usize, what: &str) {
    assert!(
        buf.capacity() >= bytes,
        "{what} buffer holds {} bytes, need {bytes}",
        buf.capacity()
    );
}

fn grid(size: Size) -> (u32, u32) {
    (size.w as u32, size.h as u32)
}

// ---------------------------------------------------------------------------
// Colour
// ---------------------------------------------------------------------------

/// Packed RGBA8 → interleaved LUV0 floats.
pub fn rgba_to_luv(dst: &mut DeviceBuffer, src: &DeviceBuffer, size: Size) {
    same_device(dst, src);
    need(dst, size.area() * 4 * F32, "LUV");
    need(src, size.area() * 4, "RGBA");
    if size.area() == 0 {
        return;
    }
    let device = dst.device().clone();
    match device.backend() {
        Backend::Host => color::rgba_to_luv(dst.host_f32_mut(), src.host_u32(), size),
        Backend::Gpu(ctx) => {
            let p = ColorParams { w: size.w as u32, h: size.h as u32, pad: [0; 2] };
            ctx.kernels.dispatch(
                &ctx.gpu,
                "rgba_to_luv",
                &p,
                &[dst.raw(), src.raw(), ctx.kernels.ltable()],
                grid(size),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Triangle convolution
// ---------------------------------------------------------------------------

fn conv_params(size: Size, ch: usize, r: usize, dst_off: usize, src_off: usize) -> ConvParams {
    ConvParams {
        w: size.w as u32,
        h: size.h as u32,
        ch: ch as u32,
        r: r as u32,
        dst_off: dst_off as u32,
        src_off: src_off as u32,
        norm_const: 0.0,
        pad: 0,
    }
}

/// Vertical triangle pass from `src[src_off..]` into `dst[dst_off..]`
/// (offsets in floats).
pub fn conv_tri_cols(
    dst: &mut DeviceBuffer,
    dst_off: usize,
    src: &DeviceBuffer,
    src_off: usize,
    size: Size,
    ch: usize,
    r: usize,
) {
    same_device(dst, src);
    let n = size.area() * ch;
    need(dst, (dst_off + n) * F32, "convolution destination");
    need(src, (src_off + n) * F32, "convolution source");
    if n == 0 {
        return;
    }
    let device = dst.device().clone();
    match device.backend() {
        Backend::Host => convolution::conv_tri_cols(
            &mut dst.host_f32_mut()[dst_off..],
            &src.host_f32()[src_off..],
            size,
            ch,
            r,
        ),
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "conv_tri_cols",
            &conv_params(size, ch, r, dst_off, src_off),
            &[dst.raw(), src.raw()],
            grid(size),
        ),
    }
}

/// Horizontal triangle pass from `src[src_off..]` into `dst[dst_off..]`.
pub fn conv_tri_rows(
    dst: &mut DeviceBuffer,
    dst_off: usize,
    src: &DeviceBuffer,
    src_off: usize,
    size: Size,
    ch: usize,
    r: usize,
) {
    same_device(dst, src);
    let n = size.area() * ch;
    need(dst, (dst_off + n) * F32, "convolution destination");
    need(src, (src_off + n) * F32, "convolution source");
    if n == 0 {
        return;
    }
    let device = dst.device().clone();
    match device.backend() {
        Backend::Host => convolution::conv_tri_rows(
            &mut dst.host_f32_mut()[dst_off..],
            &src.host_f32()[src_off..],
            size,
            ch,
            r,
        ),
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "conv_tri_rows",
            &conv_params(size, ch, r, dst_off, src_off),
            &[dst.raw(), src.raw()],
            grid(size),
        ),
    }
}

/// Horizontal triangle pass between two disjoint regions of one buffer.
pub fn conv_tri_rows_within(
    buf: &mut DeviceBuffer,
    dst_off: usize,
    src_off: usize,
    size: Size,
    ch: usize,
    r: usize,
) {
    let n = size.area() * ch;
    assert!(
        dst_off + n <= src_off || src_off + n <= dst_off,
        "in-buffer convolution regions overlap ({dst_off} and {src_off}, {n} floats)"
    );
    need(buf, (dst_off.max(src_off) + n) * F32, "convolution");
    if n == 0 {
        return;
    }
    let device = buf.device().clone();
    match device.backend() {
        Backend::Host => {
            let data = buf.host_f32_mut();
            if dst_off < src_off {
                let (dst, src) = data.split_at_mut(src_off);
                convolution::conv_tri_rows(&mut dst[dst_off..], src, size, ch, r);
            } else {
                let (src, dst) = data.split_at_mut(dst_off);
                convolution::conv_tri_rows(dst, &src[src_off..], size, ch, r);
            }
        }
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "conv_tri_rows_within",
            &conv_params(size, ch, r, dst_off, src_off),
            &[buf.raw()],
            grid(size),
        ),
    }
}

/// Smooth `img` (`ch` channels) in place with a triangle of radius `r`,
/// using `tmp` for the intermediate pass. Radius 0 does nothing.
pub fn conv_tri(img: &mut DeviceBuffer, tmp: &mut DeviceBuffer, size: Size, ch: usize, r: usize) {
    if r == 0 {
        return;
    }
    conv_tri_cols(tmp, 0, img, 0, size, ch, r);
    conv_tri_rows(img, 0, tmp, 0, size, ch, r);
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Resize `src` into `dst`, multiplying by `norm`.
pub fn resample(
    dst: &mut DeviceBuffer,
    dst_size: Size,
    src: &DeviceBuffer,
    src_size: Size,
    ch: usize,
    norm: f32,
) {
    same_device(dst, src);
    need(dst, dst_size.area() * ch * F32, "resample destination");
    need(src, src_size.area() * ch * F32, "resample source");
    if dst_size.area() == 0 {
        return;
    }
    let device = dst.device().clone();
    match device.backend() {
        Backend::Host => {
            rs::resample(dst.host_f32_mut(), dst_size, src.host_f32(), src_size, ch, norm)
        }
        Backend::Gpu(ctx) => {
            let p = ResampleParams {
                dst_w: dst_size.w as u32,
                dst_h: dst_size.h as u32,
                src_w: src_size.w as u32,
                src_h: src_size.h as u32,
                ch: ch as u32,
                norm,
                pad: [0; 2],
            };
            ctx.kernels.dispatch(&ctx.gpu, "resample", &p, &[dst.raw(), src.raw()], grid(dst_size));
        }
    }
}

// ---------------------------------------------------------------------------
// Gradients
// ---------------------------------------------------------------------------

fn grad_params(grid: Size, src_w: usize, bin_size: usize, num_orients: usize, scale: f32) -> GradParams {
    GradParams {
        w: grid.w as u32,
        h: grid.h as u32,
        src_w: src_w as u32,
        bin_size: bin_size as u32,
        num_orients: num_orients as u32,
        scale,
        pad: [0; 2],
    }
}

/// Gradient magnitude and orientation of a LUV0 image.
pub fn grad_mag(mag: &mut DeviceBuffer, angle: &mut DeviceBuffer, src: &DeviceBuffer, size: Size) {
    same_device(mag, src);
    same_device(angle, src);
    need(mag, size.area() * F32, "magnitude");
    need(angle, size.area() * F32, "orientation");
    need(src, size.area() * 4 * F32, "gradient source");
    if size.area() == 0 {
        return;
    }
    let device = src.device().clone();
    match device.backend() {
        Backend::Host => {
            gradient::grad_mag(mag.host_f32_mut(), angle.host_f32_mut(), src.host_f32(), size)
        }
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "grad_mag",
            &grad_params(size, size.w, 1, 1, 0.0),
            &[angle.raw(), mag.raw(), src.raw()],
            grid(size),
        ),
    }
}

/// Normalize magnitude by its local energy:
/// `mag / (tri(mag, radius) + norm_const)`. `tmp` needs room for two
/// magnitude planes.
pub fn mag_norm(
    mag: &mut DeviceBuffer,
    tmp: &mut DeviceBuffer,
    size: Size,
    radius: usize,
    norm_const: f32,
) {
    let n = size.area();
    need(tmp, 2 * n * F32, "normalization scratch");
    if n == 0 {
        return;
    }
    conv_tri_cols(tmp, n, mag, 0, size, 1, radius);
    conv_tri_rows_within(tmp, 0, n, size, 1, radius);

    same_device(mag, tmp);
    let device = mag.device().clone();
    match device.backend() {
        Backend::Host => gradient::normalize(mag.host_f32_mut(), tmp.host_f32(), n, norm_const),
        Backend::Gpu(ctx) => {
            let p = ConvParams { norm_const, ..conv_params(size, 1, radius, 0, 0) };
            ctx.kernels.dispatch(&ctx.gpu, "mag_norm", &p, &[mag.raw(), tmp.raw()], grid(size));
        }
    }
}

/// Convert orientations from radians to bin units.
pub fn scale_angle(angle: &mut DeviceBuffer, size: Size, num_orients: usize) {
    need(angle, size.area() * F32, "orientation");
    if size.area() == 0 {
        return;
    }
    let device = angle.device().clone();
    match device.backend() {
        Backend::Host => gradient::scale_angle(angle.host_f32_mut(), size.area(), num_orients),
        Backend::Gpu(ctx) => {
            let scale = num_orients as f32 / std::f32::consts::PI;
            ctx.kernels.dispatch(
                &ctx.gpu,
                "scale_angle",
                &grad_params(size, size.w, 1, num_orients, scale),
                &[angle.raw()],
                grid(size),
            );
        }
    }
}

/// Orientation histogram at `cells` resolution (8 floats per cell) from
/// magnitude/orientation planes of width `src_w`.
pub fn hist(
    out: &mut DeviceBuffer,
    mag: &DeviceBuffer,
    angle: &DeviceBuffer,
    cells: Size,
    src_w: usize,
    bin_size: usize,
    num_orients: usize,
) {
    same_device(out, mag);
    same_device(out, angle);
    need(out, cells.area() * MAX_ORIENTS * F32, "histogram");
    let src_px = src_w * cells.h * bin_size;
    need(mag, src_px * F32, "magnitude");
    need(angle, src_px * F32, "orientation");
    if cells.area() == 0 {
        return;
    }
    let device = out.device().clone();
    match device.backend() {
        Backend::Host => gradient::hist(
            out.host_f32_mut(),
            mag.host_f32(),
            angle.host_f32(),
            cells,
            src_w,
            bin_size,
            num_orients,
        ),
        Backend::Gpu(ctx) => {
            assert!((1..=MAX_ORIENTS).contains(&num_orients), "orientation count {num_orients} outside 1..={MAX_ORIENTS}");
            ctx.kernels.dispatch(
                &ctx.gpu,
                "hist",
                &grad_params(cells, src_w, bin_size, num_orients, 0.0),
                &[angle.raw(), mag.raw(), out.raw()],
                grid(cells),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Concatenation + padding
// ---------------------------------------------------------------------------

/// Pack colour (4), magnitude (1) and histogram (8) channels of a `size`
/// map into 16-float cells, padded by `pad` cells on every side.
pub fn conpad(
    out: &mut DeviceBuffer,
    color: &DeviceBuffer,
    mag: &DeviceBuffer,
    hist: &DeviceBuffer,
    size: Size,
    pad: Size,
) {
    same_device(out, color);
    same_device(out, mag);
    same_device(out, hist);
    let out_size = Size::new(size.w + 2 * pad.w, size.h + 2 * pad.h);
    need(out, out_size.area() * FEATURE_CHANNELS * F32, "feature");
    need(color, size.area() * 4 * F32, "colour");
    need(mag, size.area() * F32, "magnitude");
    need(hist, size.area() * MAX_ORIENTS * F32, "histogram");
    assert!(size.is_positive(), "concatenation of an empty {size} map");
    let device = out.device().clone();
    match device.backend() {
        Backend::Host => crate::pyramid::conpad_host(
            out.host_f32_mut(),
            color.host_f32(),
            mag.host_f32(),
            hist.host_f32(),
            size,
            pad,
        ),
        Backend::Gpu(ctx) => {
            let p = ConpadParams {
                w: size.w as u32,
                h: size.h as u32,
                pad_x: pad.w as u32,
                pad_y: pad.h as u32,
                out_w: out_size.w as u32,
                out_h: out_size.h as u32,
                pad: [0; 2],
            };
            ctx.kernels.dispatch(
                &ctx.gpu,
                "conpad",
                &p,
                &[out.raw(), color.raw(), mag.raw(), hist.raw()],
                grid(out_size),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Cascade passes
// ---------------------------------------------------------------------------

/// Device copies of the classifier tables.
pub(crate) struct Trees<'a> {
    pub thrs: &'a DeviceBuffer,
    pub hs: &'a DeviceBuffer,
    pub fids: &'a DeviceBuffer,
}

/// Early rejection over one scale: `(score, alive)` per output cell into
/// `out` starting at cell `p.out_off`.
pub(crate) fn early_reject(
    p: &DetectorParams,
    chns: &DeviceBuffer,
    cids: &DeviceBuffer,
    trees: &Trees<'_>,
    out: &mut DeviceBuffer,
) {
    same_device(out, chns);
    same_device(out, cids);
    let cells = (p.dims_w * p.dims_h) as usize;
    need(out, (p.out_off as usize + cells) * 2 * F32, "early score");
    let device = out.device().clone();
    match device.backend() {
        Backend::Host => cascade::early_reject(
            p,
            chns.host_f32(),
            cids.host_i32(),
            &cascade::HostTrees::from_buffers(trees),
            out.host_f32_mut(),
        ),
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "early_reject",
            p,
            &[chns.raw(), cids.raw(), trees.thrs.raw(), trees.hs.raw(), trees.fids.raw(), out.raw()],
            (p.dims_w, p.dims_h),
        ),
    }
}

/// Row compaction over one scale.
pub(crate) fn early_scan(
    p: &DetectorParams,
    out: &DeviceBuffer,
    idx: &mut DeviceBuffer,
    len: &mut DeviceBuffer,
) {
    same_device(idx, out);
    same_device(len, out);
    let cells = (p.out_off + p.dims_w * p.dims_h) as usize;
    need(idx, cells * F32, "survivor index");
    need(len, (p.len_off + p.dims_h) as usize * F32, "row length");
    let device = out.device().clone();
    match device.backend() {
        Backend::Host => {
            cascade::early_scan(p, out.host_f32(), idx.host_i32_mut(), len.host_i32_mut())
        }
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "early_scan",
            p,
            &[out.raw(), idx.raw(), len.raw()],
            (p.dims_h, 1),
        ),
    }
}

/// Per-scale inclusive prefix sums of the row counts.
pub(crate) fn early_prefix_sum(
    p: &DetectorParams,
    len: &DeviceBuffer,
    sum: &mut DeviceBuffer,
    dsz: &DeviceBuffer,
) {
    same_device(sum, len);
    same_device(sum, dsz);
    need(dsz, p.num_scales as usize * 2 * F32, "scale row table");
    need(sum, len.capacity(), "prefix sum");
    let device = len.device().clone();
    match device.backend() {
        Backend::Host => {
            cascade::early_prefix_sum(p, len.host_i32(), sum.host_i32_mut(), dsz.host_i32())
        }
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "early_prefix_sum",
            p,
            &[len.raw(), sum.raw(), dsz.raw()],
            (p.num_scales, 1),
        ),
    }
}

/// Materialize one scale's survivors as unscaled candidate records.
pub(crate) fn early_bbs(
    p: &DetectorParams,
    out: &DeviceBuffer,
    idx: &DeviceBuffer,
    sum: &DeviceBuffer,
    bbs: &mut DeviceBuffer,
) {
    same_device(bbs, out);
    same_device(bbs, idx);
    same_device(bbs, sum);
    need(bbs, (p.bbs_off + p.bbs_sz) as usize * 5 * F32, "candidate");
    let device = out.device().clone();
    match device.backend() {
        Backend::Host => cascade::early_bbs(
            p,
            out.host_f32(),
            idx.host_i32(),
            sum.host_i32(),
            bbs.host_f32_mut(),
        ),
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "early_bbs",
            p,
            &[out.raw(), idx.raw(), sum.raw(), bbs.raw()],
            (p.dims_w, p.dims_h),
        ),
    }
}

/// Leaf value of every tree for every candidate of one scale.
pub(crate) fn predict(
    p: &DetectorParams,
    chns: &DeviceBuffer,
    cids: &DeviceBuffer,
    trees: &Trees<'_>,
    bbs: &DeviceBuffer,
    hss: &mut DeviceBuffer,
) {
    assert!(p.bbs_sz > 0, "prediction over an empty candidate range");
    same_device(hss, chns);
    same_device(hss, bbs);
    need(bbs, (p.bbs_off + p.bbs_sz) as usize * 5 * F32, "candidate");
    need(hss, ((p.bbs_off + p.bbs_sz) * p.num_weaks) as usize * F32, "leaf");
    let device = bbs.device().clone();
    match device.backend() {
        Backend::Host => cascade::predict(
            p,
            chns.host_f32(),
            cids.host_i32(),
            &cascade::HostTrees::from_buffers(trees),
            bbs.host_f32(),
            hss.host_f32_mut(),
        ),
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "predict",
            p,
            &[
                chns.raw(),
                cids.raw(),
                trees.thrs.raw(),
                trees.hs.raw(),
                trees.fids.raw(),
                bbs.raw(),
                hss.raw(),
            ],
            (p.bbs_sz, p.num_weaks),
        ),
    }
}

/// Cascade reduction of the per-tree leaves into candidate scores.
pub(crate) fn predict_sum(p: &DetectorParams, hss: &DeviceBuffer, bbs: &mut DeviceBuffer) {
    same_device(bbs, hss);
    need(hss, (p.bbs_sz * p.num_weaks) as usize * F32, "leaf");
    need(bbs, p.bbs_sz as usize * 5 * F32, "candidate");
    let device = hss.device().clone();
    match device.backend() {
        Backend::Host => cascade::predict_sum(p, hss.host_f32(), bbs.host_f32_mut()),
        Backend::Gpu(ctx) => ctx.kernels.dispatch(
            &ctx.gpu,
            "predict_sum",
            p,
            &[hss.raw(), bbs.raw()],
            (p.bbs_sz, 1),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn test_mag_norm_within_buffer_offsets() {
        // Uniform magnitude: the smoothed energy equals the magnitude.
        let dev = Device::host();
        let size = Size::new(6, 4);
        let mut mag = DeviceBuffer::create(&dev, size.area() * 4);
        mag.upload_slice(&vec![2.0f32; size.area()]);
        let mut tmp = DeviceBuffer::create(&dev, size.area() * 8);
        mag_norm(&mut mag, &mut tmp, size, 2, 0.005);
        let out = mag.read_f32(size.area()).unwrap();
        for v in out {
            assert!((v - 2.0 / 2.005).abs() < 1e-5, "{v}");
        }
    }

    #[test]
    fn test_conv_tri_smooths_impulse() {
        let dev = Device::host();
        let size = Size::new(5, 5);
        let mut data = vec![0.0f32; 25];
        data[12] = 16.0;
        let mut img = DeviceBuffer::create(&dev, 100);
        img.upload_slice(&data);
        let mut tmp = DeviceBuffer::create(&dev, 100);
        conv_tri(&mut img, &mut tmp, size, 1, 1);
        let out = img.read_f32(25).unwrap();
        assert_eq!(out[12], 4.0);
        assert_eq!(out[11], 2.0);
        assert_eq!(out[6], 1.0);
        assert!((out.iter().sum::<f32>() - 16.0).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "overlap")]
    fn test_overlapping_regions_panic() {
        let dev = Device::host();
        let mut buf = DeviceBuffer::create(&dev, 64);
        conv_tri_rows_within(&mut buf, 0, 2, Size::new(2, 2), 1, 1);
    }

    #[test]
    #[should_panic(expected = "different devices")]
    fn test_mixed_devices_panic() {
        let a = Device::host();
        let b = Device::host();
        let mut dst = DeviceBuffer::create(&a, 64);
        let src = DeviceBuffer::create(&b, 64);
        resample(&mut dst, Size::new(2, 2), &src, Size::new(2, 2), 1, 1.0);
    }
}
