// gradient.rs — Gradient magnitude, orientation and orientation histograms.
//
// These are the host reference kernels behind the magnitude and histogram
// channels:
//
//   grad_mag     central differences (one-sided at the borders, divided by
//                the tap distance) of the L, U and V channels; the channel
//                with the largest squared magnitude supplies both magnitude
//                and orientation. Orientation is atan2 folded into [0, π);
//                flat pixels get 0.
//   normalize    M / (S + c), S being the triangle-smoothed magnitude.
//   scale_angle  orientation → bin units (× num_orients / π).
//   hist         per cell of `bin × bin` pixels, linear soft binning
//                between floor(o) and floor(o)+1 (mod num_orients),
//                divided by bin². Cells have 8 slots; unused ones are 0.
//
// shaders/gradient.wgsl mirrors these one invocation per output element.

use std::f32::consts::PI;

use crate::matrix::Size;

/// Maximum orientation bins per histogram cell.
pub const MAX_ORIENTS: usize = 8;

// Neighbours used for the derivative at `i` along an axis of length `n`.
fn taps(i: usize, n: usize) -> (usize, usize) {
    (i.saturating_sub(1), (i + 1).min(n - 1))
}

/// Host kernel: magnitude and orientation of a 4-channel image.
pub fn grad_mag(mag: &mut [f32], angle: &mut [f32], src: &[f32], size: Size) {
    let (w, h) = (size.w, size.h);
    let n = size.area();
    assert!(src.len() >= n * 4, "gradient source too small for {size}");
    assert!(mag.len() >= n && angle.len() >= n, "gradient outputs too small for {size}");
    let px = |x: usize, y: usize, c: usize| src[(y * w + x) * 4 + c];

    for y in 0..h {
        let (y0, y1) = taps(y, h);
        for x in 0..w {
            let (x0, x1) = taps(x, w);
            let (mut best, mut bx, mut by) = (0.0f32, 0.0f32, 0.0f32);
            for c in 0..3 {
                let gx = if x1 > x0 { (px(x1, y, c) - px(x0, y, c)) / (x1 - x0) as f32 } else { 0.0 };
                let gy = if y1 > y0 { (px(x, y1, c) - px(x, y0, c)) / (y1 - y0) as f32 } else { 0.0 };
                let m = gx * gx + gy * gy;
                if m > best {
                    (best, bx, by) = (m, gx, gy);
                }
            }
            let i = y * w + x;
            mag[i] = best.sqrt();
            angle[i] = if best > 0.0 {
                let mut a = by.atan2(bx);
                if a < 0.0 {
                    a += PI;
                }
                if a >= PI {
                    a -= PI;
                }
                a
            } else {
                0.0
            };
        }
    }
}

/// Host kernel: `mag[i] /= energy[i] + norm_const` over `n` pixels.
pub fn normalize(mag: &mut [f32], energy: &[f32], n: usize, norm_const: f32) {
    for (m, &e) in mag[..n].iter_mut().zip(&energy[..n]) {
        *m /= e + norm_const;
    }
}

/// Host kernel: convert orientations in radians to bin units.
pub fn scale_angle(angle: &mut [f32], n: usize, num_orients: usize) {
    let scale = num_orients as f32 / PI;
    for a in &mut angle[..n] {
        *a *= scale;
    }
}

/// Host kernel: orientation histogram over `cells`, reading magnitudes and
/// bin-unit orientations with row pitch `src_w`.
pub fn hist(
    out: &mut [f32],
    mag: &[f32],
    angle: &[f32],
    cells: Size,
    src_w: usize,
    bin_size: usize,
    num_orients: usize,
) {
    assert!(
        (1..=MAX_ORIENTS).contains(&num_orients),
        "orientation count {num_orients} outside 1..={MAX_ORIENTS}"
    );
    assert!(bin_size > 0, "histogram bin size must be positive");
    assert!(src_w >= cells.w * bin_size, "histogram source row too short");
    assert!(out.len() >= cells.area() * MAX_ORIENTS, "histogram output too small for {cells}");
    let norm = 1.0 / (bin_size * bin_size) as f32;

    for cy in 0..cells.h {
        for cx in 0..cells.w {
            let mut bins = [0.0f32; MAX_ORIENTS];
            for by in 0..bin_size {
                let row = (cy * bin_size + by) * src_w + cx * bin_size;
                for bx in 0..bin_size {
                    let m = mag[row + bx];
                    let o = angle[row + bx];
                    let o0 = (o.floor().max(0.0) as usize).min(num_orients - 1);
                    let f = (o - o0 as f32).clamp(0.0, 1.0);
                    let o1 = (o0 + 1) % num_orients;
                    bins[o0] += m * (1.0 - f);
                    bins[o1] += m * f;
                }
            }
            let base = (cy * cells.w + cx) * MAX_ORIENTS;
            for (dst, b) in out[base..base + MAX_ORIENTS].iter_mut().zip(bins) {
                *dst = b * norm;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_plane(size: Size, f: impl Fn(usize, usize) -> f32) -> Vec<f32> {
        let mut v = vec![0.0f32; size.area() * 4];
        for y in 0..size.h {
            for x in 0..size.w {
                v[(y * size.w + x) * 4] = f(x, y);
            }
        }
        v
    }

    #[test]
    fn test_horizontal_ramp() {
        let size = Size::new(5, 3);
        let src = rgba_plane(size, |x, _| x as f32 * 2.0);
        let mut mag = vec![0.0; 15];
        let mut angle = vec![0.0; 15];
        grad_mag(&mut mag, &mut angle, &src, size);
        // Central and one-sided differences agree on a linear ramp.
        for i in 0..15 {
            assert!((mag[i] - 2.0).abs() < 1e-6, "mag[{i}] = {}", mag[i]);
            assert!(angle[i].abs() < 1e-6, "angle[{i}] = {}", angle[i]);
        }
    }

    #[test]
    fn test_vertical_ramp_angle() {
        let size = Size::new(3, 4);
        let src = rgba_plane(size, |_, y| y as f32);
        let mut mag = vec![0.0; 12];
        let mut angle = vec![0.0; 12];
        grad_mag(&mut mag, &mut angle, &src, size);
        for a in angle {
            assert!((a - PI / 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_angle_folds_into_half_turn() {
        // Decreasing ramp: atan2(0, -1) = π folds to 0.
        let size = Size::new(4, 1);
        let src = rgba_plane(size, |x, _| 10.0 - x as f32);
        let mut mag = vec![0.0; 4];
        let mut angle = vec![0.0; 4];
        grad_mag(&mut mag, &mut angle, &src, size);
        assert!(angle.iter().all(|&a| (0.0..PI).contains(&a)));
        assert!(angle.iter().all(|&a| a.abs() < 1e-6));
    }

    #[test]
    fn test_flat_image_zero() {
        let size = Size::new(3, 3);
        let src = vec![0.5f32; 36];
        let mut mag = vec![1.0; 9];
        let mut angle = vec![1.0; 9];
        grad_mag(&mut mag, &mut angle, &src, size);
        assert!(mag.iter().chain(&angle).all(|&v| v == 0.0));
    }

    #[test]
    fn test_strongest_channel_wins() {
        let size = Size::new(3, 1);
        let mut src = vec![0.0f32; 12];
        for x in 0..3 {
            src[x * 4] = x as f32; // L: slope 1 along x
            src[x * 4 + 2] = 3.0 * x as f32; // V: slope 3 along x
        }
        let mut mag = vec![0.0; 3];
        let mut angle = vec![0.0; 3];
        grad_mag(&mut mag, &mut angle, &src, size);
        assert!(mag.iter().all(|&m| (m - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_hist_soft_binning() {
        // One 2x2 cell, 4 orientations, all pixels at 1.25 bins.
        let mag = [1.0f32, 1.0, 1.0, 1.0];
        let angle = [1.25f32; 4];
        let mut out = [0.0f32; 8];
        hist(&mut out, &mag, &angle, Size::new(1, 1), 2, 2, 4);
        assert!((out[1] - 0.75).abs() < 1e-6);
        assert!((out[2] - 0.25).abs() < 1e-6);
        assert_eq!(out[0] + out[3] + out[4..].iter().sum::<f32>(), 0.0);
    }

    #[test]
    fn test_hist_wraps_last_bin() {
        let mag = [2.0f32];
        let angle = [5.5f32];
        let mut out = [0.0f32; 8];
        hist(&mut out, &mag, &angle, Size::new(1, 1), 1, 1, 6);
        assert!((out[5] - 1.0).abs() < 1e-6);
        assert!((out[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_and_scale() {
        let mut mag = [1.0f32, 2.0];
        normalize(&mut mag, &[0.995, 1.995], 2, 0.005);
        assert!((mag[0] - 1.0).abs() < 1e-6 && (mag[1] - 1.0).abs() < 1e-6);
        let mut angle = [PI / 2.0, 0.0];
        scale_angle(&mut angle, 2, 6);
        assert!((angle[0] - 3.0).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "orientation count")]
    fn test_too_many_orients_panics() {
        let mut out = [0.0f32; 8];
        hist(&mut out, &[0.0], &[0.0], Size::new(1, 1), 1, 1, 9);
    }
}
