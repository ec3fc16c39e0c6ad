// resample.rs — Resize interleaved float images with a gain.
//
// Each axis is resampled independently and the 2-D result is their
// separable product:
//
//   src >= dst  area average: output d covers [d·s/n, (d+1)·s/n) of the
//               source, each source pixel weighted by its overlap
//   src <  dst  linear interpolation between the two nearest source pixel
//               centres (centre of d maps to (d + 0.5)·s/n - 0.5, clamped)
//
// The result is multiplied by `norm`. Equal sizes with `norm = 1` give the
// identity. Approximated pyramid scales pass `norm = (s/s_real)^-lambda`
// here to rescale channel energy.

use crate::matrix::Size;

/// Source taps contributing to one output coordinate along one axis.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Taps {
    start: usize,
    count: usize,
    lo: f32,
    hi: f32,
    frac: f32,
    area: bool,
}

impl Taps {
    pub(crate) fn new(d: usize, n_dst: usize, n_src: usize) -> Self {
        if n_src >= n_dst {
            let lo = (d * n_src) as f32 / n_dst as f32;
            let hi = ((d + 1) * n_src) as f32 / n_dst as f32;
            let start = lo.floor() as usize;
            let count = (hi.ceil() as usize).min(n_src) - start;
            Taps { start, count, lo, hi, frac: 0.0, area: true }
        } else {
            let c = ((d as f32 + 0.5) * n_src as f32 / n_dst as f32 - 0.5)
                .clamp(0.0, (n_src - 1) as f32);
            let start = c.floor() as usize;
            Taps { start, count: 2, lo: 0.0, hi: 0.0, frac: c - c.floor(), area: false }
        }
    }

    fn index(&self, k: usize, n_src: usize) -> usize {
        (self.start + k).min(n_src - 1)
    }

    fn weight(&self, k: usize) -> f32 {
        if self.area {
            let i = (self.start + k) as f32;
            (self.hi.min(i + 1.0) - self.lo.max(i)) / (self.hi - self.lo)
        } else if k == 0 {
            1.0 - self.frac
        } else {
            self.frac
        }
    }
}

/// Host kernel: resample `src` (`src_size`, `ch` channels) into `dst`
/// (`dst_size`), scaling every output by `norm`.
pub fn resample(
    dst: &mut [f32],
    dst_size: Size,
    src: &[f32],
    src_size: Size,
    ch: usize,
    norm: f32,
) {
    assert!(src_size.is_positive(), "resample source size {src_size} must be positive");
    assert!(
        src.len() >= src_size.area() * ch,
        "resample source holds {} floats, need {}",
        src.len(),
        src_size.area() * ch
    );
    assert!(
        dst.len() >= dst_size.area() * ch,
        "resample destination holds {} floats, need {}",
        dst.len(),
        dst_size.area() * ch
    );
    let xs: Vec<Taps> = (0..dst_size.w).map(|x| Taps::new(x, dst_size.w, src_size.w)).collect();
    for y in 0..dst_size.h {
        let ty = Taps::new(y, dst_size.h, src_size.h);
        for (x, tx) in xs.iter().enumerate() {
            let base = (y * dst_size.w + x) * ch;
            for c in 0..ch {
                let mut acc = 0.0f32;
                for ky in 0..ty.count {
                    let sy = ty.index(ky, src_size.h);
                    let mut row = 0.0f32;
                    for kx in 0..tx.count {
                        let sx = tx.index(kx, src_size.w);
                        row += tx.weight(kx) * src[(sy * src_size.w + sx) * ch + c];
                    }
                    acc += ty.weight(ky) * row;
                }
                dst[base + c] = norm * acc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_size_is_identity() {
        let size = Size::new(4, 3);
        let src: Vec<f32> = (0..24).map(|v| v as f32 * 0.5).collect();
        let mut dst = vec![0.0; 24];
        resample(&mut dst, size, &src, size, 2, 1.0);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_halving_averages_blocks() {
        let src = [1.0f32, 3.0, 5.0, 7.0, 1.0, 3.0, 5.0, 7.0];
        let mut dst = [0.0f32; 2];
        resample(&mut dst, Size::new(2, 1), &src, Size::new(4, 2), 1, 1.0);
        assert_eq!(dst, [2.0, 6.0]);
    }

    #[test]
    fn test_fractional_area_weights() {
        // 3 -> 2: output 0 covers [0, 1.5), output 1 covers [1.5, 3).
        let src = [3.0f32, 6.0, 9.0];
        let mut dst = [0.0f32; 2];
        resample(&mut dst, Size::new(2, 1), &src, Size::new(3, 1), 1, 1.0);
        assert!((dst[0] - 4.0).abs() < 1e-5, "{}", dst[0]);
        assert!((dst[1] - 8.0).abs() < 1e-5, "{}", dst[1]);
    }

    #[test]
    fn test_enlarging_interpolates() {
        // 2 -> 4: centres map to -0.25, 0.25, 0.75, 1.25 (clamped to [0, 1]).
        let src = [0.0f32, 4.0];
        let mut dst = [0.0f32; 4];
        resample(&mut dst, Size::new(4, 1), &src, Size::new(2, 1), 1, 1.0);
        assert_eq!(dst, [0.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn test_norm_scales_output() {
        let src = vec![2.0f32; 16];
        let mut dst = vec![0.0f32; 4];
        resample(&mut dst, Size::new(2, 2), &src, Size::new(4, 4), 1, 0.5);
        for v in dst {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_constant_preserved_any_ratio() {
        let src = vec![7.0f32; 7 * 5 * 4];
        for (w, h) in [(3, 2), (5, 5), (11, 9), (1, 1)] {
            let mut dst = vec![0.0f32; w * h * 4];
            resample(&mut dst, Size::new(w, h), &src, Size::new(7, 5), 4, 1.0);
            assert!(dst.iter().all(|v| (v - 7.0).abs() < 1e-4), "{w}x{h}");
        }
    }
}
