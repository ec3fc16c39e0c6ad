// convolution.rs — Separable triangle filter over interleaved float images.
//
// The detector smooths with a triangle kernel of integer radius r:
//
//   k = [1, 2, .., r, r+1, r, .., 2, 1] / (r+1)^2
//
// applied as two 1-D passes, columns (vertical) first, then rows
// (horizontal). Images hold `ch` interleaved channels; every channel is
// filtered independently.
//
// BORDER HANDLING: Clamp (replicate edge pixels), like GPU clamp-to-edge
// addressing. The WGSL kernels in shaders/convolution.wgsl compute the same
// weights on the fly and accumulate taps in the same order.

use crate::matrix::Size;

/// Normalized triangle kernel of radius `r` (length `2r + 1`).
pub fn tri_filter(r: usize) -> Vec<f32> {
    let norm = ((r + 1) * (r + 1)) as f32;
    (0..=2 * r)
        .map(|i| (r + 1 - i.abs_diff(r)) as f32 / norm)
        .collect()
}

fn check(dst: &[f32], src: &[f32], size: Size, ch: usize) {
    let n = size.area() * ch;
    assert!(ch > 0, "channel count must be positive");
    assert!(src.len() >= n, "convolution source holds {} floats, need {n}", src.len());
    assert!(dst.len() >= n, "convolution destination holds {} floats, need {n}", dst.len());
}

/// Vertical pass: `dst(x, y) = Σ k[d] · src(x, clamp(y + d))`.
pub fn conv_tri_cols(dst: &mut [f32], src: &[f32], size: Size, ch: usize, r: usize) {
    check(dst, src, size, ch);
    let k = tri_filter(r);
    let (w, h) = (size.w, size.h);
    for y in 0..h {
        for x in 0..w {
            for c in 0..ch {
                let mut acc = 0.0f32;
                for (i, &kv) in k.iter().enumerate() {
                    let sy = (y + i).saturating_sub(r).min(h - 1);
                    acc += kv * src[(sy * w + x) * ch + c];
                }
                dst[(y * w + x) * ch + c] = acc;
            }
        }
    }
}

/// Horizontal pass: `dst(x, y) = Σ k[d] · src(clamp(x + d), y)`.
pub fn conv_tri_rows(dst: &mut [f32], src: &[f32], size: Size, ch: usize, r: usize) {
    check(dst, src, size, ch);
    let k = tri_filter(r);
    let (w, h) = (size.w, size.h);
    for y in 0..h {
        let row = &src[y * w * ch..(y + 1) * w * ch];
        for x in 0..w {
            for c in 0..ch {
                let mut acc = 0.0f32;
                for (i, &kv) in k.iter().enumerate() {
                    let sx = (x + i).saturating_sub(r).min(w - 1);
                    acc += kv * row[sx * ch + c];
                }
                dst[(y * w + x) * ch + c] = acc;
            }
        }
    }
}

/// Smooth `img` in place; `tmp` receives the intermediate column pass.
/// Radius 0 is the identity.
pub fn conv_tri(img: &mut [f32], tmp: &mut [f32], size: Size, ch: usize, r: usize) {
    if r == 0 {
        return;
    }
    conv_tri_cols(tmp, img, size, ch, r);
    conv_tri_rows(img, tmp, size, ch, r);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_filter_properties() {
        for r in 0..6 {
            let k = tri_filter(r);
            assert_eq!(k.len(), 2 * r + 1);
            assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6, "r={r} sums to {}", k.iter().sum::<f32>());
            for i in 0..k.len() {
                assert_eq!(k[i], k[k.len() - 1 - i], "r={r} not symmetric");
            }
            // Peak at the centre, falling off linearly.
            assert!(k.iter().all(|&v| v <= k[r]));
        }
        assert_eq!(tri_filter(1), vec![0.25, 0.5, 0.25]);
    }

    #[test]
    fn test_constant_image_unchanged() {
        let size = Size::new(5, 4);
        let mut img = vec![100.0f32; size.area() * 2];
        let mut tmp = vec![0.0f32; img.len()];
        conv_tri(&mut img, &mut tmp, size, 2, 2);
        for v in img {
            assert!((v - 100.0).abs() < 1e-4, "constant image changed: {v}");
        }
    }

    #[test]
    fn test_clamp_border() {
        // Row [10, 20, 30] with r = 1: x=0 sees 10, 10, 20.
        let size = Size::new(3, 1);
        let src = [10.0f32, 20.0, 30.0];
        let mut dst = [0.0f32; 3];
        conv_tri_rows(&mut dst, &src, size, 1, 1);
        assert!((dst[0] - 12.5).abs() < 1e-6);
        assert!((dst[1] - 20.0).abs() < 1e-6);
        assert!((dst[2] - 27.5).abs() < 1e-6);
    }

    #[test]
    fn test_channels_filtered_independently() {
        // Column of three pixels, two channels with different impulses.
        let size = Size::new(1, 3);
        let src = [0.0f32, 0.0, 5.0, 8.0, 0.0, 0.0];
        let mut dst = [0.0f32; 6];
        conv_tri_cols(&mut dst, &src, size, 2, 1);
        assert_eq!(dst, [1.25, 2.0, 2.5, 4.0, 1.25, 2.0]);
    }

    #[test]
    fn test_radius_zero_is_identity() {
        let size = Size::new(3, 2);
        let mut img: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let orig = img.clone();
        let mut tmp = vec![0.0; 6];
        conv_tri(&mut img, &mut tmp, size, 1, 0);
        assert_eq!(img, orig);
    }

    #[test]
    fn test_single_pixel() {
        let size = Size::new(1, 1);
        let mut img = vec![42.0f32];
        let mut tmp = vec![0.0f32];
        conv_tri(&mut img, &mut tmp, size, 1, 3);
        assert!((img[0] - 42.0).abs() < 1e-4);
    }

    #[test]
    #[should_panic(expected = "need")]
    fn test_short_source_panics() {
        let mut dst = [0.0f32; 4];
        conv_tri_rows(&mut dst, &[0.0; 3], Size::new(2, 2), 1, 1);
    }
}
