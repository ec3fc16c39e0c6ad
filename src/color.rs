// color.rs — RGB to LUV colour conversion.
//
// The colour channels of the feature pyramid are CIE-LUV, scaled so every
// component lands roughly in [0, 1]:
//
//   x, y, z  = M · (r, g, b) / 255           (sRGB primaries, D65 white)
//   L        = ltable[floor(y * 1024)]        (cube-root lightness / 270)
//   U        = L · (13·4·x/d - 13·un) - minu  with d = x + 15y + 3z
//   V        = L · (13·9·y/d - 13·vn) - minv
//
// The lightness table is shared with the GPU kernel (uploaded once per
// device) so host and device index the same values.

use std::sync::OnceLock;

use crate::matrix::Size;

/// Entries in the lightness table. `y * 1024` never exceeds 1024; the tail
/// repeats the last value so small overshoots stay in range.
pub const LTABLE_LEN: usize = 1064;

pub(crate) const MR: [f32; 3] = [0.430574 / 255.0, 0.222015 / 255.0, 0.020183 / 255.0];
pub(crate) const MG: [f32; 3] = [0.341550 / 255.0, 0.706655 / 255.0, 0.129553 / 255.0];
pub(crate) const MB: [f32; 3] = [0.178325 / 255.0, 0.071330 / 255.0, 0.939180 / 255.0];
pub(crate) const UN: f32 = 0.197833;
pub(crate) const VN: f32 = 0.468331;
pub(crate) const MINU: f32 = -88.0 / 270.0;
pub(crate) const MINV: f32 = -134.0 / 270.0;

/// Lightness lookup table, built on first use.
pub fn ltable() -> &'static [f32; LTABLE_LEN] {
    static TABLE: OnceLock<[f32; LTABLE_LEN]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let y0 = (6.0f64 / 29.0).powi(3);
        let a = (29.0f64 / 3.0).powi(3);
        let maxi = 1.0 / 270.0;
        let mut table = [0.0f32; LTABLE_LEN];
        for (i, v) in table.iter_mut().enumerate().take(1025) {
            let y = i as f64 / 1024.0;
            let l = if y > y0 { 116.0 * y.cbrt() - 16.0 } else { y * a };
            *v = (l * maxi) as f32;
        }
        let last = table[1024];
        table[1025..].fill(last);
        table
    })
}

/// Convert one RGBA pixel to `(L, U, V, 0)`.
pub fn luv_pixel(rgba: [u8; 4]) -> [f32; 4] {
    let (r, g, b) = (rgba[0] as f32, rgba[1] as f32, rgba[2] as f32);
    let x = MR[0] * r + MG[0] * g + MB[0] * b;
    let y = MR[1] * r + MG[1] * g + MB[1] * b;
    let z = MR[2] * r + MG[2] * g + MB[2] * b;

    let l = ltable()[(y * 1024.0) as usize];
    let zi = 1.0 / (x + 15.0 * y + 3.0 * z + 1e-35);
    let u = l * (52.0 * x * zi - 13.0 * UN) - MINU;
    let v = l * (117.0 * y * zi - 13.0 * VN) - MINV;
    [l, u, v, 0.0]
}

/// Host kernel: packed RGBA (R in the low byte) to interleaved LUV0.
pub fn rgba_to_luv(dst: &mut [f32], src: &[u32], size: Size) {
    let n = size.area();
    assert!(src.len() >= n, "colour source holds {} pixels, need {n}", src.len());
    assert!(dst.len() >= n * 4, "colour destination too small for {size}");
    for (px, out) in src[..n].iter().zip(dst.chunks_exact_mut(4)) {
        out.copy_from_slice(&luv_pixel(px.to_le_bytes()));
    }
}
