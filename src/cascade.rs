// cascade.rs — Host reference versions of the cascade passes.
//
// Same arithmetic and buffer layout as shaders/cascade.wgsl,
// compact.wgsl, prefix_sum.wgsl and predict_sum.wgsl; the loops below
// simply walk the invocation grid those kernels are launched over.
//
//   early_reject      (dims_w, dims_h)    records[(out_off + cell)*2..] = (score, alive)
//   early_scan        (dims_h, 1)         dense survivor columns + row counts
//   early_prefix_sum  (num_scales, 1)     inclusive row sums inside each scale
//   early_bbs         (dims_w, dims_h)    survivors → (x, y, 0, 0, score)
//   predict           (bbs_sz, num_weaks) one leaf per candidate and tree
//   predict_sum       (bbs_sz, 1)         cascade sum of the leaves

use crate::classifier::tree_leaf;
use crate::gpu::kernels::DetectorParams;
use crate::kernels::{Trees, FEATURE_CHANNELS};

/// Host views of the classifier tables.
pub(crate) struct HostTrees<'a> {
    pub thrs: &'a [f32],
    pub hs: &'a [f32],
    pub fids: &'a [i32],
}

impl<'a> HostTrees<'a> {
    pub(crate) fn from_buffers(trees: &Trees<'a>) -> Self {
        let Trees { thrs, hs, fids } = *trees;
        HostTrees { thrs: thrs.host_f32(), hs: hs.host_f32(), fids: fids.host_i32() }
    }

    fn leaf(&self, depth: u32, t: usize, chns: &[f32], cids: &[i32], off: usize) -> f32 {
        tree_leaf(self.thrs, self.fids, self.hs, depth as usize, t, |fid| {
            chns[off + cids[fid] as usize]
        })
    }
}

// First feature of the window whose top-left output cell is (ox, oy).
fn window_offset(p: &DetectorParams, ox: u32, oy: u32) -> usize {
    ((oy * p.to_org * p.org_w + ox * p.to_org) as usize) * FEATURE_CHANNELS
}

pub(crate) fn early_reject(
    p: &DetectorParams,
    chns: &[f32],
    cids: &[i32],
    trees: &HostTrees<'_>,
    records: &mut [f32],
) {
    let n = p.early_weaks.min(p.num_weaks) as usize;
    for oy in 0..p.dims_h {
        for ox in 0..p.dims_w {
            let off = window_offset(p, ox, oy);
            let mut h = 0.0f32;
            let mut alive = 1.0f32;
            for t in 0..n {
                h += trees.leaf(p.depth, t, chns, cids, off);
                if h <= p.casc_thr {
                    alive = 0.0;
                    break;
                }
            }
            let cell = (p.out_off + oy * p.dims_w + ox) as usize;
            records[cell * 2] = h;
            records[cell * 2 + 1] = alive;
        }
    }
}

pub(crate) fn early_scan(p: &DetectorParams, records: &[f32], idx: &mut [i32], rows: &mut [i32]) {
    for y in 0..p.dims_h {
        let row = (p.out_off + y * p.dims_w) as usize;
        let mut count = 0usize;
        for x in 0..p.dims_w as usize {
            if records[(row + x) * 2 + 1] > 0.5 {
                idx[row + count] = x as i32;
                count += 1;
            }
        }
        rows[(p.len_off + y) as usize] = count as i32;
    }
}

pub(crate) fn early_prefix_sum(p: &DetectorParams, lens: &[i32], sums: &mut [i32], dsz: &[i32]) {
    for s in 0..p.num_scales as usize {
        let (n, first) = (dsz[s * 2] as usize, dsz[s * 2 + 1] as usize);
        let mut acc = 0;
        for k in first..first + n {
            acc += lens[k];
            sums[k] = acc;
        }
    }
}

pub(crate) fn early_bbs(
    p: &DetectorParams,
    records: &[f32],
    idx: &[i32],
    sums: &[i32],
    bbs: &mut [f32],
) {
    for y in 0..p.dims_h {
        let l = (p.len_off + y) as usize;
        let start = if y > 0 { sums[l - 1] } else { 0 };
        let count = sums[l] - start;
        let row = (p.out_off + y * p.dims_w) as usize;
        for x in 0..count.max(0) as usize {
            let col = idx[row + x] as usize;
            let b = (p.bbs_off as usize + start as usize + x) * 5;
            bbs[b..b + 5].copy_from_slice(&[
                col as f32,
                y as f32,
                0.0,
                0.0,
                records[(row + col) * 2],
            ]);
        }
    }
}

pub(crate) fn predict(
    p: &DetectorParams,
    chns: &[f32],
    cids: &[i32],
    trees: &HostTrees<'_>,
    bbs: &[f32],
    hss: &mut [f32],
) {
    let num_weaks = p.num_weaks as usize;
    for c in 0..p.bbs_sz as usize {
        let c = p.bbs_off as usize + c;
        let off = window_offset(p, bbs[c * 5] as u32, bbs[c * 5 + 1] as u32);
        for t in 0..num_weaks {
            hss[c * num_weaks + t] = trees.leaf(p.depth, t, chns, cids, off);
        }
    }
}

pub(crate) fn predict_sum(p: &DetectorParams, hss: &[f32], bbs: &mut [f32]) {
    let num_weaks = p.num_weaks as usize;
    for c in 0..p.bbs_sz as usize {
        let mut h = 0.0f32;
        for &leaf in &hss[c * num_weaks..(c + 1) * num_weaks] {
            h += leaf;
            if h <= p.casc_thr {
                break;
            }
        }
        bbs[c * 5 + 4] = h;
    }
}
