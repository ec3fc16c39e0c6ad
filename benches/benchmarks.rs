// benches/benchmarks.rs -- Per-stage and full-pipeline benchmarks.
//
//   cargo bench
//
// Every group runs on the host reference backend. When a GPU adapter is
// available the same group also runs on wgpu, so both backends land side
// by side in the report.
//
// CRITERION + GPU CAVEATS
// ────────────────────────
// Wall time includes buffer writes, bind group creation, submit and poll.
// The first iterations pay pipeline compilation on some drivers, hence the
// explicit warmup time.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use acfdet::channels::ChannelOptions;
use acfdet::classifier::NODES_PER_TREE;
use acfdet::kernels::FEATURE_CHANNELS;
use acfdet::nms::{nms, BoundingBox};
use acfdet::pyramid::PyramidOptions;
use acfdet::{Classifier, Config, Detector, DetectorOptions, Device, ElemType, Engine, Matrix, Pyramid, Size};

// ============================================================
// Helpers
// ============================================================

/// Synthetic RGBA scene: gradients plus bright rectangles.
fn make_scene(w: usize, h: usize) -> Matrix {
    let mut px = vec![[0u8; 4]; w * h];
    for y in 0..h {
        for x in 0..w {
            let base = ((x * 200 / w) + (y * 55 / h)) as u8;
            px[y * w + x] = [base, base / 2, 255 - base, 255];
        }
    }
    for rect in 0..6 {
        let rx = (50 + rect * 100) % w;
        let ry = (40 + (rect % 3) * 120) % h;
        let bright = 180u8.wrapping_add(rect as u8 * 10);
        for y in ry..(ry + 60).min(h) {
            for x in rx..(rx + 80).min(w) {
                px[y * w + x] = [bright, bright, bright / 3, 255];
            }
        }
    }
    Matrix::from_vec(w, h, ElemType::U8x4, px)
}

/// A 64-tree, depth-2 cascade over a 32x64 window with pseudo-random
/// splits; roughly half the windows pass the first tree.
fn make_classifier() -> Classifier {
    let (num_weaks, win) = (64, Size::new(32, 64));
    let nftrs = (win.w / 4) * (win.h / 4) * FEATURE_CHANNELS;
    let n = num_weaks * NODES_PER_TREE;
    let mut state = 7u64;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 40) as f32 / (1u64 << 24) as f32
    };
    let fids: Vec<i32> = (0..n).map(|_| (next() * nftrs as f32) as i32 % nftrs as i32).collect();
    let thrs: Vec<f32> = (0..n).map(|_| next() * 0.2).collect();
    let hs: Vec<f32> = (0..n).map(|_| next() * 2.0 - 1.0).collect();
    Classifier::new(
        num_weaks,
        2,
        4,
        win,
        Size::new(24, 48),
        Matrix::from_vec(NODES_PER_TREE, num_weaks, ElemType::F32, thrs),
        Matrix::from_vec(NODES_PER_TREE, num_weaks, ElemType::I32, fids),
        Matrix::from_vec(NODES_PER_TREE, num_weaks, ElemType::F32, hs),
    )
}

fn devices() -> Vec<(&'static str, Device)> {
    let mut out = vec![("host", Device::host())];
    match Device::gpu() {
        Ok(dev) => out.push(("gpu", dev)),
        Err(e) => eprintln!("GPU benchmarks skipped: {e}"),
    }
    out
}

fn pyramid_opts() -> PyramidOptions {
    PyramidOptions { pad: Size::new(8, 8), min_ds: Size::new(32, 64), num_approx: -1, ..Default::default() }
}

// ============================================================
// Per-stage benchmarks
// ============================================================

fn bench_pyramid(c: &mut Criterion) {
    let img = make_scene(640, 480);
    let mut group = c.benchmark_group("pyramid");
    group.warm_up_time(Duration::from_secs(2));
    for (name, dev) in devices() {
        for (label, num_approx) in [("approx", -1), ("all_real", 0)] {
            let opts = PyramidOptions { num_approx, ..pyramid_opts() };
            let mut pyr = Pyramid::new(&dev, ChannelOptions::default(), opts);
            group.bench_function(BenchmarkId::new(name, format!("{label}_640x480")), |b| {
                b.iter(|| {
                    pyr.compute(&img);
                    dev.finish();
                })
            });
        }
    }
    group.finish();
}

fn bench_detector(c: &mut Criterion) {
    let img = make_scene(640, 480);
    let mut group = c.benchmark_group("detector");
    group.warm_up_time(Duration::from_secs(2));
    for (name, dev) in devices() {
        let mut pyr = Pyramid::new(&dev, ChannelOptions::default(), pyramid_opts());
        pyr.compute(&img);
        let mut det = Detector::new(&dev, DetectorOptions::default());
        det.set_classifier(make_classifier(), false);
        group.bench_function(BenchmarkId::new(name, "predict_640x480"), |b| {
            b.iter(|| det.predict(&pyr, 4, 0.0).map(|boxes| boxes.len()))
        });
    }
    group.finish();
}

fn bench_nms(c: &mut Criterion) {
    let mut state = 11u64;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 40) as f32 / (1u64 << 24) as f32
    };
    let boxes: Vec<BoundingBox> = (0..2000)
        .map(|_| BoundingBox::new(next() * 600.0, next() * 400.0, 40.0, 80.0, next() * 100.0))
        .collect();
    let mut group = c.benchmark_group("nms");
    for greedy in [true, false] {
        group.bench_function(BenchmarkId::new("2000_boxes", if greedy { "greedy" } else { "all" }), |b| {
            b.iter(|| {
                let mut v = boxes.clone();
                nms(&mut v, 30.0, 0.65, greedy);
                v.len()
            })
        });
    }
    group.finish();
}

// ============================================================
// Full pipeline
// ============================================================

fn bench_engine(c: &mut Criterion) {
    let img = make_scene(640, 480);
    let config = Config { pyramid: pyramid_opts(), casc_thr: 0.0, ..Config::default() };
    let mut group = c.benchmark_group("engine");
    group.warm_up_time(Duration::from_secs(2));
    group.sample_size(20);
    for (name, dev) in devices() {
        let mut engine = Engine::new(&dev, config.clone());
        engine.set_classifier(make_classifier(), false);
        group.bench_function(BenchmarkId::new(name, "detect_640x480"), |b| {
            b.iter(|| engine.detect(&img).map(|boxes| boxes.len()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pyramid, bench_detector, bench_nms, bench_engine);
criterion_main!(benches);
