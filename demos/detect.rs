// demos/detect.rs
//
// Run the detector on one image and print the boxes.
//
// Usage:
//   cargo run --example detect --release -- <image> <classifier.json> [config.json] [--gpu]
//
// The classifier file is a JSON record with keys num_weaks, depth, shrink,
// win_sz_w, win_sz_h, org_win_w, org_win_h, thrs, fids, hs. The optional
// config file overrides any subset of the pipeline options (see
// src/config.rs). Set RUST_LOG=acfdet=debug for per-stage logging.
//
// Output (stdout): one line per box, `x y width height score`.

use acfdet::{Classifier, Config, Device, ElemType, Engine, Matrix};
use tracing_subscriber::EnvFilter;

use std::env;
use std::process;
use std::time::Instant;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let use_gpu = args.iter().any(|a| a == "--gpu");
    let positional: Vec<&String> = args[1..].iter().filter(|a| !a.starts_with("--")).collect();
    if positional.len() < 2 {
        eprintln!("Usage: {} <image> <classifier.json> [config.json] [--gpu]", args[0]);
        process::exit(1);
    }

    let rgba = match image::open(positional[0]) {
        Ok(img) => img.to_rgba8(),
        Err(e) => {
            eprintln!("Error: cannot read image {}: {e}", positional[0]);
            process::exit(1);
        }
    };
    let (w, h) = (rgba.width() as usize, rgba.height() as usize);
    let pixels: Vec<[u8; 4]> = rgba.pixels().map(|p| p.0).collect();
    let frame = Matrix::from_vec(w, h, ElemType::U8x4, pixels);

    let classifier = Classifier::from_path(positional[1]).unwrap_or_else(|e| {
        eprintln!("Error: cannot load classifier {}: {e}", positional[1]);
        process::exit(1);
    });
    let config = match positional.get(2) {
        Some(path) => Config::from_path(path).unwrap_or_else(|e| {
            eprintln!("Error: cannot load config {path}: {e}");
            process::exit(1);
        }),
        None => Config {
            channels: acfdet::channels::ChannelOptions { shrink: classifier.shrink(), ..Default::default() },
            ..Config::default()
        },
    };

    let device = if use_gpu {
        Device::gpu().unwrap_or_else(|e| {
            eprintln!("GPU unavailable ({e}), falling back to the host backend");
            Device::host()
        })
    } else {
        Device::host()
    };
    println!("device: {device:?}, image {w}x{h}, {} weak learners", classifier.num_weaks());

    let mut engine = Engine::new(&device, config);
    engine.set_classifier(classifier, false);

    let t0 = Instant::now();
    let boxes = match engine.detect(&frame) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error: detection failed: {e}");
            process::exit(1);
        }
    };
    let elapsed = t0.elapsed();

    let stats = engine.last_stats();
    println!(
        "{} scales, {} windows, {} candidates, {} boxes in {:.1} ms",
        stats.scales,
        stats.windows,
        stats.candidates,
        boxes.len(),
        elapsed.as_secs_f64() * 1e3
    );
    for b in &boxes {
        println!("{:.1} {:.1} {:.1} {:.1} {:.3}", b.x, b.y, b.width, b.height, b.score);
    }
}
