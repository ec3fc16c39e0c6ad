// acfdet: Aggregated Channel Features pyramid + boosted cascade detection
// on a host reference backend or wgpu compute
//
// Reference: Dollár, Appel, Belongie, Perona, "Fast Feature Pyramids for
// Object Detection" (TPAMI 2014)
//
// Pipeline, leaves first:
//
//   alloc / matrix / buffer / device     memory and compute context
//   color / convolution / resample /     host reference kernels
//   gradient / cascade
//   kernels                              backend dispatch (host or gpu::)
//   channels → pyramid → detector → nms  the detection pipeline
//   engine                               pyramid + detector per image

pub mod alloc;
pub mod buffer;
pub mod channels;
pub mod classifier;
pub mod color;
pub mod config;
pub mod convolution;
pub mod detector;
pub mod device;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod gradient;
pub mod kernels;
pub mod matrix;
pub mod nms;
pub mod pyramid;
pub mod resample;

mod cascade;

pub use classifier::Classifier;
pub use config::Config;
pub use detector::{Detector, DetectorOptions};
pub use device::Device;
pub use engine::Engine;
pub use error::{Error, Result};
pub use matrix::{ElemType, Matrix, Size};
pub use nms::BoundingBox;
pub use pyramid::Pyramid;
