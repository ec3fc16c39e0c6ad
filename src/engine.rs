// engine.rs — One-call detection pipeline.
//
// Ties the pyramid builder and the cascade detector together into the
// per-image call a serving layer makes:
//
//   1. Build the feature pyramid of the input image
//   2. Run the cascade over every scale
//   3. Convert to image boxes, NMS, return
//
// The engine owns both stages, so their device buffers survive between
// images of the same size and nothing is reallocated in steady state.
//
// NEW RUST CONCEPTS:
// - `Result<Vec<_>>` flowing out of a `&mut self` pipeline: the only
//   recoverable failures (no classifier, device transfer errors) travel
//   with `?`; caller bugs still panic at the offending assert.

use crate::classifier::Classifier;
use crate::config::Config;
use crate::detector::{DetectStats, Detector};
use crate::device::Device;
use crate::error::Result;
use crate::matrix::Matrix;
use crate::nms::BoundingBox;
use crate::pyramid::Pyramid;

pub struct Engine {
    config: Config,
    pyramid: Pyramid,
    detector: Detector,
}

impl Engine {
    pub fn new(device: &Device, config: Config) -> Self {
        let pyramid = Pyramid::new(device, config.channels, config.pyramid);
        let mut detector = Detector::new(device, config.detector);
        detector.set_nms_options(config.nms);
        Engine { config, pyramid, detector }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Install a classifier, deep-copying its tables when `copy` is set.
    ///
    /// # Panics
    /// Panics if its shrink differs from the channel shrink.
    pub fn set_classifier(&mut self, classifier: Classifier, copy: bool) {
        assert_eq!(
            classifier.shrink(),
            self.config.channels.shrink,
            "classifier shrink does not match the channel shrink"
        );
        self.detector.set_classifier(classifier, copy);
    }

    pub fn has_classifier(&self) -> bool {
        self.detector.classifier().is_some()
    }

    /// Detect objects in an RGBA8 image.
    ///
    /// # Errors
    /// [`crate::Error::ClassifierNotLoaded`] until a classifier is set.
    pub fn detect(&mut self, image: &Matrix) -> Result<Vec<BoundingBox>> {
        if !self.has_classifier() {
            return Err(crate::Error::ClassifierNotLoaded);
        }
        self.pyramid.compute(image);
        self.detector.predict(&self.pyramid, self.config.stride, self.config.casc_thr)
    }

    /// The pyramid of the last image.
    pub fn pyramid(&self) -> &Pyramid {
        &self.pyramid
    }

    pub fn last_stats(&self) -> DetectStats {
        self.detector.last_stats()
    }
}
