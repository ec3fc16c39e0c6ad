// config.rs — Aggregate detector configuration.
//
// One JSON document configures the whole pipeline. Every section and
// every field is optional; missing ones take their defaults:
//
//   {
//     "channels": { "shrink": 4, "num_orients": 6 },
//     "pyramid":  { "pad": { "w": 12, "h": 16 }, "per_oct": 8, "num_approx": -1 },
//     "detector": { "early_weaks": 1 },
//     "nms":      { "overlap": 0.65, "greedy": true },
//     "stride": 4,
//     "casc_thr": -1.0
//   }

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channels::ChannelOptions;
use crate::detector::DetectorOptions;
use crate::error::Result;
use crate::nms::NmsOptions;
use crate::pyramid::PyramidOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channels: ChannelOptions,
    pub pyramid: PyramidOptions,
    pub detector: DetectorOptions,
    pub nms: NmsOptions,
    /// Window step in input pixels; a multiple of the shrink factor.
    pub stride: usize,
    /// Cascade rejection threshold.
    pub casc_thr: f32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channels: ChannelOptions::default(),
            pyramid: PyramidOptions::default(),
            detector: DetectorOptions::default(),
            nms: NmsOptions::default(),
            stride: 4,
            casc_thr: -1.0,
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
