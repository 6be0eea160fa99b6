//! Region detectors.
//!
//! The detection model itself lives outside this program. We talk to it
//! either by running a local command or by POSTing to an inference server,
//! and both speak the same small JSON format ([`DetectorOutput`]).

use std::{sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use image::RgbImage;
use schemars::JsonSchema;

use crate::{
    extract::{BoundingBox, Detection, RegionClass},
    prelude::*,
};

pub mod command;
pub mod http;

/// Find name and quantity regions on a page.
#[async_trait]
pub trait RegionDetector: Send + Sync + 'static {
    /// Detect regions on `page`. The result is in no particular order.
    async fn detect(&self, page: &RgbImage) -> Result<Vec<Detection>>;
}

/// Our different detector types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum DetectorType {
    /// Run a local command on each page image.
    #[default]
    Command,

    /// POST each page image to an inference server.
    Http,
}

impl DetectorType {
    /// Instantiate an appropriate detector.
    pub fn create_detector(&self, opts: &DetectorOpts) -> Result<Arc<dyn RegionDetector>> {
        let labels = opts.label_map();
        let timeout = opts.timeout();
        match self {
            DetectorType::Command => {
                let program = opts
                    .detector_command
                    .clone()
                    .ok_or_else(|| anyhow!("--detector=command requires --detector-command"))?;
                Ok(Arc::new(command::CommandDetector::new(
                    program,
                    opts.detector_arg.clone(),
                    timeout,
                    labels,
                )))
            }
            DetectorType::Http => {
                let url = opts
                    .detector_url
                    .clone()
                    .ok_or_else(|| anyhow!("--detector=http requires --detector-url"))?;
                Ok(Arc::new(http::HttpDetector::new(url, timeout, labels)?))
            }
        }
    }
}

/// Detector options.
#[derive(Args, Clone, Debug)]
pub struct DetectorOpts {
    /// How to reach the region detection model.
    #[clap(long, value_enum, default_value_t = DetectorType::default())]
    pub detector: DetectorType,

    /// Program to run for `--detector=command`. It receives the page image
    /// path as its last argument and must print a JSON detection list. Run
    /// `schema DetectorOutput` for the format.
    #[clap(long)]
    pub detector_command: Option<PathBuf>,

    /// Extra argument to pass to `--detector-command`, before the image path.
    /// May be repeated, and may start with `-`.
    #[clap(long, allow_hyphen_values = true)]
    pub detector_arg: Vec<String>,

    /// Endpoint for `--detector=http`. Each page is POSTed as `image/png`.
    #[clap(long)]
    pub detector_url: Option<String>,

    /// Ignore detections with a confidence below this value.
    #[clap(long, default_value = "0.0")]
    pub min_confidence: f32,

    /// Timeout, in seconds, for detecting regions on one page.
    #[clap(long, default_value = "120")]
    pub detector_timeout: u64,

    /// Detector label used for item name regions.
    #[clap(long, default_value = "0")]
    pub name_class: i64,

    /// Detector label used for quantity regions.
    #[clap(long, default_value = "1")]
    pub quantity_class: i64,
}

impl DetectorOpts {
    /// How to interpret raw detector labels.
    pub fn label_map(&self) -> LabelMap {
        LabelMap {
            name_class: self.name_class,
            quantity_class: self.quantity_class,
            min_confidence: self.min_confidence,
        }
    }

    /// Per-page timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.detector_timeout)
    }
}

/// A single detection, as printed by a detection model.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RawDetection {
    /// Corners of the region in page pixels: `[x1, y1, x2, y2]`.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],

    /// Class label. Compared against `--name-class` and `--quantity-class`.
    pub label: i64,

    /// Model confidence, if the model reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Everything a detection model returns for one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(transparent)]
pub struct DetectorOutput(pub Vec<RawDetection>);

/// Maps raw labels onto our region classes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LabelMap {
    pub name_class: i64,
    pub quantity_class: i64,
    pub min_confidence: f32,
}

impl LabelMap {
    /// Parse detector JSON and keep the detections we understand.
    pub fn parse(&self, json: &[u8]) -> Result<Vec<Detection>> {
        let output = serde_json::from_slice::<DetectorOutput>(json).with_context(|| {
            format!(
                "detector output is not a detection list: {}",
                String::from_utf8_lossy(json)
            )
        })?;
        Ok(self.map(output))
    }

    /// Convert raw detections. Unknown labels and low-confidence detections
    /// are skipped.
    pub fn map(&self, output: DetectorOutput) -> Vec<Detection> {
        output
            .0
            .into_iter()
            .filter_map(|raw| {
                let class = if raw.label == self.name_class {
                    RegionClass::Name
                } else if raw.label == self.quantity_class {
                    RegionClass::Quantity
                } else {
                    trace!(label = raw.label, "Ignoring detection with unknown label");
                    return None;
                };
                if raw.confidence.is_some_and(|c| c < self.min_confidence) {
                    trace!(?raw, "Ignoring low-confidence detection");
                    return None;
                }
                let [x1, y1, x2, y2] = raw.bbox;
                Some(Detection {
                    bbox: BoundingBox::new(x1, y1, x2, y2),
                    class,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    const LABELS: LabelMap = LabelMap {
        name_class: 0,
        quantity_class: 1,
        min_confidence: 0.5,
    };

    #[test]
    fn labels_and_confidence_are_applied() -> Result<()> {
        let json = br#"[
            {"box": [10, 20, 110, 40], "label": 0, "confidence": 0.9},
            {"box": [200, 20, 240, 40], "label": 1},
            {"box": [0, 0, 5, 5], "label": 7, "confidence": 0.99},
            {"box": [0, 50, 5, 55], "label": 1, "confidence": 0.2}
        ]"#;
        let detections = LABELS.parse(json)?;
        assert_eq!(
            detections,
            vec![
                Detection {
                    bbox: BoundingBox::new(10.0, 20.0, 110.0, 40.0),
                    class: RegionClass::Name,
                },
                Detection {
                    bbox: BoundingBox::new(200.0, 20.0, 240.0, 40.0),
                    class: RegionClass::Quantity,
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn empty_list_is_a_blank_page() -> Result<()> {
        assert!(LABELS.parse(b"[]")?.is_empty());
        Ok(())
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(LABELS.parse(b"{\"boxes\": []}").is_err());
        assert!(LABELS.parse(b"").is_err());
    }

    #[derive(Debug, Parser)]
    struct DetectorCli {
        #[command(flatten)]
        opts: DetectorOpts,
    }

    #[test]
    fn detector_args_may_look_like_flags() -> Result<()> {
        let cli = DetectorCli::try_parse_from([
            "detect",
            "--detector-command",
            "python3",
            "--detector-arg",
            "-m",
            "--detector-arg",
            "detect_regions",
            "--detector-arg",
            "--weights=best.pt",
            "--name-class",
            "3",
        ])?;
        assert_eq!(
            cli.opts.detector_arg,
            vec!["-m", "detect_regions", "--weights=best.pt"]
        );
        assert_eq!(cli.opts.name_class, 3);
        Ok(())
    }

    #[test]
    fn missing_endpoint_is_reported() {
        let opts = DetectorOpts {
            detector: DetectorType::Http,
            detector_command: None,
            detector_arg: vec![],
            detector_url: None,
            min_confidence: 0.0,
            detector_timeout: 5,
            name_class: 0,
            quantity_class: 1,
        };
        assert!(opts.detector.create_detector(&opts).is_err());
    }
}
