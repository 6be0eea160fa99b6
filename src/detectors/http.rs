//! Detect regions with a model behind an HTTP inference endpoint.

use std::time::Duration;

use image::RgbImage;
use reqwest::header::CONTENT_TYPE;

use crate::{extract::Detection, png::encode_png, prelude::*};

use super::{LabelMap, RegionDetector};

/// POSTs each page as `image/png` and expects a detection list back.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    labels: LabelMap,
}

impl HttpDetector {
    pub fn new(url: String, timeout: Duration, labels: LabelMap) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            labels,
        })
    }
}

#[async_trait]
impl RegionDetector for HttpDetector {
    #[instrument(level = "debug", skip_all, fields(url = %self.url))]
    async fn detect(&self, page: &RgbImage) -> Result<Vec<Detection>> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "image/png")
            .body(encode_png(page)?)
            .send()
            .await
            .with_context(|| format!("Failed to reach detector at {}", self.url))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("Failed to read detector response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "Detector returned status {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ));
        }
        trace!(body = %String::from_utf8_lossy(&body), "Detector response");
        let detections = self.labels.parse(&body)?;
        debug!(count = detections.len(), "Detected regions");
        Ok(detections)
    }
}
