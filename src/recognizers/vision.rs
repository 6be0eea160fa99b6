//! Google Cloud Vision text detection, over the REST API.

use std::{env, time::Duration};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use image::RgbImage;

use crate::{
    extract::{BoundingBox, Token},
    png::encode_png,
    prelude::*,
    retry::{AttemptResult, IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

use super::{RecognitionError, TextRecognizer};

/// `google.rpc.Code` values worth retrying: RESOURCE_EXHAUSTED and
/// UNAVAILABLE.
const TRANSIENT_STATUS_CODES: &[i32] = &[8, 14];

/// The public `images:annotate` endpoint.
const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Calls `images:annotate` with `TEXT_DETECTION`.
pub struct VisionRecognizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    language_hints: Vec<String>,
}

impl VisionRecognizer {
    /// Configure from `GOOGLE_VISION_API_KEY` and, optionally,
    /// `GOOGLE_VISION_ENDPOINT`.
    pub fn from_env(timeout: Duration, language_hints: Vec<String>) -> Result<Self> {
        let api_key = env::var("GOOGLE_VISION_API_KEY")
            .context("--recognizer=vision requires GOOGLE_VISION_API_KEY")?;
        let endpoint =
            env::var("GOOGLE_VISION_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_owned());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            language_hints,
        })
    }
}

#[async_trait]
impl TextRecognizer for VisionRecognizer {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    async fn recognize(&self, image: &RgbImage) -> AttemptResult<Vec<Token>> {
        let png = try_fatal!(encode_png(image));
        let request = AnnotateRequest::text_detection(&png, &self.language_hints);
        let response = try_potentially_transient!(
            self.client
                .post(&self.endpoint)
                .query(&[("key", &self.api_key)])
                .json(&request)
                .send()
                .await
                .map_err(RecognitionError::Http)
        );
        let status = response.status();
        let body = try_potentially_transient!(
            response.text().await.map_err(RecognitionError::Http)
        );
        let body = try_potentially_transient!(RecognitionError::check_status(status, body));
        trace!(%body, "Vision response");

        let response = try_fatal!(
            serde_json::from_str::<AnnotateResponse>(&body)
                .context("Failed to parse Vision response")
        );
        let tokens = try_potentially_transient!(response.into_tokens());
        debug!(count = tokens.len(), "Recognized words");
        retry_result_ok(tokens)
    }
}

/// Request body for `images:annotate`.
#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    /// Base64-encoded image bytes.
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

impl AnnotateRequest {
    fn text_detection(png: &[u8], language_hints: &[String]) -> Self {
        let image_context = if language_hints.is_empty() {
            None
        } else {
            Some(ImageContext {
                language_hints: language_hints.to_vec(),
            })
        };
        Self {
            requests: vec![AnnotateImageRequest {
                image: ImageContent {
                    content: BASE64_STANDARD.encode(png),
                },
                features: vec![Feature {
                    feature_type: "TEXT_DETECTION",
                }],
                image_context,
            }],
        }
    }
}

/// Response body for `images:annotate`. Only the fields we read.
#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
    error: Option<ErrorStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

/// Vision leaves out coordinates that are zero.
#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

#[derive(Debug, Deserialize)]
struct ErrorStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl AnnotateResponse {
    /// Word tokens, in service order.
    ///
    /// The first annotation is the full text of the image, which would
    /// duplicate every word, so we skip it.
    fn into_tokens(self) -> Result<Vec<Token>, RecognitionError> {
        let Some(response) = self.responses.into_iter().next() else {
            return Ok(vec![]);
        };
        if let Some(error) = response.error {
            return Err(RecognitionError::Service {
                message: format!("Vision reported error {}: {}", error.code, error.message),
                transient: TRANSIENT_STATUS_CODES.contains(&error.code),
            });
        }
        Ok(response
            .text_annotations
            .into_iter()
            .skip(1)
            .filter_map(|annotation| {
                let vertices = annotation.bounding_poly?.vertices;
                let bbox = BoundingBox::enclosing(vertices.iter().map(|v| (v.x, v.y)));
                if bbox.is_none() {
                    debug!(text = %annotation.description, "Skipping word without a box");
                }
                Some(Token::new(annotation.description, bbox?))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_matches_the_rest_api() -> Result<()> {
        let request = AnnotateRequest::text_detection(b"png", &["ja".to_owned()]);
        let json = serde_json::to_value(&request)?;
        assert_eq!(
            json,
            serde_json::json!({
                "requests": [{
                    "image": {"content": "cG5n"},
                    "features": [{"type": "TEXT_DETECTION"}],
                    "imageContext": {"languageHints": ["ja"]},
                }]
            })
        );
        let without_hints = serde_json::to_value(AnnotateRequest::text_detection(b"", &[]))?;
        assert!(without_hints["requests"][0].get("imageContext").is_none());
        Ok(())
    }

    #[test]
    fn full_text_annotation_is_skipped() -> Result<()> {
        let response = serde_json::from_str::<AnnotateResponse>(
            r#"{"responses": [{"textAnnotations": [
                {"description": "ABC-O1\n12", "boundingPoly": {"vertices": [{}, {"x": 50}, {"x": 50, "y": 60}, {"y": 60}]}},
                {"description": "ABC-O1", "boundingPoly": {"vertices": [{"x": 2, "y": 3}, {"x": 40, "y": 3}, {"x": 40, "y": 20}, {"x": 2, "y": 20}]}},
                {"description": "12", "boundingPoly": {"vertices": [{"y": 45}, {"x": 10, "y": 45}, {"x": 10, "y": 58}, {"y": 58}]}},
                {"description": "nobox"}
            ]}]}"#,
        )?;
        let tokens = response.into_tokens()?;
        assert_eq!(
            tokens,
            vec![
                Token::new("ABC-O1", BoundingBox::new(2.0, 3.0, 40.0, 20.0)),
                Token::new("12", BoundingBox::new(0.0, 45.0, 10.0, 58.0)),
            ]
        );
        Ok(())
    }

    #[test]
    fn blank_images_have_no_tokens() -> Result<()> {
        let response = serde_json::from_str::<AnnotateResponse>(r#"{"responses": [{}]}"#)?;
        assert!(response.into_tokens()?.is_empty());
        Ok(())
    }

    #[test]
    fn per_image_errors_are_reported() -> Result<()> {
        let response = serde_json::from_str::<AnnotateResponse>(
            r#"{"responses": [{"error": {"code": 3, "message": "Bad image data."}}]}"#,
        )?;
        let err = response.into_tokens().expect_err("error should be reported");
        assert!(err.to_string().contains("Bad image data."));
        assert!(!err.is_known_transient());
        Ok(())
    }

    #[test]
    fn overload_errors_can_be_retried() -> Result<()> {
        for code in [8, 14] {
            let response = serde_json::from_str::<AnnotateResponse>(&format!(
                r#"{{"responses": [{{"error": {{"code": {code}, "message": "try later"}}}}]}}"#
            ))?;
            let err = response.into_tokens().expect_err("error should be reported");
            assert!(err.is_known_transient(), "code {code}");
        }
        Ok(())
    }
}
