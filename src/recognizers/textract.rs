//! Text recognition using AWS Textract.

use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_textract::{
    error::{ProvideErrorMetadata as _, SdkError},
    primitives::Blob,
    types::{Block, BlockType, Document},
};
use image::RgbImage;
use tokio::time;

use crate::{
    extract::{BoundingBox, Token},
    png::encode_png,
    prelude::*,
    retry::{AttemptResult, IsKnownTransient, retry_result_ok, try_fatal, try_potentially_transient},
};

use super::{RecognitionError, TextRecognizer};

/// Error codes Textract uses when we're sending too much.
const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "ProvisionedThroughputExceededException",
    "InternalServerError",
];

/// Calls `DetectDocumentText` and keeps the WORD blocks.
pub struct TextractRecognizer {
    client: aws_sdk_textract::Client,
    timeout: Duration,
}

impl TextractRecognizer {
    /// Create a new `textract` recognizer from the standard AWS environment
    /// variables and credential files.
    pub async fn new(timeout: Duration) -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await;
        if config.region().is_none() {
            return Err(anyhow!(
                "--recognizer=textract requires an AWS region (set AWS_REGION)"
            ));
        }
        Ok(Self {
            client: aws_sdk_textract::Client::new(&config),
            timeout,
        })
    }
}

#[async_trait]
impl TextRecognizer for TextractRecognizer {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    async fn recognize(&self, image: &RgbImage) -> AttemptResult<Vec<Token>> {
        let png = try_fatal!(encode_png(image));
        let document = Document::builder().bytes(Blob::new(png)).build();
        let request = self.client.detect_document_text().document(document).send();
        let response = try_potentially_transient!(
            match time::timeout(self.timeout, request).await {
                Ok(result) => result.map_err(|err| {
                    let transient = matches!(
                        err,
                        SdkError::DispatchFailure(_)
                            | SdkError::TimeoutError(_)
                            | SdkError::ResponseError(_)
                    ) || err.code().is_some_and(|code| THROTTLING_CODES.contains(&code));
                    RecognitionError::Service {
                        message: format!("AWS Textract error: {err:?}"),
                        transient,
                    }
                }),
                Err(_) => Err(RecognitionError::Timeout(self.timeout)),
            }
        );
        trace!("Document response: {response:#?}");

        let tokens = tokens_from_blocks(response.blocks(), image.width(), image.height());
        debug!(count = tokens.len(), "Recognized words");
        retry_result_ok(tokens)
    }
}

/// Convert WORD blocks to tokens in pixel coordinates.
///
/// Textract geometry is relative to the image size.
fn tokens_from_blocks(blocks: &[Block], width: u32, height: u32) -> Vec<Token> {
    let (width, height) = (width as f32, height as f32);
    blocks
        .iter()
        .filter(|block| block.block_type() == Some(&BlockType::Word))
        .filter_map(|block| {
            let text = block.text()?;
            let bbox = block.geometry()?.bounding_box()?;
            let x1 = bbox.left() * width;
            let y1 = bbox.top() * height;
            Some(Token::new(
                text,
                BoundingBox::new(
                    x1,
                    y1,
                    x1 + bbox.width() * width,
                    y1 + bbox.height() * height,
                ),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use aws_sdk_textract::types::{self, Geometry};

    use super::*;

    fn block(block_type: BlockType, text: &str, left: f32, top: f32) -> Block {
        Block::builder()
            .block_type(block_type)
            .text(text)
            .geometry(
                Geometry::builder()
                    .bounding_box(
                        types::BoundingBox::builder()
                            .left(left)
                            .top(top)
                            .width(0.5)
                            .height(0.25)
                            .build(),
                    )
                    .build(),
            )
            .build()
    }

    #[test]
    fn only_words_are_kept_and_scaled_to_pixels() {
        let blocks = [
            block(BlockType::Line, "ABC-O1 12", 0.0, 0.0),
            block(BlockType::Word, "ABC-O1", 0.0, 0.0),
            block(BlockType::Word, "12", 0.25, 0.5),
        ];
        let tokens = tokens_from_blocks(&blocks, 200, 100);
        assert_eq!(
            tokens,
            vec![
                Token::new("ABC-O1", BoundingBox::new(0.0, 0.0, 100.0, 25.0)),
                Token::new("12", BoundingBox::new(50.0, 50.0, 150.0, 75.0)),
            ]
        );
    }
}
