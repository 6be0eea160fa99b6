//! Text recognition with a local `tesseract` install.

use std::time::Duration;

use image::RgbImage;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, run_command},
    extract::{BoundingBox, Token},
    png::encode_png,
    prelude::*,
    retry::{AttemptResult, retry_result_ok, try_fatal},
};

use super::TextRecognizer;

/// The TSV row level for individual words.
const WORD_LEVEL: &str = "5";

/// Runs `tesseract <image> stdout -l <lang> tsv`.
pub struct TesseractRecognizer {
    lang: String,
    timeout: Duration,
}

impl TesseractRecognizer {
    pub fn new(lang: String, timeout: Duration) -> Self {
        Self { lang, timeout }
    }

    async fn run(&self, image: &RgbImage) -> Result<Vec<Token>> {
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, encode_png(image)?)
            .await
            .context("cannot write tesseract input file")?;

        let mut cmd = Command::new("tesseract");
        cmd.arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("tsv");
        let output = run_command("tesseract", &mut cmd, Some(self.timeout)).await?;
        check_for_command_failure("tesseract", &output, None)?;
        parse_tsv(&output.stdout)
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    async fn recognize(&self, image: &RgbImage) -> AttemptResult<Vec<Token>> {
        // A local tool failing won't get better by asking again.
        let tokens = try_fatal!(self.run(image).await);
        debug!(count = tokens.len(), "Recognized words");
        retry_result_ok(tokens)
    }
}

/// Parse word rows out of tesseract's TSV output.
///
/// Columns are `level page_num block_num par_num line_num word_num left top
/// width height conf text`. Rows above word level have no text column.
fn parse_tsv(tsv: &[u8]) -> Result<Vec<Token>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(tsv);
    let mut tokens = vec![];
    for record in reader.records() {
        let record = record.context("cannot read tesseract TSV output")?;
        if record.get(0) != Some(WORD_LEVEL) {
            continue;
        }
        let text = record.get(11).unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let field = |idx: usize| -> Result<f32> {
            let value = record.get(idx).unwrap_or("");
            value
                .parse::<f32>()
                .with_context(|| format!("bad number {:?} in tesseract TSV row", value))
        };
        let (left, top) = (field(6)?, field(7)?);
        let (width, height) = (field(8)?, field(9)?);
        tokens.push(Token::new(
            text,
            BoundingBox::new(left, top, left + width, top + height),
        ));
    }
    Ok(tokens)
}
