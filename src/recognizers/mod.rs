//! Text recognizers.
//!
//! A recognizer turns one composite image into a flat list of words with
//! boxes. It knows nothing about pairs; [`crate::extract::reattribution`]
//! puts the structure back.

use std::{error, fmt, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use image::RgbImage;
use reqwest::StatusCode;

use crate::{
    extract::Token,
    prelude::*,
    retry::{AttemptResult, IsKnownTransient, with_retries},
};

pub mod tesseract;
pub mod textract;
pub mod vision;

/// Recognize the words in an image.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    /// Make one attempt at recognizing `image`, reporting whether a failure
    /// is worth retrying.
    async fn recognize(&self, image: &RgbImage) -> AttemptResult<Vec<Token>>;
}

/// Recognize `image`, retrying known transient failures.
pub async fn recognize_with_retries(
    recognizer: &dyn TextRecognizer,
    image: &RgbImage,
    retries: u8,
) -> Result<Vec<Token>> {
    with_retries(retries, || recognizer.recognize(image)).await
}

/// Our different recognizer types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum RecognizerType {
    /// Google Cloud Vision text detection. Requires `GOOGLE_VISION_API_KEY`.
    #[default]
    Vision,

    /// AWS Textract, using the standard AWS credentials.
    Textract,

    /// A locally installed `tesseract`.
    Tesseract,
}

impl RecognizerType {
    /// Instantiate an appropriate recognizer.
    pub async fn create_recognizer(
        &self,
        opts: &RecognizerOpts,
    ) -> Result<Arc<dyn TextRecognizer>> {
        match self {
            RecognizerType::Vision => Ok(Arc::new(vision::VisionRecognizer::from_env(
                opts.timeout(),
                opts.language_hint.clone(),
            )?)),
            RecognizerType::Textract => Ok(Arc::new(
                textract::TextractRecognizer::new(opts.timeout()).await?,
            )),
            RecognizerType::Tesseract => Ok(Arc::new(tesseract::TesseractRecognizer::new(
                opts.tesseract_lang.clone(),
                opts.timeout(),
            ))),
        }
    }
}

/// Recognizer options.
#[derive(Args, Clone, Debug)]
pub struct RecognizerOpts {
    /// The text recognition service to use.
    #[clap(long, value_enum, default_value_t = RecognizerType::default())]
    pub recognizer: RecognizerType,

    /// Timeout, in seconds, for recognizing one composite image.
    #[clap(long, default_value = "60")]
    pub recognizer_timeout: u64,

    /// How many times to retry a composite after a transient failure, such
    /// as a rate limit or an overloaded server.
    #[clap(long, default_value = "0")]
    pub recognizer_retries: u8,

    /// Language hint for `--recognizer=vision`, such as `ja`. May be
    /// repeated.
    #[clap(long)]
    pub language_hint: Vec<String>,

    /// Languages for `--recognizer=tesseract`.
    #[clap(long, default_value = "jpn+eng")]
    pub tesseract_lang: String,
}

impl RecognizerOpts {
    /// Per-composite timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.recognizer_timeout)
    }
}

/// A failure talking to a recognition service.
#[derive(Debug)]
pub enum RecognitionError {
    /// The request never got a response.
    Http(reqwest::Error),

    /// The service answered with an error status.
    Status { status: StatusCode, body: String },

    /// No answer within our timeout.
    Timeout(Duration),

    /// The service reported an error of its own.
    Service { message: String, transient: bool },
}

impl RecognitionError {
    /// Turn a non-success response into an error.
    pub fn check_status(status: StatusCode, body: String) -> Result<String, Self> {
        if status.is_success() {
            Ok(body)
        } else {
            Err(RecognitionError::Status { status, body })
        }
    }
}

impl IsKnownTransient for RecognitionError {
    fn is_known_transient(&self) -> bool {
        match self {
            RecognitionError::Http(err) => err.is_known_transient(),
            RecognitionError::Status { status, .. } => status.is_known_transient(),
            RecognitionError::Timeout(_) => true,
            RecognitionError::Service { transient, .. } => *transient,
        }
    }
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionError::Http(err) => write!(f, "recognition request failed: {err}"),
            RecognitionError::Status { status, body } => {
                write!(f, "recognition service returned {status}: {body}")
            }
            RecognitionError::Timeout(timeout) => {
                write!(f, "recognition timed out after {timeout:?}")
            }
            RecognitionError::Service { message, .. } => {
                write!(f, "recognition service error: {message}")
            }
        }
    }
}

impl error::Error for RecognitionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            RecognitionError::Http(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let overloaded = RecognitionError::Status {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        let forbidden = RecognitionError::Status {
            status: StatusCode::FORBIDDEN,
            body: "bad key".to_owned(),
        };
        assert!(overloaded.is_known_transient());
        assert!(!forbidden.is_known_transient());
        assert!(RecognitionError::Timeout(Duration::from_secs(1)).is_known_transient());
        assert!(forbidden.to_string().contains("bad key"));
    }

    #[test]
    fn check_status_passes_success_through() {
        assert_eq!(
            RecognitionError::check_status(StatusCode::OK, "{}".to_owned()).ok(),
            Some("{}".to_owned())
        );
        assert!(
            RecognitionError::check_status(StatusCode::BAD_GATEWAY, String::new()).is_err()
        );
    }
}
