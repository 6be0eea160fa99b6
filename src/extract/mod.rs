//! The extraction pipeline.
//!
//! For every page: detect regions, pair names with quantities, pack the
//! pairs into composites, recognize each composite, map the words back to
//! their pairs and clean up the text. Pages and composites are processed one
//! at a time, in order, so rows come out in document order.
//!
//! Adapter failures never end a run. A page whose detection fails yields no
//! rows, and a composite whose recognition fails loses only its own rows.
//! Both are recorded in the [`ExtractionReport`]. Only an unreadable input
//! document is fatal.

use std::sync::Arc;

use clap::Args;
use futures::{Stream, StreamExt as _};
use image::RgbImage;
use indicatif::ProgressBar;
use schemars::JsonSchema;

use crate::{
    async_utils::blocking_iter_streams::BlockingIterStream,
    detectors::RegionDetector,
    page_iter::{PageIter, PageIterOptions},
    prelude::*,
    recognizers::{TextRecognizer, recognize_with_retries},
    ui::Ui,
};

use self::{
    compositor::{BatchLimits, CompositeImage, compose_batches},
    normalize::{normalize_item_name, normalize_quantity},
    pairing::pair_regions,
    reattribution::reattribute,
};

pub mod compositor;
pub mod geometry;
pub mod normalize;
pub mod pairing;
pub mod reattribution;

pub use self::{
    geometry::BoundingBox,
    pairing::{Detection, RegionClass},
    reattribution::Token,
};

/// One extracted line item.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct ExtractedRow {
    /// Which page this came from, like `Page 1`.
    pub page: String,
    /// The item name or code, with letter O corrected to zero and no
    /// whitespace.
    pub item_name: String,
    /// The quantity, with no whitespace.
    pub quantity: String,
}

impl ExtractedRow {
    /// Column names for CSV output.
    pub const CSV_HEADER: [&'static str; 3] = ["page", "item_name", "quantity"];

    /// Fields in [`Self::CSV_HEADER`] order.
    pub fn to_csv_record(&self) -> [&str; 3] {
        [&self.page, &self.item_name, &self.quantity]
    }
}

/// Human-readable label for a zero-based page index.
pub fn page_label(page_idx: usize) -> String {
    format!("Page {}", page_idx + 1)
}

/// Options controlling how pairs are packed for recognition.
#[derive(Args, Clone, Debug)]
pub struct PipelineOpts {
    /// The most name/quantity pairs to send in one recognition request.
    #[clap(long, default_value = "12", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_pairs_per_composite: u32,

    /// Gap, in pixels, between a name and its quantity, and between pairs.
    #[clap(long, default_value = "20", value_parser = clap::value_parser!(u32).range(2..))]
    pub padding: u32,
}

impl PipelineOpts {
    /// Packing limits for the compositor.
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_pairs_per_composite: self.max_pairs_per_composite as usize,
            padding: self.padding,
        }
    }
}

/// Which stage of the pipeline failed.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The detector failed, so the whole page was skipped.
    DetectionUnavailable,
    /// The recognizer failed on one composite, so its pairs were skipped.
    RecognitionUnavailable,
}

/// Output status of a page.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    // Every stage succeeded.
    Ok,

    // Some composites failed, so some rows are missing.
    Incomplete,

    // No rows could be produced.
    Failed,
}

/// A stage failure on one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageFailure {
    pub kind: FailureKind,
    /// Zero-based composite index, for recognition failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<usize>,
    pub message: String,
}

/// How many regions of each class the detector found.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub names: usize,
    pub quantities: usize,
}

impl ClassCounts {
    fn count(detections: &[Detection]) -> Self {
        detections
            .iter()
            .fold(Self::default(), |mut counts, detection| {
                match detection.class {
                    RegionClass::Name => counts.names += 1,
                    RegionClass::Quantity => counts.quantities += 1,
                }
                counts
            })
    }
}

/// What happened on one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageSummary {
    pub page: String,
    pub status: PageStatus,
    pub detections: ClassCounts,
    pub pairs: usize,
    pub composites: usize,
    pub failed_composites: usize,
    /// Recognized words that fell outside every pair.
    pub dropped_tokens: usize,
    pub rows: usize,
    pub errors: Vec<PageFailure>,
}

impl PageSummary {
    fn new(page: &str) -> Self {
        Self {
            page: page.to_owned(),
            status: PageStatus::Ok,
            detections: ClassCounts::default(),
            pairs: 0,
            composites: 0,
            failed_composites: 0,
            dropped_tokens: 0,
            rows: 0,
            errors: vec![],
        }
    }
}

/// Report for a whole run.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExtractionReport {
    /// The input document.
    pub document: PathBuf,
    /// Pages in the document, including any skipped because of
    /// `--max-pages`.
    pub total_pages: usize,
    pub total_rows: usize,
    /// Complaints from the page rasterizer, and skipped pages.
    pub warnings: Vec<String>,
    pub pages: Vec<PageSummary>,
}

impl ExtractionReport {
    /// Print summary messages.
    pub fn display_summary(&self, ui: &Ui) {
        ui.display_message(
            "📋",
            &format!(
                "{} rows extracted from {} pages",
                self.total_rows,
                self.pages.len()
            ),
        );
        let skipped = self
            .pages
            .iter()
            .filter(|p| {
                p.errors
                    .iter()
                    .any(|e| e.kind == FailureKind::DetectionUnavailable)
            })
            .count();
        if skipped > 0 {
            ui.display_message("⏭️", &format!("{} pages skipped (detection failed)", skipped));
        }
        let failed_composites = self.pages.iter().map(|p| p.failed_composites).sum::<usize>();
        if failed_composites > 0 {
            ui.display_message(
                "❌",
                &format!("{} composites could not be recognized", failed_composites),
            );
        }
        let dropped = self.pages.iter().map(|p| p.dropped_tokens).sum::<usize>();
        if dropped > 0 {
            ui.display_message(
                "🗑️",
                &format!("{} recognized words fell outside every pair", dropped),
            );
        }
        for warning in &self.warnings {
            ui.display_message("⚠️", warning);
        }
    }
}

/// Rows plus the report describing how they were produced.
#[derive(Clone, Debug)]
pub struct Extraction {
    pub rows: Vec<ExtractedRow>,
    pub report: ExtractionReport,
}

/// Runs the pipeline with a particular detector and recognizer.
pub struct Extractor {
    detector: Arc<dyn RegionDetector>,
    recognizer: Arc<dyn TextRecognizer>,
    limits: BatchLimits,
    recognizer_retries: u8,
}

impl Extractor {
    pub fn new(
        detector: Arc<dyn RegionDetector>,
        recognizer: Arc<dyn TextRecognizer>,
        limits: BatchLimits,
        recognizer_retries: u8,
    ) -> Self {
        Self {
            detector,
            recognizer,
            limits,
            recognizer_retries,
        }
    }

    /// Extract rows from every page of a document.
    ///
    /// Fails only if the document cannot be opened or a page cannot be
    /// decoded.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn extract_document(
        &self,
        ui: &Ui,
        path: &Path,
        page_iter_opts: &PageIterOptions,
    ) -> Result<Extraction> {
        let spinner = ui.document_spinner(path);
        let page_iter = PageIter::from_path(path, page_iter_opts)
            .await
            .with_context(|| format!("cannot read pages from {:?}", path.display()))?;
        spinner.finish_with_message(format!("Found {} pages", page_iter.total_pages()));

        let mut warnings = page_iter.warnings().to_vec();
        if let Err(err) = page_iter.check_complete() {
            warn!("{}", err);
            warnings.push(err.to_string());
        }
        let total_pages = page_iter.total_pages();

        let pb = ui.page_bar(page_iter.pages_to_process() as u64);
        let (rows, pages) = self
            .extract_pages(BlockingIterStream::new(page_iter), &pb)
            .await?;
        pb.finish_with_message(format!("{} rows", rows.len()));

        Ok(Extraction {
            report: ExtractionReport {
                document: path.to_owned(),
                total_pages,
                total_rows: rows.len(),
                warnings,
                pages,
            },
            rows,
        })
    }

    /// Extract rows from a stream of pages, in order.
    pub async fn extract_pages<S>(
        &self,
        mut pages: S,
        pb: &ProgressBar,
    ) -> Result<(Vec<ExtractedRow>, Vec<PageSummary>)>
    where
        S: Stream<Item = Result<RgbImage>> + Unpin,
    {
        let mut rows = vec![];
        let mut summaries = vec![];
        let mut page_idx = 0;
        while let Some(page) = pages.next().await {
            let label = page_label(page_idx);
            pb.set_message(label.clone());
            let page = page.with_context(|| format!("cannot decode {}", label))?;
            let (page_rows, summary) = self.extract_page(&label, &page).await;
            debug!(page = %label, rows = page_rows.len(), status = ?summary.status, "Finished page");
            rows.extend(page_rows);
            summaries.push(summary);
            pb.inc(1);
            page_idx += 1;
        }
        Ok((rows, summaries))
    }

    /// Extract rows from one page. Never fails; problems are recorded in the
    /// returned summary instead.
    #[instrument(level = "debug", skip_all, fields(page = %label))]
    pub async fn extract_page(
        &self,
        label: &str,
        page: &RgbImage,
    ) -> (Vec<ExtractedRow>, PageSummary) {
        let mut summary = PageSummary::new(label);

        let detections = match self.detector.detect(page).await {
            Ok(detections) => detections,
            Err(err) => {
                error!("Detection failed, skipping page: {:?}", err);
                summary.status = PageStatus::Failed;
                summary.errors.push(PageFailure {
                    kind: FailureKind::DetectionUnavailable,
                    composite: None,
                    message: format!("{:?}", err),
                });
                return (vec![], summary);
            }
        };
        summary.detections = ClassCounts::count(&detections);

        let pairs = pair_regions(&detections);
        summary.pairs = pairs.len();
        let composites = compose_batches(page, &pairs, self.limits);
        summary.composites = composites.len();

        let mut rows = vec![];
        for (composite_idx, composite) in composites.iter().enumerate() {
            let tokens = match self.recognize_composite(composite_idx, composite).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    error!(
                        composite = composite_idx,
                        "Recognition failed, skipping {} pairs: {:?}",
                        composite.bounds.len(),
                        err
                    );
                    summary.failed_composites += 1;
                    summary.errors.push(PageFailure {
                        kind: FailureKind::RecognitionUnavailable,
                        composite: Some(composite_idx),
                        message: format!("{:?}", err),
                    });
                    continue;
                }
            };

            let reattribution = reattribute(&tokens, &composite.bounds);
            if reattribution.dropped > 0 {
                warn!(
                    composite = composite_idx,
                    dropped = reattribution.dropped,
                    "Some recognized words fell outside every pair"
                );
            }
            summary.dropped_tokens += reattribution.dropped;
            rows.extend(reattribution.fields.into_iter().map(|text| ExtractedRow {
                page: label.to_owned(),
                item_name: normalize_item_name(&text.name),
                quantity: normalize_quantity(&text.quantity),
            }));
        }

        summary.rows = rows.len();
        summary.status = if summary.failed_composites == 0 {
            PageStatus::Ok
        } else if summary.failed_composites == summary.composites {
            PageStatus::Failed
        } else {
            PageStatus::Incomplete
        };
        (rows, summary)
    }

    #[instrument(level = "debug", skip_all, fields(composite = composite_idx, pairs = composite.bounds.len()))]
    async fn recognize_composite(
        &self,
        composite_idx: usize,
        composite: &CompositeImage,
    ) -> Result<Vec<Token>> {
        recognize_with_retries(
            self.recognizer.as_ref(),
            &composite.image,
            self.recognizer_retries,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use futures::stream;
    use image::Rgb;

    use super::*;
    use crate::retry::{AttemptResult, retry_result_fatal, retry_result_ok};

    /// Returns scripted results, one per page.
    struct ScriptedDetector {
        results: Mutex<VecDeque<Result<Vec<Detection>>>>,
    }

    impl ScriptedDetector {
        fn new(results: impl IntoIterator<Item = Result<Vec<Detection>>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl RegionDetector for ScriptedDetector {
        async fn detect(&self, _page: &RgbImage) -> Result<Vec<Detection>> {
            self.results
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .unwrap_or_else(|| Ok(vec![]))
        }
    }

    /// Returns scripted results, one per composite, then empty token lists.
    struct ScriptedRecognizer {
        results: Mutex<VecDeque<AttemptResult<Vec<Token>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(results: impl IntoIterator<Item = AttemptResult<Vec<Token>>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into_iter().collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextRecognizer for ScriptedRecognizer {
        async fn recognize(&self, _image: &RgbImage) -> AttemptResult<Vec<Token>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .unwrap_or_else(|| retry_result_ok(vec![]))
        }
    }

    const LIMITS: BatchLimits = BatchLimits {
        max_pairs_per_composite: 12,
        padding: 20,
    };

    fn extractor(
        detector: Arc<ScriptedDetector>,
        recognizer: Arc<ScriptedRecognizer>,
    ) -> Extractor {
        Extractor::new(detector, recognizer, LIMITS, 0)
    }

    fn region(class: RegionClass, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class,
        }
    }

    /// Two 20px-tall pairs. With 20px padding, the composite has pairs at
    /// 0..60 (split at 30) and 80..140 (split at 110).
    fn two_pair_detections() -> Vec<Detection> {
        vec![
            region(RegionClass::Quantity, 100.0, 50.0, 130.0, 70.0),
            region(RegionClass::Name, 10.0, 10.0, 60.0, 30.0),
            region(RegionClass::Name, 10.0, 50.0, 60.0, 70.0),
            region(RegionClass::Quantity, 100.0, 10.0, 130.0, 30.0),
        ]
    }

    /// A token centered vertically on `center_y` in composite coordinates.
    fn token(text: &str, center_y: f32) -> Token {
        Token::new(text, BoundingBox::new(0.0, center_y - 4.0, 30.0, center_y + 4.0))
    }

    fn two_pair_tokens() -> Vec<Token> {
        vec![
            token("ABC-O1", 10.0),
            token("12", 50.0),
            token("XYZ-5", 90.0),
            token("7", 130.0),
        ]
    }

    fn page() -> RgbImage {
        RgbImage::from_pixel(200, 200, Rgb([255, 255, 255]))
    }

    fn row(page: &str, item_name: &str, quantity: &str) -> ExtractedRow {
        ExtractedRow {
            page: page.to_owned(),
            item_name: item_name.to_owned(),
            quantity: quantity.to_owned(),
        }
    }

    #[tokio::test]
    async fn one_page_two_pairs() -> Result<()> {
        let extractor = extractor(
            ScriptedDetector::new([Ok(two_pair_detections())]),
            ScriptedRecognizer::new([retry_result_ok(two_pair_tokens())]),
        );
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(page())]), &ProgressBar::hidden())
            .await?;
        assert_eq!(
            rows,
            vec![row("Page 1", "ABC-01", "12"), row("Page 1", "XYZ-5", "7")]
        );
        let summary = &summaries[0];
        assert_eq!(summary.status, PageStatus::Ok);
        assert_eq!(summary.detections, ClassCounts { names: 2, quantities: 2 });
        assert_eq!((summary.pairs, summary.composites, summary.rows), (2, 1, 2));
        assert_eq!(summary.dropped_tokens, 0);
        Ok(())
    }

    #[tokio::test]
    async fn recognition_failure_only_loses_that_page() -> Result<()> {
        let recognizer = ScriptedRecognizer::new([
            retry_result_ok(two_pair_tokens()),
            retry_result_fatal(anyhow!("service unavailable")),
        ]);
        let extractor = extractor(
            ScriptedDetector::new([Ok(two_pair_detections()), Ok(two_pair_detections())]),
            recognizer.clone(),
        );
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(page()), Ok(page())]), &ProgressBar::hidden())
            .await?;
        assert_eq!(
            rows,
            vec![row("Page 1", "ABC-01", "12"), row("Page 1", "XYZ-5", "7")]
        );
        assert_eq!(recognizer.calls(), 2);
        assert_eq!(summaries[1].status, PageStatus::Failed);
        assert_eq!(summaries[1].failed_composites, 1);
        assert_eq!(summaries[1].errors[0].kind, FailureKind::RecognitionUnavailable);
        assert_eq!(summaries[1].errors[0].composite, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn detection_failure_skips_the_page() -> Result<()> {
        let recognizer = ScriptedRecognizer::new([retry_result_ok(two_pair_tokens())]);
        let extractor = extractor(
            ScriptedDetector::new([Err(anyhow!("model crashed")), Ok(two_pair_detections())]),
            recognizer.clone(),
        );
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(page()), Ok(page())]), &ProgressBar::hidden())
            .await?;
        assert_eq!(
            rows,
            vec![row("Page 2", "ABC-01", "12"), row("Page 2", "XYZ-5", "7")]
        );
        assert_eq!(recognizer.calls(), 1);
        assert_eq!(summaries[0].status, PageStatus::Failed);
        assert_eq!(summaries[0].rows, 0);
        assert_eq!(summaries[0].errors[0].kind, FailureKind::DetectionUnavailable);
        assert_eq!(summaries[1].status, PageStatus::Ok);
        Ok(())
    }

    #[tokio::test]
    async fn partial_recognition_failure_is_incomplete() -> Result<()> {
        // 13 pairs with a limit of 12 make two composites.
        let detections = (0..13)
            .flat_map(|i| {
                let y = 10.0 + 30.0 * i as f32;
                [
                    region(RegionClass::Name, 10.0, y, 60.0, y + 20.0),
                    region(RegionClass::Quantity, 100.0, y, 130.0, y + 20.0),
                ]
            })
            .collect::<Vec<_>>();
        let recognizer = ScriptedRecognizer::new([
            retry_result_fatal(anyhow!("quota exceeded")),
            retry_result_ok(vec![token("LAST", 10.0), token("1", 50.0)]),
        ]);
        let extractor = extractor(ScriptedDetector::new([Ok(detections)]), recognizer.clone());
        let tall_page = RgbImage::from_pixel(200, 500, Rgb([255, 255, 255]));
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(tall_page)]), &ProgressBar::hidden())
            .await?;
        assert_eq!(rows, vec![row("Page 1", "LAST", "1")]);
        assert_eq!(summaries[0].composites, 2);
        assert_eq!(summaries[0].status, PageStatus::Incomplete);
        Ok(())
    }

    #[tokio::test]
    async fn thirty_pairs_take_three_recognition_calls() -> Result<()> {
        let detections = (0..30)
            .flat_map(|i| {
                let y = 10.0 + 30.0 * i as f32;
                [
                    region(RegionClass::Name, 10.0, y, 60.0, y + 20.0),
                    region(RegionClass::Quantity, 100.0, y, 130.0, y + 20.0),
                ]
            })
            .collect::<Vec<_>>();
        let recognizer = ScriptedRecognizer::new([]);
        let extractor = extractor(ScriptedDetector::new([Ok(detections)]), recognizer.clone());
        let tall_page = RgbImage::from_pixel(200, 1000, Rgb([255, 255, 255]));
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(tall_page)]), &ProgressBar::hidden())
            .await?;
        assert_eq!(recognizer.calls(), 3);
        assert_eq!(summaries[0].composites, 3);
        // Pairs with no recognized text still produce (empty) rows.
        assert_eq!(rows.len(), 30);
        Ok(())
    }

    #[tokio::test]
    async fn blank_page_is_ok_and_calls_no_recognizer() -> Result<()> {
        let recognizer = ScriptedRecognizer::new([]);
        let extractor = extractor(ScriptedDetector::new([Ok(vec![])]), recognizer.clone());
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(page())]), &ProgressBar::hidden())
            .await?;
        assert!(rows.is_empty());
        assert_eq!(recognizer.calls(), 0);
        assert_eq!(summaries[0].status, PageStatus::Ok);
        Ok(())
    }

    #[tokio::test]
    async fn stray_tokens_are_counted() -> Result<()> {
        let mut tokens = two_pair_tokens();
        tokens.push(token("smudge", 70.0));
        let extractor = extractor(
            ScriptedDetector::new([Ok(two_pair_detections())]),
            ScriptedRecognizer::new([retry_result_ok(tokens)]),
        );
        let (rows, summaries) = extractor
            .extract_pages(stream::iter([Ok(page())]), &ProgressBar::hidden())
            .await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(summaries[0].dropped_tokens, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_page_is_fatal() {
        let extractor = extractor(ScriptedDetector::new([]), ScriptedRecognizer::new([]));
        let pages = stream::iter([Ok(page()), Err(anyhow!("truncated PNG"))]);
        let err = extractor
            .extract_pages(pages, &ProgressBar::hidden())
            .await
            .expect_err("decode failure should end the run");
        assert!(format!("{err:?}").contains("Page 2"));
    }

    #[tokio::test]
    async fn whole_document_from_tiff() -> Result<()> {
        use tiff::encoder::{TiffEncoder, colortype};

        let dir = tempfile::TempDir::with_prefix("extract-test")?;
        let path = dir.path().join("scan.tiff");
        let data = vec![255u8; 200 * 200 * 3];
        TiffEncoder::new(std::fs::File::create(&path)?)?
            .write_image::<colortype::RGB8>(200, 200, &data)?;

        let extractor = extractor(
            ScriptedDetector::new([Ok(two_pair_detections())]),
            ScriptedRecognizer::new([retry_result_ok(two_pair_tokens())]),
        );
        let extraction = extractor
            .extract_document(&Ui::init_for_tests(), &path, &PageIterOptions::default())
            .await?;
        assert_eq!(extraction.rows.len(), 2);
        assert_eq!(extraction.report.total_pages, 1);
        assert_eq!(extraction.report.total_rows, 2);
        assert!(extraction.report.warnings.is_empty());
        Ok(())
    }
}
