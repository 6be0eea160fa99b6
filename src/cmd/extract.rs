//! The `extract` subcommand.

use clap::Args;

use crate::{
    async_utils::io::{OutputFormat, write_json_pretty, write_rows},
    detectors::DetectorOpts,
    extract::{Extractor, PipelineOpts},
    page_iter::PageIterOptions,
    prelude::*,
    recognizers::RecognizerOpts,
    ui::Ui,
};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The scanned document: a PDF, a multipage TIFF, or a PNG or JPEG image.
    pub document: PathBuf,

    /// Where to write the rows. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Output format. Defaults to JSONL for `.jsonl` and `.ndjson` outputs,
    /// and CSV otherwise.
    #[clap(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Start CSV output with a UTF-8 byte order mark, so spreadsheet tools
    /// read Japanese text correctly.
    #[clap(long)]
    pub bom: bool,

    /// Also write a JSON report describing what happened on each page.
    #[clap(long = "report")]
    pub report_path: Option<PathBuf>,

    #[command(flatten)]
    pub page_iter_opts: PageIterOptions,

    #[command(flatten)]
    pub pipeline_opts: PipelineOpts,

    #[command(flatten)]
    pub detector_opts: DetectorOpts,

    #[command(flatten)]
    pub recognizer_opts: RecognizerOpts,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(document = %opts.document.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    // Set up our adapters before touching the document, so configuration
    // mistakes are reported right away.
    let detector = opts
        .detector_opts
        .detector
        .create_detector(&opts.detector_opts)?;
    let recognizer = opts
        .recognizer_opts
        .recognizer
        .create_recognizer(&opts.recognizer_opts)
        .await?;
    let extractor = Extractor::new(
        detector,
        recognizer,
        opts.pipeline_opts.batch_limits(),
        opts.recognizer_opts.recognizer_retries,
    );

    let extraction = extractor
        .extract_document(&ui, &opts.document, &opts.page_iter_opts)
        .await?;

    let output_path = opts.output_path.as_deref();
    let format = OutputFormat::resolve(opts.format, output_path);
    write_rows(output_path, format, &extraction.rows, opts.bom).await?;
    if let Some(report_path) = &opts.report_path {
        write_json_pretty(Some(report_path.as_path()), &extraction.report)
            .await
            .context("failed to write report")?;
    }
    extraction.report.display_summary(&ui);
    Ok(())
}
