//! Iterate over the pages of a scanned document as RGB images.
//!
//! PDFs are rasterized with Poppler's `pdftocairo`, multipage TIFFs are split
//! with the [`tiff`] crate, and PNG or JPEG files are a single page. In the
//! first two cases the pages are written to a temporary directory as PNGs and
//! decoded one at a time as the iterator advances.

use std::{
    collections::BTreeMap,
    fs,
    io::{BufReader, Read, Seek},
    sync::LazyLock,
    time::Duration,
    vec,
};

use clap::Args;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use regex::Regex;
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult, ifd::Value},
    tags::{IfdPointer, Tag},
};
use tokio::process::Command;

use crate::{
    async_utils::{
        blocking_iter_streams::spawn_blocking_propagating_panics,
        check_for_command_failure, run_command,
    },
    prelude::*,
};

/// Image types that are already a single page.
const SINGLE_PAGE_IMAGE_TYPES: &[&str] = &["image/png", "image/jpeg"];

/// TIFF MIME type, handled separately due to multipage complexity.
const TIFF_MIME_TYPE: &str = "image/tiff";

/// `PhotometricInterpretation` value for bilevel and grayscale images where
/// 0 is white.
const PHOTOMETRIC_WHITE_IS_ZERO: u16 = 0;

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

/// How long we give Poppler to rasterize a whole document.
const RASTERIZE_TIMEOUT: Duration = Duration::from_secs(600);

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reports damaged cross-reference tables as errors, then recovers.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Options for constructing a [`PageIter`].
#[derive(Args, Clone, Debug)]
pub struct PageIterOptions {
    /// The DPI to use when rasterizing PDF pages.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,

    /// The maximum number of pages to process. If this is set, we will
    /// stop processing after this many pages and record an error.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for PageIterOptions {
    fn default() -> Self {
        Self {
            rasterize_dpi: 300,
            max_pages: None,
        }
    }
}

/// An iterator over the pages of a document, as [`RgbImage`]s.
///
/// Decoding is blocking. Wrap this in a
/// [`BlockingIterStream`](crate::async_utils::blocking_iter_streams::BlockingIterStream)
/// before using it from async code.
pub struct PageIter {
    /// Temporary directory holding extracted pages, if we needed one.
    ///
    /// This is released by [`Drop`].
    tmpdir: Option<tempfile::TempDir>,
    /// The page files, in page order.
    paths: vec::IntoIter<PathBuf>,
    /// Number of pages in the document, including any beyond `max_pages`.
    total_pages: usize,
    /// The maximum number of pages we are allowed to process.
    max_pages: Option<usize>,
    /// Anything the page extraction tools complained about.
    warnings: Vec<String>,
}

impl PageIter {
    /// Open a document, choosing a strategy from its detected MIME type.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path, options: &PageIterOptions) -> Result<Self> {
        let mime_type = get_mime_type(path)?;
        if SINGLE_PAGE_IMAGE_TYPES.contains(&mime_type.as_str()) {
            Ok(Self {
                tmpdir: None,
                paths: vec![path.to_owned()].into_iter(),
                total_pages: 1,
                max_pages: options.max_pages,
                warnings: vec![],
            })
        } else if mime_type == TIFF_MIME_TYPE {
            Self::from_tiff(path, options).await
        } else if mime_type == PDF_MIME_TYPE {
            Self::from_rasterized_pdf(path, options).await
        } else {
            Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PDF, TIFF, PNG, JPEG)",
                mime_type,
                path.display()
            ))
        }
    }

    /// Rasterize every page of a PDF to PNG.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), dpi = options.rasterize_dpi))]
    async fn from_rasterized_pdf(path: &Path, options: &PageIterOptions) -> Result<Self> {
        let total_pages = get_pdf_page_count(path).await?;

        // pdftocairo appends zero-padded page numbers to this name, so the
        // files sort in page order.
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let out_path = tmpdir.path().join("page");

        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-r")
            .arg(options.rasterize_dpi.to_string());
        if let Some(max_pages) = options.max_pages
            && total_pages > max_pages
        {
            // Poppler page ranges are 1-based and inclusive.
            cmd.arg("-l").arg(max_pages.to_string());
        }
        cmd.arg(path).arg(out_path);
        let output = run_command("pdftocairo", &mut cmd, Some(RASTERIZE_TIMEOUT)).await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let warnings = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty())
            .collect();
        let paths = sorted_dir_entries(tmpdir.path())?;
        Ok(Self {
            tmpdir: Some(tmpdir),
            paths: paths.into_iter(),
            total_pages,
            max_pages: options.max_pages,
            warnings,
        })
    }

    /// Split a multipage TIFF into PNG pages.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn from_tiff(path: &Path, options: &PageIterOptions) -> Result<Self> {
        let path_owned = path.to_owned();
        let max_pages = options.max_pages;
        let (tmpdir, total_pages, warnings) =
            spawn_blocking_propagating_panics(move || split_tiff(&path_owned, max_pages))
                .await?;
        let paths = sorted_dir_entries(tmpdir.path())?;
        Ok(Self {
            tmpdir: Some(tmpdir),
            paths: paths.into_iter(),
            total_pages,
            max_pages: options.max_pages,
            warnings,
        })
    }

    /// Number of pages in the document, including any skipped because of
    /// `--max-pages`.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Number of pages this iterator will yield.
    pub fn pages_to_process(&self) -> usize {
        match self.max_pages {
            Some(max_pages) => self.total_pages.min(max_pages),
            None => self.total_pages,
        }
    }

    /// Get any warnings that occurred while extracting pages.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Will this iterator return only an incomplete set of pages?
    pub fn is_incomplete(&self) -> bool {
        self.pages_to_process() < self.total_pages
    }

    /// Return an error if this iterator will skip pages.
    pub fn check_complete(&self) -> Result<()> {
        if self.is_incomplete() {
            Err(anyhow!(
                "Only {}/{} pages processed (because of --max-pages)",
                self.pages_to_process(),
                self.total_pages
            ))
        } else {
            Ok(())
        }
    }
}

impl Drop for PageIter {
    fn drop(&mut self) {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

impl Iterator for PageIter {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        let page = decode_page(&path);

        // Extracted pages are only needed once, so free the space early.
        if self.tmpdir.is_some()
            && let Err(err) = fs::remove_file(&path)
        {
            warn!(path = %path.display(), "failed to delete page file: {}", err);
        }
        Some(page)
    }
}

/// Decode one page file.
fn decode_page(path: &Path) -> Result<RgbImage> {
    let image = image::ImageReader::open(path)
        .with_context(|| format!("failed to open page {:?}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to read page {:?}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode page {:?}", path.display()))?;
    Ok(image.to_rgb8())
}

/// List a directory, sorted by name.
fn sorted_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = dir
        .read_dir()
        .with_context(|| format!("failed to read temporary directory {:?}", dir.display()))?
        .map(|entry| {
            let entry = entry.with_context(|| {
                format!("failed to read entry in temporary directory {:?}", dir.display())
            })?;
            Ok(entry.path())
        })
        .collect::<Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let mut cmd = Command::new("pdfinfo");
    cmd.arg(path);
    let output = run_command("pdfinfo", &mut cmd, Some(RASTERIZE_TIMEOUT)).await?;
    check_for_command_failure("pdfinfo", &output, None)?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output).with_context(|| {
        format!("failed to get page count for {:?} from pdfinfo", path.display())
    })
}

/// Find the `Pages:` property in `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    pages
        .parse::<usize>()
        .with_context(|| format!("invalid page count {:?}", pages))
}

/// Get the MIME type of a file from its contents.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}

/// NewSubfileType bits from the TIFF 6.0 specification.
mod tiff_subfile_type {
    /// Reduced resolution image (thumbnail or preview).
    pub const REDUCED_RESOLUTION: u32 = 0x1;
    /// Single page of a multi-page document.
    pub const SINGLE_PAGE: u32 = 0x2;
    /// Transparency mask for another image.
    pub const TRANSPARENCY_MASK: u32 = 0x4;
    /// DNG extensions: depth map, enhanced image, semantic mask.
    pub const DNG_BITS: u32 = 0x8 | 0x10 | 0x10000;
}

/// Write each page of a TIFF to a temporary directory as PNG.
///
/// Scanners store pages as a chain of IFDs, which [`tiff`] walks for us.
/// Pages hidden in SubIFDs are rare, and we refuse those rather than silently
/// missing rows. Returns the directory, the total page count and any warnings.
fn split_tiff(
    path: &Path,
    max_pages: Option<usize>,
) -> Result<(tempfile::TempDir, usize, Vec<String>)> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TIFF file {:?}", path.display()))?;
    let mut decoder = Decoder::new(BufReader::new(file)).with_context(|| {
        format!("failed to create TIFF decoder for {:?}", path.display())
    })?;

    let tmpdir = tempfile::TempDir::with_prefix("tiff-pages")?;
    let mut warnings = Vec::new();
    let mut page_count = 0;
    loop {
        if max_pages.is_some_and(|max| page_count >= max) {
            break;
        }
        if page_count > 0 {
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().with_context(|| {
                format!("failed to advance to IFD {} in {:?}", page_count, path.display())
            })?;
        }

        check_subifds(&mut decoder, path, page_count, &mut warnings)?;
        let page = decode_tiff_page(&mut decoder, path, page_count)?;
        let png_path = tmpdir.path().join(format!("page-{:05}.png", page_count));
        page.save_with_format(&png_path, ImageFormat::Png)
            .with_context(|| format!("failed to write PNG {:?}", png_path.display()))?;
        page_count += 1;
    }

    // Count whatever we skipped because of `max_pages`.
    let mut total_pages = page_count;
    while decoder.more_images() {
        if decoder.next_image().is_err() {
            break;
        }
        total_pages += 1;
    }

    debug!(page_count, total_pages, "Split multipage TIFF");
    Ok((tmpdir, total_pages, warnings))
}

/// Make sure no SubIFD of the current IFD could be a document page.
///
/// Thumbnails, transparency masks and DNG metadata are skipped. Anything else
/// is an error.
fn check_subifds<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
    ifd_index: usize,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let subifd_offsets = match decoder.find_tag(Tag::SubIfd) {
        Ok(Some(Value::Ifd(offset))) => vec![u64::from(offset)],
        Ok(Some(Value::List(list))) => list
            .iter()
            .filter_map(|v| match v {
                Value::Ifd(offset) => Some(u64::from(*offset)),
                _ => None,
            })
            .collect(),
        _ => return Ok(()),
    };

    for (sub_idx, offset) in subifd_offsets.into_iter().enumerate() {
        let subdir = match decoder.read_directory(IfdPointer(offset)) {
            Ok(dir) => dir,
            Err(err) => {
                warnings.push(format!(
                    "Could not read SubIFD {} of IFD {}: {}",
                    sub_idx, ifd_index, err
                ));
                continue;
            }
        };
        let subfile_type = match decoder
            .read_directory_tags(&subdir)
            .find_tag(Tag::NewSubfileType)
        {
            Ok(Some(value)) => value.into_u32().unwrap_or(0),
            _ => 0,
        };

        let skippable = tiff_subfile_type::REDUCED_RESOLUTION
            | tiff_subfile_type::TRANSPARENCY_MASK
            | tiff_subfile_type::DNG_BITS;
        if subfile_type & skippable != 0 {
            debug!(ifd_index, sub_idx, subfile_type, "Skipping auxiliary SubIFD");
            continue;
        }
        if subfile_type == 0 || subfile_type & tiff_subfile_type::SINGLE_PAGE != 0 {
            return Err(anyhow!(
                "TIFF file {:?} has a SubIFD that may contain a page (IFD {}, SubIFD {}, \
                 NewSubfileType={}). Convert it to PDF or separate images first.",
                path.display(),
                ifd_index,
                sub_idx,
                subfile_type
            ));
        }
    }
    Ok(())
}

/// Decode the current IFD as an RGB page.
fn decode_tiff_page<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
    ifd_index: usize,
) -> Result<RgbImage> {
    let context = || format!("IFD {} of {:?}", ifd_index, path.display());
    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("failed to get dimensions of {}", context()))?;
    let color_type = decoder
        .colortype()
        .with_context(|| format!("failed to get color type of {}", context()))?;

    let white_is_zero = match decoder.find_tag(Tag::PhotometricInterpretation) {
        Ok(Some(value)) => value.into_u16().ok() == Some(PHOTOMETRIC_WHITE_IS_ZERO),
        _ => false,
    };

    // 16-bit samples are scaled down to 8 bits.
    let samples = match decoder
        .read_image()
        .with_context(|| format!("failed to decode {}", context()))?
    {
        DecodingResult::U8(data) => data,
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => return Err(anyhow!("unsupported TIFF sample format in {}", context())),
    };

    let image = match color_type {
        ColorType::Gray(1) => {
            unpack_bilevel(&samples, width, height, white_is_zero).map(DynamicImage::ImageLuma8)
        }
        ColorType::Gray(8 | 16) => {
            GrayImage::from_raw(width, height, samples).map(DynamicImage::ImageLuma8)
        }
        ColorType::RGB(8 | 16) => {
            RgbImage::from_raw(width, height, samples).map(DynamicImage::ImageRgb8)
        }
        ColorType::RGBA(8 | 16) => {
            RgbaImage::from_raw(width, height, samples).map(DynamicImage::ImageRgba8)
        }
        other => {
            return Err(anyhow!(
                "unsupported TIFF color type {:?} in {}",
                other,
                context()
            ));
        }
    }
    .ok_or_else(|| anyhow!("wrong number of samples in {}", context()))?;
    Ok(image.to_rgb8())
}

/// Unpack 1-bit samples into an 8-bit grayscale image.
///
/// Rows are packed most significant bit first and start on a byte boundary.
/// Returns `None` if `packed` is too short.
fn unpack_bilevel(
    packed: &[u8],
    width: u32,
    height: u32,
    white_is_zero: bool,
) -> Option<GrayImage> {
    let stride = width.div_ceil(8) as usize;
    if packed.len() < stride * height as usize {
        return None;
    }
    let (zero, one) = if white_is_zero { (255, 0) } else { (0, 255) };
    Some(GrayImage::from_fn(width, height, |x, y| {
        let byte = packed[y as usize * stride + x as usize / 8];
        let bit = (byte >> (7 - x % 8)) & 1;
        image::Luma([if bit == 1 { one } else { zero }])
    }))
}
