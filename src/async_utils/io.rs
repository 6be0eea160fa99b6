//! Output sinks for extracted rows and run reports.
//!
//! Rows can go to a file or to standard output, as CSV (optionally with a
//! UTF-8 byte order mark, which spreadsheet tools use to detect the encoding
//! of Japanese item names) or as JSONL.

use clap::ValueEnum;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::{extract::ExtractedRow, prelude::*};

/// UTF-8 byte order mark.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Supported row output formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated values with a header row.
    Csv,
    /// One JSON object per line.
    Jsonl,
}

impl OutputFormat {
    /// Pick a format: an explicit choice wins, then the output extension,
    /// then CSV.
    pub fn resolve(explicit: Option<Self>, path: Option<&Path>) -> Self {
        if let Some(format) = explicit {
            return format;
        }
        match path.and_then(|p| p.extension()).and_then(|ext| ext.to_str()) {
            Some("jsonl" | "ndjson") => OutputFormat::Jsonl,
            _ => OutputFormat::Csv,
        }
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write rows in the requested format.
pub async fn write_rows(
    path: Option<&Path>,
    format: OutputFormat,
    rows: &[ExtractedRow],
    bom: bool,
) -> Result<()> {
    match format {
        OutputFormat::Csv => write_rows_csv(path, rows, bom).await,
        OutputFormat::Jsonl => write_rows_jsonl(path, rows).await,
    }
}

/// Write rows as CSV. The header is written even when there are no rows.
async fn write_rows_csv(
    path: Option<&Path>,
    rows: &[ExtractedRow],
    bom: bool,
) -> Result<()> {
    let mut writer = create_writer(path).await?;
    if bom {
        writer
            .write_all(UTF8_BOM)
            .await
            .context("Failed to write byte order mark")?;
    }
    let mut csv_writer = csv_async::AsyncWriter::from_writer(writer);
    csv_writer
        .write_record(ExtractedRow::CSV_HEADER)
        .await
        .context("Failed to write CSV header")?;
    for row in rows {
        csv_writer
            .write_record(row.to_csv_record())
            .await
            .with_context(|| format!("Failed to write CSV row: {:?}", row))?;
    }
    csv_writer.flush().await.context("Failed to flush CSV output")?;
    Ok(())
}

/// Write rows as JSONL.
async fn write_rows_jsonl(path: Option<&Path>, rows: &[ExtractedRow]) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    for row in rows {
        let json = serde_json::to_string(row)
            .with_context(|| format!("Failed to serialize row: {:?}", row))?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write any serializable value as pretty-printed JSON.
pub async fn write_json_pretty<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize,
{
    let mut writer = create_writer(path).await?;
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write JSON")?;
    writer.write_all(b"\n").await.context("Failed to write JSON")?;
    writer.flush().await.context("Failed to flush JSON")?;
    Ok(())
}
