//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;

use crate::{
    async_utils::io::write_json_pretty,
    detectors::DetectorOutput,
    extract::{ExtractedRow, ExtractionReport},
    prelude::*,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// One output row.
    ExtractedRow,
    /// What a detector command or endpoint must return for each page.
    DetectorOutput,
    /// The run report written by `extract --report`.
    ExtractionReport,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::ExtractedRow => schema_for!(ExtractedRow),
        SchemaType::DetectorOutput => schema_for!(DetectorOutput),
        SchemaType::ExtractionReport => schema_for!(ExtractionReport),
    };
    write_json_pretty(schema_opts.output_path.as_deref(), &schema)
        .await
        .context("failed to write schema")
}
