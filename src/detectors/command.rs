//! Detect regions by running a local command, usually a script wrapping a
//! YOLO-style model.

use std::time::Duration;

use image::RgbImage;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, run_command},
    extract::Detection,
    png::encode_png,
    prelude::*,
};

use super::{LabelMap, RegionDetector};

/// Runs `program [args...] <page.png>` and parses its standard output.
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    labels: LabelMap,
}

impl CommandDetector {
    pub fn new(
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
        labels: LabelMap,
    ) -> Self {
        Self {
            program,
            args,
            timeout,
            labels,
        }
    }

    fn command_name(&self) -> String {
        self.program.display().to_string()
    }
}

#[async_trait]
impl RegionDetector for CommandDetector {
    #[instrument(level = "debug", skip_all, fields(program = %self.program.display()))]
    async fn detect(&self, page: &RgbImage) -> Result<Vec<Detection>> {
        let tmpdir = tempfile::TempDir::with_prefix("detect")?;
        let page_path = tmpdir.path().join("page.png");
        tokio::fs::write(&page_path, encode_png(page)?)
            .await
            .with_context(|| format!("cannot write detector input {:?}", page_path.display()))?;

        let command_name = self.command_name();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(&page_path);
        let output = run_command(&command_name, &mut cmd, Some(self.timeout)).await?;
        check_for_command_failure(&command_name, &output, None)?;

        let detections = self.labels.parse(&output.stdout)?;
        debug!(count = detections.len(), "Detected regions");
        Ok(detections)
    }
}
