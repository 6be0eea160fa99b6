//! Terminal UI: a spinner while a document is opened, a page bar while it is
//! extracted, and summary lines at the end.
//!
//! Log output shares stderr with the bars, so `tracing` writes through
//! [`SafeStderrWriter`], which suspends drawing around each line. The writer
//! is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{
    io::{self, Write as _},
    sync::Arc,
    time::Duration,
};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::prelude::*;

/// How often bars redraw on their own.
const TICK: Duration = Duration::from_millis(250);

/// Application UI state. Cheap to clone.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// A UI that never draws anything.
    #[cfg(test)]
    pub fn init_for_tests() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::with_draw_target(
                ProgressDrawTarget::hidden(),
            )),
        }
    }

    /// Stop drawing bars, for when rows go to stdout. Summary lines still go
    /// to stderr.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Writer for `tracing`.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Print one summary line above the bars.
    pub fn display_message(&self, emoji: &str, msg: &str) {
        let line = format!("{:3}{}", emoji, msg);
        if self.multi_progress.is_hidden() {
            eprintln!("{}", line);
        } else if let Err(err) = self.multi_progress.println(&line) {
            debug!("failed to print message: {}", err);
        }
    }

    /// Spinner shown while `document` is rasterized or split into pages.
    pub fn document_spinner(&self, document: &Path) -> ProgressBar {
        let name = document
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| document.display().to_string());
        let sp = self.add(
            ProgressBar::new_spinner().with_style(style("{spinner} {prefix:3}{msg}")),
        );
        sp.set_prefix("🖨️");
        sp.set_message(format!("Reading {}", name));
        sp
    }

    /// Bar advanced once per finished page. Its message is the page in
    /// progress.
    pub fn page_bar(&self, pages: u64) -> ProgressBar {
        let pb = self.add(ProgressBar::new(pages).with_style(style(
            "  {prefix:3}{msg:12} {pos:>4}/{len:4} pages {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}",
        )));
        pb.set_prefix("📄");
        pb
    }

    fn add(&self, bar: ProgressBar) -> ProgressBar {
        let bar = self.multi_progress.add(bar);
        #[cfg(test)]
        bar.set_draw_target(ProgressDrawTarget::hidden());
        bar.enable_steady_tick(TICK);
        bar
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).expect("bad progress bar template")
}

/// A writer which can used to write to `stderr`. It will hide and show progress
/// bars as needed, so that they don't interfere with the output.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.multi_progress.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().flush())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui.multi_progress.suspend(|| io::stderr().write_all(buf))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
