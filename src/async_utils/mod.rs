//! Asynchronous utilities for use with Tokio.
//!
//! The pipeline itself is strictly sequential, but rasterizing pages, running
//! external tools and waiting on remote services all happen on the Tokio
//! runtime. The glue for that lives here.

use std::{pin::Pin, process::Output, time::Duration};

use tokio::{process::Command, time};

use crate::prelude::*;

pub mod blocking_iter_streams;
pub mod io;

/// A type alias for a boxed future.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// Run an external command to completion, optionally giving up after
/// `timeout`.
///
/// The child is killed if the timeout expires.
#[instrument(level = "debug", skip_all, fields(command_name = command_name))]
pub async fn run_command(
    command_name: &str,
    cmd: &mut Command,
    timeout: Option<Duration>,
) -> Result<Output> {
    cmd.kill_on_drop(true);
    let output = cmd.output();
    let output = match timeout {
        Some(timeout) => time::timeout(timeout, output).await.map_err(|_| {
            anyhow!("{} did not finish within {:?}", command_name, timeout)
        })?,
        None => output.await,
    };
    output.with_context(|| format!("failed to run {}", command_name))
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged. Standard error may also be
/// checked with `is_error_line`, so that tools which exit successfully after
/// printing errors are still treated as failures.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if !output.status.success() {
        return Err(match output.status.code() {
            Some(exit_code) => anyhow!(
                "{} failed with exit code {} and error output:\n{}",
                command_name,
                exit_code,
                stderr,
            ),
            None => anyhow!("{} was killed with error output:\n{}", command_name, stderr),
        });
    }
    if let Some(is_error_line) = is_error_line
        && stderr.lines().any(is_error_line)
    {
        return Err(anyhow!(
            "{} printed error output:\n{}",
            command_name,
            stderr,
        ));
    }
    Ok(())
}
