//! Raw frame to display image conversion.
//!
//! The engine may overwrite a frame at any moment, so the converter always
//! works on a private copy (`t.pfm`) and its output (`t.bmp`) is moved next to
//! the raw frame through a temporary file and a rename.

use crate::control::{ControlChannel, DISPLAY_EXT};
use crate::model::{Exposure, PreviewTarget, TonemapOutcome};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

/// External converter invocation: `program [args...] <input> [gain]`.
#[derive(Debug, Clone)]
pub struct Converter {
    pub program: PathBuf,
    pub args: Vec<String>,
}

pub struct TonemapPipeline {
    converter: Converter,
    channel: Arc<ControlChannel>,
    in_progress: [AtomicBool; 3],
    // t.pfm/t.bmp are shared by every target.
    scratch: Mutex<()>,
}

/// Clears a target's in-progress flag when the conversion ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// `frame.pfm` -> `frame.bmp`
pub fn display_path_for(raw: &Path) -> PathBuf {
    raw.with_extension(DISPLAY_EXT)
}

impl TonemapPipeline {
    pub fn new(converter: Converter, channel: Arc<ControlChannel>) -> Self {
        Self {
            converter,
            channel,
            in_progress: Default::default(),
            scratch: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    #[cfg(test)]
    pub fn is_in_progress(&self, target: PreviewTarget) -> bool {
        self.in_progress[target.index()].load(Ordering::Acquire)
    }

    /// Convert the latest raw frame of `target`.
    ///
    /// Never fails: a busy target yields `Skipped` right away, and copy or
    /// converter failures are logged and reported as `Unavailable`.
    pub async fn convert(&self, target: PreviewTarget, exposure: Exposure) -> TonemapOutcome {
        let Some(_guard) = InFlight::acquire(&self.in_progress[target.index()]) else {
            tracing::debug!(%target, "conversion already in flight, skipping");
            return TonemapOutcome::Skipped;
        };
        let raw = self.channel.frame_path(target);
        match self.convert_frame(&raw, exposure).await {
            Ok(path) => {
                tracing::debug!(%target, %exposure, path = %path.display(), "preview updated");
                TonemapOutcome::Converted(path)
            }
            Err(e) => {
                tracing::warn!(%target, "tonemap failed: {e:#}");
                TonemapOutcome::Unavailable
            }
        }
    }

    async fn convert_frame(&self, raw: &Path, exposure: Exposure) -> Result<PathBuf> {
        let _scratch = self.scratch.lock().await;
        let input = self.channel.scratch_input();
        let output = self.channel.scratch_output();

        tokio::fs::copy(raw, &input)
            .await
            .with_context(|| format!("failed to copy {} to scratch", raw.display()))?;
        // A leftover t.bmp from an earlier run must not pass for fresh output.
        let _ = tokio::fs::remove_file(&output).await;

        self.run_converter(&input, exposure).await?;

        let display = display_path_for(raw);
        let staging = display.with_extension(format!("{DISPLAY_EXT}.tmp"));
        tokio::fs::copy(&output, &staging)
            .await
            .with_context(|| format!("failed to copy converter output {}", output.display()))?;
        tokio::fs::rename(&staging, &display)
            .await
            .with_context(|| format!("failed to publish {}", display.display()))?;
        Ok(display)
    }

    async fn run_converter(&self, input: &Path, exposure: Exposure) -> Result<()> {
        let mut cmd = Command::new(&self.converter.program);
        cmd.args(&self.converter.args)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(gain) = exposure.as_arg() {
            cmd.arg(gain);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!("failed to start converter {}", self.converter.program.display())
        })?;
        let stdout = child.stdout.take().map(|s| tokio::spawn(log_output(s, "stdout")));
        let stderr = child.stderr.take().map(|s| tokio::spawn(log_output(s, "stderr")));

        let status = child.wait().await.context("failed to wait for converter")?;
        for task in [stdout, stderr].into_iter().flatten() {
            let _ = task.await;
        }
        if !status.success() {
            bail!("converter exited with {status}");
        }
        Ok(())
    }
}

async fn log_output<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "converter", stream, "{line}");
    }
}
