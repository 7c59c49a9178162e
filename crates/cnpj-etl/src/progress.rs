//! Progress reporting for long-running stages
//!
//! Stages report through [`ProgressReporter`] so the CLI can draw indicatif
//! bars while tests and `--quiet` runs use [`SilentReporter`].

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const BYTES_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";
const SPINNER_TEMPLATE: &str = "{spinner:.green} {msg} {bytes} ({elapsed_precise})";

/// One unit of tracked work, such as a single transfer
pub trait ProgressTask: Send {
    /// Record `n` more bytes of progress
    fn advance(&mut self, n: u64);
    /// Mark the task complete
    fn finish(&mut self);
}

/// Factory for progress tasks
pub trait ProgressReporter: Send + Sync {
    /// Start tracking a task; `total` is its size when known
    fn begin(&self, label: &str, total: Option<u64>) -> Box<dyn ProgressTask>;
}

/// Reporter that draws nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentReporter;

struct SilentTask;

impl ProgressTask for SilentTask {
    fn advance(&mut self, _n: u64) {}
    fn finish(&mut self) {}
}

impl ProgressReporter for SilentReporter {
    fn begin(&self, _label: &str, _total: Option<u64>) -> Box<dyn ProgressTask> {
        Box::new(SilentTask)
    }
}

/// Terminal reporter with one bar per concurrent task
#[derive(Debug, Clone)]
pub struct IndicatifReporter {
    multi: MultiProgress,
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
        }
    }

    /// Reporter drawing to a hidden target
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
        }
    }
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

struct IndicatifTask {
    bar: ProgressBar,
    label: String,
}

impl ProgressTask for IndicatifTask {
    fn advance(&mut self, n: u64) {
        self.bar.inc(n);
    }

    fn finish(&mut self) {
        self.bar.finish_with_message(format!("Downloaded {}", self.label));
    }
}

impl ProgressReporter for IndicatifReporter {
    fn begin(&self, label: &str, total: Option<u64>) -> Box<dyn ProgressTask> {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total);
                bar.set_style(bytes_style());
                bar
            },
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(spinner_style());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            },
        };
        let bar = self.multi.add(bar);
        bar.set_message(label.to_string());
        Box::new(IndicatifTask {
            bar,
            label: label.to_string(),
        })
    }
}

fn bytes_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BYTES_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
