//! Terminal progress indicators for the CLI.
//!
//! Wraps `indicatif` so download progress reported by the update engine can be
//! rendered as a byte-count bar. Progress output is hidden when
//! `PFUPDATE_NO_PROGRESS` is set or when `--quiet` was passed.

use indicatif::{ProgressBar as IndicatifBar, ProgressStyle};
use std::time::Duration;

fn is_progress_disabled() -> bool {
    std::env::var("PFUPDATE_NO_PROGRESS").is_ok()
}

/// Byte-count progress bar for artifact downloads.
#[derive(Clone)]
pub struct ProgressBar {
    inner: IndicatifBar,
}

impl ProgressBar {
    /// Create a bar for `total` bytes.
    pub fn bytes(total: u64) -> Self {
        let bar = if is_progress_disabled() {
            IndicatifBar::hidden()
        } else {
            let bar = IndicatifBar::new(total);
            bar.set_style(bytes_style());
            bar
        };
        Self { inner: bar }
    }

    /// Spinner for work of unknown length (manifest checks, installs).
    pub fn spinner(message: impl Into<String>) -> Self {
        let bar = if is_progress_disabled() {
            IndicatifBar::hidden()
        } else {
            let bar = IndicatifBar::new_spinner();
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        };
        bar.set_message(message.into());
        Self { inner: bar }
    }

    pub fn set_position(&self, done: u64, total: u64) {
        if self.inner.length() != Some(total) {
            self.inner.set_length(total);
        }
        self.inner.set_position(done);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.inner.set_message(message.into());
    }

    pub fn finish_with_message(&self, message: impl Into<String>) {
        self.inner.finish_with_message(message.into());
    }

    pub fn finish_and_clear(&self) {
        self.inner.finish_and_clear();
    }
}

fn bytes_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
