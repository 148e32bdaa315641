//! Shared `indicatif` progress-bar style.

use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar in the house style; hidden when `visible` is false.
pub(crate) fn progress_bar(len: usize, prefix: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(bar_style());
    pb.set_prefix(prefix.to_string());
    pb
}

pub(crate) fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}
