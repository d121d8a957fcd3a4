use indicatif::{ProgressBar, ProgressStyle};

/// Hooks byte level progress of downloads and extraction into a caller's UI.
///
/// This is independent of the progress messages yielded by a fetch, which
/// report stages rather than bytes.
pub trait ProgressHandler: Send + Sync {
    /// Adds a progress bar to the underlying renderer, returning the wrapped bar.
    fn add_progress_bar(&self, bar: ProgressBar) -> ProgressBar;

    /// Returns the default style to use for byte-based progress.
    fn default_bytes_style(&self) -> ProgressStyle {
        default_bytes_style()
    }
}

/// A progress handler that renders nothing.
#[derive(Clone, Default)]
pub struct NoProgressHandler;

impl ProgressHandler for NoProgressHandler {
    fn add_progress_bar(&self, bar: ProgressBar) -> ProgressBar {
        bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        bar
    }
}

fn default_bytes_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:<18} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━ ")
}
