//! Terminal progress for the three pipeline stages.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Counters shown while a batch runs. Cloning shares the same bars.
#[derive(Clone)]
pub struct PipelineProgress {
    multi: MultiProgress,
    uploaded: ProgressBar,
    submitted: ProgressBar,
    completed: ProgressBar,
}

impl PipelineProgress {
    /// Bars drawn to stderr.
    pub fn visible() -> Self {
        Self::with_target(MultiProgress::new(), true)
    }

    /// Bars that track counts but never draw.
    pub fn hidden() -> Self {
        Self::with_target(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()), false)
    }

    fn with_target(multi: MultiProgress, ticking: bool) -> Self {
        let uploaded = multi.add(counter("uploaded", ticking));
        let submitted = multi.add(counter("submitted", ticking));
        let completed = multi.add(counter("completed", ticking));
        Self {
            multi,
            uploaded,
            submitted,
            completed,
        }
    }

    /// Print a line above the bars without tearing them.
    pub fn println(&self, line: &str) {
        let _ = self.multi.println(line);
    }

    pub fn uploaded(&self) {
        self.uploaded.inc(1);
    }

    pub fn submitted(&self) {
        self.submitted.inc(1);
    }

    pub fn completed(&self) {
        self.completed.inc(1);
    }

    pub fn finish(&self) {
        for bar in [&self.uploaded, &self.submitted, &self.completed] {
            bar.finish();
        }
    }

    /// (uploaded, submitted, completed)
    #[cfg(test)]
    pub fn counts(&self) -> (u64, u64, u64) {
        (
            self.uploaded.position(),
            self.submitted.position(),
            self.completed.position(),
        )
    }
}

fn counter(label: &'static str, ticking: bool) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {prefix:>10}: {pos}")
    {
        pb.set_style(style);
    }
    pb.set_prefix(label);
    if ticking {
        pb.enable_steady_tick(Duration::from_millis(120));
    }
    pb
}
