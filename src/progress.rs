//! Terminal progress for `navindex index`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use navindex::index::StatusReporter;
use navindex::index::sink::display_name;

use crate::theme::Themed;

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Progress bar fed by the orchestrator's status callbacks.
pub struct ProgressReporter {
    bar: ProgressBar,
    crashed: Vec<PathBuf>,
}

impl ProgressReporter {
    /// A hidden reporter draws nothing; used with `--quiet`.
    pub fn new(visible: bool) -> Self {
        let bar = ProgressBar::with_draw_target(
            Some(0),
            if visible {
                ProgressDrawTarget::stderr()
            } else {
                ProgressDrawTarget::hidden()
            },
        );
        bar.set_style(
            ProgressStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        Self {
            bar,
            crashed: Vec::new(),
        }
    }

    /// Files whose worker died while indexing them.
    pub fn crashed(&self) -> &[PathBuf] {
        &self.crashed
    }
}

impl StatusReporter for ProgressReporter {
    fn indexing_started(&mut self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.set_position(0);
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn file_in_progress(&mut self, path: &Path) {
        self.bar.set_message(display_name(path));
    }

    fn progress(&mut self, finished: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(finished as u64);
    }

    fn files_crashed(&mut self, paths: &[PathBuf]) {
        for path in paths {
            self.bar.println(format!(
                "{} {}",
                "crashed:".warning(),
                path.display().path_style()
            ));
        }
        self.crashed.extend_from_slice(paths);
    }

    fn indexing_finished(&mut self, _finished: usize, _crashed: usize, _interrupted: bool) {
        self.bar.finish_and_clear();
    }
}
