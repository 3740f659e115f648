//! Where finished work goes: the permanent store and the progress display.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::storage::IntermediateStorage;

/// Receives intermediate storages popped from the result queues.
pub trait StorageSink {
    fn insert(&mut self, storage: IntermediateStorage);

    /// Storages accepted but not yet merged. The orchestrator stops draining
    /// results while this is above its limit.
    fn pending(&self) -> usize {
        0
    }
}

/// Sink that aggregates what it receives, used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryStorageSink {
    pub storages: usize,
    pub nodes: usize,
    pub edges: usize,
    pub errors: usize,
    pub files: BTreeSet<PathBuf>,
    /// Keep every storage instead of only counting them.
    pub retain: bool,
    pub retained: Vec<IntermediateStorage>,
}

impl MemoryStorageSink {
    pub fn retaining() -> Self {
        Self {
            retain: true,
            ..Self::default()
        }
    }
}

impl StorageSink for MemoryStorageSink {
    fn insert(&mut self, storage: IntermediateStorage) {
        self.storages += 1;
        self.nodes += storage.nodes.len();
        self.edges += storage.edges.len();
        self.errors += storage.errors.len();
        self.files
            .extend(storage.files.iter().map(|file| file.file_path.clone()));
        if self.retain {
            self.retained.push(storage);
        }
    }
}

/// Progress notifications from an indexing run.
pub trait StatusReporter {
    fn indexing_started(&mut self, _total_files: usize) {}

    fn files_started(&mut self, _paths: &[PathBuf]) {}

    /// The most recently started file of any worker.
    fn file_in_progress(&mut self, _path: &Path) {}

    fn progress(&mut self, _finished: usize, _total: usize) {}

    fn files_crashed(&mut self, _paths: &[PathBuf]) {}

    fn indexing_finished(&mut self, _finished: usize, _crashed: usize, _interrupted: bool) {}
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn indexing_started(&mut self, total_files: usize) {
        info!(total_files, "Indexing started");
    }

    fn files_crashed(&mut self, paths: &[PathBuf]) {
        for path in paths {
            warn!(file = %path.display(), "Indexer crashed on file");
        }
    }

    fn indexing_finished(&mut self, finished: usize, crashed: usize, interrupted: bool) {
        info!(finished, crashed, interrupted, "Indexing finished");
    }
}

/// Short display form of a path for progress messages.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
