//! Live status board shared by the orchestrator and its workers.
//!
//! Workers record the file they are working on; the orchestrator reads which
//! files were started, which workers finished one, and which files were left
//! behind by a worker that died.
//!
//! Every file is its own record: current files live under
//! `current_files/<process id>`, and started, crashed and indexed files are
//! queues. A status update therefore writes only the entries it changes, no
//! matter how many files the run has seen.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{InterprocessDataManager, ProcessId, SizingConfig};
use crate::error::Result;
use crate::index::shared_types::SharedPath;
use crate::interprocess::{GarbageCollector, ScopedAccess};

const NAME_PREFIX: &str = "ists_";
const INDEXING_FILES_KEY: &str = "indexing_files";
const CURRENT_FILE_PREFIX: &str = "current_files/";
const CRASHED_FILES_KEY: &str = "crashed_files";
const FINISHED_PROCESS_IDS_KEY: &str = "finished_process_ids";
const INDEXING_INTERRUPTED_KEY: &str = "indexing_interrupted_flag";
const LAST_FILE_KEY: &str = "last_file";
const INDEXED_FILES_KEY: &str = "indexed_files";

fn current_file_key(process_id: ProcessId) -> String {
    format!("{CURRENT_FILE_PREFIX}{process_id}")
}

pub struct InterprocessStatusManager {
    base: InterprocessDataManager,
}

impl InterprocessStatusManager {
    pub fn new(
        instance_uuid: &str,
        process_id: ProcessId,
        is_owner: bool,
        sizing: SizingConfig,
        collector: Option<Arc<GarbageCollector>>,
    ) -> Result<Self> {
        let base = InterprocessDataManager::new(
            NAME_PREFIX,
            sizing.status_memory_size,
            instance_uuid,
            process_id,
            is_owner,
            sizing,
            collector,
        )?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &InterprocessDataManager {
        &self.base
    }

    /// Grow by doubling until `len` more bytes fit with the configured margin.
    fn reserve(&self, access: &mut ScopedAccess<'_>, len: usize) -> Result<()> {
        let required = self.base.sizing().status_entry_size(len);
        while access.free_memory_size() < required {
            let size = access.memory_size();
            access.grow_memory(size)?;
            debug!(required, "{}", access.log_string());
        }
        Ok(())
    }

    /// Record that this process started indexing `path`.
    ///
    /// If this process still has a current file, it never finished it, and that
    /// file is moved to the crashed list before being replaced.
    pub fn set_currently_indexed_source_file_path(&self, path: &Path) -> Result<()> {
        let process_id = self.base.process_id();
        let key = current_file_key(process_id);
        let mut access = self.base.memory().access()?;

        let previous: Option<SharedPath> = access.value(&key)?;
        let reserve_len = SharedPath::encoded_len(path) * 3
            + previous
                .as_ref()
                .map_or(0, |p| SharedPath::encoded_len(p.as_path()));
        self.reserve(&mut access, reserve_len)?;

        if let Some(previous) = previous {
            warn!(
                process_id,
                file = %previous.as_path().display(),
                "Previous file was never finished, marking it as crashed"
            );
            access
                .queue::<SharedPath>(CRASHED_FILES_KEY)?
                .push_back(&previous)?;
        }

        let shared = SharedPath::from(path);
        access
            .queue::<SharedPath>(INDEXING_FILES_KEY)?
            .push_back(&shared)?;
        access.set_value(&key, &shared)?;
        access.set_value(LAST_FILE_KEY, &shared)?;
        access.commit()
    }

    /// Record that this process finished its current file.
    ///
    /// Also announces the process id on the finished queue, so the orchestrator
    /// knows whose result segment to drain.
    pub fn clear_currently_indexed_source_file_path(&self) -> Result<()> {
        let process_id = self.base.process_id();
        let mut access = self.base.memory().access()?;
        access.remove_value(&current_file_key(process_id));
        access
            .queue::<ProcessId>(FINISHED_PROCESS_IDS_KEY)?
            .push_back(&process_id)?;
        access.commit()
    }

    /// Move the current file of `process_id` (if any) to the crashed list.
    ///
    /// Called once a worker is known to have exited abnormally. Returns the file.
    pub fn mark_process_crashed(&self, process_id: ProcessId) -> Result<Option<PathBuf>> {
        let key = current_file_key(process_id);
        let mut access = self.base.memory().access()?;
        let Some(path) = access.value::<SharedPath>(&key)? else {
            return Ok(None);
        };

        self.reserve(&mut access, SharedPath::encoded_len(path.as_path()))?;
        access.queue::<SharedPath>(CRASHED_FILES_KEY)?.push_back(&path)?;
        access.remove_value(&key);
        access.commit()?;
        Ok(Some(path.into()))
    }

    /// Forget the current file of `process_id` without marking it crashed.
    ///
    /// Used for workers stopped on purpose after the run was interrupted.
    pub fn abandon_current_file(&self, process_id: ProcessId) -> Result<Option<PathBuf>> {
        let key = current_file_key(process_id);
        let mut access = self.base.memory().access()?;
        let path: Option<SharedPath> = access.value(&key)?;
        if path.is_some() {
            access.remove_value(&key);
        }
        access.commit()?;
        Ok(path.map(PathBuf::from))
    }

    /// Files known to have crashed, plus every file still marked current.
    pub fn crashed_source_file_paths(&self) -> Result<Vec<PathBuf>> {
        let mut access = self.base.memory().access()?;
        let mut crashed = access.queue::<SharedPath>(CRASHED_FILES_KEY)?.values()?;
        for key in access.keys_with_prefix(CURRENT_FILE_PREFIX) {
            if let Some(path) = access.value::<SharedPath>(&key)?
                && !crashed.contains(&path)
            {
                crashed.push(path);
            }
        }
        Ok(crashed.into_iter().map(PathBuf::from).collect())
    }

    /// Drain the files started since the last call.
    pub fn take_started_source_file_paths(&self) -> Result<Vec<PathBuf>> {
        let mut access = self.base.memory().access()?;
        let started = access.queue::<SharedPath>(INDEXING_FILES_KEY)?.drain()?;
        access.commit()?;
        Ok(started.into_iter().map(PathBuf::from).collect())
    }

    /// Pop the id of a process that finished a file since the last call.
    pub fn next_finished_process_id(&self) -> Result<Option<ProcessId>> {
        let mut access = self.base.memory().access()?;
        let process_id = access
            .queue::<ProcessId>(FINISHED_PROCESS_IDS_KEY)?
            .pop_front()?;
        access.commit()?;
        Ok(process_id)
    }

    /// Most recently started file of any process.
    pub fn last_source_file_path(&self) -> Result<Option<PathBuf>> {
        let path: Option<SharedPath> = self.base.memory().access()?.value(LAST_FILE_KEY)?;
        Ok(path.map(PathBuf::from))
    }

    pub fn set_indexing_interrupted(&self, interrupted: bool) -> Result<()> {
        let mut access = self.base.memory().access()?;
        access.set_value(INDEXING_INTERRUPTED_KEY, &interrupted)?;
        access.commit()
    }

    pub fn indexing_interrupted(&self) -> Result<bool> {
        self.base
            .memory()
            .access()?
            .value_or_default(INDEXING_INTERRUPTED_KEY)
    }

    /// Successfully indexed files, accumulated over the run.
    pub fn indexed_files(&self) -> Result<BTreeSet<PathBuf>> {
        let mut access = self.base.memory().access()?;
        let indexed = access.queue::<SharedPath>(INDEXED_FILES_KEY)?.values()?;
        Ok(indexed.into_iter().map(PathBuf::from).collect())
    }

    /// Add `paths` to the indexed files.
    pub fn add_indexed_files(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let mut access = self.base.memory().access()?;
        let len = paths.iter().map(|p| SharedPath::encoded_len(p)).sum();
        self.reserve(&mut access, len)?;

        let mut indexed = access.queue::<SharedPath>(INDEXED_FILES_KEY)?;
        for path in paths {
            indexed.push_back(&SharedPath::from(path))?;
        }
        access.commit()
    }

    /// Forget all status state, e.g. pending entries of an interrupted run.
    pub fn reset(&self) -> Result<()> {
        let mut access = self.base.memory().access()?;
        for queue in [INDEXING_FILES_KEY, CRASHED_FILES_KEY, INDEXED_FILES_KEY] {
            access.queue::<SharedPath>(queue)?.clear()?;
        }
        access.queue::<ProcessId>(FINISHED_PROCESS_IDS_KEY)?.clear()?;
        access.remove_prefixed(CURRENT_FILE_PREFIX);
        access.remove_value(INDEXING_INTERRUPTED_KEY);
        access.remove_value(LAST_FILE_KEY);
        access.commit()
    }
}
