//! Per-worker shared FIFO carrying intermediate storages back to the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::{InterprocessDataManager, ProcessId, SizingConfig};
use crate::error::Result;
use crate::index::shared_types::SharedIntermediateStorage;
use crate::index::storage::IntermediateStorage;
use crate::interprocess::GarbageCollector;

const NAME_PREFIX: &str = "iist_";
const STORAGES_KEY: &str = "intermediate_storages";

pub struct InterprocessStorageManager {
    base: InterprocessDataManager,
    inserts_without_growth: AtomicUsize,
}

impl InterprocessStorageManager {
    /// Result segment of worker `process_id`, named `iist_<process_id>_<uuid>`.
    pub fn new(
        instance_uuid: &str,
        process_id: ProcessId,
        is_owner: bool,
        sizing: SizingConfig,
        collector: Option<Arc<GarbageCollector>>,
    ) -> Result<Self> {
        let prefix = format!("{NAME_PREFIX}{process_id}_");
        let base = InterprocessDataManager::new(
            &prefix,
            sizing.storage_memory_size,
            instance_uuid,
            process_id,
            is_owner,
            sizing,
            collector,
        )?;
        Ok(Self {
            base,
            inserts_without_growth: AtomicUsize::new(0),
        })
    }

    pub fn base(&self) -> &InterprocessDataManager {
        &self.base
    }

    /// Append `storage`, growing the segment first if the estimate does not fit.
    pub fn push_intermediate_storage(&self, storage: &IntermediateStorage) -> Result<()> {
        let sizing = self.base.sizing();
        let mut access = self.base.memory().access()?;

        if self.inserts_without_growth.load(Ordering::Relaxed) >= sizing.storage_shrink_after {
            access.shrink_to_fit()?;
            self.inserts_without_growth.store(0, Ordering::Relaxed);
        }

        let required = sizing.storage_size(storage.byte_size());
        let free = access.free_memory_size();
        if required > free {
            access.grow_memory(required - free)?;
            self.inserts_without_growth.store(0, Ordering::Relaxed);
            debug!(required, free, "{}", access.log_string());
        } else {
            self.inserts_without_growth.fetch_add(1, Ordering::Relaxed);
        }

        access
            .queue::<SharedIntermediateStorage>(STORAGES_KEY)?
            .push_back(&SharedIntermediateStorage::from(storage))?;
        access.commit()
    }

    pub fn pop_intermediate_storage(&self) -> Result<Option<IntermediateStorage>> {
        let mut access = self.base.memory().access()?;
        let storage = access
            .queue::<SharedIntermediateStorage>(STORAGES_KEY)?
            .pop_front()?;
        access.commit()?;
        Ok(storage.map(IntermediateStorage::from))
    }

    /// Drop every queued storage, e.g. results nobody will drain anymore.
    pub fn clear_intermediate_storages(&self) -> Result<usize> {
        let mut access = self.base.memory().access()?;
        let mut queue = access.queue::<SharedIntermediateStorage>(STORAGES_KEY)?;
        let cleared = queue.len();
        queue.clear()?;
        access.commit()?;
        Ok(cleared)
    }

    pub fn intermediate_storage_count(&self) -> Result<usize> {
        let mut access = self.base.memory().access()?;
        let count = access.queue::<SharedIntermediateStorage>(STORAGES_KEY)?.len();
        Ok(count)
    }
}
