//! Managers for the state shared between the orchestrator and its workers.
//!
//! Each manager wraps one [`SharedMemory`] segment named after its role and the
//! run's instance uuid. The orchestrator is the owner and creates the
//! segments; workers open them and fail fast if they are missing.

mod command_manager;
mod status_manager;
mod storage_manager;

pub use command_manager::InterprocessCommandManager;
pub use status_manager::InterprocessStatusManager;
pub use storage_manager::InterprocessStorageManager;

use std::sync::Arc;

use crate::error::Result;
use crate::interprocess::{AccessMode, GarbageCollector, SharedMemory};
use crate::memory::{
    DEFAULT_COMMAND_MEMORY, DEFAULT_STATUS_ENTRY_OVERHEAD, DEFAULT_STATUS_MEMORY,
    DEFAULT_STORAGE_MEMORY, DEFAULT_STORAGE_PAD,
};

/// Process id of a worker slot. The orchestrator itself is `0`.
pub type ProcessId = u32;

/// Size estimates used before writing into shared memory.
///
/// Estimates are deliberately generous: segments are grown before a write
/// instead of recovering from a failed one.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Factor applied to every size estimate.
    pub overestimation_multiplier: usize,
    /// Per-command bookkeeping added to the command byte size.
    pub command_entry_overhead: usize,
    /// Pad added to each intermediate storage byte size.
    pub storage_pad: usize,
    /// Per-entry estimate for status board writes.
    pub status_entry_overhead: usize,
    pub command_memory_size: usize,
    pub status_memory_size: usize,
    pub storage_memory_size: usize,
    /// Result segments shrink after this many pushes without growth.
    pub storage_shrink_after: usize,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            overestimation_multiplier: 3,
            command_entry_overhead: 1000,
            storage_pad: DEFAULT_STORAGE_PAD.as_usize(),
            status_entry_overhead: DEFAULT_STATUS_ENTRY_OVERHEAD.as_usize(),
            command_memory_size: DEFAULT_COMMAND_MEMORY.as_usize(),
            status_memory_size: DEFAULT_STATUS_MEMORY.as_usize(),
            storage_memory_size: DEFAULT_STORAGE_MEMORY.as_usize(),
            storage_shrink_after: 10,
        }
    }
}

impl SizingConfig {
    /// Bytes to reserve before pushing commands with the given byte sizes.
    pub fn command_batch_size(&self, byte_sizes: impl IntoIterator<Item = usize>) -> usize {
        let (total, count) = byte_sizes
            .into_iter()
            .fold((0usize, 0usize), |(total, count), size| (total + size, count + 1));
        (total + count * self.command_entry_overhead) * self.overestimation_multiplier
    }

    /// Bytes to reserve before pushing one intermediate storage.
    pub fn storage_size(&self, byte_size: usize) -> usize {
        (byte_size + self.storage_pad) * self.overestimation_multiplier
    }

    /// Bytes to keep free before a status board write of `len` bytes.
    pub fn status_entry_size(&self, len: usize) -> usize {
        (self.status_entry_overhead + len) * self.overestimation_multiplier
    }
}

/// State common to all interprocess managers.
pub struct InterprocessDataManager {
    memory: SharedMemory,
    instance_uuid: String,
    process_id: ProcessId,
    is_owner: bool,
    sizing: SizingConfig,
}

impl InterprocessDataManager {
    /// Create (owner) or open (worker) the segment `<name_prefix><instance_uuid>`.
    pub fn new(
        name_prefix: &str,
        initial_size: usize,
        instance_uuid: &str,
        process_id: ProcessId,
        is_owner: bool,
        sizing: SizingConfig,
        collector: Option<Arc<GarbageCollector>>,
    ) -> Result<Self> {
        let name = format!("{name_prefix}{instance_uuid}");
        let mode = if is_owner {
            AccessMode::CreateAndDelete
        } else {
            AccessMode::OpenOnly
        };
        let memory = SharedMemory::new(&name, initial_size, mode, collector)?;

        Ok(Self {
            memory,
            instance_uuid: instance_uuid.to_string(),
            process_id,
            is_owner,
            sizing,
        })
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn instance_uuid(&self) -> &str {
        &self.instance_uuid
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn sizing(&self) -> &SizingConfig {
        &self.sizing
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;

    /// Fresh instance uuid for one test run.
    pub(crate) fn instance_uuid() -> String {
        Uuid::new_v4().simple().to_string()
    }

    #[test]
    fn test_command_batch_size() {
        let sizing = SizingConfig::default();
        assert_eq!(
            sizing.command_batch_size([10, 20, 5]),
            (10 + 20 + 5 + 3 * 1000) * 3
        );
        assert_eq!(sizing.command_batch_size(std::iter::empty()), 0);
    }

    #[test]
    fn test_storage_and_status_estimates() {
        let sizing = SizingConfig::default();
        assert_eq!(sizing.storage_size(100), (100 + 1_048_576) * 3);
        assert_eq!(sizing.status_entry_size(10), (262_144 + 10) * 3);
    }

    #[test]
    fn test_owner_creates_and_worker_opens() {
        let uuid = instance_uuid();
        let owner = InterprocessDataManager::new(
            "tdm_",
            4096,
            &uuid,
            0,
            true,
            SizingConfig::default(),
            None,
        )
        .unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.memory().name(), &format!("tdm_{uuid}")[..18]);

        let worker =
            InterprocessDataManager::new("tdm_", 4096, &uuid, 3, false, SizingConfig::default(), None)
                .unwrap();
        assert_eq!(worker.process_id(), 3);
        assert_eq!(worker.instance_uuid(), uuid);
        assert!(!worker.is_owner());
    }

    #[test]
    fn test_worker_without_owner_fails() {
        let result = InterprocessDataManager::new(
            "tdm_",
            4096,
            &instance_uuid(),
            1,
            false,
            SizingConfig::default(),
            None,
        );
        assert!(result.is_err());
    }
}
