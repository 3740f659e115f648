//! Shared FIFO of indexer commands, filled by the orchestrator and drained by workers.

use std::sync::Arc;

use tracing::debug;

use super::{InterprocessDataManager, ProcessId, SizingConfig};
use crate::error::Result;
use crate::index::command::IndexerCommand;
use crate::index::shared_types::SharedIndexerCommand;
use crate::interprocess::GarbageCollector;

const NAME_PREFIX: &str = "icmd_";
const COMMANDS_KEY: &str = "indexer_commands";

pub struct InterprocessCommandManager {
    base: InterprocessDataManager,
}

impl InterprocessCommandManager {
    pub fn new(
        instance_uuid: &str,
        process_id: ProcessId,
        is_owner: bool,
        sizing: SizingConfig,
        collector: Option<Arc<GarbageCollector>>,
    ) -> Result<Self> {
        let base = InterprocessDataManager::new(
            NAME_PREFIX,
            sizing.command_memory_size,
            instance_uuid,
            process_id,
            is_owner,
            sizing,
            collector,
        )?;
        Ok(Self { base })
    }

    /// Append `commands` in order.
    ///
    /// The segment is grown up front by exactly the missing number of bytes, and
    /// all commands are pushed inside the same critical section.
    pub fn push_indexer_commands(&self, commands: &[IndexerCommand]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut access = self.base.memory().access()?;
        let required = self
            .base
            .sizing()
            .command_batch_size(commands.iter().map(IndexerCommand::byte_size));
        let free = access.free_memory_size();
        if required > free {
            access.grow_memory(required - free)?;
            debug!(required, free, "{}", access.log_string());
        }

        {
            let mut queue = access.queue::<SharedIndexerCommand>(COMMANDS_KEY)?;
            for command in commands {
                queue.push_back(&SharedIndexerCommand::from(command))?;
            }
        }
        access.commit()
    }

    /// Take the front command. Each command is returned to exactly one caller.
    pub fn pop_indexer_command(&self) -> Result<Option<IndexerCommand>> {
        let mut access = self.base.memory().access()?;
        let command = access
            .queue::<SharedIndexerCommand>(COMMANDS_KEY)?
            .pop_front()?;
        access.commit()?;
        Ok(command.map(IndexerCommand::from))
    }

    pub fn clear_indexer_commands(&self) -> Result<()> {
        let mut access = self.base.memory().access()?;
        access.queue::<SharedIndexerCommand>(COMMANDS_KEY)?.clear()?;
        access.commit()
    }

    /// Number of queued commands. Stale as soon as it is returned.
    pub fn indexer_command_count(&self) -> Result<usize> {
        let mut access = self.base.memory().access()?;
        let count = access.queue::<SharedIndexerCommand>(COMMANDS_KEY)?.len();
        Ok(count)
    }

    pub fn base(&self) -> &InterprocessDataManager {
        &self.base
    }
}
