//! The worker side of an indexing run.
//!
//! This runs when `navindex worker …` is invoked, and on plain threads when the
//! orchestrator is in thread mode. A worker pops commands until the queue is
//! empty or the run is interrupted, and reports every file through the status
//! board and its own result segment.

use std::path::PathBuf;

use tracing::{debug, info, instrument, warn};

use crate::error::{NavindexError, Result};
use crate::index::managers::{
    InterprocessCommandManager, InterprocessStatusManager, InterprocessStorageManager, ProcessId,
    SizingConfig,
};
use crate::index::processor::CommandProcessor;

/// Why a worker loop ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The command queue was empty.
    QueueEmpty,
    /// The orchestrator raised the interruption flag.
    Interrupted,
    /// The run's segments were deleted while the worker was between files.
    OwnerGone,
}

/// Counters from one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub exit: WorkerExit,
    pub files_processed: usize,
}

/// One worker attached to the shared segments of a run.
pub struct IndexerWorker {
    process_id: ProcessId,
    commands: InterprocessCommandManager,
    status: InterprocessStatusManager,
    storages: InterprocessStorageManager,
    processor: Box<dyn CommandProcessor>,
}

impl IndexerWorker {
    /// Open the segments of run `instance_uuid` as worker `process_id`.
    ///
    /// Fails with [`NavindexError::SegmentNotFound`] if the orchestrator has
    /// not created them.
    pub fn connect(
        instance_uuid: &str,
        process_id: ProcessId,
        sizing: SizingConfig,
        processor: Box<dyn CommandProcessor>,
    ) -> Result<Self> {
        if process_id == 0 {
            return Err(NavindexError::Config(
                "process id 0 is reserved for the orchestrator".into(),
            ));
        }

        let commands =
            InterprocessCommandManager::new(instance_uuid, process_id, false, sizing.clone(), None)?;
        let status =
            InterprocessStatusManager::new(instance_uuid, process_id, false, sizing.clone(), None)?;
        let storages =
            InterprocessStorageManager::new(instance_uuid, process_id, false, sizing, None)?;

        Ok(Self {
            process_id,
            commands,
            status,
            storages,
            processor,
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Process commands until there are none left.
    #[instrument(level = "debug", skip(self), fields(process_id = self.process_id))]
    pub fn run(&mut self) -> Result<WorkerSummary> {
        let mut files_processed = 0;

        let exit = loop {
            match self.step() {
                Ok(Some(())) => files_processed += 1,
                Ok(None) if self.interrupted_now() => break WorkerExit::Interrupted,
                Ok(None) => break WorkerExit::QueueEmpty,
                Err(NavindexError::SegmentNotFound(name)) => {
                    debug!(segment = %name, "Run segments are gone, stopping");
                    break WorkerExit::OwnerGone;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            process_id = self.process_id,
            files_processed,
            exit = ?exit,
            "Worker finished"
        );
        Ok(WorkerSummary {
            exit,
            files_processed,
        })
    }

    fn interrupted_now(&self) -> bool {
        self.status.indexing_interrupted().unwrap_or(false)
    }

    /// Index one command. `None` means there was nothing to do.
    fn step(&mut self) -> Result<Option<()>> {
        if self.status.indexing_interrupted()? {
            return Ok(None);
        }
        let Some(command) = self.commands.pop_indexer_command()? else {
            return Ok(None);
        };

        let path = command.source_file_path.clone();
        self.status.set_currently_indexed_source_file_path(&path)?;
        debug!(file = %path.display(), "Indexing");

        let storage = self.processor.process(&command);
        let indexed: Vec<PathBuf> = storage
            .files
            .iter()
            .filter(|file| file.indexed)
            .map(|file| file.file_path.clone())
            .collect();
        if storage.errors.iter().any(|error| error.fatal) {
            warn!(file = %path.display(), errors = storage.errors.len(), "Indexed with fatal errors");
        }

        // Results first, so the finished announcement never precedes them.
        self.storages.push_intermediate_storage(&storage)?;
        self.status.add_indexed_files(&indexed)?;
        self.status.clear_currently_indexed_source_file_path()?;
        Ok(Some(()))
    }
}

/// Arguments of the hidden `worker` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub process_id: ProcessId,
    pub instance_uuid: String,
    pub app_path: PathBuf,
    pub user_data_path: PathBuf,
}

/// Entry point of a worker subprocess.
pub fn run_worker_main(
    args: &WorkerArgs,
    processor: Box<dyn CommandProcessor>,
) -> Result<WorkerSummary> {
    info!(
        process_id = args.process_id,
        instance = %args.instance_uuid,
        app_path = %args.app_path.display(),
        user_data_path = %args.user_data_path.display(),
        "Worker starting"
    );
    let mut worker = IndexerWorker::connect(
        &args.instance_uuid,
        args.process_id,
        SizingConfig::default(),
        processor,
    )?;
    worker.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::command::IndexerCommand;
    use crate::index::managers::tests::instance_uuid;
    use crate::index::processor::FileRecordProcessor;
    use crate::index::storage::IntermediateStorage;

    struct Owner {
        commands: InterprocessCommandManager,
        status: InterprocessStatusManager,
        storages: InterprocessStorageManager,
    }

    fn owner(uuid: &str, process_id: ProcessId) -> Owner {
        let sizing = SizingConfig::default();
        Owner {
            commands: InterprocessCommandManager::new(uuid, 0, true, sizing.clone(), None).unwrap(),
            status: InterprocessStatusManager::new(uuid, 0, true, sizing.clone(), None).unwrap(),
            storages: InterprocessStorageManager::new(uuid, process_id, true, sizing, None)
                .unwrap(),
        }
    }

    struct Recorder;

    impl CommandProcessor for Recorder {
        fn process(&mut self, command: &IndexerCommand) -> IntermediateStorage {
            let mut storage = IntermediateStorage::new();
            storage.add_file(command.source_file_path.clone(), "java", "", true, true);
            storage
        }
    }

    #[test]
    fn test_worker_drains_queue_and_reports() {
        let uuid = instance_uuid();
        let owner = owner(&uuid, 1);
        let commands: Vec<_> = (0..3)
            .map(|i| IndexerCommand::java(format!("/src/F{i}.java"), "17"))
            .collect();
        owner.commands.push_indexer_commands(&commands).unwrap();

        let mut worker =
            IndexerWorker::connect(&uuid, 1, SizingConfig::default(), Box::new(Recorder)).unwrap();
        let summary = worker.run().unwrap();
        assert_eq!(summary.exit, WorkerExit::QueueEmpty);
        assert_eq!(summary.files_processed, 3);

        assert_eq!(owner.storages.intermediate_storage_count().unwrap(), 3);
        let started = owner.status.take_started_source_file_paths().unwrap();
        assert_eq!(started.len(), 3);
        for _ in 0..3 {
            assert_eq!(owner.status.next_finished_process_id().unwrap(), Some(1));
        }
        assert_eq!(owner.status.indexed_files().unwrap().len(), 3);
        assert!(owner.status.crashed_source_file_paths().unwrap().is_empty());
    }

    #[test]
    fn test_worker_stops_when_interrupted() {
        let uuid = instance_uuid();
        let owner = owner(&uuid, 2);
        owner
            .commands
            .push_indexer_commands(&[IndexerCommand::java("/src/A.java", "17")])
            .unwrap();
        owner.status.set_indexing_interrupted(true).unwrap();

        let mut worker =
            IndexerWorker::connect(&uuid, 2, SizingConfig::default(), Box::new(Recorder)).unwrap();
        let summary = worker.run().unwrap();
        assert_eq!(summary.exit, WorkerExit::Interrupted);
        assert_eq!(summary.files_processed, 0);
        assert_eq!(owner.commands.indexer_command_count().unwrap(), 1);
    }

    #[test]
    fn test_connect_without_owner_fails() {
        let result = IndexerWorker::connect(
            &instance_uuid(),
            1,
            SizingConfig::default(),
            Box::new(FileRecordProcessor),
        );
        assert!(matches!(result, Err(NavindexError::SegmentNotFound(_))));
    }

    #[test]
    fn test_process_id_zero_is_rejected() {
        let uuid = instance_uuid();
        let _owner = owner(&uuid, 1);
        let result =
            IndexerWorker::connect(&uuid, 0, SizingConfig::default(), Box::new(Recorder));
        assert!(matches!(result, Err(NavindexError::Config(_))));
    }

    #[test]
    fn test_worker_exits_cleanly_after_owner_teardown() {
        let uuid = instance_uuid();
        let owner = owner(&uuid, 3);
        owner
            .commands
            .push_indexer_commands(&[IndexerCommand::java("/src/A.java", "17")])
            .unwrap();
        let mut worker =
            IndexerWorker::connect(&uuid, 3, SizingConfig::default(), Box::new(Recorder)).unwrap();
        drop(owner);

        let summary = worker.run().unwrap();
        assert_eq!(summary.exit, WorkerExit::OwnerGone);
    }
}
