//! Work distribution for an indexing run.
//!
//! The orchestrator owns the run's segments. It feeds the command queue from
//! the backlog, drains finished results into the storage sink, reports
//! progress, and turns worker crashes into per-file errors.
//!
//! A run moves through `Enter → Running → (Interrupted) → Exit`:
//!
//! - **Enter**: order the backlog, create the segments, queue the first batch
//!   and start one supervisor per worker slot.
//! - **Running**: every poll interval, top up the queue, drain results within
//!   the drain budget and report what workers started.
//! - **Interrupted**: the cancellation flag empties the backlog and the queue
//!   and raises the shared interruption flag.
//! - **Exit**: once every supervisor is done, drain what is left, record
//!   crashed files and drop the segments. An interrupted run clears its
//!   pending status and results instead of draining them.
//!
//! A status segment that cannot be read anymore costs the run its progress
//! reports and crash records, not its results.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::command::{CommandProvider, IndexerCommand};
use super::managers::{
    InterprocessCommandManager, InterprocessStatusManager, InterprocessStorageManager, ProcessId,
    SizingConfig,
};
use super::processor::{CommandProcessor, FileRecordProcessor};
use super::sink::{StatusReporter, StorageSink};
use super::storage::IntermediateStorage;
use super::worker::{
    ProcessorFactory, RunControl, Supervision, SupervisorConfig, WorkerMode, WorkerSupervisor,
};
use crate::error::{NavindexError, Result};
use crate::interprocess::GarbageCollector;
use crate::paths;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of worker slots (0 = one per available CPU).
    pub jobs: usize,
    pub mode: WorkerMode,
    /// Commands kept in the shared queue ahead of the workers.
    pub max_queued_commands: usize,
    pub poll_interval: Duration,
    /// Time spent draining results per poll.
    pub drain_budget: Duration,
    /// Stop draining while the sink has this many storages pending.
    pub max_pending_storages: usize,
    /// How long interrupted worker processes may finish their file.
    pub grace_period: Duration,
    /// A slot is abandoned after this many consecutive failed worker starts.
    pub max_failed_starts: usize,
    pub sizing: SizingConfig,
    /// Passed to workers, which may use it to locate bundled resources.
    pub app_path: PathBuf,
    pub user_data_path: PathBuf,
    /// Directory for per-worker log files. Workers log to stderr otherwise.
    pub log_dir: Option<PathBuf>,
    /// Worker binary (defaults to the current executable).
    pub worker_executable: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            jobs: 0,
            mode: WorkerMode::Process,
            max_queued_commands: 20,
            poll_interval: Duration::from_millis(200),
            drain_budget: Duration::from_millis(500),
            max_pending_storages: 10,
            grace_period: Duration::from_secs(5),
            max_failed_starts: 3,
            sizing: SizingConfig::default(),
            app_path: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
                .unwrap_or_default(),
            user_data_path: paths::get_data_dir(),
            log_dir: None,
            worker_executable: None,
        }
    }
}

impl OrchestratorConfig {
    /// Worker slots to use, resolving `0` to the CPU count.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs > 0 {
            self.jobs
        } else {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queued_commands == 0 {
            return Err(NavindexError::Config(
                "max_queued_commands must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(NavindexError::Config("poll_interval must not be zero".into()));
        }
        if self.max_failed_starts == 0 {
            return Err(NavindexError::Config(
                "max_failed_starts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexingReport {
    /// Uuid naming the run's segments. Empty when nothing was indexed.
    pub instance_uuid: String,
    pub total_files: usize,
    /// Results received from workers.
    pub finished_files: usize,
    /// Files reported as successfully indexed by workers.
    pub indexed_files: usize,
    pub crashed_files: Vec<PathBuf>,
    pub interrupted: bool,
    pub elapsed: Duration,
}

/// Runs indexing backlogs across a set of workers.
pub struct Orchestrator {
    config: OrchestratorConfig,
    collector: Option<Arc<GarbageCollector>>,
    processor: ProcessorFactory,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            collector: None,
            processor: Arc::new(|| Box::new(FileRecordProcessor) as Box<dyn CommandProcessor>),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register the run's segments with `collector`.
    pub fn with_garbage_collector(mut self, collector: Arc<GarbageCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Processor used by thread workers. Process workers always use the
    /// binary's built-in processor.
    pub fn with_processor(mut self, processor: ProcessorFactory) -> Self {
        self.processor = processor;
        self
    }

    /// Share an existing cancellation flag, e.g. one set by a Ctrl+C handler.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Setting this flag interrupts the current run.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Index everything `provider` holds.
    ///
    /// Blocks until all workers are done or the run was interrupted. Worker
    /// crashes do not fail the run; they show up in
    /// [`IndexingReport::crashed_files`] and as error storages in `sink`.
    #[instrument(level = "debug", skip_all)]
    pub fn run(
        &self,
        provider: &mut dyn CommandProvider,
        sink: &mut dyn StorageSink,
        reporter: &mut dyn StatusReporter,
    ) -> Result<IndexingReport> {
        self.config.validate()?;
        let start = Instant::now();

        let mut backlog: VecDeque<IndexerCommand> =
            load_balanced_order(take_backlog(provider)).into();
        let total_files = backlog.len();
        reporter.indexing_started(total_files);

        if total_files == 0 {
            reporter.indexing_finished(0, 0, false);
            return Ok(IndexingReport {
                elapsed: start.elapsed(),
                ..IndexingReport::default()
            });
        }

        let jobs = self.config.effective_jobs().min(total_files);
        let instance_uuid = Uuid::new_v4().simple().to_string();
        info!(
            instance = %instance_uuid,
            total_files,
            jobs,
            mode = ?self.config.mode,
            "Starting indexing run"
        );

        let run = RunSegments::create(&instance_uuid, jobs, &self.config.sizing, &self.collector)?;
        if let Some(collector) = &self.collector {
            collector.run(&instance_uuid)?;
        }
        let control = Arc::new(RunControl::default());
        run.fill_command_queue(&mut backlog, self.config.max_queued_commands, &control)?;

        let (crash_tx, crash_rx) = mpsc::channel();
        let supervision = Arc::new(Supervision {
            config: SupervisorConfig {
                mode: self.config.mode,
                instance_uuid: instance_uuid.clone(),
                sizing: self.config.sizing.clone(),
                app_path: self.config.app_path.clone(),
                user_data_path: self.config.user_data_path.clone(),
                log_dir: self.config.log_dir.clone(),
                executable: self.config.worker_executable.clone(),
                restart_delay: self.config.poll_interval,
                grace_period: self.config.grace_period,
                max_failed_starts: self.config.max_failed_starts,
            },
            control: control.clone(),
            commands: run.commands.clone(),
            status: run.status.clone(),
            processor: self.processor.clone(),
            crashes: crash_tx,
        });

        let mut supervisors = Vec::with_capacity(jobs);
        for process_id in 1..=jobs as ProcessId {
            supervisors.push(WorkerSupervisor::start(process_id, supervision.clone())?);
        }
        drop(supervision);

        let mut finished_files = 0;
        let mut reported_crashes: BTreeSet<PathBuf> = BTreeSet::new();
        let mut interrupted = false;

        loop {
            if !interrupted && self.cancel.load(Ordering::SeqCst) {
                interrupted = true;
                backlog.clear();
                provider.clear();
                run.commands.clear_indexer_commands()?;
                tolerate_corrupt(
                    run.status.set_indexing_interrupted(true),
                    "interruption flag",
                )?;
                control.interrupt();
                info!(instance = %instance_uuid, "Indexing interrupted");
            }

            if !interrupted {
                run.fill_command_queue(&mut backlog, self.config.max_queued_commands, &control)?;
            }

            run.report_started_files(reporter)?;

            if !interrupted {
                finished_files += run.drain_results(
                    sink,
                    Some(self.config.drain_budget),
                    self.config.max_pending_storages,
                )?;
            }

            let crashed: Vec<PathBuf> = crash_rx
                .try_iter()
                .filter_map(|crash| crash.file)
                .filter(|file| reported_crashes.insert(file.clone()))
                .collect();
            if !crashed.is_empty() {
                reporter.files_crashed(&crashed);
            }

            reporter.progress(finished_files + reported_crashes.len(), total_files);

            if supervisors.iter().all(WorkerSupervisor::is_finished) {
                break;
            }
            thread::sleep(self.config.poll_interval);
        }

        let mut supervisor_error = None;
        for supervisor in supervisors {
            let process_id = supervisor.process_id();
            match supervisor.join() {
                Ok(summary) => debug!(
                    process_id,
                    launches = summary.launches,
                    crashes = summary.crashes,
                    "Supervisor joined"
                ),
                Err(e) => {
                    error!(process_id, error = %e, "Supervisor failed");
                    supervisor_error.get_or_insert(e);
                }
            }
        }

        run.report_started_files(reporter)?;
        if !interrupted {
            finished_files += run.drain_all_results(sink)?;
        }

        let crashed_files: Vec<PathBuf> = tolerate_corrupt(
            run.status.crashed_source_file_paths(),
            "crashed files",
        )?;
        let unreported: Vec<PathBuf> = crashed_files
            .iter()
            .filter(|path| !reported_crashes.contains(*path))
            .cloned()
            .collect();
        if !unreported.is_empty() {
            reporter.files_crashed(&unreported);
        }
        for path in &crashed_files {
            sink.insert(IntermediateStorage::crashed_file(path.clone()));
        }

        let indexed_files = tolerate_corrupt(run.status.indexed_files(), "indexed files")?.len();
        if interrupted {
            run.discard_pending()?;
        }
        reporter.progress(finished_files + crashed_files.len(), total_files);
        reporter.indexing_finished(finished_files, crashed_files.len(), interrupted);
        info!(
            instance = %instance_uuid,
            finished_files,
            indexed_files,
            crashed = crashed_files.len(),
            interrupted,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Indexing run finished"
        );

        if let Some(e) = supervisor_error
            && !interrupted
            && finished_files + crashed_files.len() < total_files
        {
            return Err(e);
        }

        Ok(IndexingReport {
            instance_uuid,
            total_files,
            finished_files,
            indexed_files,
            crashed_files,
            interrupted,
            elapsed: start.elapsed(),
        })
    }
}

/// Owner-side managers of one run. Dropping this deletes the segments.
struct RunSegments {
    commands: Arc<InterprocessCommandManager>,
    status: Arc<InterprocessStatusManager>,
    /// Result segment of worker `i + 1` at index `i`.
    storages: Vec<InterprocessStorageManager>,
}

impl RunSegments {
    fn create(
        instance_uuid: &str,
        jobs: usize,
        sizing: &SizingConfig,
        collector: &Option<Arc<GarbageCollector>>,
    ) -> Result<Self> {
        let status = InterprocessStatusManager::new(
            instance_uuid,
            0,
            true,
            sizing.clone(),
            collector.clone(),
        )?;
        let commands = InterprocessCommandManager::new(
            instance_uuid,
            0,
            true,
            sizing.clone(),
            collector.clone(),
        )?;
        let storages = (1..=jobs as ProcessId)
            .map(|process_id| {
                InterprocessStorageManager::new(
                    instance_uuid,
                    process_id,
                    true,
                    sizing.clone(),
                    collector.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            commands: Arc::new(commands),
            status: Arc::new(status),
            storages,
        })
    }

    /// Top the command queue up to `max_queued` entries.
    fn fill_command_queue(
        &self,
        backlog: &mut VecDeque<IndexerCommand>,
        max_queued: usize,
        control: &RunControl,
    ) -> Result<()> {
        if !backlog.is_empty() {
            let queued = self.commands.indexer_command_count()?;
            let take = max_queued.saturating_sub(queued).min(backlog.len());
            if take > 0 {
                let batch: Vec<IndexerCommand> = backlog.drain(..take).collect();
                self.commands.push_indexer_commands(&batch)?;
                debug!(pushed = batch.len(), remaining = backlog.len(), "Queued commands");
            }
        }

        if backlog.is_empty() && !control.is_backlog_exhausted() {
            control.set_backlog_exhausted();
        }
        Ok(())
    }

    /// Forward files workers started since the last call, and the most recent
    /// one as the file in progress.
    fn report_started_files(&self, reporter: &mut dyn StatusReporter) -> Result<()> {
        let started: Vec<PathBuf> = tolerate_corrupt(
            self.status.take_started_source_file_paths(),
            "started files",
        )?;
        if started.is_empty() {
            return Ok(());
        }
        reporter.files_started(&started);

        let last = tolerate_corrupt(self.status.last_source_file_path(), "last file")?;
        if let Some(last) = last {
            reporter.file_in_progress(&last);
        }
        Ok(())
    }

    /// Forget status entries and results an interrupted run will not use.
    fn discard_pending(&self) -> Result<()> {
        tolerate_corrupt(self.status.reset(), "status reset")?;
        for manager in &self.storages {
            let cleared = manager.clear_intermediate_storages()?;
            if cleared > 0 {
                debug!(
                    process_id = manager.base().process_id(),
                    cleared,
                    "Dropped undrained results"
                );
            }
        }
        Ok(())
    }

    /// Move announced results into `sink`, within `budget` if given.
    fn drain_results(
        &self,
        sink: &mut dyn StorageSink,
        budget: Option<Duration>,
        max_pending: usize,
    ) -> Result<usize> {
        let start = Instant::now();
        let mut drained = 0;

        while budget.is_none_or(|budget| start.elapsed() < budget) {
            if sink.pending() >= max_pending {
                debug!(pending = sink.pending(), "Storage sink is saturated");
                break;
            }
            let next = tolerate_corrupt(self.status.next_finished_process_id(), "finished queue")?;
            let Some(process_id) = next else {
                break;
            };
            let Some(manager) = self.storage_manager(process_id) else {
                warn!(process_id, "Finished announcement from an unknown worker");
                continue;
            };
            match manager.pop_intermediate_storage()? {
                Some(storage) => {
                    sink.insert(storage);
                    drained += 1;
                }
                None => warn!(process_id, "Finished announcement without a result"),
            }
        }

        Ok(drained)
    }

    /// Drain everything, including results whose announcement never came.
    fn drain_all_results(&self, sink: &mut dyn StorageSink) -> Result<usize> {
        let mut drained = self.drain_results(sink, None, usize::MAX)?;
        for manager in &self.storages {
            while let Some(storage) = manager.pop_intermediate_storage()? {
                sink.insert(storage);
                drained += 1;
            }
        }
        Ok(drained)
    }

    fn storage_manager(&self, process_id: ProcessId) -> Option<&InterprocessStorageManager> {
        let index = (process_id as usize).checked_sub(1)?;
        self.storages.get(index)
    }
}

/// Treat an unreadable segment like an empty one.
///
/// Status reads only feed reports, so a torn status segment must not abort a
/// run whose results are still intact. Other errors pass through.
fn tolerate_corrupt<T: Default>(result: Result<T>, what: &str) -> Result<T> {
    match result {
        Err(NavindexError::CorruptSegment { name, reason }) => {
            warn!(segment = %name, %reason, what, "Ignoring unreadable status");
            Ok(T::default())
        }
        other => other,
    }
}

/// Take every pending command out of `provider`.
fn take_backlog(provider: &mut dyn CommandProvider) -> Vec<IndexerCommand> {
    let mut commands = Vec::with_capacity(provider.len());
    for path in provider.source_file_paths() {
        if let Some(command) = provider.consume_command_for(&path) {
            commands.push(command);
        }
    }
    while let Some(command) = provider.consume_command() {
        commands.push(command);
    }
    commands
}

/// Order commands so large and small files alternate.
///
/// Cost is the file size on disk, or the command's byte size if the file
/// cannot be read.
pub fn load_balanced_order(commands: Vec<IndexerCommand>) -> Vec<IndexerCommand> {
    let costed = commands
        .into_iter()
        .map(|command| {
            let cost = fs::metadata(&command.source_file_path)
                .map(|metadata| metadata.len())
                .unwrap_or(command.byte_size() as u64);
            (cost, command)
        })
        .collect();
    order_by_cost(costed)
}

/// Sort by descending cost, split into a large and a small half, sort each
/// half by path and interleave them, large first.
fn order_by_cost(mut costed: Vec<(u64, IndexerCommand)>) -> Vec<IndexerCommand> {
    costed.sort_by(|(a_cost, a), (b_cost, b)| {
        b_cost
            .cmp(a_cost)
            .then_with(|| a.source_file_path.cmp(&b.source_file_path))
    });

    let small_half = costed.split_off(costed.len().div_ceil(2));
    let mut large: Vec<IndexerCommand> = costed.into_iter().map(|(_, c)| c).collect();
    let mut small: Vec<IndexerCommand> = small_half.into_iter().map(|(_, c)| c).collect();
    large.sort_by(|a, b| a.source_file_path.cmp(&b.source_file_path));
    small.sort_by(|a, b| a.source_file_path.cmp(&b.source_file_path));

    let mut ordered = Vec::with_capacity(large.len() + small.len());
    let mut small = small.into_iter();
    for command in large {
        ordered.push(command);
        ordered.extend(small.next());
    }
    ordered.extend(small);
    ordered
}
