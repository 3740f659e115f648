//! One supervisor thread per worker slot.
//!
//! A supervisor keeps its slot staffed: it starts a worker, waits for it, marks
//! the file it was working on as crashed when it dies, and starts another one
//! until the run is drained or interrupted. A worker the supervisor stops
//! itself after an interruption did not crash, so its file is only released.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::signals::{TerminationReason, analyze_wait_status};
use super::spawn::{WorkerLaunch, spawn_worker};
use super::worker_main::IndexerWorker;
use crate::error::{NavindexError, Result};
use crate::index::managers::{
    InterprocessCommandManager, InterprocessStatusManager, ProcessId, SizingConfig,
};
use crate::index::processor::CommandProcessor;
use crate::paths;

/// How often a supervisor polls a running worker process.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Where workers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// One OS process per worker; a crashing parser only takes down its worker.
    #[default]
    Process,
    /// One thread per worker in the orchestrator's process. Panics are caught.
    Thread,
}

/// Builds a fresh processor for every thread worker.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn CommandProcessor> + Send + Sync>;

/// Flags the orchestrator raises for all supervisors of a run.
#[derive(Debug, Default)]
pub struct RunControl {
    interrupted: AtomicBool,
    backlog_exhausted: AtomicBool,
}

impl RunControl {
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Every command of the backlog has been pushed to the command queue.
    pub fn set_backlog_exhausted(&self) {
        self.backlog_exhausted.store(true, Ordering::SeqCst);
    }

    pub fn is_backlog_exhausted(&self) -> bool {
        self.backlog_exhausted.load(Ordering::SeqCst)
    }
}

/// A worker death observed by a supervisor.
#[derive(Debug, Clone)]
pub struct WorkerCrash {
    pub process_id: ProcessId,
    pub file: Option<PathBuf>,
    pub reason: TerminationReason,
}

/// Settings shared by all supervisors of a run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub mode: WorkerMode,
    pub instance_uuid: String,
    pub sizing: SizingConfig,
    pub app_path: PathBuf,
    pub user_data_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub executable: Option<PathBuf>,
    /// Pause before restarting a worker that found the queue empty.
    pub restart_delay: Duration,
    /// How long an interrupted worker may keep running before it is killed.
    pub grace_period: Duration,
    /// Consecutive abnormal exits without a file in progress before giving up.
    pub max_failed_starts: usize,
}

/// Everything the supervisors of one run share.
pub struct Supervision {
    pub config: SupervisorConfig,
    pub control: Arc<RunControl>,
    pub commands: Arc<InterprocessCommandManager>,
    pub status: Arc<InterprocessStatusManager>,
    pub processor: ProcessorFactory,
    pub crashes: Sender<WorkerCrash>,
}

impl Supervision {
    /// No command is queued and none will be pushed anymore.
    fn queue_drained(&self) -> Result<bool> {
        Ok(self.control.is_backlog_exhausted() && self.commands.indexer_command_count()? == 0)
    }
}

/// How a single worker ended.
#[derive(Debug, Clone)]
struct WorkerOutcome {
    reason: TerminationReason,
    /// The supervisor stopped the worker after the run was interrupted.
    stopped: bool,
}

impl WorkerOutcome {
    fn finished(reason: TerminationReason) -> Self {
        Self {
            reason,
            stopped: false,
        }
    }
}

/// Counters of one supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorSummary {
    pub launches: usize,
    pub crashes: usize,
}

pub struct WorkerSupervisor {
    process_id: ProcessId,
    handle: JoinHandle<Result<SupervisorSummary>>,
}

impl WorkerSupervisor {
    pub fn start(process_id: ProcessId, supervision: Arc<Supervision>) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("supervisor-{process_id}"))
            .spawn(move || supervise(process_id, &supervision))?;
        Ok(Self { process_id, handle })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<SupervisorSummary> {
        self.handle.join().map_err(|payload| {
            NavindexError::Worker(format!(
                "supervisor {} {}",
                self.process_id,
                TerminationReason::from_panic(payload)
            ))
        })?
    }
}

fn supervise(process_id: ProcessId, supervision: &Supervision) -> Result<SupervisorSummary> {
    let mut summary = SupervisorSummary::default();
    let mut failed_starts = 0;

    while !supervision.control.is_interrupted() {
        summary.launches += 1;
        let WorkerOutcome { reason, stopped } = match supervision.config.mode {
            WorkerMode::Process => run_process_worker(process_id, supervision)?,
            WorkerMode::Thread => run_thread_worker(process_id, supervision)?,
        };

        if stopped {
            let file = supervision.status.abandon_current_file(process_id)?;
            info!(
                process_id,
                file = ?file.as_deref().map(|p| p.display().to_string()),
                %reason,
                "Worker stopped after interruption"
            );
            break;
        }

        if reason.is_success() {
            failed_starts = 0;
            if supervision.control.is_interrupted() || supervision.queue_drained()? {
                break;
            }
            thread::sleep(supervision.config.restart_delay);
            continue;
        }

        summary.crashes += 1;
        let file = supervision.status.mark_process_crashed(process_id)?;
        match &file {
            Some(path) => {
                failed_starts = 0;
                warn!(process_id, file = %path.display(), %reason, "Worker crashed while indexing");
            }
            None => {
                failed_starts += 1;
                warn!(process_id, %reason, failed_starts, "Worker stopped abnormally");
            }
        }
        let _ = supervision.crashes.send(WorkerCrash {
            process_id,
            file,
            reason: reason.clone(),
        });

        if failed_starts >= supervision.config.max_failed_starts {
            return Err(NavindexError::Worker(format!(
                "worker {} failed {} times in a row without indexing a file (last: {})",
                process_id, failed_starts, reason
            )));
        }
    }

    debug!(process_id, launches = summary.launches, crashes = summary.crashes, "Supervisor done");
    Ok(summary)
}

fn run_process_worker(process_id: ProcessId, supervision: &Supervision) -> Result<WorkerOutcome> {
    let config = &supervision.config;
    let launch = WorkerLaunch {
        process_id,
        instance_uuid: config.instance_uuid.clone(),
        app_path: config.app_path.clone(),
        user_data_path: config.user_data_path.clone(),
        log_file: config
            .log_dir
            .as_deref()
            .map(|dir| paths::worker_log_path(dir, process_id)),
        executable: config.executable.clone(),
    };
    let mut process = spawn_worker(&launch)?;
    debug!(process_id, pid = %process.pid(), "Spawned worker process");

    let mut deadline: Option<Instant> = None;
    loop {
        if let Some(status) = process.try_wait()? {
            return Ok(WorkerOutcome::finished(analyze_wait_status(status)));
        }

        if supervision.control.is_interrupted() {
            let deadline = *deadline.get_or_insert_with(|| Instant::now() + config.grace_period);
            if Instant::now() >= deadline {
                info!(process_id, pid = %process.pid(), "Worker outlived the grace period, stopping it");
                let status = process.stop(Duration::from_millis(500))?;
                return Ok(WorkerOutcome {
                    reason: analyze_wait_status(status),
                    stopped: true,
                });
            }
        }

        thread::sleep(WAIT_POLL);
    }
}

fn run_thread_worker(process_id: ProcessId, supervision: &Supervision) -> Result<WorkerOutcome> {
    let instance_uuid = supervision.config.instance_uuid.clone();
    let sizing = supervision.config.sizing.clone();
    let processor = (supervision.processor)();

    let handle = thread::Builder::new()
        .name(format!("worker-{process_id}"))
        .spawn(move || IndexerWorker::connect(&instance_uuid, process_id, sizing, processor)?.run())?;

    let reason = match handle.join() {
        Ok(Ok(_)) => TerminationReason::Exited(0),
        Ok(Err(e)) => {
            warn!(process_id, error = %e, "Worker thread failed");
            TerminationReason::Exited(1)
        }
        Err(payload) => TerminationReason::from_panic(payload),
    };
    Ok(WorkerOutcome::finished(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::command::IndexerCommand;
    use crate::index::managers::InterprocessStorageManager;
    use crate::index::managers::tests::instance_uuid;
    use crate::index::processor::FileRecordProcessor;
    use crate::index::storage::IntermediateStorage;
    use nix::sys::signal::Signal;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::mpsc;
    use tempfile::TempDir;

    struct PanicOn(&'static str);

    impl CommandProcessor for PanicOn {
        fn process(&mut self, command: &IndexerCommand) -> IntermediateStorage {
            if command.source_file_path.ends_with(self.0) {
                panic!("cannot parse {}", self.0);
            }
            FileRecordProcessor.process(command)
        }
    }

    /// Executable shell script standing in for the worker binary.
    fn stub_worker(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("stub-worker");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn process_supervision(
        uuid: &str,
        executable: PathBuf,
        max_failed_starts: usize,
    ) -> (Arc<Supervision>, mpsc::Receiver<WorkerCrash>) {
        let (supervision, crashes) = supervision(
            uuid,
            Arc::new(|| Box::new(FileRecordProcessor) as Box<dyn CommandProcessor>),
        );
        let mut supervision = Arc::into_inner(supervision).unwrap();
        supervision.config.mode = WorkerMode::Process;
        supervision.config.executable = Some(executable);
        supervision.config.max_failed_starts = max_failed_starts;
        (Arc::new(supervision), crashes)
    }

    /// Mark `path` as the file worker `process_id` is working on.
    fn register_current_file(uuid: &str, process_id: ProcessId, path: &Path) {
        InterprocessStatusManager::new(uuid, process_id, false, SizingConfig::default(), None)
            .unwrap()
            .set_currently_indexed_source_file_path(path)
            .unwrap();
    }

    fn supervision(
        uuid: &str,
        processor: ProcessorFactory,
    ) -> (Arc<Supervision>, mpsc::Receiver<WorkerCrash>) {
        let sizing = SizingConfig::default();
        let (tx, rx) = mpsc::channel();
        let supervision = Supervision {
            config: SupervisorConfig {
                mode: WorkerMode::Thread,
                instance_uuid: uuid.to_string(),
                sizing: sizing.clone(),
                app_path: PathBuf::from("/opt/navindex"),
                user_data_path: PathBuf::from("/tmp"),
                log_dir: None,
                executable: None,
                restart_delay: Duration::from_millis(10),
                grace_period: Duration::from_millis(100),
                max_failed_starts: 3,
            },
            control: Arc::new(RunControl::default()),
            commands: Arc::new(
                InterprocessCommandManager::new(uuid, 0, true, sizing.clone(), None).unwrap(),
            ),
            status: Arc::new(InterprocessStatusManager::new(uuid, 0, true, sizing, None).unwrap()),
            processor,
            crashes: tx,
        };
        (Arc::new(supervision), rx)
    }

    #[test]
    fn test_run_control_flags() {
        let control = RunControl::default();
        assert!(!control.is_interrupted());
        assert!(!control.is_backlog_exhausted());
        control.interrupt();
        control.set_backlog_exhausted();
        assert!(control.is_interrupted());
        assert!(control.is_backlog_exhausted());
    }

    #[test]
    fn test_supervisor_restarts_after_panic() {
        let uuid = instance_uuid();
        let (supervision, crashes) =
            supervision(&uuid, Arc::new(|| Box::new(PanicOn("B.java")) as Box<dyn CommandProcessor>));
        let storages =
            InterprocessStorageManager::new(&uuid, 1, true, SizingConfig::default(), None).unwrap();

        let commands: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|name| IndexerCommand::java(format!("/missing/{name}.java"), "17"))
            .collect();
        supervision.commands.push_indexer_commands(&commands).unwrap();
        supervision.control.set_backlog_exhausted();

        let summary = WorkerSupervisor::start(1, supervision.clone())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(summary.crashes, 1);
        assert_eq!(summary.launches, 2);

        let crash = crashes.try_recv().unwrap();
        assert_eq!(crash.file, Some(PathBuf::from("/missing/B.java")));
        assert!(matches!(crash.reason, TerminationReason::Panicked(_)));

        assert_eq!(storages.intermediate_storage_count().unwrap(), 2);
        assert_eq!(
            supervision.status.crashed_source_file_paths().unwrap(),
            vec![PathBuf::from("/missing/B.java")]
        );
    }

    #[test]
    fn test_supervisor_does_not_start_when_interrupted() {
        let uuid = instance_uuid();
        let (supervision, _crashes) =
            supervision(&uuid, Arc::new(|| Box::new(FileRecordProcessor) as Box<dyn CommandProcessor>));
        supervision.control.interrupt();

        let summary = WorkerSupervisor::start(1, supervision).unwrap().join().unwrap();
        assert_eq!(summary.launches, 0);
    }

    #[test]
    fn test_supervisor_gives_up_on_repeated_startup_failures() {
        let uuid = instance_uuid();
        let (supervision, crashes) =
            supervision(&uuid, Arc::new(|| Box::new(FileRecordProcessor) as Box<dyn CommandProcessor>));
        // No result segment for slot 4, so every worker fails to connect.
        supervision
            .commands
            .push_indexer_commands(&[IndexerCommand::java("/missing/A.java", "17")])
            .unwrap();

        let err = WorkerSupervisor::start(4, supervision).unwrap().join().unwrap_err();
        assert!(err.to_string().contains("failed 3 times"));
        assert_eq!(crashes.try_iter().count(), 3);
    }

    #[test]
    fn test_signal_killed_worker_process_reports_its_file() {
        let uuid = instance_uuid();
        let dir = tempfile::tempdir().unwrap();
        let stub = stub_worker(&dir, "kill -TERM $$");
        let (supervision, crashes) = process_supervision(&uuid, stub, 1);
        register_current_file(&uuid, 3, Path::new("/src/crash.cpp"));

        // The second launch dies without a file in progress and ends the slot.
        let err = WorkerSupervisor::start(3, supervision.clone())
            .unwrap()
            .join()
            .unwrap_err();
        assert!(err.to_string().contains("failed 1 times"));

        let crash = crashes.try_recv().unwrap();
        assert_eq!(crash.process_id, 3);
        assert_eq!(crash.file, Some(PathBuf::from("/src/crash.cpp")));
        assert_eq!(crash.reason, TerminationReason::Signaled(Signal::SIGTERM));

        let crash = crashes.try_recv().unwrap();
        assert_eq!(crash.file, None);
        assert_eq!(
            supervision.status.crashed_source_file_paths().unwrap(),
            vec![PathBuf::from("/src/crash.cpp")]
        );
    }

    #[test]
    fn test_worker_process_stopped_on_interrupt_is_not_crashed() {
        let uuid = instance_uuid();
        let dir = tempfile::tempdir().unwrap();
        let stub = stub_worker(&dir, "exec sleep 30");
        let (supervision, crashes) = process_supervision(&uuid, stub, 3);
        register_current_file(&uuid, 3, Path::new("/src/slow.cpp"));

        let supervisor = WorkerSupervisor::start(3, supervision.clone()).unwrap();
        thread::sleep(Duration::from_millis(300));
        supervision.control.interrupt();

        let summary = supervisor.join().unwrap();
        assert_eq!(summary.launches, 1);
        assert_eq!(summary.crashes, 0);
        assert!(crashes.try_recv().is_err());
        assert!(supervision.status.crashed_source_file_paths().unwrap().is_empty());
    }
}
