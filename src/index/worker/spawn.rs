//! Worker subprocess spawning.
//!
//! Workers are the current executable re-invoked with the hidden `worker`
//! subcommand, so a single binary carries both roles.

use super::proc::WorkerProcess;
use crate::error::{NavindexError, Result};
use crate::index::managers::ProcessId;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Everything a worker needs to find its run.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub process_id: ProcessId,
    pub instance_uuid: String,
    pub app_path: PathBuf,
    pub user_data_path: PathBuf,
    pub log_file: Option<PathBuf>,
    /// Binary to run instead of the current executable.
    pub executable: Option<PathBuf>,
}

impl WorkerLaunch {
    /// Arguments following the executable path.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            self.process_id.to_string(),
            self.instance_uuid.clone(),
            self.app_path.display().to_string(),
            self.user_data_path.display().to_string(),
        ];
        if let Some(log_file) = &self.log_file {
            args.push(log_file.display().to_string());
        }
        args
    }
}

/// Spawn a worker subprocess.
///
/// The worker gets its own process group so a Ctrl+C in the terminal reaches
/// only the orchestrator, which then stops workers through the shared
/// interruption flag.
pub fn spawn_worker(launch: &WorkerLaunch) -> Result<WorkerProcess> {
    let exe_path = match &launch.executable {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .map_err(|e| NavindexError::Worker(format!("Failed to get current executable: {}", e)))?,
    };

    let mut cmd = Command::new(&exe_path);
    cmd.args(launch.args());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::inherit());
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| NavindexError::Worker(format!("Failed to spawn worker: {}", e)))?;

    Ok(WorkerProcess::from_child(child))
}
