//! Handle to a worker subprocess.

use crate::error::{NavindexError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// A spawned worker, reaped with `waitpid`.
///
/// Dropping an unreaped handle terminates the process.
pub struct WorkerProcess {
    pid: Pid,
    reaped: bool,
}

impl WorkerProcess {
    /// Take over a spawned child. The `Child` itself is not waited on again.
    pub fn from_child(child: std::process::Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            reaped: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Non-blocking check whether the process has exited.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(NavindexError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => Err(NavindexError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(NavindexError::Worker("Process already reaped".into()));
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| NavindexError::Worker(format!("waitpid failed: {}", e)))?;
        self.reaped = true;
        Ok(status)
    }

    /// Send SIGTERM to the process.
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM)
            .map_err(|e| NavindexError::Worker(format!("Failed to send SIGTERM: {}", e)))
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL. Returns the final status.
    pub fn stop(&mut self, timeout: Duration) -> Result<WaitStatus> {
        if self.reaped {
            return Err(NavindexError::Worker("Process already reaped".into()));
        }

        let _ = self.terminate();
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        signal::kill(self.pid, Signal::SIGKILL)
            .map_err(|e| NavindexError::Worker(format!("Failed to send SIGKILL: {}", e)))?;
        self.wait()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::worker::signals::{TerminationReason, analyze_wait_status};
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> WorkerProcess {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .expect("Failed to spawn");
        WorkerProcess::from_child(child)
    }

    #[test]
    fn test_wait_reports_exit_code() {
        let mut process = spawn("sh", &["-c", "exit 3"]);
        let status = process.wait().unwrap();
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(3));
        assert!(process.try_wait().is_err());
    }

    #[test]
    fn test_stop_terminates_sleeping_process() {
        let mut process = spawn("sleep", &["60"]);
        assert!(process.try_wait().unwrap().is_none());

        let status = process.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let mut process = spawn("sh", &["-c", "trap '' TERM; sleep 60"]);
        std::thread::sleep(Duration::from_millis(100));

        let status = process.stop(Duration::from_millis(200)).unwrap();
        assert_eq!(analyze_wait_status(status), TerminationReason::Killed);
    }
}
