//! Why a worker stopped.
//!
//! Process workers are analyzed from their `waitpid` status, thread workers
//! from the outcome of joining their thread.

use std::any::Any;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// SIGKILL, either from us after the grace period or from the OOM killer.
    Killed,
    /// SIGSEGV or SIGBUS, typically a parser bug or a stack overflow.
    Crashed(Signal),
    /// Any other terminating signal.
    Signaled(Signal),
    /// A thread worker panicked.
    Panicked(String),
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// The worker drained the queue or noticed the interruption flag.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Signaled(sig) => format!("terminated by {:?}", sig),
            Self::Panicked(message) => format!("panicked: {}", message),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }

    /// Reason for a thread worker whose join returned a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Crashed(signal),
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_only_clean_exit_is_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Killed.is_success());
        assert!(!TerminationReason::Panicked("boom".into()).is_success());
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Crashed(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_panic_payload_message() {
        let payload = std::panic::catch_unwind(|| panic!("parser exploded")).unwrap_err();
        let reason = TerminationReason::from_panic(payload);
        assert_eq!(reason, TerminationReason::Panicked("parser exploded".into()));
        assert!(reason.to_string().contains("parser exploded"));
    }
}
