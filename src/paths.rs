//! Path utilities for navindex data and logs.

use std::path::{Path, PathBuf};

use crate::index::managers::ProcessId;

/// Name of the log directory below the data directory.
pub const LOGS_DIR_NAME: &str = "logs";

/// Get the data directory for navindex.
///
/// - Linux: `~/.local/share/navindex`
/// - macOS: `~/Library/Application Support/navindex`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("navindex"))
        .unwrap_or_else(|| PathBuf::from(".navindex"))
}

/// Directory receiving per-worker log files.
pub fn get_logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOGS_DIR_NAME)
}

/// Log file of worker `process_id`.
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use navindex::paths::worker_log_path;
///
/// let path = worker_log_path(Path::new("/var/log/navindex"), 3);
/// assert_eq!(path, PathBuf::from("/var/log/navindex/worker_3.log"));
/// ```
pub fn worker_log_path(log_dir: &Path, process_id: ProcessId) -> PathBuf {
    log_dir.join(format!("worker_{process_id}.log"))
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// Covers `--flag=~/path`, where the shell does not expand the tilde.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use navindex::paths::expand_tilde;
///
/// let path = PathBuf::from("/tmp/foo");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

/// Create `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir_returns_valid_path() {
        let data_dir = get_data_dir();
        let name = data_dir.file_name().unwrap().to_str().unwrap();
        assert!(name == "navindex" || name == ".navindex");
    }

    #[test]
    fn test_logs_dir_is_below_data_dir() {
        let data_dir = PathBuf::from("/data/navindex");
        assert_eq!(get_logs_dir(&data_dir), PathBuf::from("/data/navindex/logs"));
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let path = PathBuf::from("~/Documents/test");
        let expanded = expand_tilde(&path);
        assert!(!expanded.to_str().unwrap().starts_with("~"));
        assert!(expanded.to_str().unwrap().ends_with("Documents/test"));
    }

    #[test]
    fn test_expand_tilde_relative_path_unchanged() {
        let path = PathBuf::from("./relative/path");
        assert_eq!(expand_tilde(&path), path);
    }

    #[test]
    fn test_ensure_dir_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a/b/logs");
        ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
        ensure_dir(&dir).unwrap();
    }
}
