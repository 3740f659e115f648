//! Turning one indexer command into an intermediate storage.
//!
//! Language frontends plug in here. The built-in [`FileRecordProcessor`]
//! records the file and a single file node, which is enough to drive a
//! complete indexing run end to end.

use std::fs;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};

use super::command::{CommandKindTag, IndexerCommand};
use super::storage::IntermediateStorage;

/// Node kind used for file nodes.
pub const NODE_KIND_FILE: i32 = 1;

/// Parser seam used by workers.
pub trait CommandProcessor: Send {
    /// Index the file described by `command`.
    ///
    /// Failures the frontend can recover from are reported as storage errors,
    /// not as panics or `Err`s.
    fn process(&mut self, command: &IndexerCommand) -> IntermediateStorage;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileRecordProcessor;

impl FileRecordProcessor {
    fn language(tag: CommandKindTag) -> &'static str {
        match tag {
            CommandKindTag::Cxx => "cpp",
            CommandKindTag::Java => "java",
        }
    }
}

impl CommandProcessor for FileRecordProcessor {
    fn process(&mut self, command: &IndexerCommand) -> IntermediateStorage {
        let path = &command.source_file_path;
        let mut storage = IntermediateStorage::new();

        match fs::metadata(path) {
            Ok(metadata) => {
                let modified = metadata
                    .modified()
                    .ok()
                    .filter(|time| *time >= UNIX_EPOCH)
                    .map(|time| DateTime::<Utc>::from(time).format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let language = Self::language(command.kind_tag());
                let file_id = storage.add_file(path.clone(), language, modified, true, true);
                storage.add_node(NODE_KIND_FILE, path.to_string_lossy());
                storage.add_symbol(file_id, 0);
            }
            Err(e) => {
                storage.add_file(path.clone(), "", "", false, false);
                storage.add_error(format!("cannot read file: {e}"), path.clone(), true, true);
            }
        }

        storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_existing_file_is_recorded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("main.cpp");
        fs::write(&path, "int main() {}\n").unwrap();

        let command = IndexerCommand::cxx(&path, dir.path(), Vec::new());
        let storage = FileRecordProcessor.process(&command);

        assert_eq!(storage.files.len(), 1);
        assert_eq!(storage.files[0].file_path, path);
        assert_eq!(storage.files[0].language, "cpp");
        assert!(storage.files[0].indexed);
        assert!(!storage.files[0].modification_time.is_empty());
        assert_eq!(storage.nodes.len(), 1);
        assert_eq!(storage.nodes[0].node_kind, NODE_KIND_FILE);
        assert!(storage.errors.is_empty());
    }

    #[test]
    fn test_missing_file_yields_error() {
        let command = IndexerCommand::java("/definitely/not/here/A.java", "17");
        let storage = FileRecordProcessor.process(&command);

        assert_eq!(storage.files.len(), 1);
        assert!(!storage.files[0].indexed);
        assert_eq!(storage.errors.len(), 1);
        assert!(storage.errors[0].message.contains("cannot read file"));
        assert!(storage.nodes.is_empty());
    }
}
