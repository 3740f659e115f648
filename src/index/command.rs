//! Indexer commands and the backlog that hands them out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Language frontend a command is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKindTag {
    Cxx,
    Java,
}

impl std::fmt::Display for CommandKindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKindTag::Cxx => write!(f, "cxx"),
            CommandKindTag::Java => write!(f, "java"),
        }
    }
}

/// Kind-specific body of an [`IndexerCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerCommandKind {
    Cxx {
        indexed_paths: Vec<PathBuf>,
        exclude_filters: Vec<String>,
        include_filters: Vec<String>,
        working_directory: PathBuf,
        compiler_flags: Vec<String>,
    },
    Java {
        language_standard: String,
        class_path: Vec<PathBuf>,
    },
}

/// One unit of indexing work: analyze a single source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerCommand {
    pub source_file_path: PathBuf,
    pub kind: IndexerCommandKind,
}

impl IndexerCommand {
    pub fn cxx(
        source_file_path: impl Into<PathBuf>,
        working_directory: impl Into<PathBuf>,
        compiler_flags: Vec<String>,
    ) -> Self {
        let source_file_path = source_file_path.into();
        Self {
            kind: IndexerCommandKind::Cxx {
                indexed_paths: vec![source_file_path.clone()],
                exclude_filters: Vec::new(),
                include_filters: Vec::new(),
                working_directory: working_directory.into(),
                compiler_flags,
            },
            source_file_path,
        }
    }

    pub fn java(source_file_path: impl Into<PathBuf>, language_standard: impl Into<String>) -> Self {
        Self {
            source_file_path: source_file_path.into(),
            kind: IndexerCommandKind::Java {
                language_standard: language_standard.into(),
                class_path: Vec::new(),
            },
        }
    }

    pub fn kind_tag(&self) -> CommandKindTag {
        match self.kind {
            IndexerCommandKind::Cxx { .. } => CommandKindTag::Cxx,
            IndexerCommandKind::Java { .. } => CommandKindTag::Java,
        }
    }

    /// Estimated serialized size: the byte length of every string the command carries.
    pub fn byte_size(&self) -> usize {
        let mut size = path_len(&self.source_file_path);
        match &self.kind {
            IndexerCommandKind::Cxx {
                indexed_paths,
                exclude_filters,
                include_filters,
                working_directory,
                compiler_flags,
            } => {
                size += indexed_paths.iter().map(|p| path_len(p)).sum::<usize>();
                size += exclude_filters.iter().map(String::len).sum::<usize>();
                size += include_filters.iter().map(String::len).sum::<usize>();
                size += path_len(working_directory);
                size += compiler_flags.iter().map(String::len).sum::<usize>();
            }
            IndexerCommandKind::Java {
                language_standard,
                class_path,
            } => {
                size += language_standard.len();
                size += class_path.iter().map(|p| path_len(p)).sum::<usize>();
            }
        }
        size
    }
}

fn path_len(path: &Path) -> usize {
    path.as_os_str().len()
}

/// Source of indexer commands for one run.
pub trait CommandProvider: Send {
    fn has_commands(&self) -> bool {
        self.len() > 0
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source paths of all commands not yet consumed.
    fn source_file_paths(&self) -> Vec<PathBuf>;

    /// Take the command for `path`, if it is still pending.
    fn consume_command_for(&mut self, path: &Path) -> Option<IndexerCommand>;

    /// Take any pending command.
    fn consume_command(&mut self) -> Option<IndexerCommand>;

    fn clear(&mut self);
}

/// Backlog held in memory, keyed by source path.
#[derive(Debug, Default)]
pub struct MemoryCommandProvider {
    commands: BTreeMap<PathBuf, IndexerCommand>,
}

impl MemoryCommandProvider {
    pub fn new(commands: impl IntoIterator<Item = IndexerCommand>) -> Self {
        let mut provider = Self::default();
        for command in commands {
            provider.add_command(command);
        }
        provider
    }

    /// Add a command, replacing any pending command for the same file.
    pub fn add_command(&mut self, command: IndexerCommand) {
        self.commands
            .insert(command.source_file_path.clone(), command);
    }
}

impl CommandProvider for MemoryCommandProvider {
    fn len(&self) -> usize {
        self.commands.len()
    }

    fn source_file_paths(&self) -> Vec<PathBuf> {
        self.commands.keys().cloned().collect()
    }

    fn consume_command_for(&mut self, path: &Path) -> Option<IndexerCommand> {
        self.commands.remove(path)
    }

    fn consume_command(&mut self) -> Option<IndexerCommand> {
        self.commands.pop_first().map(|(_, command)| command)
    }

    fn clear(&mut self) {
        self.commands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_counts_all_strings() {
        let command = IndexerCommand::cxx("/src/a.cpp", "/src", vec!["-O2".into(), "-DX".into()]);
        // path + indexed path + working dir + two flags
        assert_eq!(command.byte_size(), 10 + 10 + 4 + 3 + 3);
        assert_eq!(command.kind_tag(), CommandKindTag::Cxx);

        let java = IndexerCommand::java("A.java", "17");
        assert_eq!(java.byte_size(), 6 + 2);
        assert_eq!(java.kind_tag(), CommandKindTag::Java);
    }

    #[test]
    fn test_provider_consumes_each_command_once() {
        let mut provider = MemoryCommandProvider::new([
            IndexerCommand::java("b.java", "17"),
            IndexerCommand::java("a.java", "17"),
        ]);
        assert!(provider.has_commands());
        assert_eq!(provider.len(), 2);
        assert_eq!(
            provider.source_file_paths(),
            vec![PathBuf::from("a.java"), PathBuf::from("b.java")]
        );

        let b = provider.consume_command_for(Path::new("b.java")).unwrap();
        assert_eq!(b.source_file_path, PathBuf::from("b.java"));
        assert!(provider.consume_command_for(Path::new("b.java")).is_none());

        let a = provider.consume_command().unwrap();
        assert_eq!(a.source_file_path, PathBuf::from("a.java"));
        assert!(provider.is_empty());
        assert!(provider.consume_command().is_none());
    }

    #[test]
    fn test_provider_clear() {
        let mut provider = MemoryCommandProvider::new([IndexerCommand::java("a.java", "17")]);
        provider.clear();
        assert!(!provider.has_commands());
    }

    #[test]
    fn test_kind_tag_display() {
        assert_eq!(CommandKindTag::Cxx.to_string(), "cxx");
        assert_eq!(CommandKindTag::Java.to_string(), "java");
    }
}
