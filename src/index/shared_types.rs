//! Representations of commands and storages as they live in shared memory.
//!
//! Fixed-layout records are shared as they are. Records carrying paths are
//! transcoded field by field into [`SharedPath`]s, which keep the raw bytes of
//! the path, and reconstructed the same way on the reading side.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::command::{CommandKindTag, IndexerCommand, IndexerCommandKind};
use super::storage::{
    Id, IntermediateStorage, StorageCommentLocation, StorageComponentAccess, StorageEdge,
    StorageError, StorageFile, StorageLocalSymbol, StorageNode, StorageOccurrence,
    StorageSourceLocation, StorageSymbol,
};

/// A path as raw bytes.
///
/// Serialized as a string when the bytes are UTF-8 and as a byte array
/// otherwise, so any path a filesystem hands out survives the trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SharedPath(Vec<u8>);

impl SharedPath {
    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.0))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Upper bound of the encoded size, for reserving shared memory.
    ///
    /// Byte arrays take up to four characters per byte.
    pub fn encoded_len(path: &Path) -> usize {
        path.as_os_str().len() * 4 + 2
    }
}

impl From<&Path> for SharedPath {
    fn from(path: &Path) -> Self {
        Self(path.as_os_str().as_bytes().to_vec())
    }
}

impl From<&PathBuf> for SharedPath {
    fn from(path: &PathBuf) -> Self {
        Self::from(path.as_path())
    }
}

impl From<SharedPath> for PathBuf {
    fn from(path: SharedPath) -> Self {
        PathBuf::from(OsString::from_vec(path.0))
    }
}

impl Serialize for SharedPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.serialize_bytes(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for SharedPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Encoded {
            Text(String),
            Bytes(Vec<u8>),
        }

        Ok(match Encoded::deserialize(deserializer)? {
            Encoded::Text(text) => Self(text.into_bytes()),
            Encoded::Bytes(bytes) => Self(bytes),
        })
    }
}

fn shared_paths(paths: &[PathBuf]) -> Vec<SharedPath> {
    paths.iter().map(SharedPath::from).collect()
}

fn paths(shared: Vec<SharedPath>) -> Vec<PathBuf> {
    shared.into_iter().map(PathBuf::from).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedCommandKind {
    Cxx,
    Java,
}

impl From<CommandKindTag> for SharedCommandKind {
    fn from(tag: CommandKindTag) -> Self {
        match tag {
            CommandKindTag::Cxx => SharedCommandKind::Cxx,
            CommandKindTag::Java => SharedCommandKind::Java,
        }
    }
}

/// Flat shared form of an [`IndexerCommand`]. Fields of the other kind stay empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedIndexerCommand {
    pub kind: SharedCommandKind,
    pub source_file_path: SharedPath,
    #[serde(default)]
    pub indexed_paths: Vec<SharedPath>,
    #[serde(default)]
    pub exclude_filters: Vec<String>,
    #[serde(default)]
    pub include_filters: Vec<String>,
    #[serde(default)]
    pub working_directory: SharedPath,
    #[serde(default)]
    pub compiler_flags: Vec<String>,
    #[serde(default)]
    pub language_standard: String,
    #[serde(default)]
    pub class_path: Vec<SharedPath>,
}

impl From<&IndexerCommand> for SharedIndexerCommand {
    fn from(command: &IndexerCommand) -> Self {
        let mut shared = SharedIndexerCommand {
            kind: command.kind_tag().into(),
            source_file_path: SharedPath::from(&command.source_file_path),
            indexed_paths: Vec::new(),
            exclude_filters: Vec::new(),
            include_filters: Vec::new(),
            working_directory: SharedPath::default(),
            compiler_flags: Vec::new(),
            language_standard: String::new(),
            class_path: Vec::new(),
        };

        match &command.kind {
            IndexerCommandKind::Cxx {
                indexed_paths,
                exclude_filters,
                include_filters,
                working_directory,
                compiler_flags,
            } => {
                shared.indexed_paths = shared_paths(indexed_paths);
                shared.exclude_filters = exclude_filters.clone();
                shared.include_filters = include_filters.clone();
                shared.working_directory = SharedPath::from(working_directory);
                shared.compiler_flags = compiler_flags.clone();
            }
            IndexerCommandKind::Java {
                language_standard,
                class_path,
            } => {
                shared.language_standard = language_standard.clone();
                shared.class_path = shared_paths(class_path);
            }
        }
        shared
    }
}

impl From<SharedIndexerCommand> for IndexerCommand {
    fn from(shared: SharedIndexerCommand) -> Self {
        let kind = match shared.kind {
            SharedCommandKind::Cxx => IndexerCommandKind::Cxx {
                indexed_paths: paths(shared.indexed_paths),
                exclude_filters: shared.exclude_filters,
                include_filters: shared.include_filters,
                working_directory: shared.working_directory.into(),
                compiler_flags: shared.compiler_flags,
            },
            SharedCommandKind::Java => IndexerCommandKind::Java {
                language_standard: shared.language_standard,
                class_path: paths(shared.class_path),
            },
        };
        IndexerCommand {
            source_file_path: shared.source_file_path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStorageFile {
    pub id: Id,
    pub file_path: SharedPath,
    pub language: String,
    pub modification_time: String,
    pub indexed: bool,
    pub complete: bool,
}

impl From<&StorageFile> for SharedStorageFile {
    fn from(file: &StorageFile) -> Self {
        Self {
            id: file.id,
            file_path: SharedPath::from(&file.file_path),
            language: file.language.clone(),
            modification_time: file.modification_time.clone(),
            indexed: file.indexed,
            complete: file.complete,
        }
    }
}

impl From<SharedStorageFile> for StorageFile {
    fn from(file: SharedStorageFile) -> Self {
        Self {
            id: file.id,
            file_path: file.file_path.into(),
            language: file.language,
            modification_time: file.modification_time,
            indexed: file.indexed,
            complete: file.complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStorageError {
    pub id: Id,
    pub message: String,
    pub translation_unit: SharedPath,
    pub fatal: bool,
    pub indexed: bool,
}

impl From<&StorageError> for SharedStorageError {
    fn from(error: &StorageError) -> Self {
        Self {
            id: error.id,
            message: error.message.clone(),
            translation_unit: SharedPath::from(&error.translation_unit),
            fatal: error.fatal,
            indexed: error.indexed,
        }
    }
}

impl From<SharedStorageError> for StorageError {
    fn from(error: SharedStorageError) -> Self {
        Self {
            id: error.id,
            message: error.message,
            translation_unit: error.translation_unit.into(),
            fatal: error.fatal,
            indexed: error.indexed,
        }
    }
}

/// Shared form of an [`IntermediateStorage`], one collection per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedIntermediateStorage {
    pub nodes: Vec<StorageNode>,
    pub files: Vec<SharedStorageFile>,
    pub symbols: Vec<StorageSymbol>,
    pub edges: Vec<StorageEdge>,
    pub local_symbols: Vec<StorageLocalSymbol>,
    pub source_locations: Vec<StorageSourceLocation>,
    pub occurrences: Vec<StorageOccurrence>,
    pub component_accesses: Vec<StorageComponentAccess>,
    pub comment_locations: Vec<StorageCommentLocation>,
    pub errors: Vec<SharedStorageError>,
    pub next_id: Id,
}

impl From<&IntermediateStorage> for SharedIntermediateStorage {
    fn from(storage: &IntermediateStorage) -> Self {
        Self {
            nodes: storage.nodes.clone(),
            files: storage.files.iter().map(SharedStorageFile::from).collect(),
            symbols: storage.symbols.clone(),
            edges: storage.edges.clone(),
            local_symbols: storage.local_symbols.clone(),
            source_locations: storage.source_locations.clone(),
            occurrences: storage.occurrences.clone(),
            component_accesses: storage.component_accesses.clone(),
            comment_locations: storage.comment_locations.clone(),
            errors: storage.errors.iter().map(SharedStorageError::from).collect(),
            next_id: storage.next_id,
        }
    }
}

impl From<SharedIntermediateStorage> for IntermediateStorage {
    fn from(shared: SharedIntermediateStorage) -> Self {
        Self {
            nodes: shared.nodes,
            files: shared.files.into_iter().map(StorageFile::from).collect(),
            symbols: shared.symbols,
            edges: shared.edges,
            local_symbols: shared.local_symbols,
            source_locations: shared.source_locations,
            occurrences: shared.occurrences,
            component_accesses: shared.component_accesses,
            comment_locations: shared.comment_locations,
            errors: shared.errors.into_iter().map(StorageError::from).collect(),
            next_id: shared.next_id,
        }
    }
}
