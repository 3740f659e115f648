//! Intermediate storage: the partial graph produced by indexing one file.
//!
//! Ids are allocated locally from `next_id` and are only unique within one
//! storage. Merging and renumbering happen in the permanent store.

use std::mem::size_of;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Locally unique element id.
pub type Id = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: Id,
    pub node_kind: i32,
    pub serialized_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFile {
    pub id: Id,
    pub file_path: PathBuf,
    pub language: String,
    pub modification_time: String,
    pub indexed: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSymbol {
    pub id: Id,
    pub definition_kind: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEdge {
    pub id: Id,
    pub edge_kind: i32,
    pub source_node_id: Id,
    pub target_node_id: Id,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocalSymbol {
    pub id: Id,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSourceLocation {
    pub id: Id,
    pub file_node_id: Id,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub location_kind: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOccurrence {
    pub element_id: Id,
    pub source_location_id: Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageComponentAccess {
    pub node_id: Id,
    pub access_kind: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCommentLocation {
    pub id: Id,
    pub file_node_id: Id,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    pub id: Id,
    pub message: String,
    pub translation_unit: PathBuf,
    pub fatal: bool,
    pub indexed: bool,
}

/// Everything one worker learned about one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntermediateStorage {
    pub nodes: Vec<StorageNode>,
    pub files: Vec<StorageFile>,
    pub symbols: Vec<StorageSymbol>,
    pub edges: Vec<StorageEdge>,
    pub local_symbols: Vec<StorageLocalSymbol>,
    pub source_locations: Vec<StorageSourceLocation>,
    pub occurrences: Vec<StorageOccurrence>,
    pub component_accesses: Vec<StorageComponentAccess>,
    pub comment_locations: Vec<StorageCommentLocation>,
    pub errors: Vec<StorageError>,
    pub next_id: Id,
}

impl IntermediateStorage {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    fn allocate_id(&mut self) -> Id {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_node(&mut self, node_kind: i32, serialized_name: impl Into<String>) -> Id {
        let id = self.allocate_id();
        self.nodes.push(StorageNode {
            id,
            node_kind,
            serialized_name: serialized_name.into(),
        });
        id
    }

    pub fn add_file(
        &mut self,
        file_path: impl Into<PathBuf>,
        language: impl Into<String>,
        modification_time: impl Into<String>,
        indexed: bool,
        complete: bool,
    ) -> Id {
        let id = self.allocate_id();
        self.files.push(StorageFile {
            id,
            file_path: file_path.into(),
            language: language.into(),
            modification_time: modification_time.into(),
            indexed,
            complete,
        });
        id
    }

    pub fn add_symbol(&mut self, id: Id, definition_kind: i32) {
        self.symbols.push(StorageSymbol {
            id,
            definition_kind,
        });
    }

    pub fn add_edge(&mut self, edge_kind: i32, source_node_id: Id, target_node_id: Id) -> Id {
        let id = self.allocate_id();
        self.edges.push(StorageEdge {
            id,
            edge_kind,
            source_node_id,
            target_node_id,
        });
        id
    }

    pub fn add_local_symbol(&mut self, name: impl Into<String>) -> Id {
        let id = self.allocate_id();
        self.local_symbols.push(StorageLocalSymbol {
            id,
            name: name.into(),
        });
        id
    }

    pub fn add_source_location(&mut self, mut location: StorageSourceLocation) -> Id {
        location.id = self.allocate_id();
        self.source_locations.push(location);
        location.id
    }

    pub fn add_occurrence(&mut self, element_id: Id, source_location_id: Id) {
        self.occurrences.push(StorageOccurrence {
            element_id,
            source_location_id,
        });
    }

    pub fn add_component_access(&mut self, node_id: Id, access_kind: i32) {
        self.component_accesses.push(StorageComponentAccess {
            node_id,
            access_kind,
        });
    }

    pub fn add_comment_location(&mut self, mut location: StorageCommentLocation) -> Id {
        location.id = self.allocate_id();
        self.comment_locations.push(location);
        location.id
    }

    pub fn add_error(
        &mut self,
        message: impl Into<String>,
        translation_unit: impl Into<PathBuf>,
        fatal: bool,
        indexed: bool,
    ) -> Id {
        let id = self.allocate_id();
        self.errors.push(StorageError {
            id,
            message: message.into(),
            translation_unit: translation_unit.into(),
            fatal,
            indexed,
        });
        id
    }

    /// Storage recording that `path` brought down the worker indexing it.
    pub fn crashed_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut storage = Self::new();
        storage.add_file(path.clone(), "", "", false, false);
        storage.add_error("The indexer crashed while processing this file.", path, true, true);
        storage
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.files.is_empty()
            && self.symbols.is_empty()
            && self.edges.is_empty()
            && self.local_symbols.is_empty()
            && self.source_locations.is_empty()
            && self.occurrences.is_empty()
            && self.component_accesses.is_empty()
            && self.comment_locations.is_empty()
            && self.errors.is_empty()
    }

    /// Estimated size of the storage in bytes: record sizes plus string lengths.
    pub fn byte_size(&self) -> usize {
        let mut size = 0;
        for file in &self.files {
            size += size_of::<StorageFile>();
            size += file.file_path.as_os_str().len() + file.language.len();
            size += file.modification_time.len();
        }
        for error in &self.errors {
            size += size_of::<StorageError>();
            size += error.message.len() + error.translation_unit.as_os_str().len();
        }
        for node in &self.nodes {
            size += size_of::<StorageNode>() + node.serialized_name.len();
        }
        for symbol in &self.local_symbols {
            size += size_of::<StorageLocalSymbol>() + symbol.name.len();
        }

        size += self.symbols.len() * size_of::<StorageSymbol>();
        size += self.edges.len() * size_of::<StorageEdge>();
        size += self.source_locations.len() * size_of::<StorageSourceLocation>();
        size += self.occurrences.len() * size_of::<StorageOccurrence>();
        size += self.component_accesses.len() * size_of::<StorageComponentAccess>();
        size += self.comment_locations.len() * size_of::<StorageCommentLocation>();
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_allocated_sequentially() {
        let mut storage = IntermediateStorage::new();
        let file = storage.add_file("a.cpp", "cpp", "", true, true);
        let node = storage.add_node(1, "main");
        let edge = storage.add_edge(2, file, node);
        assert_eq!((file, node, edge), (1, 2, 3));
        assert_eq!(storage.next_id, 4);
    }

    #[test]
    fn test_default_storage_starts_ids_at_one() {
        let mut storage = IntermediateStorage::default();
        assert_eq!(storage.add_node(0, "x"), 1);
    }

    #[test]
    fn test_crashed_file_storage() {
        let storage = IntermediateStorage::crashed_file("/src/bad.cpp");
        assert_eq!(storage.files.len(), 1);
        assert!(!storage.files[0].indexed);
        assert_eq!(storage.errors.len(), 1);
        assert!(storage.errors[0].fatal);
        assert_eq!(storage.errors[0].translation_unit, PathBuf::from("/src/bad.cpp"));
    }

    #[test]
    fn test_byte_size_grows_with_content() {
        let mut storage = IntermediateStorage::new();
        assert!(storage.is_empty());
        assert_eq!(storage.byte_size(), 0);

        storage.add_node(1, "short");
        let small = storage.byte_size();
        storage.add_node(1, "a_much_longer_serialized_name");
        assert!(storage.byte_size() > small);
        assert!(!storage.is_empty());
    }
}
