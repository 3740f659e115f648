//! Source file discovery for `navindex index`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ignore::WalkBuilder;
use navindex::index::{IndexerCommand, MemoryCommandProvider};
use tracing::{debug, warn};

const CXX_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx"];
const JAVA_EXTENSIONS: &[&str] = &["java"];

/// How discovered files become indexer commands.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub java_standard: String,
    pub cxx_flags: Vec<String>,
}

/// Language frontend a file extension maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLanguage {
    Cxx,
    Java,
}

fn language_of(path: &Path) -> Option<SourceLanguage> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if CXX_EXTENSIONS.contains(&ext.as_str()) {
        Some(SourceLanguage::Cxx)
    } else if JAVA_EXTENSIONS.contains(&ext.as_str()) {
        Some(SourceLanguage::Java)
    } else {
        None
    }
}

/// Walk `roots` and collect every indexable file, deduplicated and sorted.
pub fn discover(roots: &[PathBuf], respect_ignore_files: bool) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();

    for root in roots {
        if !root.exists() {
            bail!("Source path does not exist: {}", root.display());
        }
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", root.display()))?;

        // Explicitly named files are taken as-is, ignore files notwithstanding.
        if root.is_file() {
            if language_of(&root).is_some() {
                files.insert(root);
            } else {
                warn!(file = %root.display(), "Skipping file with unknown language");
            }
            continue;
        }

        let walker = WalkBuilder::new(&root)
            .hidden(true)
            .git_ignore(respect_ignore_files)
            .ignore(respect_ignore_files)
            .build();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if language_of(entry.path()).is_some() {
                files.insert(entry.into_path());
            }
        }
    }

    Ok(files.into_iter().collect())
}

/// Build the command backlog for `files`.
pub fn build_provider(files: &[PathBuf], options: &SourceOptions) -> MemoryCommandProvider {
    let mut provider = MemoryCommandProvider::default();
    for file in files {
        let command = match language_of(file) {
            Some(SourceLanguage::Cxx) => {
                let working_directory = file.parent().map(Path::to_path_buf).unwrap_or_default();
                IndexerCommand::cxx(file.clone(), working_directory, options.cxx_flags.clone())
            }
            Some(SourceLanguage::Java) => {
                IndexerCommand::java(file.clone(), options.java_standard.clone())
            }
            None => continue,
        };
        provider.add_command(command);
    }
    provider
}
