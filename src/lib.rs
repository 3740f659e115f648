//! navindex - coordinate source indexing across worker processes.
//!
//! An orchestrator hands per-file indexer commands to a pool of workers
//! through named shared memory and collects their intermediate storages.
//! A worker that crashes only loses the file it was working on; the file is
//! recorded as an error and the worker is restarted.
//!
//! ```no_run
//! use navindex::index::{
//!     IndexerCommand, LogReporter, MemoryCommandProvider, MemoryStorageSink, Orchestrator,
//!     OrchestratorConfig, WorkerMode,
//! };
//!
//! let mut provider = MemoryCommandProvider::new([
//!     IndexerCommand::cxx("/src/main.cpp", "/src", vec!["-std=c++17".into()]),
//!     IndexerCommand::java("/src/Main.java", "17"),
//! ]);
//! let config = OrchestratorConfig {
//!     jobs: 2,
//!     mode: WorkerMode::Thread,
//!     ..OrchestratorConfig::default()
//! };
//! let mut sink = MemoryStorageSink::default();
//! let report = Orchestrator::new(config)
//!     .run(&mut provider, &mut sink, &mut LogReporter)
//!     .unwrap();
//! assert_eq!(report.total_files, 2);
//! ```

pub mod error;
pub mod index;
pub mod interprocess;
pub mod logging;
pub mod memory;
pub mod paths;
pub mod version;

pub use error::{NavindexError, Result};
