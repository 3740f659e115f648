//! Multi-process source indexing.
//!
//! An indexing run hands one [`command::IndexerCommand`] per source file to a
//! set of workers. Commands, results and status travel through named shared
//! memory segments (see [`crate::interprocess`]), so a worker that crashes
//! inside a language frontend only costs the file it was indexing.

pub mod command;
pub mod managers;
pub mod orchestrator;
pub mod processor;
pub mod shared_types;
pub mod sink;
pub mod storage;
pub mod worker;

pub use command::{CommandProvider, IndexerCommand, IndexerCommandKind, MemoryCommandProvider};
pub use orchestrator::{IndexingReport, Orchestrator, OrchestratorConfig};
pub use processor::{CommandProcessor, FileRecordProcessor};
pub use sink::{LogReporter, MemoryStorageSink, StatusReporter, StorageSink};
pub use storage::IntermediateStorage;
pub use worker::WorkerMode;
