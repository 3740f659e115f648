//! Indexer workers and their supervision.
//!
//! # Architecture
//!
//! ```text
//!                  ┌────────────────────────┐
//!                  │      Orchestrator      │
//!                  │  icmd_ / ists_ owner   │
//!                  └───────────┬────────────┘
//!                              │ one supervisor thread per slot
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ iist_1_   │  │ iist_2_   │  │ iist_N_   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers only talk to the orchestrator through shared memory segments.
//! A supervisor restarts its worker after a crash and reports the file the
//! worker was indexing at the time.

mod proc;
mod signals;
mod spawn;
mod supervisor;
pub mod worker_main;

pub use proc::WorkerProcess;
pub use signals::TerminationReason;
pub use spawn::{WorkerLaunch, spawn_worker};
pub use supervisor::{
    ProcessorFactory, RunControl, Supervision, SupervisorConfig, SupervisorSummary, WorkerCrash,
    WorkerMode, WorkerSupervisor,
};
pub use worker_main::{IndexerWorker, WorkerArgs, WorkerExit, WorkerSummary, run_worker_main};
