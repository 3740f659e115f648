//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use navindex::index::managers::ProcessId;
use navindex::index::worker::WorkerArgs;
use navindex::memory::{self, MemorySize};
use navindex::paths;
use navindex::version;
use std::path::PathBuf;

/// Index source trees in parallel worker processes.
#[derive(Parser, Debug)]
#[command(name = "navindex")]
#[command(author, version = version::full_version(), about, long_about = None)]
pub struct Cli {
    /// Directory for navindex data and worker logs.
    #[arg(long, env = "NAVINDEX_DATA_DIR", default_value_os_t = paths::get_data_dir())]
    pub data_dir: PathBuf,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index source files with a pool of workers.
    Index(IndexArgs),

    /// Run as an indexing worker (started by `index`).
    #[command(hide = true)]
    Worker(WorkerProcessArgs),

    /// Verify that named shared memory works on this system.
    Check,

    /// Reclaim shared memory left behind by crashed runs.
    Gc(GcArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "navindex",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments for the index command.
#[derive(Parser, Debug)]
pub struct IndexArgs {
    /// Source files or directories to index.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Number of parallel workers (0 = one per CPU).
    #[arg(short, long, env = "NAVINDEX_JOBS", default_value_t = 0)]
    pub jobs: usize,

    /// Run workers as threads instead of processes.
    #[arg(long)]
    pub threads: bool,

    /// Commands kept queued ahead of the workers.
    #[arg(long, default_value_t = 20)]
    pub queue_size: usize,

    /// How often the orchestrator polls workers, in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub poll_interval_ms: u64,

    /// Java language standard passed to the Java frontend.
    #[arg(long, default_value = "17")]
    pub java_standard: String,

    /// Extra compiler flags for C and C++ files.
    #[arg(long = "cxx-flag", allow_hyphen_values = true)]
    pub cxx_flags: Vec<String>,

    /// Also index files ignored by .gitignore and friends.
    #[arg(long)]
    pub no_ignore: bool,

    /// Initial size of each worker's result segment (e.g. 3M, 512K).
    #[arg(long, default_value = "3M", value_parser = memory::parse_segment_size)]
    pub storage_memory: MemorySize,
}

/// Arguments of a worker process.
#[derive(Parser, Debug)]
pub struct WorkerProcessArgs {
    /// Worker slot, 1 or higher.
    pub process_id: ProcessId,

    /// Uuid of the indexing run to join.
    pub instance_uuid: String,

    pub app_path: PathBuf,

    pub user_data_path: PathBuf,

    /// Log to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl WorkerProcessArgs {
    pub fn to_worker_args(&self) -> WorkerArgs {
        WorkerArgs {
            process_id: self.process_id,
            instance_uuid: self.instance_uuid.clone(),
            app_path: self.app_path.clone(),
            user_data_path: self.user_data_path.clone(),
        }
    }
}

/// Arguments for the gc command.
#[derive(Parser, Debug)]
pub struct GcArgs {
    /// Seconds without heartbeat after which a segment counts as abandoned.
    #[arg(long, default_value_t = 10)]
    pub threshold_secs: u64,
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Default: warnings, errors and results.
    Normal,
    /// -v: progress of the run.
    Info,
    /// -vv: shared memory and worker internals.
    Debug,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v flags.
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from(self.verbose)
    }
}
