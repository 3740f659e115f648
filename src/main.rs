//! navindex - cross-process source indexing

mod cli;
mod progress;
mod sources;
mod theme;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{Level, info};

use cli::{Cli, Commands, Verbosity};
use navindex::index::{
    FileRecordProcessor, MemoryStorageSink, Orchestrator, OrchestratorConfig, WorkerMode,
};
use navindex::index::managers::SizingConfig;
use navindex::index::worker::run_worker_main;
use navindex::interprocess::{GarbageCollector, GarbageCollectorConfig, SharedMemory};
use navindex::logging::{self, LogConfig};
use navindex::paths;
use progress::ProgressReporter;
use theme::Themed;

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Index(args) => cmd_index(&cli, args),
        Commands::Worker(args) => cmd_worker(args),
        Commands::Check => cmd_check(),
        Commands::Gc(args) => cmd_gc(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let config = match &cli.command {
        Commands::Worker(args) => LogConfig::for_worker(args.log_file.clone()),
        _ => {
            let level = if cli.quiet {
                Level::ERROR
            } else {
                match cli.verbosity() {
                    Verbosity::Normal => Level::WARN,
                    Verbosity::Info => Level::INFO,
                    Verbosity::Debug => Level::DEBUG,
                }
            };
            LogConfig::for_cli().with_level(level)
        }
    };
    logging::init(config.with_env_overrides());
}

fn cmd_index(cli: &Cli, args: &cli::IndexArgs) -> Result<()> {
    let roots: Vec<_> = args.paths.iter().map(paths::expand_tilde).collect();
    let files = sources::discover(&roots, !args.no_ignore)?;
    if files.is_empty() {
        eprintln!("{}", "No C, C++ or Java sources found.".warning());
        return Ok(());
    }

    let options = sources::SourceOptions {
        java_standard: args.java_standard.clone(),
        cxx_flags: args.cxx_flags.clone(),
    };
    let mut provider = sources::build_provider(&files, &options);

    let data_dir = paths::expand_tilde(&cli.data_dir);
    let log_dir = paths::get_logs_dir(&data_dir);
    paths::ensure_dir(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let config = OrchestratorConfig {
        jobs: args.jobs,
        mode: if args.threads {
            WorkerMode::Thread
        } else {
            WorkerMode::Process
        },
        max_queued_commands: args.queue_size,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        sizing: SizingConfig {
            storage_memory_size: args.storage_memory.as_usize(),
            ..SizingConfig::default()
        },
        user_data_path: data_dir,
        log_dir: Some(log_dir),
        ..OrchestratorConfig::default()
    };

    let collector = Arc::new(
        GarbageCollector::new(GarbageCollectorConfig::default())
            .context("Failed to open the shared memory registry")?,
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping workers...");
        cancel_flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let orchestrator = Orchestrator::new(config)
        .with_garbage_collector(collector.clone())
        .with_cancellation(cancel);

    if !cli.quiet {
        eprintln!(
            "Indexing {} files with {} workers",
            files.len().count_style(),
            orchestrator
                .config()
                .effective_jobs()
                .min(files.len())
                .count_style()
        );
    }

    let mut sink = MemoryStorageSink::default();
    let mut reporter = ProgressReporter::new(!cli.quiet);
    let result = orchestrator.run(&mut provider, &mut sink, &mut reporter);
    collector.stop();
    let report = result?;

    info!(
        instance = %report.instance_uuid,
        nodes = sink.nodes,
        edges = sink.edges,
        "Indexing run complete"
    );

    if !cli.quiet {
        eprintln!();
        if report.interrupted {
            eprintln!("{}", "Indexing interrupted.".warning());
        } else {
            eprintln!("{}", "Indexing complete!".success());
        }
        eprintln!(
            "  Files indexed: {}/{}",
            report.indexed_files.count_style(),
            report.total_files.count_style()
        );
        eprintln!("  Results received: {}", report.finished_files.count_style());
        eprintln!("  Symbols: {}", sink.nodes.count_style());
        eprintln!("  References: {}", sink.edges.count_style());
        eprintln!("  Errors: {}", sink.errors.count_style());
        if !reporter.crashed().is_empty() {
            eprintln!(
                "  {} {}",
                "Crashed files:".warning(),
                reporter.crashed().len().count_style()
            );
            for file in reporter.crashed() {
                eprintln!("    {}", file.display().path_style());
            }
        }
        eprintln!("  Elapsed: {:.1}s", report.elapsed.as_secs_f64());
    }

    Ok(())
}

fn cmd_worker(args: &cli::WorkerProcessArgs) -> Result<()> {
    let summary = run_worker_main(&args.to_worker_args(), Box::new(FileRecordProcessor))
        .with_context(|| format!("Worker {} failed", args.process_id))?;
    info!(
        process_id = args.process_id,
        files = summary.files_processed,
        exit = ?summary.exit,
        "Worker finished"
    );
    Ok(())
}

fn cmd_check() -> Result<()> {
    let check_id = uuid::Uuid::new_v4().simple().to_string();
    SharedMemory::check_shared_memory(&check_id)
        .context("Named shared memory is not usable on this system")?;
    println!("{}", "Shared memory check passed".success());
    Ok(())
}

fn cmd_gc(args: &cli::GcArgs) -> Result<()> {
    let collector = GarbageCollector::new(
        GarbageCollectorConfig::default()
            .with_delete_threshold(Duration::from_secs(args.threshold_secs)),
    )
    .context("Failed to open the shared memory registry")?;
    let deleted = collector.collect()?;
    println!(
        "Reclaimed {} abandoned segment(s) from {}",
        deleted.count_style(),
        collector.registry_name().path_style()
    );
    Ok(())
}
