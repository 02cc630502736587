use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use testwatch::config::Config;
use testwatch::git::{DiffProvider, GitDiff};
use testwatch::indexer::index_file;
use testwatch::watcher::ChangeWatcher;
use testwatch::{ChangeAction, ChangeEvent, ExecutionQueue, Orchestrator, TestRunnerWorker};

#[derive(Parser)]
#[command(name = "testwatch")]
#[command(about = "Watch a Python source tree and re-run the tests each change touches")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project root (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Path to config file (default: <root>/testwatch.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Always run tests matching this pattern instead of detecting affected
    /// tests (repeatable)
    #[arg(short = 'k', long = "pattern", global = true)]
    patterns: Vec<String>,

    /// Verbose diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch files and re-run affected tests on changes (default)
    Watch,

    /// Print the targets the current working-tree diff would run
    Impact,

    /// Print the test methods and line ranges found in a file
    Index {
        /// Python source file
        file: PathBuf,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let root = match cli.root {
        Some(ref root) => root.clone(),
        None => std::env::current_dir().context("Could not determine current directory")?,
    };
    let root = std::fs::canonicalize(&root)
        .with_context(|| format!("Could not find project root: {}", root.display()))?;

    let config = Config::load_or_default(&root, cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => cmd_watch(root, config, cli.patterns),
        Commands::Impact => cmd_impact(&root, &config),
        Commands::Index { file } => cmd_index(&root, &config, &file),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "testwatch=debug" } else { "testwatch=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The repository diff, or nothing when the root is not under git
fn open_diff(root: &Path) -> Option<GitDiff> {
    match GitDiff::open(root) {
        Ok(diff) => Some(diff),
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "line-level detection disabled");
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn cmd_watch(root: PathBuf, config: Config, patterns: Vec<String>) -> Result<()> {
    let queue = ExecutionQueue::new();

    let worker = TestRunnerWorker::new(&root, config.runner.clone(), queue.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let watcher = ChangeWatcher::new(&root, &config);
    let (_watcher_guard, mut events) = watcher.start()?;

    let mut orchestrator = Orchestrator::new(&root, config.detect.clone(), open_diff(&root), queue)
        .with_patterns(patterns.clone());

    println!(
        "\n{} {} {}\n",
        "👀".cyan(),
        "Watching for changes in".bold(),
        root.display()
    );

    if !patterns.is_empty() {
        println!("   Running tests matching: {}\n", patterns.join(", ").cyan());
    }

    println!("{}", "Press Ctrl+C to stop\n".dimmed());

    loop {
        tokio::select! {
            batch = watcher.next_batch(&mut events) => match batch {
                Some(batch) => orchestrator.handle_batch(&batch),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n{} Stopped via Ctrl+C", "✓".green());
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    worker_handle.await.context("Test runner worker panicked")?;

    Ok(())
}

fn cmd_impact(root: &Path, config: &Config) -> Result<()> {
    let diff = GitDiff::open(root)?;
    let snapshots = diff.snapshots().context("Could not compute working-tree diff")?;

    let mut changed: Vec<&String> = snapshots.keys().collect();
    changed.sort();

    let events: Vec<ChangeEvent> = changed
        .into_iter()
        .map(|rel| {
            let path = root.join(rel);
            let action = if path.exists() {
                ChangeAction::Modified
            } else {
                ChangeAction::Removed
            };
            ChangeEvent::new(action, path)
        })
        .filter(|e| config.detect.is_source_file(&e.path))
        .collect();

    if events.is_empty() {
        println!("{}", "No changed source files".dimmed());
        return Ok(());
    }

    let mut orchestrator = Orchestrator::new(root, config.detect.clone(), diff, ExecutionQueue::new());
    let targets = orchestrator.resolve_batch(&events);

    println!("\n{} {} changed file(s)", "↻".yellow(), events.len());
    for event in &events {
        let rel = event.path.strip_prefix(root).unwrap_or(&event.path);
        println!("  {} {}", event.action.symbol().dimmed(), rel.display());
    }

    println!("\n{}", "Targets:".bold());
    for target in &targets {
        println!("  {} {}", "•".green(), target.cyan());
    }

    Ok(())
}

fn cmd_index(root: &Path, config: &Config, file: &Path) -> Result<()> {
    let path = std::fs::canonicalize(file)
        .with_context(|| format!("Could not find {}", file.display()))?;

    let index = index_file(root, &path, &config.detect)?;

    if index.is_empty() {
        println!("{}", "No tests found".dimmed());
        return Ok(());
    }

    let mut entries: Vec<_> = index.into_iter().collect();
    entries.sort_by_key(|(name, range)| (range.start, name.clone()));

    for (name, range) in entries {
        println!(
            "  {} {}",
            format!("{:>5}-{:<5}", range.start, range.end).dimmed(),
            name.cyan()
        );
    }

    Ok(())
}
