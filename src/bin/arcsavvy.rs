//! # arcsavvy CLI
//!
//! Command-line front end for the arcsavvy archive library.
//!
//! ## Usage
//! ```bash
//! # Snapshot a directory into an archive
//! arcsavvy snapshot ./backup ./project
//!
//! # List snapshots
//! arcsavvy list ./backup
//!
//! # Verify every object, re-hashing content
//! arcsavvy check ./backup --deep
//!
//! # Restore the newest snapshot into a new directory
//! arcsavvy restore ./backup ./restored
//!
//! # What changed since the last snapshot
//! arcsavvy diff ./backup ./project
//! ```
//!
//! Exit status is 0 on success, 1 on error and 2 when `check` finds
//! corrupted objects.

use arcsavvy::{
    ArcsavvyError, Archiver, ArchiverBuilder, ChangeEvent, ChangeKind, DiffReport, Result,
    SnapshotId,
};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit status when a check finds corruption
const EXIT_CORRUPTION: i32 = 2;

/// arcsavvy - deduplicating directory archives
#[derive(Parser)]
#[command(name = "arcsavvy")]
#[command(version)]
#[command(about = "Snapshot, verify and restore directory trees with content deduplication")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Hashing threads (defaults to the number of CPUs)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Glob patterns to leave out of snapshots
    #[arg(short, long, global = true)]
    ignore: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot a directory
    #[command(alias = "snap")]
    Snapshot {
        /// Archive directory (created if missing)
        archive: PathBuf,
        /// Directory to snapshot
        source: PathBuf,
    },

    /// Verify the objects referenced by every snapshot
    Check {
        /// Archive directory
        archive: PathBuf,
        /// Re-hash every object instead of only testing presence
        #[arg(long)]
        deep: bool,
    },

    /// Restore a snapshot into a new directory
    #[command(alias = "rs")]
    Restore {
        /// Archive directory
        archive: PathBuf,
        /// Target directory; must not exist
        target: PathBuf,
        /// Snapshot to restore
        #[arg(short, long, default_value = "current")]
        snapshot: String,
    },

    /// List snapshots
    #[command(alias = "ls")]
    List {
        /// Archive directory
        archive: PathBuf,
        /// Show entry counts and sizes
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show changes since the last snapshot, or between two snapshots
    Diff {
        /// Archive directory
        archive: PathBuf,
        /// Directory to compare with the current snapshot
        source: Option<PathBuf>,
        /// Older snapshot
        #[arg(long, conflicts_with = "source")]
        from: Option<String>,
        /// Newer snapshot
        #[arg(long, conflicts_with = "source")]
        to: Option<String>,
        /// Include unchanged entries
        #[arg(short, long)]
        all: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(1);
        }
    }
}

/// Main command runner, returning the exit status
fn run(cli: Cli) -> Result<i32> {
    let settings = Settings {
        verbose: cli.verbose,
        workers: cli.workers,
        ignore: cli.ignore,
    };

    match cli.command {
        Commands::Snapshot { archive, source } => cmd_snapshot(&settings, &archive, &source),
        Commands::Check { archive, deep } => cmd_check(&settings, &archive, deep),
        Commands::Restore { archive, target, snapshot } => {
            cmd_restore(&settings, &archive, &target, &snapshot)
        }
        Commands::List { archive, detailed } => cmd_list(&settings, &archive, detailed),
        Commands::Diff { archive, source, from, to, all } => {
            cmd_diff(&settings, &archive, source.as_deref(), from, to, all)
        }
    }
}

/// Global options shared by every command
struct Settings {
    verbose: bool,
    workers: Option<usize>,
    ignore: Vec<String>,
}

fn open_archiver(settings: &Settings, archive: &Path) -> Result<Archiver> {
    let mut builder = ArchiverBuilder::new().ignore_patterns(settings.ignore.clone());
    if let Some(workers) = settings.workers {
        builder = builder.parallel_workers(workers);
    }
    let archiver = builder.build(archive)?;

    if settings.verbose {
        if let Ok(config) = serde_json::to_string(archiver.config()) {
            eprintln!("{} {}", "config:".dimmed(), config.dimmed());
        }
    }
    Ok(archiver)
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Take a snapshot
///
/// Only new content is stored; renamed, copied and unchanged files reuse
/// objects already in the archive.
fn cmd_snapshot(settings: &Settings, archive: &Path, source: &Path) -> Result<i32> {
    let archiver = open_archiver(settings, archive)?;

    let pb = spinner("Scanning and storing...");
    let outcome = archiver.snapshot(source);
    pb.finish_and_clear();
    let outcome = outcome?;

    println!("{} Created snapshot {}", "✓".green().bold(), outcome.id.to_string().yellow().bold());
    println!("  Entries: {}", outcome.index.len().to_string().cyan());
    println!("  Size: {}", format_bytes(outcome.index.total_size()).cyan());
    println!(
        "  Stored: {} new objects ({})",
        outcome.new_objects.to_string().cyan(),
        format_bytes(outcome.bytes_stored).cyan()
    );
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(outcome.duration_ms)).to_string().cyan()
    );

    if outcome.stats.has_changes() {
        println!("  Changes:");
        for (kind, count) in outcome.stats.iter().filter(|(k, _)| *k != ChangeKind::Unchanged) {
            println!("    {:<18} {}", kind.to_string(), count.to_string().yellow());
        }
    } else {
        println!("  {}", "No changes".dimmed());
    }

    for warning in &outcome.warnings {
        println!("{} {}", "⚠".yellow().bold(), warning);
    }
    for fault in &outcome.faults {
        println!(
            "{} {} skipped: collides with stored object {}",
            "✗".red().bold(),
            fault.path,
            &fault.hash[..12.min(fault.hash.len())]
        );
    }

    Ok(0)
}

/// Verify objects of every snapshot
fn cmd_check(settings: &Settings, archive: &Path, deep: bool) -> Result<i32> {
    let archiver = open_archiver(settings, archive)?;

    let pb = spinner(if deep { "Re-hashing objects..." } else { "Checking objects..." });
    let report = archiver.check(deep);
    pb.finish_and_clear();
    let report = report?;

    if report.snapshots.is_empty() {
        println!("{}", "No snapshots found.".yellow());
        return Ok(0);
    }

    for snapshot in &report.snapshots {
        let status = if snapshot.is_ok() { "✓".green().bold() } else { "✗".red().bold() };
        if let Some(error) = &snapshot.error {
            println!("{} {} unreadable: {}", status, snapshot.id.to_string().yellow(), error.dimmed());
            continue;
        }
        println!(
            "{} {} ({} objects)",
            status,
            snapshot.id.to_string().yellow(),
            snapshot.results.len()
        );
        for (path, result) in snapshot.corrupted() {
            println!("    {} {}", path.red(), result.to_string().dimmed());
        }
    }

    if report.is_ok() {
        println!("\n{} {} objects verified", "✓".green().bold(), report.objects_checked());
        Ok(0)
    } else {
        println!(
            "\n{} {} corrupted references found, {} snapshots unreadable",
            "✗".red().bold(),
            report.corrupted().len(),
            report.unreadable().len()
        );
        Ok(EXIT_CORRUPTION)
    }
}

/// Restore a snapshot into a fresh directory
fn cmd_restore(settings: &Settings, archive: &Path, target: &Path, snapshot: &str) -> Result<i32> {
    let archiver = open_archiver(settings, archive)?;
    let id: SnapshotId = snapshot.parse()?;

    println!("{} {}", "Restoring snapshot".blue().bold(), id.to_string().yellow());

    let pb = spinner("Restoring files...");
    let result = archiver.restore(target, &id);
    pb.finish_and_clear();
    let result = result?;

    println!("{} Restored into {}", "✓".green().bold(), target.display().to_string().cyan());
    println!("  Files: {}", result.files_restored.to_string().cyan());
    println!("  Directories: {}", result.directories_created.to_string().cyan());
    println!("  Written: {}", format_bytes(result.bytes_written).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );

    for warning in &result.warnings {
        println!("{} {}", "⚠".yellow().bold(), warning);
    }

    Ok(0)
}

/// List snapshot history
fn cmd_list(settings: &Settings, archive: &Path, detailed: bool) -> Result<i32> {
    let archiver = open_archiver(settings, archive)?;
    let ids = archiver.list()?;

    if ids.is_empty() {
        println!("{}", "No snapshots found.".yellow());
        return Ok(0);
    }

    println!("{}", "Snapshots:".blue().bold());
    let latest = archiver.snapshots().latest()?;

    for id in &ids {
        let marker = if Some(id) == latest.as_ref() || id.is_current() {
            "*".green().bold()
        } else {
            " ".normal()
        };
        let when = id
            .timestamp()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
            .unwrap_or_else(|| "alias of newest".to_string());
        print!("{} {:<28} {}", marker, id.to_string().yellow(), when.dimmed());

        if detailed {
            let index = archiver.read(id)?;
            print!(
                "  {} entries, {} objects, {}",
                index.len(),
                index.distinct_objects(),
                format_bytes(index.total_size())
            );
        }
        println!();
    }

    if detailed {
        let stats = archiver.stats()?;
        println!(
            "\n{} {} objects, {}",
            "Store:".bold(),
            stats.objects,
            format_bytes(stats.total_bytes)
        );
    }

    Ok(0)
}

/// Show changes
fn cmd_diff(
    settings: &Settings,
    archive: &Path,
    source: Option<&Path>,
    from: Option<String>,
    to: Option<String>,
    all: bool,
) -> Result<i32> {
    let archiver = open_archiver(settings, archive)?;

    let report = match (source, to) {
        (Some(source), _) => archiver.diff(source)?,
        (None, Some(to)) => {
            let from: SnapshotId = from.as_deref().unwrap_or("current").parse()?;
            let to: SnapshotId = to.parse()?;
            archiver.diff_snapshots(&from, &to)?
        }
        (None, None) => {
            return Err(ArcsavvyError::InvalidConfiguration(
                "diff needs a source directory or --to <snapshot>".to_string(),
            ))
        }
    };

    print_diff(&report, all);
    Ok(0)
}

fn print_diff(report: &DiffReport, all: bool) {
    if !report.has_changes() && !all {
        println!("{}", "No changes.".green());
        return;
    }

    for event in &report.events {
        let line = match event {
            ChangeEvent::New(e) => format!("+ {}", e.path).green(),
            ChangeEvent::Renamed { from, to } => format!("→ {} -> {}", from.path, to.path).cyan(),
            ChangeEvent::Copied { from, to } => format!("⧉ {} -> {}", from.path, to.path).cyan(),
            ChangeEvent::Modified { to, .. } => format!("~ {}", to.path).yellow(),
            ChangeEvent::ModifiedSharedInstance { to, .. } => {
                format!("~ {} (shared content)", to.path).yellow()
            }
            ChangeEvent::ModeChanged { from, to } => {
                format!("m {} ({:o} -> {:o})", to.path, from.mode, to.mode).yellow()
            }
            ChangeEvent::Unchanged { to, .. } if all => format!("  {}", to.path).dimmed(),
            ChangeEvent::Unchanged { .. } => continue,
            ChangeEvent::Deleted(e) => format!("- {}", e.path).red(),
            ChangeEvent::DeletedSharedInstance(e) => format!("- {} (content kept elsewhere)", e.path).red(),
        };
        println!("{}", line);
    }

    println!();
    for (kind, count) in report.stats.iter() {
        println!("  {:<18} {}", kind.to_string(), count);
    }
    for warning in &report.warnings {
        println!("{} {}", "⚠".yellow().bold(), warning);
    }
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
