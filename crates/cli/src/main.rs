use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use keytrace::commands::{list_history_command, print_profile_command, scan_command, ScanOptions};
use keytrace::init_tracing;
use keytrace_core::analysis::CancelToken;

/// Trace candidate configuration keys to NVRAM/environment setters in firmware binaries.
///
/// This CLI is a thin wrapper around `keytrace-core` (exposed in code as `keytrace_core`).
/// Program facts come from an external disassembler export; see `keytrace scan --help`.
#[derive(Parser, Debug)]
#[command(
    name = "keytrace",
    version,
    about = "Config-key to sink reachability analysis for firmware binaries",
    long_about = None
)]
struct Cli {
    /// Increase log verbosity on stderr (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search every candidate key for a call path into a sink function.
    ///
    /// This will:
    /// - Print one line per sink path, then a summary.
    /// - Optionally write the same text to `--report`.
    /// - Optionally merge this run's key/call-site map into `--keyword-map`.
    /// - Optionally record the run in a SQLite history database.
    Scan {
        /// Program facts snapshot (JSON) exported for the binary.
        #[arg(long)]
        facts: PathBuf,

        /// File of whitespace-separated candidate keys.
        #[arg(long)]
        keys: PathBuf,

        /// Write report lines and the summary to this file.
        #[arg(long)]
        report: Option<PathBuf>,

        /// Persisted key to call-site map, updated in place.
        #[arg(long)]
        keyword_map: Option<PathBuf>,

        /// Binary name used in call sites. Defaults to the facts file stem.
        #[arg(long)]
        binary_name: Option<String>,

        /// Analysis profile (YAML, or JSON by `.json` extension). Defaults to built-in tables.
        #[arg(long)]
        profile: Option<PathBuf>,

        /// Run history database to record this scan in.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Print the built-in analysis profile as a starting point for `--profile`.
    Profile {
        /// Emit JSON instead of YAML.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List scans recorded in a run history database.
    History {
        /// Run history database.
        #[arg(long)]
        db: PathBuf,

        /// Only show runs of this binary.
        #[arg(long)]
        binary: Option<String>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan { facts, keys, report, keyword_map, binary_name, profile, db } => {
            let cancel = CancelToken::new();
            let handle = cancel.clone();
            ctrlc::set_handler(move || {
                eprintln!("\nCancelling scan...");
                handle.cancel();
            })
            .context("Failed to set Ctrl+C handler")?;

            let opts =
                ScanOptions { facts, keys, report, keyword_map, binary_name, profile, db, cancel };
            scan_command(&opts)?
        }
        Command::Profile { json } => print_profile_command(json)?,
        Command::History { db, binary, json } => {
            list_history_command(&db, binary.as_deref(), json)?
        }
    }

    Ok(())
}
