use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use keytrace_core::analysis::{CancelToken, Engine, EngineError, KeywordMap, RunSummary};
use keytrace_core::db::{
    findings_for, sha256_file, timestamp_now, FindingRecord, RunDb, RunRecord, RunStatus,
};
use keytrace_core::facts::ProgramSnapshot;
use keytrace_core::model::SinkPath;
use tracing::info;

use crate::commands::load_profile;
use crate::{default_binary_name, read_keys};

/// Inputs of one `scan` invocation.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub facts: PathBuf,
    pub keys: PathBuf,
    pub report: Option<PathBuf>,
    pub keyword_map: Option<PathBuf>,
    pub binary_name: Option<String>,
    pub profile: Option<PathBuf>,
    pub db: Option<PathBuf>,
    /// Polled by the engine; `main` cancels it from the Ctrl-C handler.
    pub cancel: CancelToken,
}

/// What a finished scan produced.
#[derive(Debug)]
pub struct ScanOutcome {
    pub binary_name: String,
    pub lines: Vec<String>,
    pub summary: RunSummary,
    pub paths: Vec<SinkPath>,
    pub run_id: Option<i64>,
}

impl ScanOutcome {
    /// Report text: one line per sink path, then the summary block.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&self.summary.to_string());
        out
    }
}

/// Run the scan and persist its outputs, without printing.
pub fn run_scan(opts: &ScanOptions) -> Result<ScanOutcome> {
    let started_at = timestamp_now();
    let profile = load_profile(opts.profile.as_deref())?;
    let keys = read_keys(&opts.keys)?;
    let snapshot = ProgramSnapshot::load(&opts.facts)
        .with_context(|| format!("Failed to load program facts: {}", opts.facts.display()))?;
    let binary_name =
        opts.binary_name.clone().unwrap_or_else(|| default_binary_name(&opts.facts));
    let prior_map = match &opts.keyword_map {
        Some(map_path) => Some(
            KeywordMap::load(map_path)
                .with_context(|| format!("Failed to read keyword map: {}", map_path.display()))?,
        ),
        None => None,
    };

    let mut engine = Engine::new(&snapshot, profile, binary_name.as_str())
        .context("Program facts cannot drive the analysis")?
        .with_cancel_token(opts.cancel.clone());
    info!(binary = %binary_name, keys = keys.len(), "scan started");

    let summary = match engine.run(keys.iter().cloned()) {
        Ok(summary) => summary,
        Err(err) => {
            if let Some(db_path) = &opts.db {
                let status = match &err {
                    EngineError::Cancelled => RunStatus::Canceled,
                    _ => RunStatus::Failed,
                };
                let record = RunRecord {
                    binary: binary_name.clone(),
                    facts_hash: sha256_file(&opts.facts).ok(),
                    seed_count: keys.len() as i64,
                    referenced_count: 0,
                    reachable_count: 0,
                    discovered_count: 0,
                    status,
                    started_at,
                    finished_at: timestamp_now(),
                };
                record_run(db_path, &record, &[])?;
            }
            return Err(anyhow::Error::new(err).context("Scan failed"));
        }
    };

    let lines = engine.report_lines();
    let state = engine.into_state();
    let mut outcome = ScanOutcome { binary_name, lines, summary, paths: state.paths, run_id: None };

    if let Some(report_path) = &opts.report {
        write_report(report_path, &outcome.report())?;
    }

    if let Some(db_path) = &opts.db {
        let record = RunRecord {
            binary: outcome.binary_name.clone(),
            facts_hash: Some(sha256_file(&opts.facts)?),
            seed_count: outcome.summary.seed_count as i64,
            referenced_count: outcome.summary.referenced as i64,
            reachable_count: outcome.summary.reachable as i64,
            discovered_count: outcome.summary.discovered.len() as i64,
            status: RunStatus::Succeeded,
            started_at,
            finished_at: timestamp_now(),
        };
        let findings = findings_for(&outcome.binary_name, &outcome.paths);
        outcome.run_id = Some(record_run(db_path, &record, &findings)?);
    }

    if let (Some(map_path), Some(prior)) = (&opts.keyword_map, prior_map) {
        let merged = state.keyword_map.merge_over(prior);
        merged
            .save(map_path)
            .with_context(|| format!("Failed to write keyword map: {}", map_path.display()))?;
    }

    Ok(outcome)
}

/// `keytrace scan`: run, persist, and echo the report to stdout.
pub fn scan_command(opts: &ScanOptions) -> Result<()> {
    let outcome = run_scan(opts)?;
    print!("{}", outcome.report());
    if let Some(id) = outcome.run_id {
        info!(run_id = id, "run recorded");
    }
    Ok(())
}

fn write_report(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report dir: {}", parent.display()))?;
    }
    fs::write(path, body).with_context(|| format!("Failed to write report: {}", path.display()))
}

fn record_run(
    db_path: &Path,
    record: &RunRecord,
    findings: &[FindingRecord],
) -> Result<i64> {
    let mut db = RunDb::open(db_path)
        .with_context(|| format!("Failed to open run database at {}", db_path.display()))?;
    db.insert_run(record, findings).context("Failed to record run")
}
