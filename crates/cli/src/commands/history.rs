use std::path::Path;

use anyhow::{Context, Result};
use keytrace_core::db::RunDb;

/// List recorded scans, optionally for one binary.
pub fn list_history_command(db_path: &Path, binary: Option<&str>, json: bool) -> Result<()> {
    let db = RunDb::open(db_path)
        .with_context(|| format!("Failed to open run database at {}", db_path.display()))?;
    let runs = db.list_runs(binary).context("Failed to list runs")?;

    if json {
        let serialized =
            serde_json::to_string_pretty(&runs).context("Failed to serialize runs to JSON")?;
        println!("{serialized}");
        return Ok(());
    }

    println!("Runs ({}):", runs.len());
    if runs.is_empty() {
        println!("  (none)");
        return Ok(());
    }
    for run in runs {
        let rec = &run.record;
        println!(
            "  - #{} {} [{}] keys={} referenced={} reachable={} discovered={} started={}",
            run.id,
            rec.binary,
            rec.status.as_str(),
            rec.seed_count,
            rec.referenced_count,
            rec.reachable_count,
            rec.discovered_count,
            rec.started_at
        );
        let findings = db
            .list_findings(run.id)
            .with_context(|| format!("Failed to list findings for run {}", run.id))?;
        for finding in findings {
            match finding.digest {
                Some(digest) => {
                    println!("      {} -> {} (via {digest})", finding.key, finding.call_site)
                }
                None => println!("      {} -> {}", finding.key, finding.call_site),
            }
        }
    }
    Ok(())
}
