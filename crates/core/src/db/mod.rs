//! Run history database.
//!
//! A small SQLite store recording every scan and the findings it produced, so
//! results can be compared across firmware versions. Schema versions:
//! - 0: no schema
//! - 1: runs
//! - 2: findings

pub mod models;
pub mod util;

use std::path::Path;

use rusqlite::{params, Connection};
use thiserror::Error;

use crate::model::{format_address, SinkPath};

pub use models::{FindingRecord, RunRecord, RunStatus};
pub use util::{sha256_file, timestamp_now};

/// Minimum schema version we know how to handle.
///
/// `0` means "no schema yet" (fresh DB).
const MIN_SUPPORTED_SCHEMA_VERSION: i32 = 0;

/// Latest schema version this crate knows about.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The database was created with a newer schema version than we support.
    #[error(
        "Unsupported schema version {found}; supported range is {min_supported}..={max_supported}"
    )]
    UnsupportedSchemaVersion { found: i32, min_supported: i32, max_supported: i32 },
}

pub type DbResult<T> = Result<T, DbError>;

/// A stored run together with its row id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoredRun {
    pub id: i64,
    #[serde(flatten)]
    pub record: RunRecord,
}

/// Findings for the sink paths whose key resolved, one per distinct call site.
pub fn findings_for(binary: &str, paths: &[SinkPath]) -> Vec<FindingRecord> {
    let mut out: Vec<FindingRecord> = Vec::new();
    for path in paths {
        let (Some(key), Some(sink)) = (path.extracted_key.as_ref(), path.sink()) else {
            continue;
        };
        let finding = FindingRecord {
            key: key.clone(),
            sink: sink.callee_name.clone(),
            call_site: format!("{binary} {} {}", sink.callee_name, format_address(sink.address)),
            digest: path.digest().map(|d| d.callee.clone()),
        };
        if !out.iter().any(|f| f.key == finding.key && f.call_site == finding.call_site) {
            out.push(finding);
        }
    }
    out
}

/// SQLite-backed run history.
#[derive(Debug)]
pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a run database at the given path and ensure the schema exists.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        apply_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert a run and its findings atomically; returns the run's row id.
    pub fn insert_run(&mut self, run: &RunRecord, findings: &[FindingRecord]) -> DbResult<i64> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO runs (binary, facts_hash, seed_count, referenced_count, reachable_count,
                              discovered_count, status, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                run.binary,
                run.facts_hash,
                run.seed_count,
                run.referenced_count,
                run.reachable_count,
                run.discovered_count,
                run.status.as_str(),
                run.started_at,
                run.finished_at
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        for finding in findings {
            tx.execute(
                r#"
                INSERT INTO findings (run_id, key, sink, call_site, digest)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![run_id, finding.key, finding.sink, finding.call_site, finding.digest],
            )?;
        }
        tx.commit()?;
        Ok(run_id)
    }

    /// List runs, optionally filtered by binary name.
    pub fn list_runs(&self, binary: Option<&str>) -> DbResult<Vec<StoredRun>> {
        fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRun> {
            let status: String = row.get(7)?;
            Ok(StoredRun {
                id: row.get(0)?,
                record: RunRecord {
                    binary: row.get(1)?,
                    facts_hash: row.get(2)?,
                    seed_count: row.get(3)?,
                    referenced_count: row.get(4)?,
                    reachable_count: row.get(5)?,
                    discovered_count: row.get(6)?,
                    status: RunStatus::parse(&status),
                    started_at: row.get(8)?,
                    finished_at: row.get(9)?,
                },
            })
        }

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, binary, facts_hash, seed_count, referenced_count, reachable_count,
                   discovered_count, status, started_at, finished_at
            FROM runs
            WHERE (?1 IS NULL OR binary = ?1)
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![binary], map_run)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_findings(&self, run_id: i64) -> DbResult<Vec<FindingRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT key, sink, call_site, digest
            FROM findings
            WHERE run_id = ?1
            ORDER BY key, call_site
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(FindingRecord {
                key: row.get(0)?,
                sink: row.get(1)?,
                call_site: row.get(2)?,
                digest: row.get(3)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Apply schema migrations to bring the database to the latest version.
///
/// We use `PRAGMA user_version` as the schema version indicator.
fn apply_migrations(conn: &Connection) -> DbResult<()> {
    let current_version = current_schema_version(conn)?;

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            found: current_version,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            max_supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current_version < 1 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS runs (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                binary            TEXT NOT NULL,
                facts_hash        TEXT,
                seed_count        INTEGER NOT NULL,
                referenced_count  INTEGER NOT NULL,
                reachable_count   INTEGER NOT NULL,
                discovered_count  INTEGER NOT NULL,
                status            TEXT NOT NULL,
                started_at        TEXT NOT NULL,
                finished_at       TEXT NOT NULL
            );

            PRAGMA user_version = 1;
            COMMIT;
            "#,
        )?;
    }

    if current_version < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS findings (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id     INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                key        TEXT NOT NULL,
                sink       TEXT NOT NULL,
                call_site  TEXT NOT NULL,
                digest     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_findings_run ON findings(run_id);

            PRAGMA user_version = 2;
            COMMIT;
            "#,
        )?;
    }

    Ok(())
}

/// Read the SQLite schema version from `PRAGMA user_version`.
fn current_schema_version(conn: &Connection) -> DbResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}
