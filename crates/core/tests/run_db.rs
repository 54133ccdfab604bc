use rusqlite::Connection;
use tempfile::tempdir;

use keytrace_core::db::{
    findings_for, DbError, FindingRecord, RunDb, RunRecord, RunStatus, CURRENT_SCHEMA_VERSION,
};
use keytrace_core::model::{DigestSite, PathStep, SinkPath};

fn run(binary: &str, status: RunStatus) -> RunRecord {
    RunRecord {
        binary: binary.into(),
        facts_hash: Some(format!("{binary}-hash")),
        seed_count: 10,
        referenced_count: 6,
        reachable_count: 2,
        discovered_count: 1,
        status,
        started_at: "t0".into(),
        finished_at: "t1".into(),
    }
}

fn finding(key: &str, call_site: &str) -> FindingRecord {
    FindingRecord {
        key: key.into(),
        sink: "nvram_set".into(),
        call_site: call_site.into(),
        digest: Some("strcpy".into()),
    }
}

#[test]
fn runs_and_findings_round_trip() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("history.db");
    let mut db = RunDb::open(&db_path).expect("open db");

    let httpd = db
        .insert_run(
            &run("httpd", RunStatus::Succeeded),
            &[
                finding("lan_ip", "httpd nvram_set 0x1014"),
                finding("dns", "httpd nvram_set 0x2000"),
            ],
        )
        .expect("insert httpd");
    db.insert_run(&run("rc", RunStatus::Canceled), &[]).expect("insert rc");

    let all = db.list_runs(None).expect("list runs");
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].record.status, RunStatus::Canceled);

    let only_httpd = db.list_runs(Some("httpd")).expect("filter runs");
    assert_eq!(only_httpd.len(), 1);
    assert_eq!(only_httpd[0].id, httpd);
    assert_eq!(only_httpd[0].record, run("httpd", RunStatus::Succeeded));

    let findings = db.list_findings(httpd).expect("findings");
    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].key, "dns");
    assert_eq!(findings[1].call_site, "httpd nvram_set 0x1014");
}

#[test]
fn reopening_keeps_history() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("history.db");
    {
        let mut db = RunDb::open(&db_path).expect("open db");
        db.insert_run(&run("httpd", RunStatus::Failed), &[]).expect("insert");
    }
    let db = RunDb::open(&db_path).expect("reopen db");
    let runs = db.list_runs(None).expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].record.status, RunStatus::Failed);

    let version: i32 = db
        .connection()
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .expect("user_version");
    assert_eq!(version, CURRENT_SCHEMA_VERSION);
}

#[test]
fn v1_database_gains_findings_table() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("history.db");
    {
        let conn = Connection::open(&db_path).expect("open raw");
        conn.execute_batch(
            r#"
            CREATE TABLE runs (
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
            "#,
        )
        .expect("v1 schema");
    }

    let mut db = RunDb::open(&db_path).expect("migrate");
    let id = db
        .insert_run(&run("httpd", RunStatus::Succeeded), &[finding("k", "httpd nvram_set 0x10")])
        .expect("insert after migration");
    assert_eq!(db.list_findings(id).expect("findings").len(), 1);
}

#[test]
fn newer_schema_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("history.db");
    {
        let conn = Connection::open(&db_path).expect("open raw");
        conn.execute_batch("PRAGMA user_version = 99;").expect("bump version");
    }

    let err = RunDb::open(&db_path).expect_err("must reject");
    assert!(matches!(err, DbError::UnsupportedSchemaVersion { found: 99, .. }));
}

#[test]
fn findings_skip_unresolved_keys_and_duplicate_sites() {
    let step = |address: u64, digest: Option<DigestSite>| PathStep {
        address,
        callee: 0x2200,
        callee_name: "nvram_set".into(),
        digest,
    };
    let path = |extracted: Option<&str>, steps: Vec<PathStep>| SinkPath {
        key: "lan_ip".into(),
        occurrence: 0x9000,
        reference: 0x1000,
        origin: "F".into(),
        steps,
        extracted_key: extracted.map(str::to_string),
    };
    let strcpy = DigestSite { address: 0x100c, callee: "strcpy".into() };
    let paths = vec![
        path(Some("lan_ipaddr"), vec![step(0x1014, Some(strcpy))]),
        path(Some("lan_ipaddr"), vec![step(0x1014, None)]),
        path(None, vec![step(0x1018, None)]),
        path(Some("lan_ipaddr"), vec![step(0x1020, None)]),
    ];

    let findings = findings_for("httpd", &paths);

    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].call_site, "httpd nvram_set 0x1014");
    assert_eq!(findings[0].digest.as_deref(), Some("strcpy"));
    assert_eq!(findings[1].call_site, "httpd nvram_set 0x1020");
    assert_eq!(findings[1].digest, None);
}
