use crate::stats::{CycleSample, RunStatistics, RunStatus};
use rusqlite::{params, Connection, Result};
use std::collections::HashMap;
use std::path::Path;

/// Opens (or creates) the run history database at the given path.
///
/// Creates the runs table and indexes if they don't already exist.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Parallel invocations append to the same file
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      TEXT NOT NULL,
            recorded    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            label       TEXT NOT NULL,
            iteration   INTEGER NOT NULL,
            status      TEXT NOT NULL,
            total_ms    REAL NOT NULL,
            initial_ms  REAL NOT NULL,
            average_ms  REAL NOT NULL,
            median_ms   REAL NOT NULL,
            min_ms      REAL NOT NULL,
            max_ms      REAL NOT NULL,
            diagnostics INTEGER,
            samples     TEXT NOT NULL,
            error       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_runs_label ON runs(label);
        CREATE INDEX IF NOT EXISTS idx_runs_run_id ON runs(run_id);",
    )?;

    Ok(conn)
}

/// Append one scenario run.
pub fn insert_run(
    conn: &Connection,
    run_id: &str,
    label: &str,
    iteration: u32,
    stats: &RunStatistics,
    error: Option<&str>,
) -> Result<i64> {
    let samples = serde_json::to_string(&stats.samples)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO runs (run_id, label, iteration, status, total_ms, initial_ms, average_ms,
                           median_ms, min_ms, max_ms, diagnostics, samples, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            run_id,
            label,
            iteration,
            stats.status.to_string(),
            stats.total_ms,
            stats.initial_ms,
            stats.average_ms,
            stats.median_ms,
            stats.min_ms,
            stats.max_ms,
            stats.diagnostics.map(|d| d as i64),
            samples,
            error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Median of medians per label over the most recent earlier invocation that
/// has a measured run for that label. Failed runs and partial runs without
/// samples have no median and are skipped, as in `Summary::from_runs`.
pub fn previous_medians(conn: &Connection, current_run_id: &str) -> Result<HashMap<String, f64>> {
    let mut stmt = conn.prepare(
        "SELECT label, run_id, median_ms
         FROM runs
         WHERE run_id != ?1 AND status != 'failed' AND samples != '[]'
         ORDER BY id DESC",
    )?;
    let rows = stmt.query_map(params![current_run_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;

    // Newest first: the first run_id seen per label is the one to compare with.
    let mut latest: HashMap<String, (String, Vec<f64>)> = HashMap::new();
    for row in rows {
        let (label, run_id, median) = row?;
        let entry = latest
            .entry(label)
            .or_insert_with(|| (run_id.clone(), Vec::new()));
        if entry.0 == run_id {
            entry.1.push(median);
        }
    }

    Ok(latest
        .into_iter()
        .map(|(label, (_, medians))| (label, crate::stats::median(&medians)))
        .collect())
}

/// A row from the runs table.
#[derive(Debug)]
pub struct HistoryRow {
    pub id: i64,
    pub run_id: String,
    pub recorded: String,
    pub label: String,
    pub iteration: u32,
    pub stats: RunStatistics,
    pub error: Option<String>,
}

/// List the most recent runs, newest first, optionally for one label.
pub fn list_runs(conn: &Connection, label: Option<&str>, last: i64) -> Result<Vec<HistoryRow>> {
    let sql = "SELECT id, run_id, recorded, label, iteration, status, total_ms, initial_ms,
                      average_ms, median_ms, min_ms, max_ms, diagnostics, samples, error
               FROM runs
               WHERE ?1 IS NULL OR label = ?1
               ORDER BY id DESC
               LIMIT ?2";
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![label, last], map_row)?;
    let runs = rows.collect::<Result<Vec<_>>>()?;
    Ok(runs)
}

fn map_row(row: &rusqlite::Row) -> Result<HistoryRow> {
    let status: String = row.get(5)?;
    let samples_json: String = row.get(13)?;
    let samples: Vec<CycleSample> = serde_json::from_str(&samples_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let diagnostics: Option<i64> = row.get(12)?;
    Ok(HistoryRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        recorded: row.get(2)?,
        label: row.get(3)?,
        iteration: row.get(4)?,
        stats: RunStatistics {
            status: parse_status(&status),
            total_ms: row.get(6)?,
            initial_ms: row.get(7)?,
            average_ms: row.get(8)?,
            median_ms: row.get(9)?,
            min_ms: row.get(10)?,
            max_ms: row.get(11)?,
            diagnostics: diagnostics.map(|d| d as u64),
            samples,
        },
        error: row.get(14)?,
    })
}

fn parse_status(s: &str) -> RunStatus {
    match s {
        "completed" => RunStatus::Completed,
        "partial" => RunStatus::Partial,
        _ => RunStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stats(median: u64) -> RunStatistics {
        RunStatistics::from_samples(
            RunStatus::Completed,
            Duration::from_secs(4),
            Duration::from_secs(1),
            vec![CycleSample::new(0, Duration::from_millis(median))],
            Some(0),
        )
    }

    fn db() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_or_create(&dir.path().join("history.db")).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        open_or_create(&path).unwrap();
        open_or_create(&path).unwrap();
    }

    #[test]
    fn test_insert_and_list_round_trip() {
        let (_dir, conn) = db();
        insert_run(&conn, "r1", "tsc/small", 0, &stats(120), None).unwrap();
        insert_run(&conn, "r1", "tsc/large", 0, &RunStatistics::failed(), Some("timed out")).unwrap();

        let rows = list_runs(&conn, None, 10).unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first.
        assert_eq!(rows[0].label, "tsc/large");
        assert_eq!(rows[0].stats.status, RunStatus::Failed);
        assert_eq!(rows[0].error.as_deref(), Some("timed out"));
        assert_eq!(rows[1].stats, stats(120));
        assert_eq!(rows[1].run_id, "r1");
        assert!(!rows[1].recorded.is_empty());
    }

    #[test]
    fn test_list_filters_by_label_and_limit() {
        let (_dir, conn) = db();
        for i in 0..5 {
            insert_run(&conn, "r1", "a/x", i, &stats(100), None).unwrap();
        }
        insert_run(&conn, "r1", "b/x", 0, &stats(100), None).unwrap();

        assert_eq!(list_runs(&conn, Some("a/x"), 3).unwrap().len(), 3);
        assert_eq!(list_runs(&conn, Some("b/x"), 10).unwrap().len(), 1);
        assert_eq!(list_runs(&conn, Some("c/x"), 10).unwrap().len(), 0);
    }

    #[test]
    fn test_previous_medians_uses_latest_earlier_run() {
        let (_dir, conn) = db();
        insert_run(&conn, "r1", "a/x", 0, &stats(500), None).unwrap();
        insert_run(&conn, "r2", "a/x", 0, &stats(100), None).unwrap();
        insert_run(&conn, "r2", "a/x", 1, &stats(300), None).unwrap();
        insert_run(&conn, "r2", "b/x", 0, &RunStatistics::failed(), Some("boom")).unwrap();
        insert_run(&conn, "r3", "a/x", 0, &stats(900), None).unwrap();

        let previous = previous_medians(&conn, "r3").unwrap();
        assert_eq!(previous.get("a/x"), Some(&200.0));
        // Failed runs never become a baseline.
        assert!(!previous.contains_key("b/x"));
    }

    #[test]
    fn test_previous_medians_skips_partial_runs_without_samples() {
        let (_dir, conn) = db();
        let empty_partial = RunStatistics::from_samples(
            RunStatus::Partial,
            Duration::from_secs(2),
            Duration::from_secs(1),
            Vec::new(),
            None,
        );
        insert_run(&conn, "r1", "a/x", 0, &stats(100), None).unwrap();
        insert_run(&conn, "r1", "a/x", 1, &stats(300), None).unwrap();
        insert_run(&conn, "r1", "a/x", 2, &empty_partial, Some("timed out")).unwrap();
        insert_run(&conn, "r2", "b/x", 0, &empty_partial, Some("timed out")).unwrap();

        let previous = previous_medians(&conn, "r3").unwrap();
        assert_eq!(previous.get("a/x"), Some(&200.0));
        assert!(!previous.contains_key("b/x"));
    }

    #[test]
    fn test_corrupt_samples_are_reported() {
        let (_dir, conn) = db();
        insert_run(&conn, "r1", "a/x", 0, &stats(100), None).unwrap();
        conn.execute("UPDATE runs SET samples = 'not json'", []).unwrap();

        let err = list_runs(&conn, None, 10).unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(13, _, _)));
    }
}
