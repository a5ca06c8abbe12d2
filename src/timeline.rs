use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, params};

use crate::queue::EpochId;
use crate::util::{ensure_directory, now_utc_string};

const TIMELINE_SCHEMA_VERSION: &str = "0.1.0";

pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: &EpochId) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

pub struct SqliteTimeline {
    connection: Connection,
    path: PathBuf,
    run_id: String,
}

impl SqliteTimeline {
    pub fn path_for_split(eval_output_dir: &Path, split: &str) -> PathBuf {
        eval_output_dir.join(format!("timeline_{split}.sqlite"))
    }

    pub fn open(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }

        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;

        Ok(SqliteTimeline {
            connection,
            path: path.to_path_buf(),
            run_id: run_id.to_string(),
        })
    }
}

impl MetricsSink for SqliteTimeline {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: &EpochId) -> Result<()> {
        self.connection
            .execute(
                "
                INSERT INTO scalars(run_id, tag, value, epoch, epoch_label, recorded_at)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    self.run_id,
                    tag,
                    value,
                    epoch.value(),
                    epoch.label(),
                    now_utc_string()
                ],
            )
            .with_context(|| format!("failed to append scalar {tag} for epoch {epoch}"))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.connection
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))
            .with_context(|| format!("failed to checkpoint {}", self.path.display()))?;
        Ok(())
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scalars (
              scalar_id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              tag TEXT NOT NULL,
              value REAL NOT NULL,
              epoch REAL NOT NULL,
              epoch_label TEXT NOT NULL,
              recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scalars_tag_epoch ON scalars(tag, epoch);
            ",
        )
        .context("failed to initialize timeline schema")?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('timeline_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [TIMELINE_SCHEMA_VERSION],
    )?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSummary {
    pub scalar_rows: i64,
    pub distinct_epochs: i64,
    pub latest_epoch: Option<f64>,
}

pub fn summarize(path: &Path) -> Result<TimelineSummary> {
    let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", path.display()))?;

    Ok(TimelineSummary {
        scalar_rows: query_count(&connection, "SELECT COUNT(*) FROM scalars")?,
        distinct_epochs: query_count(&connection, "SELECT COUNT(DISTINCT epoch) FROM scalars")?,
        latest_epoch: connection
            .query_row("SELECT MAX(epoch) FROM scalars", [], |row| row.get(0))
            .context("failed to query latest epoch")?,
    })
}

#[cfg(test)]
pub fn scalar_series(path: &Path, tag: &str) -> Result<Vec<(f64, f64)>> {
    let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut statement = connection.prepare(
        "SELECT epoch, value FROM scalars WHERE tag = ?1 ORDER BY epoch ASC, scalar_id ASC",
    )?;

    let mut rows = statement.query([tag])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push((row.get(0)?, row.get(1)?));
    }
    Ok(out)
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    let count = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
