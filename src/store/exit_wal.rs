//! Append-only exit-code write-ahead log
//!
//! The background exit monitor appends a record here *before* it commits
//! the exit code to the relational store, so a daemon crash between the
//! two writes is recoverable on the next startup (§9: "write-ahead exit
//! log"). One JSON object per line, fsynced on every append. Not shared
//! across processes; the daemon is single-instance.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitWalRecord {
    pub id: String,
    pub exit_code: i32,
    pub timestamp_ns: i64,
}

pub struct ExitWal {
    path: PathBuf,
    file: Mutex<File>,
}

impl ExitWal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    /// Append one record and fsync before returning.
    pub async fn append(&self, record: &ExitWalRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| {
            crate::error::DaemonError::Internal(format!("failed to encode exit-wal record: {e}"))
        })?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read every well-formed record currently in the log. Corrupt lines
    /// are skipped with a warning, per §7 "Local recovery".
    pub fn read_all(&self) -> Result<Vec<ExitWalRecord>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExitWalRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(lineno, error = %e, "skipping corrupt exit-wal record"),
            }
        }
        Ok(records)
    }

    /// Truncate the log to empty. Called once replay has committed every
    /// recoverable record to the state store.
    pub async fn truncate(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.set_len(0)?;
        *file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(std::fs::metadata(&self.path)?.len() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_and_replays_records() {
        let dir = tempdir().unwrap();
        let wal = ExitWal::open(dir.path().join("exit-wal.log")).unwrap();

        wal.append(&ExitWalRecord { id: "a".into(), exit_code: 0, timestamp_ns: 1 })
            .await
            .unwrap();
        wal.append(&ExitWalRecord { id: "b".into(), exit_code: 137, timestamp_ns: 2 })
            .await
            .unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].exit_code, 137);
    }

    #[tokio::test]
    async fn truncate_leaves_empty_log() {
        let dir = tempdir().unwrap();
        let wal = ExitWal::open(dir.path().join("exit-wal.log")).unwrap();
        wal.append(&ExitWalRecord { id: "a".into(), exit_code: 0, timestamp_ns: 1 })
            .await
            .unwrap();

        wal.truncate().await.unwrap();
        assert!(wal.is_empty().unwrap());
        assert!(wal.read_all().unwrap().is_empty());
    }

    #[test]
    fn skips_corrupt_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exit-wal.log");
        std::fs::write(&path, "{\"id\":\"a\",\"exit_code\":0,\"timestamp_ns\":1}\nnot json\n").unwrap();

        let wal = ExitWal::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
    }
}
