use crate::protocol::logs;
use crate::tracker::{Conflict, LogEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Which side recorded a conflict.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

/// One side's last known state of a conflicting path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EntryState {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl From<&LogEntry> for EntryState {
    fn from(e: &LogEntry) -> Self {
        Self {
            created: e.creation_time,
            modified: e.modification_time,
            size: e.size,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub detected_at: DateTime<Utc>,
    pub recorded_by: Side,
    pub relative_path: String,
    pub local: Option<EntryState>,
    /// Only known on the side that ran the merge.
    pub remote: Option<EntryState>,
}

impl ConflictRecord {
    pub fn new(conflict: &Conflict, recorded_by: Side) -> Self {
        Self {
            detected_at: Utc::now(),
            recorded_by,
            relative_path: conflict.relative_path.clone(),
            local: Some(EntryState::from(&conflict.local)),
            remote: Some(EntryState::from(&conflict.remote)),
        }
    }

    /// A conflict reported by the peer, described with what this side knows.
    pub fn reported(relative_path: &str, local: Option<&LogEntry>, recorded_by: Side) -> Self {
        Self {
            detected_at: Utc::now(),
            recorded_by,
            relative_path: relative_path.to_string(),
            local: local.map(EntryState::from),
            remote: None,
        }
    }
}

/// Unresolved two-way conflicts, one JSON object per line.
pub struct ConflictLog {
    log_file_path: PathBuf,
}

impl ConflictLog {
    pub fn new(root: &Path) -> Self {
        ConflictLog {
            log_file_path: root.join(logs::CONFLICTS),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn append(&self, records: &[ConflictRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open conflict log file")?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<ConflictRecord>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open conflict log file for reading")?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Operation;
    use chrono::TimeZone;

    fn entry(created: i64) -> LogEntry {
        let t = Utc.timestamp_opt(created, 0).unwrap();
        LogEntry {
            run_start: t,
            creation_time: t,
            modification_time: t,
            size: 3,
            operation: Operation::Create,
            relative_path: "shared.txt".into(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ConflictLog::new(tmp.path());
        assert!(log.read_log().unwrap().is_empty());

        let c = Conflict {
            relative_path: "shared.txt".into(),
            local: entry(100),
            remote: entry(200),
        };
        log.append(&[ConflictRecord::new(&c, Side::Server)]).unwrap();
        log.append(&[ConflictRecord::reported("shared.txt", Some(&c.local), Side::Client)])
            .unwrap();

        let back = log.read_log().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].recorded_by, Side::Server);
        assert_eq!(back[0].remote.as_ref().unwrap().created.timestamp(), 200);
        assert!(back[1].remote.is_none());
        assert_eq!(back[1].local.as_ref().unwrap().size, 3);
        assert!(log.path().ends_with(logs::CONFLICTS));
    }
}
