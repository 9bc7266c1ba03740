//! Change tracking and conflict detection for two-way sync.
//!
//! Each synchronized root keeps an append-only operation log. `analyze`
//! diffs the tree against the state replayed from that log; `compare`
//! merges the local log with the peer's and decides, per path, which way
//! (if any) the file should move.
//!
//! Creation time in the log is logical: a MODIFY keeps the creation time
//! of the entry it follows, and files written by a transfer are recorded
//! with the sender's times.

use crate::buffer::{CodecError, WireBuffer, WireEnum};
use crate::file_info::FileInfo;
use crate::fs_enum::{scan_tree, ScanFilter};
use crate::protocol::logs;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Modify,
    Delete,
}

impl Operation {
    pub fn code(self) -> &'static str {
        match self {
            Operation::Create => "CR",
            Operation::Modify => "MO",
            Operation::Delete => "DE",
        }
    }

    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "CR" => Some(Operation::Create),
            "MO" => Some(Operation::Modify),
            "DE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl WireEnum for Operation {
    const KIND: &'static str = "operation";

    fn to_wire(&self) -> u8 {
        match self {
            Operation::Create => 0,
            Operation::Modify => 1,
            Operation::Delete => 2,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Operation::Create),
            1 => Some(Operation::Modify),
            2 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// One line of the operation log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub run_start: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub size: u64,
    pub operation: Operation,
    pub relative_path: String,
}

pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t)
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), TIME_FORMAT)
        .with_context(|| format!("bad timestamp {:?}", s))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("timestamp {:?} does not exist in local time", s))
}

impl LogEntry {
    /// `runStart|creation|modification|size|op|relativePath`
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            format_time(&self.run_start),
            format_time(&self.creation_time),
            format_time(&self.modification_time),
            self.size,
            self.operation.code(),
            self.relative_path
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.splitn(6, '|').collect();
        if parts.len() != 6 {
            bail!("expected 6 fields, found {}", parts.len());
        }
        let operation = Operation::from_code(parts[4].trim())
            .ok_or_else(|| anyhow!("unknown operation {:?}", parts[4]))?;
        if parts[5].is_empty() {
            bail!("empty path");
        }
        Ok(Self {
            run_start: parse_time(parts[0])?,
            creation_time: parse_time(parts[1])?,
            modification_time: parse_time(parts[2])?,
            size: parts[3].trim().parse().context("bad size")?,
            operation,
            relative_path: parts[5].to_string(),
        })
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// FileInfo for a file the peer will send or receive.
    pub fn to_file_info(&self) -> FileInfo {
        FileInfo {
            path: None,
            relative_path: self.relative_path.clone(),
            size: self.size,
            creation_time: self.creation_time,
            modification_time: self.modification_time,
            is_directory: false,
            extended_attributes: 0,
        }
    }

    pub fn encode(&self, buf: &mut WireBuffer) {
        buf.put_time(&self.run_start);
        buf.put_time(&self.creation_time);
        buf.put_time(&self.modification_time);
        buf.put_u64(self.size);
        buf.put_enum(&self.operation);
        buf.put_str(&self.relative_path);
    }

    pub fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            run_start: buf.get_time()?,
            creation_time: buf.get_time()?,
            modification_time: buf.get_time()?,
            size: buf.get_u64()?,
            operation: buf.get_enum()?,
            relative_path: buf.get_str()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    PushToRemote,
    PullFromRemote,
    DeleteRemote,
    DeleteLocal,
    Conflict,
    NoAction,
}

/// Decide what to do with one path given the latest entry on each side.
pub fn decide(local: Option<&LogEntry>, remote: Option<&LogEntry>) -> SyncDecision {
    use SyncDecision::*;
    match (local, remote) {
        (None, None) => NoAction,
        (Some(l), None) => {
            if l.is_delete() {
                NoAction
            } else {
                PushToRemote
            }
        }
        (None, Some(r)) => {
            if r.is_delete() {
                NoAction
            } else {
                PullFromRemote
            }
        }
        (Some(l), Some(r)) => match (l.is_delete(), r.is_delete()) {
            (true, true) => NoAction,
            (true, false) => DeleteRemote,
            (false, true) => DeleteLocal,
            (false, false) => {
                if l.creation_time.timestamp() != r.creation_time.timestamp() {
                    Conflict
                } else if l.modification_time.timestamp() > r.modification_time.timestamp() {
                    PushToRemote
                } else if l.modification_time.timestamp() < r.modification_time.timestamp() {
                    PullFromRemote
                } else if l.size == r.size {
                    NoAction
                } else {
                    Conflict
                }
            }
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub relative_path: String,
    pub local: LogEntry,
    pub remote: LogEntry,
}

/// Per-path decisions for a whole tree, sorted by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    /// Local entries of files the peer must receive.
    pub push: Vec<LogEntry>,
    /// Remote entries of files the peer must send.
    pub pull: Vec<LogEntry>,
    pub delete_local: Vec<String>,
    pub delete_remote: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

/// Merge two latest-per-path maps.
pub fn compare_maps(
    local: &HashMap<String, LogEntry>,
    remote: &HashMap<String, LogEntry>,
) -> SyncPlan {
    let paths: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut plan = SyncPlan::default();
    for path in paths {
        if logs::is_log_file(path) {
            continue;
        }
        let (l, r) = (local.get(path), remote.get(path));
        match decide(l, r) {
            SyncDecision::PushToRemote => plan.push.extend(l.cloned()),
            SyncDecision::PullFromRemote => plan.pull.extend(r.cloned()),
            SyncDecision::DeleteRemote => plan.delete_remote.push(path.clone()),
            SyncDecision::DeleteLocal => plan.delete_local.push(path.clone()),
            SyncDecision::Conflict => {
                if let (Some(l), Some(r)) = (l, r) {
                    plan.conflicts.push(Conflict {
                        relative_path: path.clone(),
                        local: l.clone(),
                        remote: r.clone(),
                    });
                }
            }
            SyncDecision::NoAction => {}
        }
    }
    plan
}

/// Keep only the most recent entry per path (last line wins).
pub fn latest_per_path(entries: impl IntoIterator<Item = LogEntry>) -> HashMap<String, LogEntry> {
    let mut map = HashMap::new();
    for e in entries {
        map.insert(e.relative_path.clone(), e);
    }
    map
}

/// Operation log and timestamps for one root.
pub struct ChangeTracker {
    root: PathBuf,
    filter: ScanFilter,
    // Serializes log writes from concurrent receivers
    lock: Mutex<()>,
}

impl ChangeTracker {
    pub fn new(root: &Path) -> Self {
        Self::with_filter(root, ScanFilter::default())
    }

    pub fn with_filter(root: &Path, filter: ScanFilter) -> Self {
        Self {
            root: root.to_path_buf(),
            filter,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Every parseable entry in file order. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path(logs::OPERATIONS);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut out = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match LogEntry::parse_line(line) {
                Ok(e) => out.push(e),
                Err(e) => tracing::warn!(line = n + 1, error = %e, "skipping bad operation log line"),
            }
        }
        Ok(out)
    }

    pub fn latest(&self) -> Result<HashMap<String, LogEntry>> {
        Ok(latest_per_path(self.entries()?))
    }

    /// Latest entry per path, sorted, as sent to the peer in FileSync.
    pub fn snapshot_for_peer(&self) -> Result<Vec<LogEntry>> {
        let mut v: Vec<LogEntry> = self.latest()?.into_values().collect();
        v.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(v)
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock();
        let path = self.log_path(logs::OPERATIONS);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut text = String::new();
        for e in entries {
            text.push_str(&e.to_line());
            text.push('\n');
        }
        f.write_all(text.as_bytes())?;
        f.flush()?;
        Ok(())
    }

    fn write_stamp(&self, name: &str, t: &DateTime<Utc>) -> Result<()> {
        let path = self.log_path(name);
        std::fs::write(&path, format_time(t)).with_context(|| format!("writing {}", path.display()))
    }

    fn read_stamp(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.log_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        parse_time(&text).map(Some)
    }

    pub fn last_update(&self) -> Result<Option<DateTime<Utc>>> {
        self.read_stamp(logs::LAST_UPDATE)
    }

    pub fn last_compaction(&self) -> Result<Option<DateTime<Utc>>> {
        self.read_stamp(logs::LAST_COMPACT)
    }

    /// Diff the tree against the replayed log, append the changes and
    /// return them sorted by path.
    pub fn analyze(&self) -> Result<Vec<LogEntry>> {
        let run_start = truncate_to_second(Utc::now());

        let current: BTreeMap<String, FileInfo> = scan_tree(&self.root, &self.filter)?
            .into_iter()
            .filter(|f| !f.is_directory)
            .map(|f| (f.relative_path.clone(), f))
            .collect();
        let previous: HashMap<String, LogEntry> = self
            .latest()?
            .into_iter()
            .filter(|(_, e)| !e.is_delete())
            .collect();

        let mut changes = Vec::new();
        for (path, fi) in &current {
            let modified = truncate_to_second(fi.modification_time);
            match previous.get(path) {
                None => changes.push(LogEntry {
                    run_start,
                    creation_time: truncate_to_second(fi.creation_time),
                    modification_time: modified,
                    size: fi.size,
                    operation: Operation::Create,
                    relative_path: path.clone(),
                }),
                Some(prev)
                    if prev.size != fi.size
                        || prev.modification_time.timestamp() != modified.timestamp() =>
                {
                    changes.push(LogEntry {
                        run_start,
                        creation_time: prev.creation_time,
                        modification_time: modified,
                        size: fi.size,
                        operation: Operation::Modify,
                        relative_path: path.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        let mut gone: Vec<&String> = previous.keys().filter(|p| !current.contains_key(*p)).collect();
        gone.sort();
        for path in gone {
            changes.push(LogEntry {
                run_start,
                creation_time: run_start,
                modification_time: run_start,
                size: 0,
                operation: Operation::Delete,
                relative_path: path.clone(),
            });
        }
        changes.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        self.append(&changes)?;
        self.write_stamp(logs::LAST_UPDATE, &run_start)?;
        tracing::debug!(root = %self.root.display(), changes = changes.len(), "analyzed tree");
        Ok(changes)
    }

    /// Merge the local log with the peer's entries.
    pub fn compare(&self, remote: &[LogEntry]) -> Result<SyncPlan> {
        let local = self.latest()?;
        let remote = latest_per_path(remote.iter().cloned());
        Ok(compare_maps(&local, &remote))
    }

    /// Record a file written by a transfer using the sender's timestamps,
    /// so the next `analyze` sees no change.
    pub fn record_received(&self, file: &FileInfo, existed: bool) -> Result<()> {
        if file.is_directory {
            return Ok(());
        }
        self.append(&[LogEntry {
            run_start: truncate_to_second(Utc::now()),
            creation_time: truncate_to_second(file.creation_time),
            modification_time: truncate_to_second(file.modification_time),
            size: file.size,
            operation: if existed { Operation::Modify } else { Operation::Create },
            relative_path: file.relative_path.clone(),
        }])
    }

    pub fn record_deleted(&self, relative_path: &str) -> Result<()> {
        let now = truncate_to_second(Utc::now());
        self.append(&[LogEntry {
            run_start: now,
            creation_time: now,
            modification_time: now,
            size: 0,
            operation: Operation::Delete,
            relative_path: relative_path.to_string(),
        }])
    }

    /// Describe a local file for sending, carrying the logical creation time.
    pub fn describe(&self, relative_path: &str) -> Result<FileInfo> {
        let mut fi = FileInfo::from_path(&self.root, &self.root.join(relative_path))?;
        if let Some(e) = self.latest()?.get(relative_path) {
            if !e.is_delete() {
                fi.creation_time = e.creation_time;
            }
        }
        Ok(fi)
    }

    /// Rewrite the log keeping the latest CREATE per path. A path that moved
    /// on after that CREATE (or never had one) also keeps its latest entry,
    /// so `latest()` and therefore `compare` give the same answer afterwards.
    /// Returns the number of entries kept.
    pub fn compact(&self) -> Result<usize> {
        let mut per_path: BTreeMap<String, (Option<LogEntry>, LogEntry)> = BTreeMap::new();
        for e in self.entries()? {
            let slot = per_path
                .entry(e.relative_path.clone())
                .or_insert_with(|| (None, e.clone()));
            if e.operation == Operation::Create {
                slot.0 = Some(e.clone());
            }
            slot.1 = e;
        }
        let mut kept: Vec<LogEntry> = Vec::new();
        for (_, (create, latest)) in per_path {
            match create {
                Some(c) if c == latest => kept.push(c),
                Some(c) => {
                    kept.push(c);
                    kept.push(latest);
                }
                None => kept.push(latest),
            }
        }

        let _guard = self.lock.lock();
        let path = self.log_path(logs::OPERATIONS);
        let tmp = self.log_path(logs::OPERATIONS_TMP);
        let mut text = String::new();
        for e in &kept {
            text.push_str(&e.to_line());
            text.push('\n');
        }
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        self.write_stamp(logs::LAST_COMPACT, &truncate_to_second(Utc::now()))?;
        Ok(kept.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(path: &str, op: Operation, created: i64, modified: i64, size: u64) -> LogEntry {
        LogEntry {
            run_start: at(modified),
            creation_time: at(created),
            modification_time: at(modified),
            size,
            operation: op,
            relative_path: path.to_string(),
        }
    }

    use Operation::{Create as CR, Delete as DE, Modify as MO};
    use SyncDecision::*;

    #[test]
    fn test_decision_table() {
        let live = entry("f", CR, 100, 200, 10);
        let dead = entry("f", DE, 100, 200, 0);

        assert_eq!(decide(Some(&live), None), PushToRemote);
        assert_eq!(decide(None, Some(&live)), PullFromRemote);
        assert_eq!(decide(Some(&dead), None), NoAction);
        assert_eq!(decide(None, Some(&dead)), NoAction);
        assert_eq!(decide(Some(&dead), Some(&dead)), NoAction);
        assert_eq!(decide(Some(&dead), Some(&live)), DeleteRemote);
        assert_eq!(decide(Some(&live), Some(&dead)), DeleteLocal);
        assert_eq!(decide(None, None), NoAction);
    }

    #[test]
    fn test_compare_local_newer_sends_to_remote() {
        let l = entry("f", MO, 100, 300, 10);
        let r = entry("f", CR, 100, 200, 10);
        assert_eq!(decide(Some(&l), Some(&r)), PushToRemote);
        assert_eq!(decide(Some(&r), Some(&l)), PullFromRemote);
    }

    #[test]
    fn test_compare_creation_differs_is_conflict_even_with_equal_mtime() {
        let l = entry("f", CR, 100, 300, 10);
        let r = entry("f", CR, 150, 300, 10);
        assert_eq!(decide(Some(&l), Some(&r)), Conflict);
        let r2 = entry("f", MO, 150, 900, 99);
        assert_eq!(decide(Some(&l), Some(&r2)), Conflict);
    }

    #[test]
    fn test_compare_same_times_different_size_is_conflict() {
        let l = entry("f", CR, 100, 300, 10);
        let r = entry("f", MO, 100, 300, 11);
        assert_eq!(decide(Some(&l), Some(&r)), Conflict);
        let same = entry("f", MO, 100, 300, 10);
        assert_eq!(decide(Some(&l), Some(&same)), NoAction);
    }

    #[test]
    fn test_delete_never_maps_to_push_or_pull() {
        for op in [CR, MO] {
            let live = entry("f", op, 1, 999_999, 5);
            let dead = entry("f", DE, 1, 1, 0);
            assert_eq!(decide(Some(&dead), Some(&live)), DeleteRemote);
            assert_eq!(decide(Some(&live), Some(&dead)), DeleteLocal);
        }
    }

    #[test]
    fn test_compare_maps_builds_sorted_plan() {
        let local = latest_per_path(vec![
            entry("b", CR, 1, 5, 1),
            entry("a", CR, 1, 5, 1),
            entry("gone", DE, 1, 5, 0),
            entry("both", CR, 1, 5, 1),
        ]);
        let remote = latest_per_path(vec![
            entry("c", CR, 1, 5, 1),
            entry("gone", CR, 1, 5, 1),
            entry("both", CR, 2, 5, 1),
        ]);
        let plan = compare_maps(&local, &remote);
        let names = |v: &[LogEntry]| v.iter().map(|e| e.relative_path.clone()).collect::<Vec<_>>();
        assert_eq!(names(&plan.push), vec!["a", "b"]);
        assert_eq!(names(&plan.pull), vec!["c"]);
        assert_eq!(plan.delete_remote, vec!["gone"]);
        assert!(plan.delete_local.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].relative_path, "both");
    }

    #[test]
    fn test_log_line_format_round_trips() {
        let e = entry("dir/with|pipe.txt", MO, 1_700_000_000, 1_700_000_500, 42);
        let line = e.to_line();
        assert_eq!(line.split('|').count(), 7);
        assert!(line.contains("|42|MO|dir/with|pipe.txt"));
        assert_eq!(LogEntry::parse_line(&line).unwrap(), e);
        assert!(LogEntry::parse_line("garbage").is_err());
        assert!(LogEntry::parse_line("a|b|c|d|XX|f").is_err());
    }

    #[test]
    fn test_analyze_twice_without_changes_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("a.txt"), b"one").unwrap();
        fs::write(tmp.path().join("d/b.txt"), b"two").unwrap();
        let t = ChangeTracker::new(tmp.path());

        let first = t.analyze().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.operation == CR));
        assert!(t.analyze().unwrap().is_empty());
        assert!(t.last_update().unwrap().is_some());
    }

    #[test]
    fn test_analyze_detects_modify_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.txt");
        fs::write(&a, b"one").unwrap();
        fs::write(tmp.path().join("b.txt"), b"two").unwrap();
        let t = ChangeTracker::new(tmp.path());
        let created = t.analyze().unwrap();
        let a_created = created.iter().find(|e| e.relative_path == "a.txt").unwrap().creation_time;

        fs::write(&a, b"one plus more").unwrap();
        set_file_mtime(&a, FileTime::from_unix_time(2_000_000_000, 0)).unwrap();
        fs::remove_file(tmp.path().join("b.txt")).unwrap();

        let changes = t.analyze().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].relative_path, "a.txt");
        assert_eq!(changes[0].operation, MO);
        assert_eq!(changes[0].creation_time, a_created);
        assert_eq!(changes[1].relative_path, "b.txt");
        assert_eq!(changes[1].operation, DE);
        assert_eq!(changes[1].size, 0);

        // A deleted path that comes back is a fresh CREATE
        fs::write(tmp.path().join("b.txt"), b"again").unwrap();
        let again = t.analyze().unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].operation, CR);
    }

    #[test]
    fn test_received_files_are_not_reported_as_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let t = ChangeTracker::new(tmp.path());
        let p = tmp.path().join("pulled.txt");
        fs::write(&p, b"data").unwrap();
        set_file_mtime(&p, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        let mut fi = FileInfo::from_path(tmp.path(), &p).unwrap();
        fi.creation_time = at(1_600_000_000);

        t.record_received(&fi, false).unwrap();
        assert!(t.analyze().unwrap().is_empty());
        assert_eq!(t.describe("pulled.txt").unwrap().creation_time, at(1_600_000_000));
    }

    #[test]
    fn test_compact_keeps_latest_create_per_path() {
        let tmp = tempfile::tempdir().unwrap();
        let t = ChangeTracker::new(tmp.path());
        t.append(&[
            entry("file1.txt", CR, 100, 100, 100),
            entry("file1.txt", CR, 100, 150, 200),
            entry("file2.txt", CR, 100, 100, 5),
            entry("file2.txt", MO, 100, 200, 6),
            entry("file2.txt", MO, 100, 300, 7),
            entry("file3.txt", CR, 400, 400, 7),
        ])
        .unwrap();

        assert_eq!(t.compact().unwrap(), 4);
        let after = t.entries().unwrap();
        let summary: Vec<(&str, Operation, u64)> = after
            .iter()
            .map(|e| (e.relative_path.as_str(), e.operation, e.size))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("file1.txt", CR, 200),
                ("file2.txt", CR, 5),
                ("file2.txt", MO, 7),
                ("file3.txt", CR, 7),
            ]
        );
        assert!(t.last_compaction().unwrap().is_some());
    }

    #[test]
    fn test_compact_does_not_change_the_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let t = ChangeTracker::new(tmp.path());
        t.append(&[
            entry("x.txt", CR, 100, 100, 5),
            entry("x.txt", DE, 300, 300, 0),
            entry("y.txt", CR, 100, 100, 5),
            entry("y.txt", MO, 100, 200, 9),
            entry("y.txt", MO, 100, 250, 10),
        ])
        .unwrap();
        let remote = vec![entry("x.txt", CR, 100, 100, 5), entry("y.txt", CR, 100, 100, 5)];

        let before = t.compare(&remote).unwrap();
        assert_eq!(before.delete_remote, vec!["x.txt"]);
        assert_eq!(before.push.len(), 1);

        t.compact().unwrap();
        assert_eq!(t.compare(&remote).unwrap(), before);
        assert!(!tmp.path().join(logs::OPERATIONS_TMP).exists());
    }

    #[test]
    fn test_log_files_never_tracked() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(logs::CONFLICTS), b"{}").unwrap();
        let t = ChangeTracker::new(tmp.path());
        let changes = t.analyze().unwrap();
        assert!(changes.is_empty());
    }
}
