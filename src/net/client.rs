//! Client side of a job: handshake, then a backup, restore or two-way flow,
//! then the end-of-sync exchange.

use super::connect;
use crate::config::BackupType;
use crate::connection::{spawn_keep_alive, Connection};
use crate::error::SyncError;
use crate::file_info::FileInfo;
use crate::fs_enum::{remove_relative, remove_relatives, scan_tree, ScanFilter};
use crate::log::{ConflictLog, ConflictRecord, Side};
use crate::logger::Logger;
use crate::message::{
    Connect, ConnectResponse, FileData, FileDescriptorAck, FileEnd, FileEndAck, FileList,
    FileListResponse, FileSync, FileSyncAck, MessageRegistry, StartRestore, StartRestoreAck,
    SyncEnd, SyncEndAck,
};
use crate::orchestrator::{receive_all, AbortFlag, Orchestrator, TransferReport};
use crate::protocol::timeouts::KEEP_ALIVE_MS;
use crate::protocol::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT, MAIN_CONNECTION_ID};
use crate::protocol_core::normalize_under_root;
use crate::tracker::ChangeTracker;
use crate::transfer::{send_file, CycleOutcome, DiskTarget, ReceiveTarget, SendOptions};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Direction {
    /// Local folder to server
    Backup,
    /// Server to local folder
    Restore,
    /// Two-way sync against a two-way folder
    Sync,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Backup => "backup",
            Direction::Restore => "restore",
            Direction::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobParams {
    pub source: PathBuf,
    pub host: String,
    pub port: u16,
    pub folder: String,
    pub username: String,
    pub password: String,
    pub direction: Direction,
    pub dry_run: bool,
    pub max_connections: usize,
    pub max_packet_size: usize,
    pub ignore_hidden: bool,
    pub ignore_system: bool,
    pub ignored_patterns: Vec<String>,
    /// Refuse to run unless the folder has this backup type.
    pub expected_backup_type: Option<BackupType>,
    pub keep_alive: Duration,
    /// Compact the local operation log after a successful two-way run.
    pub compact_log: bool,
}

impl JobParams {
    pub fn new(source: impl Into<PathBuf>, host: &str, folder: &str, direction: Direction) -> Self {
        Self {
            source: source.into(),
            host: host.to_string(),
            port: DEFAULT_PORT,
            folder: folder.to_string(),
            username: String::new(),
            password: String::new(),
            direction,
            dry_run: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            ignore_hidden: false,
            ignore_system: false,
            ignored_patterns: Vec::new(),
            expected_backup_type: None,
            keep_alive: Duration::from_millis(KEEP_ALIVE_MS),
            compact_log: false,
        }
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    fn remote(&self) -> String {
        format!("vault://{}:{}/{}", self.host, self.port, self.folder)
    }
}

#[derive(Debug, Default, Clone)]
pub struct JobSummary {
    pub sent: usize,
    pub received: usize,
    pub deleted: usize,
    pub not_ready: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub conflicts: Vec<String>,
    pub bytes: u64,
    pub elapsed: Duration,
    pub problems: Vec<(String, String)>,
    /// Reason the server gave when its SyncEndAck reported failure.
    pub end_reason: Option<String>,
}

impl JobSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.end_reason.is_none()
    }

    fn absorb(&mut self, report: TransferReport, sent: bool) {
        if sent {
            self.sent += report.transferred;
        } else {
            self.received += report.transferred;
        }
        self.bytes += report.bytes;
        self.not_ready += report.not_ready;
        self.failed += report.failed;
        self.cancelled += report.cancelled;
        self.problems.extend(report.problems);
    }
}

/// Why a job must not run against a folder of `actual` type, if it must not.
pub fn backup_type_conflict(direction: Direction, expected: Option<BackupType>, actual: BackupType) -> Option<String> {
    if let Some(expected) = expected {
        if expected != actual {
            return Some(format!("folder is {} but {} was expected", actual, expected));
        }
    }
    match (direction, actual) {
        (Direction::Sync, BackupType::TwoWaySync) => None,
        (Direction::Sync, other) => Some(format!("folder is {}; two-way sync needs a two-way folder", other)),
        (_, BackupType::TwoWaySync) => Some("folder is two-way; run it with --direction sync".to_string()),
        _ => None,
    }
}

/// Run one job against the server and report what happened. Errors mean
/// the job as a whole failed; per-file problems land in the summary.
pub async fn run_job(params: &JobParams, logger: Arc<dyn Logger>, abort: AbortFlag) -> Result<JobSummary> {
    let started = Instant::now();
    let registry = Arc::new(MessageRegistry::standard()?);
    let stream = connect(&params.host, params.port).await?;
    let mut main = Connection::new(
        stream,
        registry.clone(),
        MAIN_CONNECTION_ID,
        Uuid::nil(),
        params.max_packet_size,
    );

    let host_name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    main.send(Connect {
        username: params.username.clone(),
        password: params.password.clone(),
        folder: params.folder.clone(),
        max_packet_size: params.max_packet_size as u32,
        max_connections: params.max_connections as u32,
        dry_run: params.dry_run,
        host_name,
        ignore_hidden: params.ignore_hidden,
        ignore_system: params.ignore_system,
        ignored_patterns: params.ignored_patterns.clone(),
    })
    .await?;
    let response: ConnectResponse = main.expect("connect response").await?;
    if !response.accepted {
        main.close().await;
        return Err(SyncError::Rejected(response.reason).into());
    }
    main.set_session_id(response.session_id);
    main.set_max_packet_size(response.max_packet_size as usize);
    tracing::info!(
        session = %response.session_id,
        backup_type = %response.backup_type,
        max_packet_size = response.max_packet_size,
        max_connections = response.max_connections,
        "connected"
    );

    if let Some(reason) = backup_type_conflict(params.direction, params.expected_backup_type, response.backup_type) {
        if let Err(e) = end_session(&mut main).await {
            tracing::debug!(error = %e, "ending refused session");
        }
        main.close().await;
        bail!("{}", reason);
    }

    let job = Job {
        params,
        registry,
        session_id: response.session_id,
        max_packet_size: response.max_packet_size as usize,
        max_connections: (response.max_connections as usize).max(1),
        filter: ScanFilter::new(
            response.ignore_hidden,
            response.ignore_system,
            &response.ignored_patterns,
        )?,
        logger: logger.clone(),
        abort: abort.clone(),
    };

    logger.start(params.direction.as_str(), &params.source, &params.remote());
    let interval = params.keep_alive.max(Duration::from_millis(10));
    let keep_alive = spawn_keep_alive(main.sender(), interval, abort.clone());
    let mut summary = JobSummary::default();
    let flow = match params.direction {
        Direction::Backup => job.backup(&mut main, &mut summary).await,
        Direction::Restore => job.restore(&mut main, &mut summary).await,
        Direction::Sync => job.sync(&mut main, &mut summary).await,
    };
    keep_alive.abort();

    if let Err(e) = flow {
        // Unblock anything the server is still waiting on
        main.close().await;
        logger.error(params.direction.as_str(), &params.folder, &format!("{:#}", e));
        return Err(e);
    }
    if abort.is_aborted() {
        main.close().await;
        return Err(SyncError::Cancelled.into());
    }

    let ack = end_session(&mut main).await;
    main.close().await;
    let ack = ack.context("ending session")?;
    if !ack.success {
        summary.end_reason = Some(ack.reason);
    }
    summary.elapsed = started.elapsed();
    logger.done(
        (summary.sent + summary.received) as u64,
        summary.bytes,
        summary.elapsed.as_secs_f64(),
    );
    Ok(summary)
}

async fn end_session(main: &mut Connection) -> Result<SyncEndAck, SyncError> {
    main.send(SyncEnd).await?;
    main.expect::<SyncEndAck>("sync end ack").await
}

struct Job<'a> {
    params: &'a JobParams,
    registry: Arc<MessageRegistry>,
    session_id: Uuid,
    max_packet_size: usize,
    max_connections: usize,
    filter: ScanFilter,
    logger: Arc<dyn Logger>,
    abort: AbortFlag,
}

impl Job<'_> {
    fn root(&self) -> &std::path::Path {
        &self.params.source
    }

    async fn open_auxiliary(&self, count: usize) -> Result<Vec<Connection>> {
        let mut conns = Vec::with_capacity(count);
        for id in 1..=count as u32 {
            let stream = connect(&self.params.host, self.params.port).await?;
            conns.push(Connection::new(
                stream,
                self.registry.clone(),
                id,
                self.session_id,
                self.max_packet_size,
            ));
        }
        Ok(conns)
    }

    fn connections_for(&self, files: usize) -> usize {
        self.max_connections.min(files).max(1)
    }

    /// Send `files` from the local root over fresh auxiliary connections.
    async fn push(&self, files: Vec<FileInfo>, summary: &mut JobSummary) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let conns = self.open_auxiliary(self.connections_for(files.len())).await?;
        let opts = SendOptions {
            block_size: self.max_packet_size,
            dry_run: self.params.dry_run,
        };
        let root = Arc::new(self.root().to_path_buf());
        let logger = self.logger.clone();
        let orchestrator = Orchestrator::new(conns, self.abort.clone());
        let report = orchestrator
            .run(files, move |mut conn: Connection, file: FileInfo| {
                let root = root.clone();
                let logger = logger.clone();
                async move {
                    let result = match normalize_under_root(&root, &file.relative_path) {
                        Ok(source) => send_file(&mut conn, &file, &source, opts).await,
                        Err(e) => Ok(CycleOutcome::Failed(e.to_string())),
                    };
                    match &result {
                        Ok(CycleOutcome::Transferred { bytes }) => logger.file_sent(&file.relative_path, *bytes),
                        Ok(CycleOutcome::NotReady(reason)) | Ok(CycleOutcome::Failed(reason)) => {
                            logger.error("send", &file.relative_path, reason)
                        }
                        Err(e) => logger.error("send", &file.relative_path, &e.to_string()),
                    }
                    (conn, result)
                }
            })
            .await;
        for conn in orchestrator.into_connections() {
            conn.close().await;
        }
        tracing::info!(
            sent = report.transferred,
            bytes = report.bytes,
            not_ready = report.not_ready,
            failed = report.failed,
            "push finished"
        );
        summary.absorb(report, true);
        Ok(())
    }

    /// Register auxiliary connections for a server push, start it on the
    /// main connection and write what arrives through `target`.
    async fn pull<T>(&self, main: &mut Connection, files: &[FileInfo], target: T, summary: &mut JobSummary) -> Result<()>
    where
        T: ReceiveTarget + 'static,
    {
        if files.is_empty() {
            return Ok(());
        }
        let mut conns = self.open_auxiliary(self.connections_for(files.len())).await?;
        for conn in conns.iter_mut() {
            conn.send(StartRestore).await?;
            conn.expect::<StartRestoreAck>("start restore ack").await?;
        }
        main.send(StartRestore).await?;
        main.expect::<StartRestoreAck>("start restore ack").await?;

        let target = Arc::new(Reporting {
            inner: target,
            logger: self.logger.clone(),
        });
        let report = receive_all(conns, target, files.len(), self.abort.clone()).await;
        tracing::info!(
            received = report.transferred,
            bytes = report.bytes,
            not_ready = report.not_ready,
            failed = report.failed,
            "pull finished"
        );
        summary.absorb(report, false);
        Ok(())
    }

    async fn backup(&self, main: &mut Connection, summary: &mut JobSummary) -> Result<()> {
        if !self.root().is_dir() {
            bail!("source {} is not a directory", self.root().display());
        }
        let files = scan_tree(self.root(), &self.filter)?;
        tracing::info!(files = files.len(), root = %self.root().display(), "scanned source");
        main.send(FileList { files, is_backup: true }).await?;
        let response: FileListResponse = main.expect("file list response").await?;
        for rel in &response.files_to_delete {
            self.logger.delete(rel);
        }
        summary.deleted += response.files_to_delete.len();
        self.push(response.files_to_transfer, summary).await
    }

    async fn restore(&self, main: &mut Connection, summary: &mut JobSummary) -> Result<()> {
        let dry_run = self.params.dry_run;
        if !self.root().exists() && !dry_run {
            std::fs::create_dir_all(self.root())
                .with_context(|| format!("create {}", self.root().display()))?;
        }
        let files = if self.root().exists() {
            scan_tree(self.root(), &self.filter)?
        } else {
            Vec::new()
        };
        main.send(FileList { files, is_backup: false }).await?;
        let response: FileListResponse = main.expect("file list response").await?;

        if !response.files_to_delete.is_empty() {
            let removed = if dry_run {
                response.files_to_delete.len()
            } else {
                remove_relatives(self.root(), &response.files_to_delete)
            };
            for rel in &response.files_to_delete {
                self.logger.delete(rel);
            }
            summary.deleted += removed;
        }

        let target = DiskTarget::new(self.root(), dry_run).expecting(&response.files_to_transfer);
        self.pull(main, &response.files_to_transfer, target, summary).await
    }

    async fn sync(&self, main: &mut Connection, summary: &mut JobSummary) -> Result<()> {
        let dry_run = self.params.dry_run;
        if !self.root().exists() {
            std::fs::create_dir_all(self.root())
                .with_context(|| format!("create {}", self.root().display()))?;
        }
        let tracker = Arc::new(ChangeTracker::with_filter(self.root(), self.filter.clone()));
        let last_update = tracker.last_update()?;
        let local_changes = tracker.analyze()?;
        let changes = tracker.snapshot_for_peer()?;
        tracing::info!(local_changes = local_changes.len(), entries = changes.len(), "sending change log");
        main.send(FileSync { changes, last_update }).await?;
        let first: FileListResponse = main.expect("file sync response").await?;

        if !first.conflicts.is_empty() {
            let latest = tracker.latest()?;
            let records: Vec<ConflictRecord> = first
                .conflicts
                .iter()
                .map(|rel| ConflictRecord::reported(rel, latest.get(rel), Side::Client))
                .collect();
            if !dry_run {
                ConflictLog::new(self.root()).append(&records)?;
            }
            for rel in &first.conflicts {
                tracing::warn!(path = %rel, "conflict left for manual resolution");
                self.logger.conflict(rel);
            }
            summary.conflicts.extend(first.conflicts.iter().cloned());
        }

        for rel in &first.files_to_delete {
            if !dry_run {
                if let Err(e) = remove_relative(self.root(), rel) {
                    self.logger.error("delete", rel, &format!("{:#}", e));
                    continue;
                }
                tracker.record_deleted(rel)?;
            }
            self.logger.delete(rel);
            summary.deleted += 1;
        }

        // Logical creation times so both logs agree after the transfer
        let mut outgoing = Vec::with_capacity(first.files_to_transfer.len());
        for f in &first.files_to_transfer {
            match tracker.describe(&f.relative_path) {
                Ok(info) => outgoing.push(FileInfo { path: None, ..info }),
                Err(e) => {
                    self.logger.error("send", &f.relative_path, &format!("{:#}", e));
                    summary.failed += 1;
                    summary.problems.push((f.relative_path.clone(), format!("{:#}", e)));
                }
            }
        }
        self.push(outgoing, summary).await?;

        main.send(FileSyncAck).await?;
        let second: FileListResponse = main.expect("server changes").await?;
        let target = DiskTarget::new(self.root(), dry_run)
            .expecting(&second.files_to_transfer)
            .recording(tracker.clone());
        self.pull(main, &second.files_to_transfer, target, summary).await?;

        if self.params.compact_log && !dry_run && !self.abort.is_aborted() {
            let kept = tracker.compact()?;
            tracing::info!(kept, "operation log compacted");
        }
        Ok(())
    }
}

/// Forwards to a receive target and reports each file to the job logger.
struct Reporting<T> {
    inner: T,
    logger: Arc<dyn Logger>,
}

impl<T: ReceiveTarget> ReceiveTarget for Reporting<T> {
    fn begin(&self, connection_id: u32, file: &FileInfo) -> FileDescriptorAck {
        let ack = self.inner.begin(connection_id, file);
        if !ack.ready {
            self.logger.error("receive", &file.relative_path, &ack.reason);
        }
        ack
    }

    fn write_block(&self, connection_id: u32, block: &FileData) -> Result<(), String> {
        self.inner.write_block(connection_id, block)
    }

    fn finish(&self, connection_id: u32, end: &FileEnd, write_error: Option<String>) -> FileEndAck {
        let ack = self.inner.finish(connection_id, end, write_error);
        if ack.success {
            self.logger.file_received(&end.relative_path, end.file.size);
        } else {
            self.logger.error("receive", &end.relative_path, &ack.reason);
        }
        ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_type_conflicts() {
        assert!(backup_type_conflict(Direction::Backup, None, BackupType::Mirror).is_none());
        assert!(backup_type_conflict(Direction::Restore, None, BackupType::DateSeparated).is_none());
        assert!(backup_type_conflict(Direction::Sync, None, BackupType::TwoWaySync).is_none());
        assert!(backup_type_conflict(Direction::Sync, None, BackupType::Preserve).is_some());
        assert!(backup_type_conflict(Direction::Backup, None, BackupType::TwoWaySync).is_some());
        assert!(backup_type_conflict(Direction::Backup, Some(BackupType::Mirror), BackupType::Preserve).is_some());
        assert!(backup_type_conflict(Direction::Backup, Some(BackupType::Mirror), BackupType::Mirror).is_none());
    }

    #[test]
    fn test_summary_success() {
        let mut s = JobSummary::default();
        assert!(s.is_success());
        s.absorb(
            TransferReport {
                transferred: 2,
                bytes: 10,
                not_ready: 1,
                problems: vec![("x".into(), "exists".into())],
                ..Default::default()
            },
            false,
        );
        assert_eq!(s.received, 2);
        assert!(s.is_success(), "not-ready files are skips, not failures");
        s.end_reason = Some("1 file(s) were not completed".into());
        assert!(!s.is_success());
    }
}
