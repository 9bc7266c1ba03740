//! Server-side backup strategies.
//!
//! A strategy decides which files of an incoming list need transferring or
//! deleting, where received files are stored, and which server files a
//! restore sends back. The per-file receive path is shared; strategies only
//! override the pieces that differ.

mod date_separated;
mod mirror;
mod preserve;
mod two_way;

pub use date_separated::DateSeparated;
pub use mirror::Mirror;
pub use preserve::Preserve;
pub use two_way::TwoWay;

use crate::config::BackupType;
use crate::error::SyncResult;
use crate::file_info::FileInfo;
use crate::fs_enum::{scan_tree, ScanFilter};
use crate::message::{
    FileData, FileDescriptorAck, FileEnd, FileEndAck, FileList, FileListResponse, FileSync,
    SyncEndAck,
};
use crate::protocol_core::normalize_under_root;
use crate::tracker::ChangeTracker;
use crate::transfer::{OpenFile, OpenFiles};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a strategy may touch for one session's folder.
pub struct FolderContext {
    pub root: PathBuf,
    pub dry_run: bool,
    pub filter: ScanFilter,
    pub open: OpenFiles,
    pub tracker: Option<Arc<ChangeTracker>>,
}

impl FolderContext {
    pub fn new(root: &Path, dry_run: bool, filter: ScanFilter) -> Self {
        Self {
            root: root.to_path_buf(),
            dry_run,
            filter,
            open: OpenFiles::new(),
            tracker: None,
        }
    }

    pub fn with_tracker(mut self) -> Self {
        self.tracker = Some(Arc::new(ChangeTracker::with_filter(&self.root, self.filter.clone())));
        self
    }

    /// Current contents of the folder under the session's ignore rules.
    pub fn scan(&self) -> Result<Vec<FileInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        scan_tree(&self.root, &self.filter)
    }
}

/// A file the server will send during the restore phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPush {
    /// As the client will see it.
    pub info: FileInfo,
    /// Where the bytes live on the server.
    pub source: PathBuf,
}

/// Response to a file list plus what the server will push afterwards.
#[derive(Debug, Default)]
pub struct FileListPlan {
    pub response: FileListResponse,
    pub pending: Vec<PendingPush>,
}

pub trait BackupStrategy: Send + Sync {
    fn backup_type(&self) -> BackupType;

    /// Diff the client's list against the folder.
    fn handle_file_list(&self, ctx: &FolderContext, list: &FileList) -> Result<FileListPlan>;

    /// Where an incoming file is written.
    fn storage_path(&self, ctx: &FolderContext, file: &FileInfo) -> SyncResult<PathBuf> {
        normalize_under_root(&ctx.root, &file.relative_path)
    }

    fn handle_descriptor(&self, ctx: &FolderContext, connection_id: u32, file: &FileInfo) -> FileDescriptorAck {
        match self.storage_path(ctx, file) {
            Ok(path) => ctx.open.begin(connection_id, file, path, ctx.dry_run),
            Err(e) => FileDescriptorAck::not_ready(&file.relative_path, e.to_string()),
        }
    }

    fn handle_data(&self, ctx: &FolderContext, connection_id: u32, block: &FileData) -> Result<(), String> {
        ctx.open.write(connection_id, block)
    }

    fn handle_end(
        &self,
        ctx: &FolderContext,
        connection_id: u32,
        end: &FileEnd,
        write_error: Option<String>,
    ) -> FileEndAck {
        match ctx.open.finish(connection_id, end, write_error) {
            Ok(done) => {
                self.file_written(ctx, &done);
                FileEndAck::success(&end.relative_path)
            }
            Err(reason) => FileEndAck::failure(&end.relative_path, reason),
        }
    }

    /// Hook after a file was fully received.
    fn file_written(&self, _ctx: &FolderContext, _file: &OpenFile) {}

    /// Two-way merge. Returns the first response and the files the server
    /// pushes after the client's FileSyncAck.
    fn handle_file_sync(
        &self,
        _ctx: &FolderContext,
        _sync: &FileSync,
    ) -> Result<(FileListResponse, Vec<PendingPush>)> {
        bail!("{} folders do not support two-way sync", self.backup_type())
    }

    fn handle_sync_end(&self, ctx: &FolderContext) -> SyncEndAck {
        let unfinished = ctx.open.len();
        ctx.open.clear();
        if unfinished == 0 {
            SyncEndAck {
                success: true,
                reason: String::new(),
            }
        } else {
            tracing::warn!(unfinished, "session ended with incomplete files");
            SyncEndAck {
                success: false,
                reason: format!("{} file(s) were not completed", unfinished),
            }
        }
    }
}

pub fn for_type(backup_type: BackupType) -> Arc<dyn BackupStrategy> {
    match backup_type {
        BackupType::Preserve => Arc::new(Preserve),
        BackupType::Mirror => Arc::new(Mirror),
        BackupType::DateSeparated => Arc::new(DateSeparated),
        BackupType::TwoWaySync => Arc::new(TwoWay),
    }
}

// ---- shared diff helpers ----

pub(crate) fn by_path(files: &[FileInfo]) -> HashMap<&str, &FileInfo> {
    files.iter().map(|f| (f.relative_path.as_str(), f)).collect()
}

/// Incoming entries that have no current copy in `existing`.
pub(crate) fn changed_files(incoming: &[FileInfo], existing: &HashMap<&str, &FileInfo>) -> Vec<FileInfo> {
    incoming
        .iter()
        .filter(|f| match existing.get(f.relative_path.as_str()) {
            Some(have) => !have.matches(f),
            None => true,
        })
        .cloned()
        .collect()
}

/// Restore candidates: server files the client lacks or holds a different version of.
pub(crate) fn restore_candidates(ctx: &FolderContext, server: &[FileInfo], client: &[FileInfo]) -> Vec<PendingPush> {
    let have = by_path(client);
    server
        .iter()
        .filter(|f| match have.get(f.relative_path.as_str()) {
            Some(c) => !c.matches(f),
            None => true,
        })
        .map(|f| PendingPush {
            info: FileInfo { path: None, ..f.clone() },
            source: ctx.root.join(&f.relative_path),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{TimeZone, Utc};
    use filetime::{set_file_mtime, FileTime};

    pub fn write(root: &Path, rel: &str, body: &[u8], mtime: i64) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, body).unwrap();
        set_file_mtime(&p, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    pub fn info(rel: &str, size: u64, mtime: i64) -> FileInfo {
        let t = Utc.timestamp_opt(mtime, 0).unwrap();
        FileInfo {
            path: None,
            relative_path: rel.into(),
            size,
            creation_time: t,
            modification_time: t,
            is_directory: false,
            extended_attributes: 0o644,
        }
    }

    pub fn dir(rel: &str) -> FileInfo {
        FileInfo {
            is_directory: true,
            size: 0,
            ..info(rel, 0, 0)
        }
    }

    pub fn names(files: &[FileInfo]) -> Vec<&str> {
        let mut v: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        v.sort();
        v
    }
}
