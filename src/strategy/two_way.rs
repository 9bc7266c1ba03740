use super::{BackupStrategy, FileListPlan, FolderContext, PendingPush};
use crate::config::BackupType;
use crate::fs_enum::remove_relative;
use crate::message::{FileList, FileListResponse, FileSync};
use crate::log::{ConflictLog, ConflictRecord, Side};
use crate::transfer::OpenFile;
use anyhow::{anyhow, bail, Result};

/// Bidirectional sync driven by the operation logs on both sides.
pub struct TwoWay;

impl BackupStrategy for TwoWay {
    fn backup_type(&self) -> BackupType {
        BackupType::TwoWaySync
    }

    fn handle_file_list(&self, _ctx: &FolderContext, _list: &FileList) -> Result<FileListPlan> {
        bail!("two-way folders are synchronized with FileSync, not a file list")
    }

    fn file_written(&self, ctx: &FolderContext, file: &OpenFile) {
        if ctx.dry_run {
            return;
        }
        if let Some(tracker) = &ctx.tracker {
            if let Err(e) = tracker.record_received(&file.info, file.existed) {
                tracing::warn!(path = %file.info.relative_path, error = %e, "could not record received file");
            }
        }
    }

    /// Merge the client's log with ours. The first response tells the
    /// client what to push and what to delete; what we push is returned
    /// separately and sent after FileSyncAck.
    fn handle_file_sync(
        &self,
        ctx: &FolderContext,
        sync: &FileSync,
    ) -> Result<(FileListResponse, Vec<PendingPush>)> {
        let tracker = ctx
            .tracker
            .as_ref()
            .ok_or_else(|| anyhow!("session has no change tracker"))?;
        if !ctx.root.exists() {
            std::fs::create_dir_all(&ctx.root)?;
        }
        let local_changes = tracker.analyze()?;
        let plan = tracker.compare(&sync.changes)?;
        tracing::info!(
            local_changes = local_changes.len(),
            remote_entries = sync.changes.len(),
            to_client = plan.push.len(),
            from_client = plan.pull.len(),
            delete_here = plan.delete_local.len(),
            delete_there = plan.delete_remote.len(),
            conflicts = plan.conflicts.len(),
            "two-way merge"
        );

        if !ctx.dry_run {
            for rel in &plan.delete_local {
                match remove_relative(&ctx.root, rel) {
                    Ok(_) => tracker.record_deleted(rel)?,
                    Err(e) => tracing::warn!(path = %rel, error = %e, "could not delete"),
                }
            }
            let records: Vec<ConflictRecord> = plan
                .conflicts
                .iter()
                .map(|c| ConflictRecord::new(c, Side::Server))
                .collect();
            ConflictLog::new(&ctx.root).append(&records)?;
        }

        let mut pending = Vec::with_capacity(plan.push.len());
        for entry in &plan.push {
            match tracker.describe(&entry.relative_path) {
                Ok(mut info) => {
                    info.path = None;
                    pending.push(PendingPush {
                        info,
                        source: ctx.root.join(&entry.relative_path),
                    });
                }
                Err(e) => tracing::warn!(path = %entry.relative_path, error = %e, "file vanished before push"),
            }
        }

        let response = FileListResponse {
            files_to_transfer: plan.pull.iter().map(|e| e.to_file_info()).collect(),
            files_to_delete: plan.delete_remote.clone(),
            conflicts: plan.conflicts.iter().map(|c| c.relative_path.clone()).collect(),
            is_backup: true,
        };
        Ok((response, pending))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::fs_enum::ScanFilter;
    use crate::tracker::{ChangeTracker, LogEntry, Operation};
    use chrono::{TimeZone, Utc};

    fn remote(path: &str, op: Operation, created: i64, modified: i64, size: u64) -> LogEntry {
        LogEntry {
            run_start: Utc.timestamp_opt(modified, 0).unwrap(),
            creation_time: Utc.timestamp_opt(created, 0).unwrap(),
            modification_time: Utc.timestamp_opt(modified, 0).unwrap(),
            size,
            operation: op,
            relative_path: path.into(),
        }
    }

    #[test]
    fn test_merge_splits_work_between_sides() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "server-only.txt", b"s", 1000);
        write(tmp.path(), "gone-on-client.txt", b"g", 1000);
        let ctx = FolderContext::new(tmp.path(), false, ScanFilter::default()).with_tracker();
        // Seed the server log so the client's tombstone is comparable
        let tracker = ctx.tracker.clone().unwrap();
        tracker.analyze().unwrap();

        let sync = FileSync {
            changes: vec![
                remote("client-only.txt", Operation::Create, 500, 500, 4),
                remote("gone-on-client.txt", Operation::Delete, 900, 900, 0),
            ],
            last_update: None,
        };
        let (response, pending) = TwoWay.handle_file_sync(&ctx, &sync).unwrap();

        assert_eq!(names(&response.files_to_transfer), vec!["client-only.txt"]);
        assert!(response.files_to_delete.is_empty());
        assert!(response.conflicts.is_empty());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].info.relative_path, "server-only.txt");
        assert!(!tmp.path().join("gone-on-client.txt").exists());

        let again = ChangeTracker::new(tmp.path()).analyze().unwrap();
        assert!(again.is_empty(), "deletion should already be logged: {:?}", again);
    }

    #[test]
    fn test_conflict_is_logged_and_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "shared.txt", b"server", 1000);
        let ctx = FolderContext::new(tmp.path(), false, ScanFilter::default()).with_tracker();
        ctx.tracker.as_ref().unwrap().analyze().unwrap();

        // Remote creation time can never equal a fresh local one at epoch 1
        let sync = FileSync {
            changes: vec![remote("shared.txt", Operation::Create, 1, 3000, 6)],
            last_update: None,
        };
        let (response, pending) = TwoWay.handle_file_sync(&ctx, &sync).unwrap();
        assert_eq!(response.conflicts, vec!["shared.txt"]);
        assert!(response.files_to_transfer.is_empty());
        assert!(pending.is_empty());
        assert_eq!(std::fs::read(tmp.path().join("shared.txt")).unwrap(), b"server");
        let log = ConflictLog::new(tmp.path()).read_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].relative_path, "shared.txt");
    }

    #[test]
    fn test_plain_file_list_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = FolderContext::new(tmp.path(), false, ScanFilter::default()).with_tracker();
        let list = FileList { files: vec![], is_backup: true };
        assert!(TwoWay.handle_file_list(&ctx, &list).is_err());
    }
}
