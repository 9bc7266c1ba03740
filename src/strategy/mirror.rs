use super::{by_path, changed_files, restore_candidates, BackupStrategy, FileListPlan, FolderContext};
use crate::config::BackupType;
use crate::fs_enum::remove_relatives;
use crate::message::{FileList, FileListResponse};
use anyhow::Result;
use std::collections::HashSet;

/// Make the destination an exact copy of the source.
///
/// On backup the server deletes its extras itself and reports them in
/// `files_to_delete`. On restore the extras are on the client, which
/// deletes what the response names.
pub struct Mirror;

impl BackupStrategy for Mirror {
    fn backup_type(&self) -> BackupType {
        BackupType::Mirror
    }

    fn handle_file_list(&self, ctx: &FolderContext, list: &FileList) -> Result<FileListPlan> {
        let existing = ctx.scan()?;

        if list.is_backup {
            let incoming: HashSet<&str> = list.files.iter().map(|f| f.relative_path.as_str()).collect();
            let mut extras: Vec<String> = existing
                .iter()
                .filter(|f| !incoming.contains(f.relative_path.as_str()))
                .map(|f| f.relative_path.clone())
                .collect();
            extras.sort();
            // A file replaced by a directory (or the reverse) goes too
            let have = by_path(&existing);
            for f in &list.files {
                if let Some(h) = have.get(f.relative_path.as_str()) {
                    if h.is_directory != f.is_directory {
                        extras.push(f.relative_path.clone());
                    }
                }
            }

            if !ctx.dry_run {
                let removed = remove_relatives(&ctx.root, &extras);
                tracing::info!(removed, root = %ctx.root.display(), "mirror removed extras");
            }
            let after = if ctx.dry_run { existing } else { ctx.scan()? };
            let files_to_transfer = changed_files(&list.files, &by_path(&after));
            return Ok(FileListPlan {
                response: FileListResponse {
                    files_to_transfer,
                    files_to_delete: extras,
                    is_backup: true,
                    ..Default::default()
                },
                pending: Vec::new(),
            });
        }

        let on_server: HashSet<&str> = existing.iter().map(|f| f.relative_path.as_str()).collect();
        let mut files_to_delete: Vec<String> = list
            .files
            .iter()
            .filter(|f| !on_server.contains(f.relative_path.as_str()))
            .map(|f| f.relative_path.clone())
            .collect();
        files_to_delete.sort();
        let pending = restore_candidates(ctx, &existing, &list.files);
        Ok(FileListPlan {
            response: FileListResponse {
                files_to_transfer: pending.iter().map(|p| p.info.clone()).collect(),
                files_to_delete,
                is_backup: false,
                ..Default::default()
            },
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::fs_enum::ScanFilter;

    #[test]
    fn test_backup_deletes_stale_target_files() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "keep.txt", b"k", 1000);
        write(tmp.path(), "stale.txt", b"s", 1000);
        write(tmp.path(), "old/deep.txt", b"d", 1000);
        let ctx = FolderContext::new(tmp.path(), false, ScanFilter::default());

        let list = FileList {
            files: vec![info("keep.txt", 1, 1000), info("fresh.txt", 2, 1000)],
            is_backup: true,
        };
        let plan = Mirror.handle_file_list(&ctx, &list).unwrap();
        assert_eq!(plan.response.files_to_delete, vec!["old", "old/deep.txt", "stale.txt"]);
        assert_eq!(names(&plan.response.files_to_transfer), vec!["fresh.txt"]);
        assert!(!tmp.path().join("stale.txt").exists());
        assert!(!tmp.path().join("old").exists());
        assert!(tmp.path().join("keep.txt").exists());
    }

    #[test]
    fn test_dry_run_backup_deletes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "stale.txt", b"s", 1000);
        let ctx = FolderContext::new(tmp.path(), true, ScanFilter::default());
        let list = FileList { files: vec![], is_backup: true };
        let plan = Mirror.handle_file_list(&ctx, &list).unwrap();
        assert_eq!(plan.response.files_to_delete, vec!["stale.txt"]);
        assert!(tmp.path().join("stale.txt").exists());
    }

    #[test]
    fn test_ignored_target_files_survive() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "cache.tmp", b"c", 1000);
        let filter = ScanFilter::new(false, false, &["*.tmp".into()]).unwrap();
        let ctx = FolderContext::new(tmp.path(), false, filter);
        let list = FileList { files: vec![], is_backup: true };
        let plan = Mirror.handle_file_list(&ctx, &list).unwrap();
        assert!(plan.response.files_to_delete.is_empty());
        assert!(tmp.path().join("cache.tmp").exists());
    }

    #[test]
    fn test_restore_names_client_extras() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", b"a", 1000);
        let ctx = FolderContext::new(tmp.path(), false, ScanFilter::default());
        let list = FileList {
            files: vec![info("a.txt", 1, 1000), info("mine.txt", 3, 5)],
            is_backup: false,
        };
        let plan = Mirror.handle_file_list(&ctx, &list).unwrap();
        assert_eq!(plan.response.files_to_delete, vec!["mine.txt"]);
        assert!(plan.response.files_to_transfer.is_empty());
    }
}
