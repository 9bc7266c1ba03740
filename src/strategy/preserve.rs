use super::{by_path, changed_files, restore_candidates, BackupStrategy, FileListPlan, FolderContext};
use crate::config::BackupType;
use crate::message::{FileList, FileListResponse};
use anyhow::Result;

/// Keep everything: new and changed files are written in place, nothing is
/// ever deleted on either side.
pub struct Preserve;

impl BackupStrategy for Preserve {
    fn backup_type(&self) -> BackupType {
        BackupType::Preserve
    }

    fn handle_file_list(&self, ctx: &FolderContext, list: &FileList) -> Result<FileListPlan> {
        let existing = ctx.scan()?;
        if list.is_backup {
            let files_to_transfer = changed_files(&list.files, &by_path(&existing));
            return Ok(FileListPlan {
                response: FileListResponse {
                    files_to_transfer,
                    is_backup: true,
                    ..Default::default()
                },
                pending: Vec::new(),
            });
        }

        let pending = restore_candidates(ctx, &existing, &list.files);
        Ok(FileListPlan {
            response: FileListResponse {
                files_to_transfer: pending.iter().map(|p| p.info.clone()).collect(),
                is_backup: false,
                ..Default::default()
            },
            pending,
        })
    }
}
