use super::{BackupStrategy, FileListPlan, FolderContext, PendingPush};
use crate::config::BackupType;
use crate::error::SyncResult;
use crate::file_info::FileInfo;
use crate::message::{FileList, FileListResponse};
use crate::protocol_core::normalize_under_root;
use anyhow::Result;
use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::path::PathBuf;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Files are stored under `yyyy-MM-dd/<relative path>`, keyed by the
/// file's creation date in local time. Earlier copies are never replaced.
pub struct DateSeparated;

pub fn date_dir(file: &FileInfo) -> String {
    file.creation_time.with_timezone(&Local).format(DATE_FORMAT).to_string()
}

fn is_date_dir(name: &str) -> bool {
    name.len() == 10 && NaiveDate::parse_from_str(name, DATE_FORMAT).is_ok()
}

/// `2024-05-01/a/b.txt` -> `a/b.txt`. Root-level files pass through.
pub fn strip_date(relative_path: &str) -> Option<&str> {
    match relative_path.split_once('/') {
        Some((first, rest)) if is_date_dir(first) => Some(rest),
        Some(_) => Some(relative_path),
        None if is_date_dir(relative_path) => None,
        None => Some(relative_path),
    }
}

impl DateSeparated {
    /// Every stored copy of every file, grouped by its undated path.
    fn copies(existing: &[FileInfo]) -> HashMap<&str, Vec<&FileInfo>> {
        let mut map: HashMap<&str, Vec<&FileInfo>> = HashMap::new();
        for f in existing.iter().filter(|f| !f.is_directory) {
            if let Some(rel) = strip_date(&f.relative_path) {
                map.entry(rel).or_default().push(f);
            }
        }
        map
    }
}

impl BackupStrategy for DateSeparated {
    fn backup_type(&self) -> BackupType {
        BackupType::DateSeparated
    }

    fn storage_path(&self, ctx: &FolderContext, file: &FileInfo) -> SyncResult<PathBuf> {
        let dated = format!("{}/{}", date_dir(file), file.relative_path);
        normalize_under_root(&ctx.root, &dated)
    }

    fn handle_file_list(&self, ctx: &FolderContext, list: &FileList) -> Result<FileListPlan> {
        let existing = ctx.scan()?;
        let copies = Self::copies(&existing);

        if list.is_backup {
            // Directories appear implicitly under each date
            let files_to_transfer = list
                .files
                .iter()
                .filter(|f| !f.is_directory)
                .filter(|f| {
                    !copies
                        .get(f.relative_path.as_str())
                        .is_some_and(|have| have.iter().any(|c| c.matches(f)))
                })
                .cloned()
                .collect();
            return Ok(FileListPlan {
                response: FileListResponse {
                    files_to_transfer,
                    is_backup: true,
                    ..Default::default()
                },
                pending: Vec::new(),
            });
        }

        let client: HashMap<&str, &FileInfo> =
            list.files.iter().map(|f| (f.relative_path.as_str(), f)).collect();
        let mut pending: Vec<PendingPush> = Vec::new();
        for (rel, stored) in &copies {
            // Newest copy wins
            let Some(newest) = stored.iter().max_by_key(|c| c.modification_time) else {
                continue;
            };
            if client.get(rel).is_some_and(|c| c.matches(newest)) {
                continue;
            }
            pending.push(PendingPush {
                info: FileInfo {
                    path: None,
                    relative_path: rel.to_string(),
                    ..(*newest).clone()
                },
                source: ctx.root.join(&newest.relative_path),
            });
        }
        pending.sort_by(|a, b| a.info.relative_path.cmp(&b.info.relative_path));
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
