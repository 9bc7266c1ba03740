use crate::file_info::{attr, FileInfo};
use crate::protocol::{logs, PARTIAL_PREFIX};
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use crate::protocol_core::normalize_under_root;
use std::path::Path;
// Tree enumeration with ignore rules (hidden, system, patterns)

/// Ignore rules negotiated for a session.
///
/// Patterns are globs matched against both the relative path and the file
/// name. A pattern starting with `@` is a regular expression instead.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    pub ignore_hidden: bool,
    pub ignore_system: bool,
    globs: GlobSet,
    regexes: Vec<Regex>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            ignore_hidden: false,
            ignore_system: false,
            globs: GlobSet::empty(),
            regexes: Vec::new(),
        }
    }
}

impl ScanFilter {
    pub fn new(ignore_hidden: bool, ignore_system: bool, patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut regexes = Vec::new();
        for p in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            if let Some(re) = p.strip_prefix('@') {
                regexes.push(Regex::new(re).with_context(|| format!("bad ignore regex {:?}", re))?);
            } else {
                builder.add(Glob::new(p).with_context(|| format!("bad ignore pattern {:?}", p))?);
            }
        }
        Ok(Self {
            ignore_hidden,
            ignore_system,
            globs: builder.build().context("building ignore patterns")?,
            regexes,
        })
    }

    pub fn matches_pattern(&self, relative_path: &str) -> bool {
        let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.globs.is_match(relative_path)
            || self.globs.is_match(name)
            || self
                .regexes
                .iter()
                .any(|re| re.is_match(relative_path) || re.is_match(name))
    }

    /// Check if an entry should be skipped
    pub fn is_ignored(&self, file: &FileInfo) -> bool {
        if file.is_symlink() {
            return true;
        }
        let dotfile = file.file_name().starts_with('.');
        if self.ignore_hidden && (file.is_hidden() || dotfile) {
            return true;
        }
        // Unix has no system flag; dot-files stand in for it
        if self.ignore_system && (file.extended_attributes & attr::SYSTEM != 0 || dotfile) {
            return true;
        }
        self.matches_pattern(&file.relative_path)
    }
}

/// Enumerate `root` (excluding the root itself and the sync bookkeeping logs).
/// Ignored directories are not descended into. Directories come before
/// their contents.
pub fn scan_tree(root: &Path, filter: &ScanFilter) -> Result<Vec<FileInfo>> {
    use walkdir::WalkDir;

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            match e.metadata() {
                Ok(md) => {
                    let rel = e.path().strip_prefix(root).unwrap_or(e.path());
                    let fi = FileInfo::from_metadata(
                        e.path(),
                        &crate::file_info::normalize_relative(rel),
                        &md,
                    );
                    !filter.is_ignored(&fi)
                }
                Err(_) => false,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = crate::file_info::normalize_relative(rel);
        if entry.depth() == 1 && logs::is_log_file(&rel) {
            continue;
        }
        if !entry.file_type().is_dir() && entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
            continue;
        }
        match entry.metadata() {
            Ok(md) => entries.push(FileInfo::from_metadata(entry.path(), &rel, &md)),
            Err(e) => tracing::warn!(path = %rel, error = %e, "skipping entry without metadata"),
        }
    }

    Ok(entries)
}

/// Delete `relative` under `root`. Missing paths are not an error.
pub fn remove_relative(root: &Path, relative: &str) -> Result<bool> {
    let path = normalize_under_root(root, relative)?;
    let md = match std::fs::symlink_metadata(&path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if md.is_dir() {
        std::fs::remove_dir_all(&path)?;
    } else {
        std::fs::remove_file(&path)?;
    }
    Ok(true)
}

/// Delete a batch, children before parents. Failures are logged and skipped.
pub fn remove_relatives(root: &Path, paths: &[String]) -> usize {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort_by(|a, b| b.cmp(a));
    let mut removed = 0;
    for rel in sorted {
        match remove_relative(root, rel) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %rel, error = %e, "could not delete"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let r = tmp.path();
        fs::create_dir_all(r.join("dir/sub")).unwrap();
        fs::create_dir_all(r.join(".cache")).unwrap();
        fs::write(r.join("a.txt"), b"a").unwrap();
        fs::write(r.join("dir/b.txt"), b"b").unwrap();
        fs::write(r.join("dir/sub/c.tmp"), b"c").unwrap();
        fs::write(r.join(".cache/blob"), b"x").unwrap();
        fs::write(r.join(".profile"), b"p").unwrap();
        fs::write(r.join(logs::OPERATIONS), b"").unwrap();
        fs::write(r.join(logs::CONFLICTS), b"").unwrap();
        tmp
    }

    fn names(v: &[FileInfo]) -> Vec<&str> {
        v.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_scan_lists_everything_but_logs() {
        let t = tree();
        let all = scan_tree(t.path(), &ScanFilter::default()).unwrap();
        let n = names(&all);
        assert!(n.contains(&"a.txt"));
        assert!(n.contains(&"dir"));
        assert!(n.contains(&"dir/sub/c.tmp"));
        assert!(n.contains(&".cache/blob"));
        assert!(!n.contains(&logs::OPERATIONS));
        assert!(!n.contains(&logs::CONFLICTS));
        let dir_pos = n.iter().position(|p| *p == "dir").unwrap();
        let child_pos = n.iter().position(|p| *p == "dir/b.txt").unwrap();
        assert!(dir_pos < child_pos);
    }

    #[test]
    fn test_half_written_files_are_not_scanned() {
        let t = tree();
        fs::write(t.path().join(logs::OPERATIONS_TMP), b"half written").unwrap();
        let partial = format!("dir/{}abc.part", PARTIAL_PREFIX);
        fs::write(t.path().join(&partial), b"half received").unwrap();
        let all = scan_tree(t.path(), &ScanFilter::default()).unwrap();
        let n = names(&all);
        assert!(!n.contains(&logs::OPERATIONS_TMP));
        assert!(!n.contains(&partial.as_str()));
        assert!(n.contains(&"dir/b.txt"));
    }

    #[test]
    fn test_hidden_entries_pruned() {
        let t = tree();
        let filter = ScanFilter::new(true, false, &[]).unwrap();
        let n: Vec<String> = scan_tree(t.path(), &filter)
            .unwrap()
            .into_iter()
            .map(|f| f.relative_path)
            .collect();
        assert!(!n.iter().any(|p| p.starts_with(".cache")));
        assert!(!n.contains(&".profile".to_string()));
        assert!(n.contains(&"a.txt".to_string()));
    }

    #[test]
    fn test_glob_and_regex_patterns() {
        let t = tree();
        let filter = ScanFilter::new(false, false, &["*.tmp".into(), "@^dir/b\\.".into()]).unwrap();
        let all = scan_tree(t.path(), &filter).unwrap();
        let n = names(&all);
        assert!(!n.contains(&"dir/sub/c.tmp"));
        assert!(!n.contains(&"dir/b.txt"));
        assert!(n.contains(&"dir/sub"));
    }

    #[test]
    fn test_remove_relatives_handles_nested_and_missing() {
        let t = tree();
        let n = remove_relatives(
            t.path(),
            &["dir".into(), "dir/sub/c.tmp".into(), "missing".into()],
        );
        assert_eq!(n, 2);
        assert!(!t.path().join("dir").exists());
        assert!(t.path().join("a.txt").exists());
    }

    #[test]
    fn test_remove_refuses_escape() {
        let t = tree();
        assert!(remove_relative(t.path(), "../etc/passwd").is_err());
    }

    #[test]
    fn test_bad_regex_is_an_error() {
        assert!(ScanFilter::new(false, false, &["@(".into()]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_skipped() {
        let t = tree();
        std::os::unix::fs::symlink(t.path().join("a.txt"), t.path().join("link")).unwrap();
        let all = scan_tree(t.path(), &ScanFilter::default()).unwrap();
        assert!(!names(&all).contains(&"link"));
    }
}
