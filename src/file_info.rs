use crate::buffer::{CodecError, WireBuffer};
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Attribute bitmask carried with every file. The low nine bits are POSIX
/// permission bits; the flags above them describe the entry type.
pub mod attr {
    pub const PERMISSIONS: u32 = 0o777;
    pub const HIDDEN: u32 = 0x1000;
    pub const SYMLINK: u32 = 0x2000;
    pub const SYSTEM: u32 = 0x4000;
    pub const DIRECTORY: u32 = 0x8000;
}

/// Metadata for one entry of a sync root. Identity is the relative path alone.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Sender-local absolute path; never sent on the wire.
    pub path: Option<PathBuf>,
    pub relative_path: String,
    pub size: u64,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub is_directory: bool,
    pub extended_attributes: u32,
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path
    }
}

impl Eq for FileInfo {}

impl Hash for FileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.relative_path.hash(state);
    }
}

impl FileInfo {
    /// Stat `path` (without following symlinks) and describe it relative to `root`.
    pub fn from_path(root: &Path, path: &Path) -> std::io::Result<Self> {
        let md = std::fs::symlink_metadata(path)?;
        let rel = path.strip_prefix(root).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not under {}", path.display(), root.display()),
            )
        })?;
        Ok(Self::from_metadata(path, &normalize_relative(rel), &md))
    }

    pub fn from_metadata(path: &Path, relative_path: &str, md: &Metadata) -> Self {
        let modified = md.modified().map(to_utc).unwrap_or_else(|_| Utc::now());
        // Birth time is not available everywhere; fall back to mtime
        let created = md.created().map(to_utc).unwrap_or(modified);
        let is_directory = md.is_dir();
        Self {
            path: Some(path.to_path_buf()),
            relative_path: relative_path.to_string(),
            size: if is_directory { 0 } else { md.len() },
            creation_time: created,
            modification_time: modified,
            is_directory,
            extended_attributes: attributes_of(relative_path, md),
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.extended_attributes & attr::SYMLINK != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.extended_attributes & attr::HIDDEN != 0
    }

    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// Same size and modification second: the copy on the other side is current.
    pub fn matches(&self, other: &FileInfo) -> bool {
        self.is_directory == other.is_directory
            && (self.is_directory
                || (self.size == other.size
                    && same_second(&self.modification_time, &other.modification_time)))
    }

    pub fn encode(&self, buf: &mut WireBuffer) {
        buf.put_str(&self.relative_path);
        buf.put_u64(self.size);
        buf.put_time(&self.creation_time);
        buf.put_time(&self.modification_time);
        buf.put_bool(self.is_directory);
        buf.put_u32(self.extended_attributes);
    }

    pub fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            path: None,
            relative_path: buf.get_str()?,
            size: buf.get_u64()?,
            creation_time: buf.get_time()?,
            modification_time: buf.get_time()?,
            is_directory: buf.get_bool()?,
            extended_attributes: buf.get_u32()?,
        })
    }

    pub fn encode_list(items: &[FileInfo], buf: &mut WireBuffer) {
        buf.put_u32(items.len() as u32);
        for fi in items {
            fi.encode(buf);
        }
    }

    pub fn decode_list(buf: &mut WireBuffer) -> Result<Vec<FileInfo>, CodecError> {
        let count = buf.get_u32()? as usize;
        // Smallest encoding is 4 + 8 + 8 + 8 + 1 + 4 bytes
        if count.saturating_mul(33) > buf.remaining() {
            return Err(CodecError::LengthOverrun(count));
        }
        (0..count).map(|_| FileInfo::decode(buf)).collect()
    }
}

pub fn to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

pub fn same_second(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}

/// Forward-slash form of a relative path, dropping `.` components.
pub fn normalize_relative(rel: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for c in rel.components() {
        match c {
            Component::Normal(s) => parts.push(s.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    parts.join("/")
}

fn attributes_of(relative_path: &str, md: &Metadata) -> u32 {
    let mut bits = 0;
    let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    if name.starts_with('.') {
        bits |= attr::HIDDEN;
    }
    let ft = md.file_type();
    if ft.is_symlink() {
        bits |= attr::SYMLINK;
    }
    if ft.is_dir() {
        bits |= attr::DIRECTORY;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        bits |= md.permissions().mode() & attr::PERMISSIONS;
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
        const FILE_ATTRIBUTE_SYSTEM: u32 = 0x4;
        let win = md.file_attributes();
        if win & FILE_ATTRIBUTE_HIDDEN != 0 {
            bits |= attr::HIDDEN;
        }
        if win & FILE_ATTRIBUTE_SYSTEM != 0 {
            bits |= attr::SYSTEM;
        }
    }
    bits
}

/// Apply the sender's modification time and permission bits to a written entry.
pub fn apply_metadata(path: &Path, info: &FileInfo) -> std::io::Result<()> {
    let mtime = filetime::FileTime::from_unix_time(
        info.modification_time.timestamp(),
        info.modification_time.timestamp_subsec_nanos(),
    );
    filetime::set_file_times(path, mtime, mtime)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = info.extended_attributes & attr::PERMISSIONS;
        // Never lock ourselves out of a file we just wrote
        if mode & 0o600 == 0o600 || (info.is_directory && mode & 0o700 == 0o700) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn sample(rel: &str, size: u64) -> FileInfo {
        FileInfo {
            path: None,
            relative_path: rel.to_string(),
            size,
            creation_time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            modification_time: Utc.timestamp_opt(1_600_000_500, 0).unwrap(),
            is_directory: false,
            extended_attributes: 0o644,
        }
    }

    #[test]
    fn test_identity_is_relative_path_only() {
        let mut a = sample("docs/a.txt", 1);
        a.path = Some(PathBuf::from("/one/docs/a.txt"));
        let mut b = sample("docs/a.txt", 99);
        b.path = Some(PathBuf::from("/two/docs/a.txt"));
        assert_eq!(a, b);
        let set: HashSet<FileInfo> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_normalize_relative_uses_forward_slashes() {
        assert_eq!(normalize_relative(Path::new("./dir/sub/file.txt")), "dir/sub/file.txt");
        assert_eq!(normalize_relative(Path::new("file.txt")), "file.txt");
    }

    #[test]
    fn test_matches_compares_size_and_second() {
        let a = sample("a", 10);
        let mut b = sample("a", 10);
        b.modification_time = a.modification_time + chrono::Duration::milliseconds(400);
        assert!(a.matches(&b));
        b.size = 11;
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_file_info_survives_the_wire() {
        let mut fi = sample("x/y.bin", 12345);
        fi.path = Some(PathBuf::from("/local/x/y.bin"));
        let mut buf = WireBuffer::new();
        fi.encode(&mut buf);
        let mut rd = WireBuffer::from_bytes(buf.into_bytes());
        let back = FileInfo::decode(&mut rd).unwrap();
        rd.finish().unwrap();
        assert_eq!(back.relative_path, fi.relative_path);
        assert_eq!(back.size, fi.size);
        assert_eq!(back.creation_time, fi.creation_time);
        assert_eq!(back.modification_time, fi.modification_time);
        assert_eq!(back.extended_attributes, fi.extended_attributes);
        assert!(back.path.is_none());
    }

    #[test]
    fn test_from_path_reads_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/.hidden"), b"abc").unwrap();
        let fi = FileInfo::from_path(tmp.path(), &tmp.path().join("sub/.hidden")).unwrap();
        assert_eq!(fi.relative_path, "sub/.hidden");
        assert_eq!(fi.size, 3);
        assert!(fi.is_hidden());
        assert!(!fi.is_directory);
        let dir = FileInfo::from_path(tmp.path(), &tmp.path().join("sub")).unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_apply_metadata_sets_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f");
        std::fs::write(&p, b"data").unwrap();
        let fi = sample("f", 4);
        apply_metadata(&p, &fi).unwrap();
        let md = std::fs::metadata(&p).unwrap();
        assert!(same_second(&to_utc(md.modified().unwrap()), &fi.modification_time));
    }
}
