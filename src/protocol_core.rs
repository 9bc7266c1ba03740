//! Protocol-agnostic helpers shared by the client and server flows
//!
//! Path safety for relative paths received from a peer, packet header
//! layout and the block arithmetic of the per-file transfer cycle.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{FRAME_OVERHEAD, HEADER_LEN};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

fn path_error(p: &str, reason: impl Into<String>) -> SyncError {
    SyncError::Path {
        path: p.to_string(),
        reason: reason.into(),
    }
}

/// Resolve a peer-supplied relative path to a location under `root`.
/// Rejects NUL bytes, absolute paths and parent components, then
/// canonicalizes what already exists so a symlink cannot lead outside.
pub fn normalize_under_root(root: &Path, relative: &str) -> SyncResult<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if relative.contains('\0') {
        return Err(path_error(relative, "contains NUL byte"));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                // ADS defense
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(path_error(relative, "component contains ':'"));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(path_error(
                    relative,
                    format!("disallowed component {:?}", component),
                ));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(path_error(relative, "empty path"));
    }

    let canon_root = root
        .canonicalize()
        .map_err(|e| path_error(relative, format!("root {}: {}", root.display(), e)))?;
    let joined = canon_root.join(&safe);

    // Resolve the deepest existing ancestor; the rest is created later
    let mut existing = joined.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    while std::fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| path_error(relative, e.to_string()))?;
    for name in tail.into_iter().rev() {
        resolved.push(name);
    }

    if !resolved.starts_with(&canon_root) {
        return Err(path_error(relative, "escapes root"));
    }
    Ok(resolved)
}

/// Largest `length` field accepted for a negotiated packet size.
pub fn max_frame_len(max_packet_size: usize) -> usize {
    max_packet_size + FRAME_OVERHEAD
}

/// Validate the declared total packet length before reading anything else.
pub fn validate_frame_len(len: i32, max_packet_size: usize) -> SyncResult<usize> {
    let max = max_frame_len(max_packet_size);
    if len <= 0 || (len as usize) < HEADER_LEN || len as usize > max {
        return Err(SyncError::FrameLength {
            len: len as i64,
            max,
        });
    }
    Ok(len as usize)
}

/// Fixed packet header fields (everything before the compressed payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub connection_id: u32,
    pub session_id: Uuid,
    pub packet_id: u32,
    pub message_type: [u8; 2],
}

/// Build the header (30 bytes)
/// Format: LENGTH (4) | CONNECTION (4) | SESSION (16) | PACKET (4) | TYPE (2)
pub fn build_frame_header(h: &FrameHeader) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&h.length.to_be_bytes());
    header[4..8].copy_from_slice(&h.connection_id.to_be_bytes());
    header[8..24].copy_from_slice(h.session_id.as_bytes());
    header[24..28].copy_from_slice(&h.packet_id.to_be_bytes());
    header[28..30].copy_from_slice(&h.message_type);
    header
}

pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> FrameHeader {
    let be32 = |i: usize| u32::from_be_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
    let mut session = [0u8; 16];
    session.copy_from_slice(&header[8..24]);
    FrameHeader {
        length: be32(0),
        connection_id: be32(4),
        session_id: Uuid::from_bytes(session),
        packet_id: be32(24),
        message_type: [header[28], header[29]],
    }
}

/// Number of FileData blocks for a file: `max(1, ceil(size / block))`.
pub fn block_count(size: u64, block_size: usize) -> u64 {
    let block = block_size.max(1) as u64;
    size.div_ceil(block).max(1)
}

/// Byte length of block `index` (zero-based) of a file of `size` bytes.
pub fn block_len(size: u64, block_size: usize, index: u64) -> usize {
    let block = block_size.max(1) as u64;
    let start = index.saturating_mul(block);
    size.saturating_sub(start).min(block) as usize
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
