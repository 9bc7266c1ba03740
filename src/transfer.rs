//! Per-file transfer cycle.
//!
//! Sender: FileDescriptor -> (ack) -> FileData* -> (ack each) -> FileEnd -> (ack).
//! One block is in flight per connection; the next block is only read once
//! the previous one was acknowledged. Directories stop after the descriptor
//! ack and dry runs skip the data phase entirely.

use crate::connection::Connection;
use crate::error::{SyncError, SyncResult};
use crate::file_info::{apply_metadata, FileInfo};
use crate::message::{
    FileData, FileDataAck, FileDescriptor, FileDescriptorAck, FileEnd, FileEndAck, Message,
};
use crate::protocol::PARTIAL_PREFIX;
use crate::protocol_core::{block_count, block_len, ensure_parent_exists, normalize_under_root};
use crate::tracker::ChangeTracker;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Result of one file's cycle. Errors that leave the connection in an
/// unknown state are returned as `Err` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Transferred { bytes: u64 },
    NotReady(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub block_size: usize,
    pub dry_run: bool,
}

/// Splits a reader into the exact blocks the cycle sends.
pub struct BlockReader<R> {
    reader: R,
    size: u64,
    block_size: usize,
    index: u64,
    total: u64,
}

impl<R: AsyncRead + Unpin> BlockReader<R> {
    pub fn new(reader: R, size: u64, block_size: usize) -> Self {
        Self {
            reader,
            size,
            block_size,
            index: 0,
            total: block_count(size, block_size),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// `(index, bytes)` of the next block. A file that shrank while being
    /// read is an `UnexpectedEof` error.
    pub async fn next_block(&mut self) -> std::io::Result<Option<(u64, Vec<u8>)>> {
        if self.index >= self.total {
            return Ok(None);
        }
        let mut buf = vec![0u8; block_len(self.size, self.block_size, self.index)];
        self.reader.read_exact(&mut buf).await?;
        let idx = self.index;
        self.index += 1;
        Ok(Some((idx, buf)))
    }
}

/// Drive one file through the sender side of the cycle.
pub async fn send_file(
    conn: &mut Connection,
    file: &FileInfo,
    source: &Path,
    opts: SendOptions,
) -> SyncResult<CycleOutcome> {
    // Size is taken when the file is opened, not when it was listed
    let opened = if file.is_directory || opts.dry_run {
        None
    } else {
        // Nothing was sent yet, so the connection stays usable
        let f = match tokio::fs::File::open(source).await {
            Ok(f) => f,
            Err(e) => return Ok(CycleOutcome::Failed(format!("open {}: {}", source.display(), e))),
        };
        let size = match f.metadata().await {
            Ok(md) => md.len(),
            Err(e) => return Ok(CycleOutcome::Failed(format!("stat {}: {}", source.display(), e))),
        };
        Some((f, size))
    };
    let mut info = file.clone();
    if let Some((_, size)) = &opened {
        info.size = *size;
    }

    conn.send(FileDescriptor { file: info.clone() }).await?;
    let ack: FileDescriptorAck = conn.expect("file descriptor ack").await?;
    if ack.relative_path != info.relative_path {
        return Err(SyncError::Protocol(format!(
            "descriptor ack for {} while sending {}",
            ack.relative_path, info.relative_path
        )));
    }
    if !ack.ready {
        return Ok(CycleOutcome::NotReady(ack.reason));
    }
    if info.is_directory {
        return Ok(CycleOutcome::Transferred { bytes: 0 });
    }

    let mut sent = 0u64;
    if let Some((f, size)) = opened {
        let mut blocks = BlockReader::new(f, size, opts.block_size);
        let total = blocks.total() as u32;
        while let Some((index, data)) = blocks.next_block().await? {
            sent += data.len() as u64;
            conn.send(FileData {
                relative_path: info.relative_path.clone(),
                block_index: index as u32,
                total_blocks: total,
                data,
            })
            .await?;
            let ack: FileDataAck = conn.expect("file data ack").await?;
            if ack.block_index != index as u32 {
                return Err(SyncError::Protocol(format!(
                    "ack for block {} of {} while waiting for {}",
                    ack.block_index, info.relative_path, index
                )));
            }
        }
    }

    conn.send(FileEnd {
        relative_path: info.relative_path.clone(),
        file: info.clone(),
    })
    .await?;
    let end: FileEndAck = conn.expect("file end ack").await?;
    if end.success {
        Ok(CycleOutcome::Transferred { bytes: sent })
    } else {
        Ok(CycleOutcome::Failed(end.reason))
    }
}

/// Receiving side of the cycle, independent of where bytes end up.
pub trait ReceiveTarget: Send + Sync {
    fn begin(&self, connection_id: u32, file: &FileInfo) -> FileDescriptorAck;
    fn write_block(&self, connection_id: u32, block: &FileData) -> Result<(), String>;
    fn finish(&self, connection_id: u32, end: &FileEnd, write_error: Option<String>) -> FileEndAck;
}

/// Drive one file through the receiver side, starting from its descriptor.
pub async fn receive_file(
    conn: &mut Connection,
    descriptor: FileDescriptor,
    target: &dyn ReceiveTarget,
) -> SyncResult<CycleOutcome> {
    let file = descriptor.file;
    let conn_id = conn.connection_id();
    let ack = target.begin(conn_id, &file);
    let ready = ack.ready;
    let reason = ack.reason.clone();
    conn.send(ack).await?;
    if !ready {
        tracing::info!(path = %file.relative_path, %reason, "file not ready");
        return Ok(CycleOutcome::NotReady(reason));
    }
    if file.is_directory {
        return Ok(CycleOutcome::Transferred { bytes: 0 });
    }

    let mut received = 0u64;
    let mut write_error: Option<String> = None;
    loop {
        match conn.receive().await? {
            None => return Err(SyncError::Closed("file data or end")),
            Some(Message::FileData(block)) => {
                if block.relative_path != file.relative_path {
                    return Err(SyncError::Protocol(format!(
                        "data for {} while receiving {}",
                        block.relative_path, file.relative_path
                    )));
                }
                received += block.data.len() as u64;
                if write_error.is_none() {
                    if let Err(e) = target.write_block(conn_id, &block) {
                        tracing::warn!(path = %file.relative_path, error = %e, "write failed");
                        write_error = Some(e);
                    }
                }
                conn.send(FileDataAck {
                    relative_path: block.relative_path,
                    block_index: block.block_index,
                })
                .await?;
            }
            Some(Message::FileEnd(end)) => {
                let ack = target.finish(conn_id, &end, write_error);
                let outcome = if ack.success {
                    CycleOutcome::Transferred { bytes: received }
                } else {
                    CycleOutcome::Failed(ack.reason.clone())
                };
                conn.send(ack).await?;
                return Ok(outcome);
            }
            Some(other) => {
                return Err(SyncError::Unexpected {
                    expected: "file data or end",
                    got: other.message_type(),
                })
            }
        }
    }
}

/// A file currently being written on one connection.
pub struct OpenFile {
    pub info: FileInfo,
    pub path: PathBuf,
    /// Whether something already existed at `path` before this transfer.
    pub existed: bool,
    pub written: u64,
    next_block: u32,
    /// Sibling temp file renamed over `path` once the transfer succeeds.
    handle: Option<NamedTempFile>,
}

fn partial_file_for(path: &Path) -> std::io::Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .suffix(".part")
        .tempfile_in(dir)
}

/// Per-connection map of the file whose descriptor was last acknowledged.
/// Block data on a connection always belongs to that file.
#[derive(Default)]
pub struct OpenFiles {
    entries: Mutex<HashMap<u32, Arc<Mutex<OpenFile>>>>,
}

impl OpenFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, connection_id: u32) -> Option<FileInfo> {
        let entry = self.entries.lock().get(&connection_id).cloned();
        entry.map(|e| e.lock().info.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn insert(&self, connection_id: u32, file: OpenFile) {
        self.entries
            .lock()
            .insert(connection_id, Arc::new(Mutex::new(file)));
    }

    fn get(&self, connection_id: u32) -> Option<Arc<Mutex<OpenFile>>> {
        self.entries.lock().get(&connection_id).cloned()
    }

    fn take(&self, connection_id: u32) -> Option<Arc<Mutex<OpenFile>>> {
        self.entries.lock().remove(&connection_id)
    }

    /// Prepare `path` for `file`: create a directory, or open a temp file
    /// next to `path` and remember it for this connection. An existing file
    /// at `path` is only replaced when the transfer completes. Nothing
    /// touches disk in dry run.
    pub fn begin(
        &self,
        connection_id: u32,
        file: &FileInfo,
        path: PathBuf,
        dry_run: bool,
    ) -> FileDescriptorAck {
        let rel = &file.relative_path;
        let existing = std::fs::symlink_metadata(&path).ok();
        match (&existing, file.is_directory) {
            (Some(md), true) if !md.is_dir() => {
                return FileDescriptorAck::not_ready(rel, "a file exists where a directory is expected")
            }
            (Some(md), false) if md.is_dir() => {
                return FileDescriptorAck::not_ready(rel, "a directory exists where a file is expected")
            }
            _ => {}
        }

        if file.is_directory {
            if !dry_run {
                if let Err(e) = std::fs::create_dir_all(&path) {
                    return FileDescriptorAck::not_ready(rel, e.to_string());
                }
            }
            return FileDescriptorAck::ready(rel);
        }

        let handle = if dry_run {
            None
        } else {
            let created = ensure_parent_exists(&path).and_then(|_| partial_file_for(&path));
            match created {
                Ok(f) => Some(f),
                Err(e) => return FileDescriptorAck::not_ready(rel, e.to_string()),
            }
        };
        self.insert(
            connection_id,
            OpenFile {
                info: file.clone(),
                path,
                existed: existing.is_some(),
                written: 0,
                next_block: 0,
                handle,
            },
        );
        FileDescriptorAck::ready(rel)
    }

    pub fn write(&self, connection_id: u32, block: &FileData) -> Result<(), String> {
        let entry = self
            .get(connection_id)
            .ok_or_else(|| format!("no open file on connection {}", connection_id))?;
        let mut open = entry.lock();
        if open.info.relative_path != block.relative_path {
            return Err(format!(
                "block for {} but {} is open",
                block.relative_path, open.info.relative_path
            ));
        }
        if block.block_index != open.next_block {
            return Err(format!(
                "block {} out of order, expected {}",
                block.block_index, open.next_block
            ));
        }
        if let Some(f) = open.handle.as_mut() {
            f.write_all(&block.data).map_err(|e| e.to_string())?;
        }
        open.written += block.data.len() as u64;
        open.next_block += 1;
        Ok(())
    }

    /// Close the open file and apply the sender's metadata.
    pub fn finish(
        &self,
        connection_id: u32,
        end: &FileEnd,
        write_error: Option<String>,
    ) -> Result<OpenFile, String> {
        let entry = self
            .take(connection_id)
            .ok_or_else(|| format!("no open file on connection {}", connection_id))?;
        let mut open = Arc::try_unwrap(entry)
            .map(Mutex::into_inner)
            .map_err(|_| "open file still in use".to_string())?;
        if open.info.relative_path != end.relative_path {
            return Err(format!(
                "end for {} but {} is open",
                end.relative_path, open.info.relative_path
            ));
        }
        if let Some(e) = write_error {
            return Err(e);
        }
        if let Some(mut f) = open.handle.take() {
            f.flush().map_err(|e| e.to_string())?;
            if open.written != end.file.size {
                return Err(format!(
                    "received {} bytes, expected {}",
                    open.written, end.file.size
                ));
            }
            f.persist(&open.path).map_err(|e| e.error.to_string())?;
            apply_metadata(&open.path, &end.file).map_err(|e| e.to_string())?;
        }
        open.info = end.file.clone();
        Ok(open)
    }
}

/// Writes incoming files under a local root. Used by the client for restores
/// and the pull half of two-way sync.
pub struct DiskTarget {
    root: PathBuf,
    dry_run: bool,
    open: OpenFiles,
    expected: Option<HashSet<String>>,
    tracker: Option<Arc<ChangeTracker>>,
}

impl DiskTarget {
    pub fn new(root: &Path, dry_run: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            dry_run,
            open: OpenFiles::new(),
            expected: None,
            tracker: None,
        }
    }

    /// Refuse anything the file-list exchange did not name.
    pub fn expecting(mut self, files: &[FileInfo]) -> Self {
        self.expected = Some(files.iter().map(|f| f.relative_path.clone()).collect());
        self
    }

    /// Record completed files in the operation log.
    pub fn recording(mut self, tracker: Arc<ChangeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

impl ReceiveTarget for DiskTarget {
    fn begin(&self, connection_id: u32, file: &FileInfo) -> FileDescriptorAck {
        if let Some(expected) = &self.expected {
            if !expected.contains(&file.relative_path) {
                return FileDescriptorAck::not_ready(&file.relative_path, "file was not requested");
            }
        }
        match normalize_under_root(&self.root, &file.relative_path) {
            Ok(path) => self.open.begin(connection_id, file, path, self.dry_run),
            Err(e) => FileDescriptorAck::not_ready(&file.relative_path, e.to_string()),
        }
    }

    fn write_block(&self, connection_id: u32, block: &FileData) -> Result<(), String> {
        self.open.write(connection_id, block)
    }

    fn finish(&self, connection_id: u32, end: &FileEnd, write_error: Option<String>) -> FileEndAck {
        match self.open.finish(connection_id, end, write_error) {
            Ok(done) => {
                if let (Some(tracker), false) = (&self.tracker, self.dry_run) {
                    if let Err(e) = tracker.record_received(&done.info, done.existed) {
                        tracing::warn!(path = %end.relative_path, error = %e, "could not record received file");
                    }
                }
                FileEndAck::success(&end.relative_path)
            }
            Err(reason) => FileEndAck::failure(&end.relative_path, reason),
        }
    }
}
