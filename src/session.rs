//! Server-side sessions.
//!
//! A session is created by an accepted Connect and shared by every
//! connection that presents its id afterwards. The registry also enforces
//! one live session per backup folder and expires sessions that went quiet.

use crate::config::BackupType;
use crate::connection::{Connection, MessageSender};
use crate::message::{FileData, FileDescriptorAck, FileEnd, FileEndAck};
use crate::strategy::{BackupStrategy, FolderContext, PendingPush};
use crate::transfer::ReceiveTarget;
use crate::file_info::FileInfo;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct Session {
    pub id: Uuid,
    pub username: String,
    pub folder: String,
    pub host_name: String,
    pub max_packet_size: usize,
    pub max_connections: usize,
    pub ctx: FolderContext,
    strategy: Arc<dyn BackupStrategy>,
    pending: Mutex<Vec<PendingPush>>,
    restore_pool: Mutex<Vec<Connection>>,
    senders: Mutex<Vec<MessageSender>>,
    last_touch: Mutex<Instant>,
    active: AtomicUsize,
}

/// Keeps a session from expiring while a long operation runs.
pub struct ActiveGuard<'a>(&'a Session);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

pub struct SessionParams {
    pub username: String,
    pub folder: String,
    pub host_name: String,
    pub max_packet_size: usize,
    pub max_connections: usize,
}

impl Session {
    pub fn new(params: SessionParams, ctx: FolderContext, strategy: Arc<dyn BackupStrategy>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: params.username,
            folder: params.folder,
            host_name: params.host_name,
            max_packet_size: params.max_packet_size,
            max_connections: params.max_connections,
            ctx,
            strategy,
            pending: Mutex::new(Vec::new()),
            restore_pool: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            last_touch: Mutex::new(Instant::now()),
            active: AtomicUsize::new(0),
        }
    }

    pub fn backup_type(&self) -> BackupType {
        self.strategy.backup_type()
    }

    pub fn strategy(&self) -> &dyn BackupStrategy {
        self.strategy.as_ref()
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        if self.active.load(Ordering::SeqCst) > 0 {
            return Duration::ZERO;
        }
        self.last_touch.lock().elapsed()
    }

    pub fn activity(&self) -> ActiveGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self)
    }

    pub fn set_pending(&self, files: Vec<PendingPush>) {
        *self.pending.lock() = files;
    }

    pub fn take_pending(&self) -> Vec<PendingPush> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// What the server will push, as announced to the client.
    pub fn pending_files(&self) -> Vec<FileInfo> {
        self.pending.lock().iter().map(|p| p.info.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Park an auxiliary connection that sent StartRestore.
    pub fn add_restore_connection(&self, conn: Connection) {
        self.restore_pool.lock().push(conn);
    }

    pub fn take_restore_connections(&self) -> Vec<Connection> {
        std::mem::take(&mut *self.restore_pool.lock())
    }

    /// Remember a connection's write half so an expired session can be shut.
    pub fn track(&self, sender: MessageSender) {
        self.senders.lock().push(sender);
    }

    pub async fn close_all(&self) {
        let senders = std::mem::take(&mut *self.senders.lock());
        for s in senders {
            s.close().await;
        }
        for c in self.take_restore_connections() {
            c.close().await;
        }
    }
}

impl ReceiveTarget for Session {
    fn begin(&self, connection_id: u32, file: &FileInfo) -> FileDescriptorAck {
        self.touch();
        self.strategy.handle_descriptor(&self.ctx, connection_id, file)
    }

    fn write_block(&self, connection_id: u32, block: &FileData) -> Result<(), String> {
        self.touch();
        self.strategy.handle_data(&self.ctx, connection_id, block)
    }

    fn finish(&self, connection_id: u32, end: &FileEnd, write_error: Option<String>) -> FileEndAck {
        self.touch();
        self.strategy.handle_end(&self.ctx, connection_id, end, write_error)
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<Session>>,
    busy: DashMap<String, Uuid>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` unless its folder already has a live one.
    pub fn register(&self, session: Session) -> Option<Arc<Session>> {
        match self.busy.entry(session.folder.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(session.id);
                let session = Arc::new(session);
                self.sessions.insert(session.id, session.clone());
                Some(session)
            }
        }
    }

    /// Look a session up and mark it active.
    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|s| s.value().clone())?;
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        self.busy.remove_if(&session.folder, |_, owner| owner == id);
        Some(session)
    }

    pub fn is_busy(&self, folder: &str) -> bool {
        self.busy.contains_key(folder)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and return sessions idle for longer than `timeout`.
    pub fn sweep(&self, timeout: Duration) -> Vec<Arc<Session>> {
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.idle_for() > timeout)
            .map(|s| *s.key())
            .collect();
        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn spawn_sweeper(self: Arc<Self>, timeout: Duration, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                for session in self.sweep(timeout) {
                    tracing::warn!(
                        session = %session.id,
                        folder = %session.folder,
                        idle_secs = session.idle_for().as_secs(),
                        "session timed out"
                    );
                    session.close_all().await;
                }
            }
        })
    }
}
