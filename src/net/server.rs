//! The vaultsync daemon.
//!
//! Every accepted socket is its own task. The first message decides what the
//! socket is: a Connect opens a session on a main connection, while a
//! FileDescriptor or StartRestore carrying a known session id attaches an
//! auxiliary connection to that session.

use crate::config::{AccessDenied, BackupType, ServerSettings};
use crate::connection::{Connection, Envelope, PacketHook};
use crate::error::{SyncError, SyncResult};
use crate::file_info::FileInfo;
use crate::fs_enum::ScanFilter;
use crate::message::{
    Connect, ConnectResponse, ErrorMessage, FileListResponse, Message, MessageRegistry,
    StartRestoreAck,
};
use crate::orchestrator::{AbortFlag, Orchestrator, TransferReport};
use crate::protocol::timeouts::SESSION_SWEEP_MS;
use crate::protocol::{
    error_code, MAIN_CONNECTION_ID, MAX_CONNECTIONS_LIMIT, MAX_PACKET_SIZE_LIMIT, MIN_PACKET_SIZE,
};
use crate::session::{Session, SessionParams, SessionRegistry};
use crate::strategy::{for_type, FolderContext};
use crate::transfer::{receive_file, send_file, CycleOutcome, SendOptions};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use uuid::Uuid;

pub struct Server {
    settings: Arc<ServerSettings>,
    registry: Arc<MessageRegistry>,
    sessions: Arc<SessionRegistry>,
}

/// Values agreed in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub max_packet_size: usize,
    pub max_connections: usize,
}

/// Smaller of the two proposals, clamped into the supported bounds.
pub fn negotiate(client: &Connect, settings: &ServerSettings) -> Negotiated {
    let packet = match client.max_packet_size as usize {
        0 => settings.max_packet_size,
        n => n.min(settings.max_packet_size),
    };
    let conns = match client.max_connections as usize {
        0 => settings.max_connections,
        n => n.min(settings.max_connections),
    };
    Negotiated {
        max_packet_size: packet.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE_LIMIT),
        max_connections: conns.clamp(1, MAX_CONNECTIONS_LIMIT),
    }
}

fn merge_patterns(folder: &[String], client: &[String]) -> Vec<String> {
    let mut merged = folder.to_vec();
    for p in client {
        if !merged.contains(p) {
            merged.push(p.clone());
        }
    }
    merged
}

impl Server {
    pub fn new(settings: ServerSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: Arc::new(settings),
            registry: Arc::new(MessageRegistry::standard()?),
            sessions: Arc::new(SessionRegistry::new()),
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {}", addr))
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let timeout = Duration::from_secs(self.settings.session_timeout_secs);
        let sweeper = self
            .sessions
            .clone()
            .spawn_sweeper(timeout, Duration::from_millis(SESSION_SWEEP_MS));
        tracing::info!(
            addr = %listener.local_addr()?,
            folders = self.settings.folders.len(),
            "vaultsync daemon listening"
        );
        let result = loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(anyhow::Error::new(e).context("accept")),
            };
            let _ = stream.set_nodelay(true);
            tracing::debug!(%peer, "connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_stream(stream).await {
                    tracing::warn!(%peer, error = %e, "connection ended with error");
                }
            });
        };
        sweeper.abort();
        result
    }

    /// Serve one accepted stream until its peer is done with it.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S) -> SyncResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let mut conn = Connection::new(
            stream,
            self.registry.clone(),
            MAIN_CONNECTION_ID,
            Uuid::nil(),
            self.settings.max_packet_size,
        );
        let Some(first) = conn.receive_envelope().await? else {
            return Ok(());
        };
        match first.message {
            Message::Connect(connect) => self.handle_main(conn, connect).await,
            Message::FileDescriptor(_) | Message::StartRestore(_) => self.handle_aux(conn, first).await,
            other => {
                let reason = format!("{} cannot start a connection", other.message_type());
                let _ = conn.send(ErrorMessage::new(error_code::PROTOCOL, reason.clone())).await;
                conn.close().await;
                Err(SyncError::Protocol(reason))
            }
        }
    }

    /// Authenticate, resolve the folder and register a session.
    fn open_session(&self, connect: &Connect) -> Result<(Arc<Session>, ConnectResponse), String> {
        let (_, folder) = self
            .settings
            .authorize(&connect.username, &connect.password, &connect.folder)
            .map_err(|e| {
                let code = match e {
                    AccessDenied::BadCredentials => error_code::AUTH,
                    AccessDenied::UnknownFolder(_) | AccessDenied::NotAllowed(_) => error_code::ACCESS,
                };
                format!("{}: {}", code, e)
            })?;

        let agreed = negotiate(connect, &self.settings);
        let ignore_hidden = connect.ignore_hidden || folder.ignore_hidden;
        let ignore_system = connect.ignore_system || folder.ignore_system;
        let patterns = merge_patterns(&folder.ignored_patterns, &connect.ignored_patterns);
        let filter = ScanFilter::new(ignore_hidden, ignore_system, &patterns)
            .map_err(|e| format!("{}: bad ignore pattern: {:#}", error_code::PROTOCOL, e))?;

        let mut ctx = FolderContext::new(&folder.real_path, connect.dry_run, filter);
        if folder.backup_type == BackupType::TwoWaySync {
            ctx = ctx.with_tracker();
        }
        let session = Session::new(
            SessionParams {
                username: connect.username.clone(),
                folder: folder.virtual_name.clone(),
                host_name: connect.host_name.clone(),
                max_packet_size: agreed.max_packet_size,
                max_connections: agreed.max_connections,
            },
            ctx,
            for_type(folder.backup_type),
        );
        let session = self.sessions.register(session).ok_or_else(|| {
            format!(
                "{}: folder {:?} already has a running job",
                error_code::BUSY,
                folder.virtual_name
            )
        })?;

        let response = ConnectResponse {
            accepted: true,
            reason: String::new(),
            session_id: session.id,
            max_packet_size: agreed.max_packet_size as u32,
            max_connections: agreed.max_connections as u32,
            backup_type: folder.backup_type,
            ignore_hidden,
            ignore_system,
            ignored_patterns: patterns,
        };
        Ok((session, response))
    }

    async fn handle_main(&self, mut conn: Connection, connect: Connect) -> SyncResult<()> {
        let (session, response) = match self.open_session(&connect) {
            Ok(opened) => opened,
            Err(reason) => {
                tracing::warn!(
                    user = %connect.username,
                    folder = %connect.folder,
                    host = %connect.host_name,
                    %reason,
                    "connect rejected"
                );
                let sent = conn.send(ConnectResponse::rejected(reason)).await;
                conn.close().await;
                return sent;
            }
        };

        conn.set_session_id(session.id);
        conn.send(response).await?;
        conn.set_max_packet_size(session.max_packet_size);
        conn.set_packet_hook(touch_hook(&session));
        session.track(conn.sender());
        tracing::info!(
            session = %session.id,
            user = %session.username,
            folder = %session.folder,
            host = %session.host_name,
            backup_type = %session.backup_type(),
            max_packet_size = session.max_packet_size,
            max_connections = session.max_connections,
            dry_run = session.ctx.dry_run,
            "session opened"
        );

        let result = self.main_loop(&mut conn, &session).await;
        if let Err(e) = &result {
            if !matches!(e, SyncError::Io(_) | SyncError::Closed(_)) {
                let _ = conn.send(ErrorMessage::new(error_code::PROTOCOL, e.to_string())).await;
            }
            tracing::warn!(session = %session.id, error = %e, "session aborted");
        }
        self.sessions.remove(&session.id);
        session.close_all().await;
        conn.close().await;
        tracing::info!(session = %session.id, folder = %session.folder, "session closed");
        result
    }

    async fn main_loop(&self, conn: &mut Connection, session: &Arc<Session>) -> SyncResult<()> {
        loop {
            let Some(msg) = conn.receive().await? else {
                tracing::info!(session = %session.id, "client closed the main connection");
                return Ok(());
            };
            match msg {
                Message::FileList(list) => {
                    if session.backup_type() == BackupType::TwoWaySync {
                        return refuse_backup_type(conn, "two-way folders expect FileSync").await;
                    }
                    let _active = session.activity();
                    let plan = session
                        .strategy()
                        .handle_file_list(&session.ctx, &list)
                        .map_err(|e| SyncError::Protocol(format!("{:#}", e)))?;
                    tracing::info!(
                        session = %session.id,
                        is_backup = list.is_backup,
                        listed = list.files.len(),
                        to_transfer = plan.response.files_to_transfer.len(),
                        to_delete = plan.response.files_to_delete.len(),
                        "file list compared"
                    );
                    session.set_pending(plan.pending);
                    conn.send(plan.response).await?;
                }
                Message::FileDescriptor(fd) => {
                    let _active = session.activity();
                    receive_file(conn, fd, &**session).await?;
                }
                Message::FileSync(sync) => {
                    if session.backup_type() != BackupType::TwoWaySync {
                        return refuse_backup_type(
                            conn,
                            &format!("folder {:?} is {}, not two-way", session.folder, session.backup_type()),
                        )
                        .await;
                    }
                    let _active = session.activity();
                    let (response, pending) = session
                        .strategy()
                        .handle_file_sync(&session.ctx, &sync)
                        .map_err(|e| SyncError::Protocol(format!("{:#}", e)))?;
                    session.set_pending(pending);
                    conn.send(response).await?;
                }
                Message::FileSyncAck(_) => {
                    conn.send(FileListResponse {
                        files_to_transfer: session.pending_files(),
                        is_backup: false,
                        ..Default::default()
                    })
                    .await?;
                }
                Message::StartRestore(_) => {
                    conn.send(StartRestoreAck).await?;
                    let _active = session.activity();
                    push_pending(session).await;
                }
                Message::SyncEnd(_) => {
                    let ack = session.strategy().handle_sync_end(&session.ctx);
                    tracing::info!(session = %session.id, success = ack.success, "sync end");
                    // Free the folder before the client can start its next job
                    self.sessions.remove(&session.id);
                    conn.send(ack).await?;
                    return Ok(());
                }
                other => {
                    return Err(SyncError::Unexpected {
                        expected: "a request on the main connection",
                        got: other.message_type(),
                    })
                }
            }
        }
    }

    async fn handle_aux(&self, mut conn: Connection, first: Envelope) -> SyncResult<()> {
        let Some(session) = self.sessions.get(&first.session_id) else {
            let reason = format!("unknown session {}", first.session_id);
            let _ = conn.send(ErrorMessage::new(error_code::PROTOCOL, reason.clone())).await;
            conn.close().await;
            return Err(SyncError::Protocol(reason));
        };
        conn.set_session_id(session.id);
        conn.set_connection_id(first.connection_id);
        conn.set_max_packet_size(session.max_packet_size);
        conn.set_packet_hook(touch_hook(&session));
        session.touch();
        session.track(conn.sender());
        tracing::debug!(session = %session.id, connection = first.connection_id, "auxiliary connection attached");

        let mut next = Some(first.message);
        loop {
            let msg = match next.take() {
                Some(m) => m,
                None => match conn.receive().await? {
                    Some(m) => m,
                    None => return Ok(()),
                },
            };
            match msg {
                Message::FileDescriptor(fd) => {
                    let _active = session.activity();
                    receive_file(&mut conn, fd, &*session).await?;
                }
                Message::StartRestore(_) => {
                    // Pooled before the ack so the main StartRestore always finds it
                    let sender = conn.sender();
                    session.add_restore_connection(conn);
                    return sender.send(StartRestoreAck).await;
                }
                other => {
                    let err = SyncError::Unexpected {
                        expected: "file descriptor or start restore",
                        got: other.message_type(),
                    };
                    let _ = conn.send(ErrorMessage::new(error_code::PROTOCOL, err.to_string())).await;
                    return Err(err);
                }
            }
        }
    }
}

/// Every packet read for a session, keep-alives and data blocks included,
/// counts as activity. Weak so pooled restore connections do not keep
/// their session alive.
fn touch_hook(session: &Arc<Session>) -> PacketHook {
    let weak = Arc::downgrade(session);
    Arc::new(move || {
        if let Some(s) = weak.upgrade() {
            s.touch();
        }
    })
}

async fn refuse_backup_type(conn: &Connection, reason: &str) -> SyncResult<()> {
    tracing::warn!(%reason, "request does not fit the folder's backup type");
    conn.send(ErrorMessage::new(error_code::BACKUP_TYPE, reason)).await
}

/// Send every pending file over the connections parked by StartRestore,
/// then close them so the client's receivers see end of stream.
async fn push_pending(session: &Arc<Session>) -> TransferReport {
    let pending = session.take_pending();
    let connections = session.take_restore_connections();
    if connections.is_empty() && !pending.is_empty() {
        tracing::warn!(session = %session.id, files = pending.len(), "restore started without connections");
    }
    let sources: Arc<HashMap<String, PathBuf>> = Arc::new(
        pending
            .iter()
            .map(|p| (p.info.relative_path.clone(), p.source.clone()))
            .collect(),
    );
    let files: Vec<FileInfo> = pending.into_iter().map(|p| p.info).collect();
    let opts = SendOptions {
        block_size: session.max_packet_size,
        dry_run: session.ctx.dry_run,
    };

    let orchestrator = Orchestrator::new(connections, AbortFlag::new());
    let report = orchestrator
        .run(files, move |mut conn: Connection, file: FileInfo| {
            let sources = sources.clone();
            async move {
                let result = match sources.get(&file.relative_path) {
                    Some(source) => send_file(&mut conn, &file, source, opts).await,
                    None => Ok(CycleOutcome::Failed("no source for file".into())),
                };
                (conn, result)
            }
        })
        .await;
    for conn in orchestrator.into_connections() {
        conn.close().await;
    }
    tracing::info!(
        session = %session.id,
        sent = report.transferred,
        bytes = report.bytes,
        not_ready = report.not_ready,
        failed = report.failed,
        "restore push finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupFolder, User};
    use crate::message::{FileList, MessageRegistry};
    use crate::protocol::DEFAULT_MAX_PACKET_SIZE;

    fn connect(user: &str, pass: &str, folder: &str) -> Connect {
        Connect {
            username: user.into(),
            password: pass.into(),
            folder: folder.into(),
            max_packet_size: 64 * 1024,
            max_connections: 2,
            dry_run: false,
            host_name: "test".into(),
            ignore_hidden: false,
            ignore_system: false,
            ignored_patterns: vec!["*.tmp".into()],
        }
    }

    fn settings(root: &std::path::Path, backup_type: BackupType) -> ServerSettings {
        let mut s = ServerSettings::with_admin("admin", "secret");
        s.users.push(User {
            id: 2,
            username: "guest".into(),
            password: "guest".into(),
            admin: false,
        });
        s.folders.push(BackupFolder {
            virtual_name: "docs".into(),
            real_path: root.to_path_buf(),
            backup_type,
            allowed_users: vec![],
            ignore_hidden: true,
            ignore_system: false,
            ignored_patterns: vec!["*.bak".into()],
        });
        s
    }

    fn client_side(server: Arc<Server>) -> Connection {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        tokio::spawn(async move {
            let _ = server.serve_stream(b).await;
        });
        let reg = Arc::new(MessageRegistry::standard().unwrap());
        Connection::new(a, reg, MAIN_CONNECTION_ID, Uuid::nil(), DEFAULT_MAX_PACKET_SIZE)
    }

    #[test]
    fn test_negotiation_takes_minimum_and_clamps() {
        let s = ServerSettings::default();
        let mut c = connect("a", "b", "c");
        c.max_packet_size = 8;
        c.max_connections = 500;
        let n = negotiate(&c, &s);
        assert_eq!(n.max_packet_size, MIN_PACKET_SIZE);
        assert_eq!(n.max_connections, s.max_connections);

        c.max_packet_size = 0;
        c.max_connections = 0;
        let n = negotiate(&c, &s);
        assert_eq!(n.max_packet_size, s.max_packet_size);
        assert_eq!(n.max_connections, s.max_connections);
    }

    #[tokio::test]
    async fn test_handshake_merges_ignore_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(settings(tmp.path(), BackupType::Preserve)).unwrap());
        let mut conn = client_side(server.clone());
        conn.send(connect("admin", "secret", "docs")).await.unwrap();
        let resp: ConnectResponse = conn.expect("connect response").await.unwrap();
        assert!(resp.accepted);
        assert!(resp.ignore_hidden);
        assert_eq!(resp.ignored_patterns, vec!["*.bak", "*.tmp"]);
        assert_eq!(resp.max_packet_size, 64 * 1024);
        assert_eq!(resp.max_connections, 2);
        assert!(server.sessions().is_busy("docs"));
    }

    #[tokio::test]
    async fn test_rejections_carry_error_codes() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(settings(tmp.path(), BackupType::Preserve)).unwrap());
        for (user, pass, folder, code) in [
            ("admin", "wrong", "docs", error_code::AUTH),
            ("admin", "secret", "nope", error_code::ACCESS),
            ("guest", "guest", "docs", error_code::ACCESS),
        ] {
            let mut conn = client_side(server.clone());
            conn.send(connect(user, pass, folder)).await.unwrap();
            let resp: ConnectResponse = conn.expect("connect response").await.unwrap();
            assert!(!resp.accepted);
            assert!(resp.reason.starts_with(code), "{}", resp.reason);
        }
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_second_job_on_folder_is_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(settings(tmp.path(), BackupType::Preserve)).unwrap());
        let mut first = client_side(server.clone());
        first.send(connect("admin", "secret", "docs")).await.unwrap();
        assert!(first.expect::<ConnectResponse>("first").await.unwrap().accepted);

        let mut second = client_side(server.clone());
        second.send(connect("admin", "secret", "docs")).await.unwrap();
        let resp: ConnectResponse = second.expect("second").await.unwrap();
        assert!(!resp.accepted);
        assert!(resp.reason.starts_with(error_code::BUSY));
    }

    #[tokio::test]
    async fn test_file_list_on_two_way_folder_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(settings(tmp.path(), BackupType::TwoWaySync)).unwrap());
        let mut conn = client_side(server.clone());
        conn.send(connect("admin", "secret", "docs")).await.unwrap();
        let resp: ConnectResponse = conn.expect("connect response").await.unwrap();
        conn.set_session_id(resp.session_id);
        conn.send(FileList { files: vec![], is_backup: true }).await.unwrap();
        match conn.expect::<FileListResponse>("file list response").await {
            Err(SyncError::Remote { code, .. }) => assert_eq!(code, error_code::BACKUP_TYPE),
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(settings(tmp.path(), BackupType::Preserve)).unwrap());
        let mut conn = client_side(server);
        conn.set_session_id(Uuid::new_v4());
        conn.send(crate::message::StartRestore).await.unwrap();
        match conn.expect::<StartRestoreAck>("restore ack").await {
            Err(SyncError::Remote { code, .. }) => assert_eq!(code, error_code::PROTOCOL),
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_keep_alive_holds_idle_session_open() {
        let tmp = tempfile::tempdir().unwrap();
        let server = Arc::new(Server::new(settings(tmp.path(), BackupType::Preserve)).unwrap());
        let sweeper = server
            .sessions()
            .clone()
            .spawn_sweeper(Duration::from_secs(1), Duration::from_millis(100));

        let mut conn = client_side(server.clone());
        conn.send(connect("admin", "secret", "docs")).await.unwrap();
        let resp: ConnectResponse = conn.expect("connect response").await.unwrap();
        conn.set_session_id(resp.session_id);
        let lost = AbortFlag::new();
        let heartbeat =
            crate::connection::spawn_keep_alive(conn.sender(), Duration::from_millis(100), lost.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(server.sessions().len(), 1);
        assert!(!lost.is_aborted());

        // Without heartbeats the same session is swept
        heartbeat.abort();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(server.sessions().is_empty());
        sweeper.abort();
    }
}
