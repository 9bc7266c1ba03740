//! Framed connection: a duplex stream tagged with session, connection and
//! packet ids that moves whole messages.
//!
//! The read half is owned by whoever drives the state machine. The write
//! half sits behind a [`MessageSender`] that can be cloned into a
//! keep-alive task, so heartbeats go out while the reader is waiting.

use crate::error::{SyncError, SyncResult};
use crate::message::{ErrorMessage, KeepAlive, Message, MessageRegistry, WireMessage};
use crate::orchestrator::AbortFlag;
use crate::packet::{read_packet, write_packet, Packet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

type BoxReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// A received message with the routing fields of its packet.
#[derive(Debug)]
pub struct Envelope {
    pub connection_id: u32,
    pub session_id: Uuid,
    pub packet_id: u32,
    pub message: Message,
}

struct SenderInner {
    writer: Mutex<BoxWriter>,
    connection_id: AtomicU32,
    session_id: RwLock<Uuid>,
    next_packet_id: AtomicU32,
    max_packet_size: AtomicUsize,
    closed: AtomicBool,
}

/// Cloneable write side of a connection.
#[derive(Clone)]
pub struct MessageSender {
    inner: Arc<SenderInner>,
}

impl MessageSender {
    pub async fn send(&self, msg: impl Into<Message>) -> SyncResult<()> {
        let msg = msg.into();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed("send on closed connection"));
        }
        let packet = Packet::seal(
            self.inner.connection_id.load(Ordering::Relaxed),
            *self.inner.session_id.read(),
            self.inner.next_packet_id.fetch_add(1, Ordering::Relaxed),
            msg.message_type().code(),
            &msg.to_body(),
        )?;
        let mut w = self.inner.writer.lock().await;
        write_packet(&mut *w, &packet).await
    }

    /// Shut the write half down. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut w = self.inner.writer.lock().await;
        let _ = w.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Called for every packet read, keep-alives included.
pub type PacketHook = Arc<dyn Fn() + Send + Sync>;

pub struct Connection {
    reader: BoxReader,
    sender: MessageSender,
    registry: Arc<MessageRegistry>,
    on_packet: Option<PacketHook>,
}

impl Connection {
    pub fn new<S>(
        stream: S,
        registry: Arc<MessageRegistry>,
        connection_id: u32,
        session_id: Uuid,
        max_packet_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Box::new(r),
            sender: MessageSender {
                inner: Arc::new(SenderInner {
                    writer: Mutex::new(Box::new(w)),
                    connection_id: AtomicU32::new(connection_id),
                    session_id: RwLock::new(session_id),
                    next_packet_id: AtomicU32::new(0),
                    max_packet_size: AtomicUsize::new(max_packet_size),
                    closed: AtomicBool::new(false),
                }),
            },
            registry,
            on_packet: None,
        }
    }

    /// Run `hook` on every packet this connection reads.
    pub fn set_packet_hook(&mut self, hook: PacketHook) {
        self.on_packet = Some(hook);
    }

    pub fn connection_id(&self) -> u32 {
        self.sender.inner.connection_id.load(Ordering::Relaxed)
    }

    /// Adopt the id the peer chose for this connection.
    pub fn set_connection_id(&self, id: u32) {
        self.sender.inner.connection_id.store(id, Ordering::Relaxed);
    }

    pub fn session_id(&self) -> Uuid {
        *self.sender.inner.session_id.read()
    }

    pub fn set_session_id(&self, id: Uuid) {
        *self.sender.inner.session_id.write() = id;
    }

    pub fn max_packet_size(&self) -> usize {
        self.sender.inner.max_packet_size.load(Ordering::Relaxed)
    }

    /// Apply the negotiated packet size to both directions.
    pub fn set_max_packet_size(&self, size: usize) {
        self.sender.inner.max_packet_size.store(size, Ordering::Relaxed);
    }

    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    pub async fn send(&self, msg: impl Into<Message>) -> SyncResult<()> {
        self.sender.send(msg).await
    }

    /// Next non-keep-alive message with its packet fields, or `None` when
    /// the peer closed the stream between packets.
    pub async fn receive_envelope(&mut self) -> SyncResult<Option<Envelope>> {
        loop {
            let max = self.max_packet_size();
            let Some(packet) = read_packet(&mut self.reader, max).await? else {
                return Ok(None);
            };
            if let Some(hook) = &self.on_packet {
                hook();
            }
            let header_type = self.registry.message_type(packet.message_type)?;
            let message = self.registry.decode(packet.open(max)?)?;
            if message.message_type() != header_type {
                return Err(SyncError::TypeMismatch {
                    header: header_type,
                    body: message.message_type(),
                });
            }
            if matches!(message, Message::KeepAlive(_)) {
                continue;
            }
            return Ok(Some(Envelope {
                connection_id: packet.connection_id,
                session_id: packet.session_id,
                packet_id: packet.packet_id,
                message,
            }));
        }
    }

    pub async fn receive(&mut self) -> SyncResult<Option<Message>> {
        Ok(self.receive_envelope().await?.map(|e| e.message))
    }

    /// Receive exactly a `T`. An ER from the peer becomes `SyncError::Remote`.
    pub async fn expect<T>(&mut self, what: &'static str) -> SyncResult<T>
    where
        T: WireMessage + TryFrom<Message, Error = Message>,
    {
        match self.receive().await? {
            None => Err(SyncError::Closed(what)),
            Some(Message::ErrorMessage(ErrorMessage { code, message, .. })) => {
                Err(SyncError::Remote { code, message })
            }
            Some(msg) => T::try_from(msg).map_err(|other| SyncError::Unexpected {
                expected: what,
                got: other.message_type(),
            }),
        }
    }

    pub async fn close(&self) {
        self.sender.close().await;
    }
}

/// Send KeepAlive every `interval` until aborted. A failed send flags the
/// connection as lost through `lost`.
pub fn spawn_keep_alive(sender: MessageSender, interval: Duration, lost: AbortFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sender.is_closed() {
                break;
            }
            if let Err(e) = sender.send(KeepAlive).await {
                tracing::warn!(error = %e, "keep-alive failed; treating main connection as lost");
                lost.abort();
                break;
            }
        }
    })
}
