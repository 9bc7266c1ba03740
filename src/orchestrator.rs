//! Parallel transfer over a pool of auxiliary connections.
//!
//! At most `K` cycles run at once, where `K` is the number of pooled
//! connections. A connection is taken from the pool for exactly one file and
//! returned afterwards, so the worker/connection pairing changes between
//! files. Failed files still count toward completion.

use crate::connection::Connection;
use crate::error::{SyncError, SyncResult};
use crate::file_info::FileInfo;
use crate::message::Message;
use crate::transfer::{receive_file, CycleOutcome, ReceiveTarget};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Cooperative cancellation shared by a job's tasks.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone)]
pub struct TransferReport {
    pub transferred: usize,
    pub bytes: u64,
    pub not_ready: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// `(relative path, reason)` for every file that did not make it.
    pub problems: Vec<(String, String)>,
}

impl TransferReport {
    /// Files accounted for, whatever their outcome.
    pub fn completed(&self) -> usize {
        self.transferred + self.not_ready + self.failed + self.cancelled
    }

    fn tally(&mut self, path: String, result: SyncResult<CycleOutcome>) {
        match result {
            Ok(CycleOutcome::Transferred { bytes }) => {
                self.transferred += 1;
                self.bytes += bytes;
            }
            Ok(CycleOutcome::NotReady(reason)) => {
                self.not_ready += 1;
                self.problems.push((path, reason));
            }
            Ok(CycleOutcome::Failed(reason)) => {
                self.failed += 1;
                self.problems.push((path, reason));
            }
            Err(SyncError::Cancelled) => {
                self.cancelled += 1;
            }
            Err(e) => {
                self.failed += 1;
                self.problems.push((path, e.to_string()));
            }
        }
    }

    pub fn merge(&mut self, other: TransferReport) {
        self.transferred += other.transferred;
        self.bytes += other.bytes;
        self.not_ready += other.not_ready;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.problems.extend(other.problems);
    }
}

/// Bounded fan-out of per-file cycles over pooled connections.
pub struct Orchestrator<C> {
    pool: Arc<Mutex<Vec<C>>>,
    permits: Arc<Semaphore>,
    alive: Arc<AtomicUsize>,
    abort: AbortFlag,
}

impl<C: Send + 'static> Orchestrator<C> {
    pub fn new(connections: Vec<C>, abort: AbortFlag) -> Self {
        let k = connections.len();
        let permits = Arc::new(Semaphore::new(k));
        if k == 0 {
            permits.close();
        }
        Self {
            pool: Arc::new(Mutex::new(connections)),
            permits,
            alive: Arc::new(AtomicUsize::new(k)),
            abort,
        }
    }

    pub fn capacity(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Run `cycle` once per file and wait for all of them.
    ///
    /// `cycle` receives a connection by value and hands it back with the
    /// outcome. A connection that comes back with an `Err` is in an unknown
    /// protocol state and is dropped instead of returned to the pool; once
    /// every connection is gone the remaining files are counted as failed.
    pub async fn run<F, Fut>(&self, files: Vec<FileInfo>, cycle: F) -> TransferReport
    where
        F: Fn(C, FileInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (C, SyncResult<CycleOutcome>)> + Send + 'static,
    {
        let cycle = Arc::new(cycle);
        let remaining = Arc::new(AtomicUsize::new(files.len()));
        let mut report = TransferReport::default();
        let mut tasks: JoinSet<(String, SyncResult<CycleOutcome>)> = JoinSet::new();

        for file in files {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    remaining.fetch_sub(1, Ordering::SeqCst);
                    report.tally(
                        file.relative_path,
                        Err(SyncError::Protocol("no usable connection left".into())),
                    );
                    continue;
                }
            };
            if self.abort.is_aborted() {
                remaining.fetch_sub(1, Ordering::SeqCst);
                report.tally(file.relative_path, Err(SyncError::Cancelled));
                continue;
            }
            let Some(conn) = self.pool.lock().pop() else {
                remaining.fetch_sub(1, Ordering::SeqCst);
                report.tally(
                    file.relative_path,
                    Err(SyncError::Protocol("connection pool empty".into())),
                );
                continue;
            };

            let cycle = cycle.clone();
            let pool = self.pool.clone();
            let permits = self.permits.clone();
            let alive = self.alive.clone();
            let remaining = remaining.clone();
            tasks.spawn(async move {
                let rel = file.relative_path.clone();
                let (conn, result) = cycle(conn, file).await;
                if result.is_err() {
                    drop(conn);
                    permit.forget();
                    if alive.fetch_sub(1, Ordering::SeqCst) == 1 {
                        permits.close();
                    }
                } else {
                    pool.lock().push(conn);
                    drop(permit);
                }
                remaining.fetch_sub(1, Ordering::SeqCst);
                (rel, result)
            });

            // Reap finished cycles as we go so the report stays current
            while let Some(done) = tasks.try_join_next() {
                Self::collect(&mut report, done);
            }
        }

        while let Some(done) = tasks.join_next().await {
            Self::collect(&mut report, done);
        }
        debug_assert_eq!(remaining.load(Ordering::SeqCst), 0);
        report
    }

    fn collect(
        report: &mut TransferReport,
        done: Result<(String, SyncResult<CycleOutcome>), tokio::task::JoinError>,
    ) {
        match done {
            Ok((rel, result)) => {
                if let Err(e) = &result {
                    tracing::warn!(path = %rel, error = %e, "file cycle failed");
                }
                report.tally(rel, result)
            }
            Err(e) => report.tally(
                String::from("<task>"),
                Err(SyncError::Protocol(format!("transfer task died: {}", e))),
            ),
        }
    }

    /// Hand back the connections still in the pool.
    pub fn into_connections(self) -> Vec<C> {
        std::mem::take(&mut *self.pool.lock())
    }
}

/// Receive pushed files on every connection until `expected` files have
/// been accounted for or each peer closes its side.
pub async fn receive_all<T>(
    connections: Vec<Connection>,
    target: Arc<T>,
    expected: usize,
    abort: AbortFlag,
) -> TransferReport
where
    T: ReceiveTarget + 'static,
{
    let remaining = Arc::new(AtomicUsize::new(expected));
    let (done_tx, done_rx) = watch::channel(expected == 0);
    let done_tx = Arc::new(done_tx);
    let mut tasks: JoinSet<TransferReport> = JoinSet::new();

    for mut conn in connections {
        let target = target.clone();
        let remaining = remaining.clone();
        let done_tx = done_tx.clone();
        let mut done_rx = done_rx.clone();
        let abort = abort.clone();
        tasks.spawn(async move {
            let mut report = TransferReport::default();
            loop {
                if *done_rx.borrow() || abort.is_aborted() {
                    break;
                }
                let next = tokio::select! {
                    msg = conn.receive() => msg,
                    _ = done_rx.changed() => continue,
                };
                let descriptor = match next {
                    Ok(Some(Message::FileDescriptor(fd))) => fd,
                    Ok(None) => break,
                    Ok(Some(other)) => {
                        tracing::warn!(got = %other.message_type(), "unexpected message on receive connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "receive connection failed");
                        break;
                    }
                };
                let rel = descriptor.file.relative_path.clone();
                let result = receive_file(&mut conn, descriptor, &*target).await;
                let fatal = result.is_err();
                report.tally(rel, result);
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = done_tx.send(true);
                }
                if fatal {
                    break;
                }
            }
            conn.close().await;
            report
        });
    }
    drop(done_rx);

    let mut report = TransferReport::default();
    while let Some(done) = tasks.join_next().await {
        match done {
            Ok(r) => report.merge(r),
            Err(e) => tracing::warn!(error = %e, "receive task died"),
        }
    }
    report
}
