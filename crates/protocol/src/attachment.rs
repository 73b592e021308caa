//! Attachment streams over the protocol connection
//!
//! The consuming side sees each remote attachment as a `RemoteAttachment`
//! whose reader fetches bytes lazily: the first read sends `GetAttachment`
//! and the peer answers with `AttachmentData` chunks until an empty chunk.
//! The serving side keeps its attachments in an `AttachmentTable` and pumps
//! them from a blocking task, one confirmed chunk at a time.

use crate::{Connection, ManagementRequest, ManagementResponse, RequestContext, ResponseStream};
use bytes::{Buf, Bytes};
use dashmap::DashMap;
use proven_common::{AttachmentSource, OperationId};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Default number of bytes per `AttachmentData` chunk
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Attachment held by the peer, fetched on demand
///
/// When the last clone is dropped without a reader ever being opened, the
/// peer is told to release the attachment.
#[derive(Clone)]
pub struct RemoteAttachment {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    connection: Connection,
    op_id: OperationId,
    index: u32,
    opened: AtomicBool,
}

impl RemoteAttachment {
    pub fn new(connection: Connection, op_id: OperationId, index: u32) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                connection,
                op_id,
                index,
                opened: AtomicBool::new(false),
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    /// Proxies for `count` attachments of one operation
    pub fn all(connection: &Connection, op_id: OperationId, count: u32) -> Vec<Self> {
        (0..count)
            .map(|index| Self::new(connection.clone(), op_id, index))
            .collect()
    }

    /// Open a typed reader; closing it releases the attachment
    pub fn reader(&self) -> AttachmentReader {
        self.inner.opened.store(true, Ordering::SeqCst);
        AttachmentReader {
            connection: self.inner.connection.clone(),
            op_id: self.inner.op_id,
            index: self.inner.index,
            state: ReaderState::Idle,
            chunk: Bytes::new(),
        }
    }
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        if self.opened.load(Ordering::SeqCst) || self.connection.is_closed() {
            return;
        }
        if let Err(e) = self.connection.notify(
            self.op_id,
            ManagementRequest::CloseAttachment { index: self.index },
        ) {
            tracing::debug!(
                "Failed to release attachment {} of operation {}: {}",
                self.index,
                self.op_id,
                e
            );
        }
    }
}

impl fmt::Debug for RemoteAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAttachment")
            .field("op_id", &self.inner.op_id)
            .field("index", &self.inner.index)
            .finish()
    }
}

impl AttachmentSource for RemoteAttachment {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.reader()))
    }
}

enum ReaderState {
    Idle,
    Streaming {
        request_id: u64,
        responses: ResponseStream,
    },
    Finished,
    Failed(io::ErrorKind, String),
    Closed,
}

/// Pull-based reader over a remote attachment
///
/// Reads block the calling thread and must not be performed on an async
/// task. Once a fetch fails every later read returns the same error.
pub struct AttachmentReader {
    connection: Connection,
    op_id: OperationId,
    index: u32,
    state: ReaderState,
    chunk: Bytes,
}

impl AttachmentReader {
    /// Release both ends of the stream; idempotent
    ///
    /// The local end is always released. An error telling the peer is
    /// reported rather than swallowed.
    pub fn close(&mut self) -> io::Result<()> {
        self.chunk.clear();
        match std::mem::replace(&mut self.state, ReaderState::Closed) {
            ReaderState::Closed => return Ok(()),
            ReaderState::Streaming { request_id, .. } => {
                self.connection.discard_request(request_id);
            }
            ReaderState::Idle | ReaderState::Finished | ReaderState::Failed(..) => {}
        }

        if self.connection.is_closed() {
            return Ok(());
        }

        self.connection
            .notify(
                self.op_id,
                ManagementRequest::CloseAttachment { index: self.index },
            )
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    fn start(&mut self) -> io::Result<()> {
        let (sink, responses) = mpsc::unbounded_channel();
        match self.connection.request_with_sink(
            self.op_id,
            ManagementRequest::GetAttachment { index: self.index },
            sink,
        ) {
            Ok(request_id) => {
                self.state = ReaderState::Streaming {
                    request_id,
                    responses,
                };
                Ok(())
            }
            Err(e) => Err(self.fail(io::ErrorKind::BrokenPipe, e.to_string())),
        }
    }

    fn fail(&mut self, kind: io::ErrorKind, message: String) -> io::Error {
        tracing::debug!(
            "Attachment {} of operation {} failed: {}",
            self.index,
            self.op_id,
            message
        );
        self.state = ReaderState::Failed(kind, message.clone());
        io::Error::new(kind, message)
    }
}

impl Read for AttachmentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.chunk.has_remaining() {
                let n = buf.len().min(self.chunk.remaining());
                self.chunk.copy_to_slice(&mut buf[..n]);
                return Ok(n);
            }

            let next = match &mut self.state {
                ReaderState::Idle => {
                    self.start()?;
                    continue;
                }
                ReaderState::Streaming { responses, .. } => responses.blocking_recv(),
                ReaderState::Finished => return Ok(0),
                ReaderState::Failed(kind, message) => {
                    return Err(io::Error::new(*kind, message.clone()));
                }
                ReaderState::Closed => {
                    return Err(io::Error::other("attachment stream closed"));
                }
            };

            match next {
                Some(ManagementResponse::AttachmentData(data)) if data.is_empty() => {
                    self.state = ReaderState::Finished;
                }
                Some(ManagementResponse::AttachmentData(data)) => {
                    self.chunk = Bytes::from(data);
                }
                Some(ManagementResponse::Error { description }) => {
                    return Err(self.fail(io::ErrorKind::Other, description));
                }
                Some(other) => {
                    return Err(self.fail(
                        io::ErrorKind::InvalidData,
                        format!("unexpected {:?} while streaming", other.response_type()),
                    ));
                }
                None => {
                    return Err(self.fail(
                        io::ErrorKind::ConnectionAborted,
                        "connection closed while fetching attachment".to_string(),
                    ));
                }
            }
        }
    }
}

impl Drop for AttachmentReader {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!(
                "Failed to close attachment {} of operation {}: {}",
                self.index,
                self.op_id,
                e
            );
        }
    }
}

struct ServedAttachment {
    source: Arc<dyn AttachmentSource>,
    stop: Arc<AtomicBool>,
}

/// Attachments this side serves to the peer, keyed by operation and index
pub struct AttachmentTable {
    entries: DashMap<(OperationId, u32), ServedAttachment>,
    chunk_size: usize,
}

impl AttachmentTable {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Make an operation's attachments available by position
    pub fn insert(&self, op_id: OperationId, attachments: &[Arc<dyn AttachmentSource>]) {
        for (index, source) in attachments.iter().enumerate() {
            self.entries.insert(
                (op_id, index as u32),
                ServedAttachment {
                    source: source.clone(),
                    stop: Arc::new(AtomicBool::new(false)),
                },
            );
        }
    }

    /// Answer a `GetAttachment` request
    ///
    /// Must be called from within a tokio runtime; the pump runs on a
    /// blocking task.
    pub fn serve(&self, ctx: RequestContext, index: u32) {
        let op_id = ctx.op_id();
        let Some((source, stop)) = self
            .entries
            .get(&(op_id, index))
            .map(|entry| (entry.source.clone(), entry.stop.clone()))
        else {
            tracing::warn!("Operation {} has no attachment {}", op_id, index);
            let _ = ctx.send(ManagementResponse::error(format!(
                "no attachment {} for operation {}",
                index, op_id
            )));
            return;
        };

        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || pump(ctx, index, source, stop, chunk_size));
    }

    /// Stop and forget one attachment; returns whether it existed
    pub fn close(&self, op_id: OperationId, index: u32) -> bool {
        match self.entries.remove(&(op_id, index)) {
            Some((_, served)) => {
                served.stop.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Stop and forget every attachment of an operation
    pub fn remove_operation(&self, op_id: OperationId) {
        self.entries.retain(|(id, _), served| {
            if *id == op_id {
                served.stop.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&self) {
        for entry in self.entries.iter() {
            entry.stop.store(true, Ordering::SeqCst);
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AttachmentTable {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

fn pump(
    ctx: RequestContext,
    index: u32,
    source: Arc<dyn AttachmentSource>,
    stop: Arc<AtomicBool>,
    chunk_size: usize,
) {
    let op_id = ctx.op_id();
    let mut reader = match source.open() {
        Ok(reader) => reader,
        Err(e) => {
            let _ = ctx.send(ManagementResponse::error(format!(
                "failed to open attachment {}: {}",
                index, e
            )));
            return;
        }
    };

    let mut buf = vec![0u8; chunk_size];
    loop {
        if stop.load(Ordering::SeqCst) {
            tracing::debug!("Attachment {} of operation {} closed by peer", index, op_id);
            return;
        }

        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = ctx.send(ManagementResponse::AttachmentData(Vec::new()));
                return;
            }
            Ok(n) => {
                let written = ctx
                    .send_partial_confirmed(ManagementResponse::AttachmentData(buf[..n].to_vec()))
                    .ok()
                    .and_then(|confirm| confirm.blocking_recv().ok());
                if !matches!(written, Some(Ok(()))) {
                    tracing::debug!(
                        "Stopped streaming attachment {} of operation {}: channel unavailable",
                        index,
                        op_id
                    );
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(
                    "Failed to read attachment {} of operation {}: {}",
                    index,
                    op_id,
                    e
                );
                let _ = ctx.send(ManagementResponse::error(format!(
                    "failed to read attachment {}: {}",
                    index, e
                )));
                return;
            }
        }
    }
}
