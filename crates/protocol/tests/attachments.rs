//! Attachment streaming between two connections

use proven_channel::Channel;
use proven_common::{AttachmentSource, BytesAttachment, OperationId};
use proven_protocol::{
    AttachmentTable, Connection, ManagementRequest, RemoteAttachment, RequestContext,
    RequestHandler,
};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Serving {
    table: Arc<AttachmentTable>,
}

impl RequestHandler for Serving {
    fn handle_request(&self, ctx: RequestContext, request: ManagementRequest) {
        match request {
            ManagementRequest::GetAttachment { index } => self.table.serve(ctx, index),
            ManagementRequest::CloseAttachment { index } => {
                self.table.close(ctx.op_id(), index);
            }
            _ => {}
        }
    }
}

struct Ignoring;

impl RequestHandler for Ignoring {
    fn handle_request(&self, _ctx: RequestContext, _request: ManagementRequest) {}
}

/// Endless source that records when its reader is dropped
#[derive(Debug)]
struct EndlessSource {
    dropped: Arc<AtomicBool>,
}

struct EndlessReader {
    dropped: Arc<AtomicBool>,
}

impl Read for EndlessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(7);
        Ok(buf.len())
    }
}

impl Drop for EndlessReader {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

impl AttachmentSource for EndlessSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(EndlessReader {
            dropped: self.dropped.clone(),
        }))
    }
}

#[derive(Debug)]
struct BrokenSource;

impl AttachmentSource for BrokenSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Err(io::Error::new(io::ErrorKind::NotFound, "deployment content missing"))
    }
}

fn connect(chunk_size: usize) -> (Connection, Arc<AttachmentTable>) {
    let ((a, a_rx), (b, b_rx)) = Channel::pair();
    let table = Arc::new(AttachmentTable::new(chunk_size));
    let consumer = Connection::open(a, a_rx, Arc::new(Ignoring));
    let _server = Connection::open(
        b,
        b_rx,
        Arc::new(Serving {
            table: table.clone(),
        }),
    );
    (consumer, table)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_round_trip_yields_identical_bytes() {
    let (consumer, table) = connect(1000);
    let op = OperationId::new(11);
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let source: Arc<dyn AttachmentSource> = Arc::new(BytesAttachment::new(payload.clone()));
    table.insert(op, &[source]);

    let remote = RemoteAttachment::new(consumer, op, 0);
    let received = tokio::task::spawn_blocking(move || {
        let mut reader = remote.open()?;
        let mut received = Vec::new();
        reader.read_to_end(&mut received)?;
        io::Result::Ok(received)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(received, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_before_end_stops_the_pump() {
    let (consumer, table) = connect(512);
    let op = OperationId::new(12);
    let dropped = Arc::new(AtomicBool::new(false));
    let source: Arc<dyn AttachmentSource> = Arc::new(EndlessSource {
        dropped: dropped.clone(),
    });
    table.insert(op, &[source]);

    let remote = RemoteAttachment::new(consumer, op, 0);
    tokio::task::spawn_blocking(move || {
        let mut reader = remote.reader();
        let mut buf = [0u8; 100];
        reader.read_exact(&mut buf)?;
        assert!(buf.iter().all(|b| *b == 7));
        reader.close()?;
        // Second close is a no-op
        reader.close()
    })
    .await
    .unwrap()
    .unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pump should release the source after close");
    assert!(table.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_error_is_sticky() {
    let (consumer, table) = connect(512);
    let op = OperationId::new(13);
    let source: Arc<dyn AttachmentSource> = Arc::new(BrokenSource);
    table.insert(op, &[source]);

    let remote = RemoteAttachment::new(consumer, op, 0);
    let (first, second) = tokio::task::spawn_blocking(move || {
        let mut reader = remote.reader();
        let mut buf = [0u8; 16];
        let first = reader.read(&mut buf).unwrap_err();
        let second = reader.read(&mut buf).unwrap_err();
        (first.to_string(), second.to_string())
    })
    .await
    .unwrap();

    assert!(first.contains("deployment content missing"));
    assert_eq!(first, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_index_is_an_error() {
    let (consumer, _table) = connect(512);

    let remote = RemoteAttachment::new(consumer, OperationId::new(14), 3);
    let error = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        remote.reader().read_to_end(&mut buf).unwrap_err()
    })
    .await
    .unwrap();

    assert!(error.to_string().contains("no attachment 3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unopened_attachment_is_released_by_last_drop() {
    let (consumer, table) = connect(512);
    let op = OperationId::new(15);
    let source: Arc<dyn AttachmentSource> = Arc::new(BytesAttachment::new(b"abc".to_vec()));
    table.insert(op, &[source]);

    let remote = RemoteAttachment::new(consumer, op, 0);
    let copy = remote.clone();
    drop(remote);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(table.len(), 1);

    drop(copy);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !table.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dropping the last handle should release the attachment");
}
