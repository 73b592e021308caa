//! One end of a bidirectional framed connection
//!
//! Reads happen on a dedicated reader task that forwards decoded messages to
//! a `MessageReceiver`. Writes are enqueued and performed by a dedicated
//! writer task, so a caller never performs I/O on the task that is
//! dispatching inbound messages.

use crate::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use crate::{ChannelError, Message, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

/// Buffer size of the in-memory pipe used by `Channel::pair`
const PAIR_BUFFER_SIZE: usize = 64 * 1024;

/// Channel configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum size of one encoded message
    pub max_frame_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Outbound item queued for the writer task
struct Outbound {
    message: Message,
    confirm: Option<oneshot::Sender<Result<()>>>,
}

struct ChannelInner {
    name: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: watch::Sender<bool>,
    max_frame_size: usize,
}

/// Sending half of a connection; cheap to clone
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Open a channel over a byte stream
    ///
    /// Must be called from within a tokio runtime; the reader and writer
    /// tasks are spawned on it.
    pub fn open<T>(name: impl Into<String>, io: T, config: ChannelConfig) -> (Channel, MessageReceiver)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (reader, writer) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(ChannelInner {
            name: name.clone(),
            outbound: out_tx,
            closed: closed_tx,
            max_frame_size: config.max_frame_size,
        });

        tokio::spawn(run_writer(
            inner.clone(),
            writer,
            out_rx,
            config.max_frame_size,
        ));
        tokio::spawn(run_reader(
            inner.clone(),
            reader,
            in_tx,
            config.max_frame_size,
        ));

        (Channel { inner }, MessageReceiver { receiver: in_rx })
    }

    /// Create a connected in-memory pair
    pub fn pair() -> ((Channel, MessageReceiver), (Channel, MessageReceiver)) {
        let (a, b) = tokio::io::duplex(PAIR_BUFFER_SIZE);
        (
            Channel::open("pair-a", a, ChannelConfig::default()),
            Channel::open("pair-b", b, ChannelConfig::default()),
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_frame_size(&self) -> usize {
        self.inner.max_frame_size
    }

    /// Fails with `FrameTooLarge` if the writer would refuse `message`
    pub fn check_frame(&self, message: &Message) -> Result<()> {
        codec::encode_frame(message, self.inner.max_frame_size).map(|_| ())
    }

    /// Enqueue a message for the writer task
    ///
    /// Fails immediately if the channel is closed. Transport failures that
    /// happen later are only visible through `send_confirmed`.
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.inner
            .outbound
            .send(Outbound {
                message,
                confirm: None,
            })
            .map_err(|_| ChannelError::Closed)
    }

    /// Enqueue a message and get notified once the write was attempted
    pub fn send_confirmed(&self, message: Message) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        if self.is_closed() {
            let _ = tx.send(Err(ChannelError::Closed));
            return rx;
        }
        if let Err(mpsc::error::SendError(outbound)) = self.inner.outbound.send(Outbound {
            message,
            confirm: Some(tx),
        }) && let Some(confirm) = outbound.confirm
        {
            let _ = confirm.send(Err(ChannelError::Closed));
        }
        rx
    }

    /// Close both directions
    pub fn close(&self) {
        if !self.inner.closed.send_replace(true) {
            tracing::debug!("[{}] Channel closed", self.inner.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Wait until the channel is closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Receiving half of a connection
pub struct MessageReceiver {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl MessageReceiver {
    /// Receive the next message; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

async fn run_writer<W>(
    inner: Arc<ChannelInner>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    max_frame_size: usize,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = inner.closed.subscribe();

    loop {
        let item = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            item = outbound.recv() => item,
        };

        let Some(Outbound { message, confirm }) = item else {
            break;
        };

        let result = codec::write_message(&mut writer, &message, max_frame_size).await;
        let failed = match &result {
            // An oversized message is the caller's problem, not the connection's
            Err(ChannelError::FrameTooLarge { .. }) | Ok(()) => false,
            Err(_) => true,
        };

        if let Err(e) = &result {
            tracing::warn!("[{}] Failed to write message: {}", inner.name, e);
        }
        if let Some(confirm) = confirm {
            let _ = confirm.send(result);
        }
        if failed {
            break;
        }
    }

    inner.closed.send_replace(true);
}

async fn run_reader<R>(
    inner: Arc<ChannelInner>,
    mut reader: R,
    inbound: mpsc::UnboundedSender<Message>,
    max_frame_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = inner.closed.subscribe();

    loop {
        let read = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            read = codec::read_message(&mut reader, max_frame_size) => read,
        };

        match read {
            Ok(Some(message)) => {
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("[{}] Peer closed the connection", inner.name);
                break;
            }
            Err(e) => {
                tracing::warn!("[{}] Failed to read message: {}", inner.name, e);
                break;
            }
        }
    }

    inner.closed.send_replace(true);
}
