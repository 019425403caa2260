//! The optional channel to a parent process.
//!
//! Outbound sends are fire-and-forget and silently do nothing when there is
//! no parent. Inbound listening turns lines of JSON into typed events and
//! drops everything it cannot understand.

use crate::protocol::{decode_line, IpcMessage, IPC_ENV_STDIO, IPC_ENV_VAR};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub trait ParentChannel: Send + Sync {
    /// Whether a parent is attached and still reachable.
    fn is_connected(&self) -> bool;

    /// Queue `message` for the parent. Never blocks, never fails.
    fn send_message(&self, message: IpcMessage);
}

impl dyn ParentChannel {
    pub fn send<E: Serialize>(&self, event: &E) {
        match IpcMessage::from_event(event) {
            Ok(message) => self.send_message(message),
            Err(e) => tracing::warn!(error = %e, "dropping event that failed to serialize"),
        }
    }
}

/// Used when the process runs standalone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopParentChannel;

impl ParentChannel for NoopParentChannel {
    fn is_connected(&self) -> bool {
        false
    }

    fn send_message(&self, _message: IpcMessage) {}
}

/// Channel backed by a queue drained into a byte stream, one JSON line per message.
#[derive(Debug, Clone)]
pub struct StreamParentChannel {
    tx: mpsc::UnboundedSender<IpcMessage>,
}

impl StreamParentChannel {
    /// A channel plus the receiving end of its queue, for callers that drain it themselves.
    pub fn queued() -> (Self, mpsc::UnboundedReceiver<IpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Spawn a writer task that forwards queued messages to `writer`.
    pub fn spawn_writer<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (channel, rx) = Self::queued();
        let task = tokio::spawn(write_messages(writer, rx));
        (channel, task)
    }
}

impl ParentChannel for StreamParentChannel {
    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send_message(&self, message: IpcMessage) {
        if self.tx.send(message).is_err() {
            tracing::trace!("parent channel closed; dropping message");
        }
    }
}

async fn write_messages<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<IpcMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, id = %message.id, "failed to encode message");
                continue;
            }
        };
        tracing::trace!(id = %message.id, "sending to parent");
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::debug!(error = %e, "parent channel write failed");
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            tracing::debug!(error = %e, "parent channel write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "parent channel flush failed");
            break;
        }
    }
    tracing::debug!("parent channel writer finished");
}

/// Whether this process was started with a parent on stdio.
pub fn has_parent() -> bool {
    std::env::var(IPC_ENV_VAR).is_ok_and(|value| value == IPC_ENV_STDIO)
}

/// Parent channel over stdout when a parent is attached, otherwise a no-op.
///
/// Must be called from within a Tokio runtime.
pub fn detect_parent_channel() -> Arc<dyn ParentChannel> {
    if has_parent() {
        let (channel, _task) = StreamParentChannel::spawn_writer(tokio::io::stdout());
        tracing::debug!("parent channel attached on stdout");
        Arc::new(channel)
    } else {
        Arc::new(NoopParentChannel)
    }
}

/// Read newline-delimited envelopes from `reader` and forward the ones that decode as `E`.
///
/// Ends at EOF or when the receiver is dropped. Never fails.
pub fn listen<R, E>(reader: R) -> (mpsc::UnboundedReceiver<E>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    E: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        while let Some(line) = next_text_line(&mut reader, &mut buf).await {
            match decode_line::<E>(&line) {
                Some(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                None => tracing::trace!(line = %line, "ignoring unrecognised control message"),
            }
        }
        tracing::debug!("control channel listener finished");
    });
    (rx, task)
}

/// Next line from `reader` without its terminator, skipping lines that are not UTF-8.
///
/// `None` at EOF or on a read error.
pub(crate) async fn next_text_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        buf.clear();
        match reader.read_until(b'\n', buf).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "control channel read failed");
                return None;
            }
        }
        match std::str::from_utf8(buf) {
            Ok(text) => return Some(text.trim_end_matches(['\n', '\r']).to_string()),
            Err(e) => tracing::trace!(error = %e, bytes = buf.len(), "skipping line that is not UTF-8"),
        }
    }
}

/// Listen on stdin when a parent is attached; otherwise an already-closed receiver.
pub fn listen_to_parent<E>() -> mpsc::UnboundedReceiver<E>
where
    E: DeserializeOwned + Send + 'static,
{
    if has_parent() {
        listen(tokio::io::stdin()).0
    } else {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }
}
