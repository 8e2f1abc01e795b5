//! # Framed Channel
//!
//! Carries messages over any byte pipe (an OS pipe, a socket, a child's stdio)
//! as `u32BE` length-prefixed JSON frames.
//!
//! ## Invariants
//!
//! - **Whole Frames**: writes are serialized behind an async mutex and each
//!   frame is written completely before the next one starts, so concurrent
//!   senders never interleave bytes.
//! - **Backpressure**: `send` resolves only after the pipe accepted the frame.
//! - **Recoverable Garbage**: a frame that fails to decode is logged and
//!   skipped. An oversized length header is fatal, since the position of the
//!   next header is unknown.
//! - **Single Close**: the close notification fires once, whichever side
//!   (local `close`, end of input, or a read failure) triggers it.
//! - **Local Close Wins**: after a local `close`, `recv` returns `None` even if
//!   frames were already read. After the peer hangs up, frames already read
//!   are still delivered first.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use plexwire::FrameBuffer;
use plexwire::Message;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Channel;
use crate::transport::Packet;

const READ_CHUNK: usize = 8 * 1024;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct FramedChannel {
    writer: Mutex<Writer>,
    inbox: Mutex<mpsc::UnboundedReceiver<transport::Result<Message>>>,
    closed: Arc<watch::Sender<bool>>,
    closed_locally: AtomicBool,
    max_frame_len: usize,
    child: std::sync::Mutex<Option<Child>>,
}

impl FramedChannel {
    /// Wraps a reader/writer pair. Must be called within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W, max_frame_len: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(watch::Sender::new(false));

        tokio::spawn(read_frames(reader, FrameBuffer::with_max_len(max_frame_len), tx, Arc::clone(&closed)));

        Self {
            writer: Mutex::new(Box::new(writer)),
            inbox: Mutex::new(rx),
            closed,
            closed_locally: AtomicBool::new(false),
            max_frame_len,
            child: std::sync::Mutex::new(None),
        }
    }

    /// Starts `command` with piped stdio and talks to it as a worker process.
    /// The child is killed when the channel closes or is dropped.
    pub fn spawn(command: &mut Command, max_frame_len: usize) -> transport::Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| transport::Error::Io("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| transport::Error::Io("child stdout unavailable".into()))?;

        tracing::debug!(pid = child.id(), "spawned worker process");

        let channel = Self::new(stdout, stdin, max_frame_len);
        if let Ok(mut slot) = channel.child.lock() {
            *slot = Some(child);
        }
        Ok(channel)
    }

    /// The worker-process side of [`FramedChannel::spawn`].
    pub fn stdio(max_frame_len: usize) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), max_frame_len)
    }

    /// Resolves once the channel has closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Marks the channel closed. Returns whether this call did it.
fn mark_closed(closed: &watch::Sender<bool>) -> bool {
    closed.send_if_modified(|c| !std::mem::replace(c, true))
}

async fn read_frames<R>(
    mut reader: R,
    mut frames: FrameBuffer,
    inbox: mpsc::UnboundedSender<transport::Result<Message>>,
    closed: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut closed_rx = closed.subscribe();
    let mut chunk = vec![0u8; READ_CHUNK];

    'read: loop {
        let n = tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break 'read,
                Ok(n) => n,
                Err(e) => {
                    let _ = inbox.send(Err(e.into()));
                    break 'read;
                }
            },
            _ = closed_rx.wait_for(|c| *c) => break 'read,
        };

        frames.push(&chunk[..n]);
        loop {
            match frames.next_message() {
                Ok(Some(msg)) => {
                    if inbox.send(Ok(msg)).is_err() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(plexwire::Error::FrameTooLarge { len, max }) => {
                    tracing::error!(len, max, "oversized frame, dropping connection");
                    let _ = inbox.send(Err(plexwire::Error::FrameTooLarge { len, max }.into()));
                    break 'read;
                }
                Err(e) => tracing::warn!(error = %e, "protocol violation: skipping undecodable frame"),
            }
        }
    }

    if frames.buffered() > 0 {
        tracing::debug!(bytes = frames.buffered(), "discarding partial frame");
    }
    if mark_closed(&closed) {
        tracing::debug!("framed channel closed by peer");
    }
}

#[async_trait::async_trait]
impl Channel for FramedChannel {
    async fn send(&self, msg: Message) -> transport::Result<()> {
        if self.is_closed() {
            return Err(transport::Error::Closed);
        }

        let frame = plexwire::encode_frame_with_limit(&msg, self.max_frame_len)?;
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => transport::Error::ConnectionLost(e.to_string()),
            _ => e.into(),
        })
    }

    async fn recv(&self) -> transport::Result<Option<Packet>> {
        if self.closed_locally.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut closed = self.closed.subscribe();
        let mut inbox = self.inbox.lock().await;

        // Frames already read are still delivered after the peer hung up.
        let next = tokio::select! {
            biased;
            next = inbox.recv() => next,
            _ = closed.wait_for(|c| *c), if !self.is_closed() => None,
        };
        if self.closed_locally.load(Ordering::SeqCst) {
            return Ok(None);
        }

        match next {
            Some(Ok(msg)) => Ok(Some(Packet::Message(msg))),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&self) {
        self.closed_locally.store(true, Ordering::SeqCst);
        if mark_closed(&self.closed) {
            tracing::debug!("framed channel closed locally");
        }
        if let Ok(mut slot) = self.child.lock() {
            if let Some(child) = slot.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        mark_closed(&self.closed);
    }
}
