//! # Channel Abstraction
//!
//! A minimal async interface for moving render messages between a dispatcher
//! and a worker, whether they share a process or not.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: a channel moves whole `Message`s, in order. Framing,
//!   if any, is the channel's own business.
//! - **Streams Are Optional**: a live byte stream can only cross a channel that
//!   shares memory with its peer. Every other channel refuses it with
//!   `SendStreamError::NotTransferable`, handing the stream back so the caller
//!   can fall back to `Chunk` messages.

use std::fmt;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use plexwire::JobId;
use plexwire::Message;
use plexwire::RenderFailure;

/// A live byte stream. Errors travel in-band as render failures.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, RenderFailure>> + Send>>;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is gone or the pipe broke.
    ConnectionLost(String),
    /// The channel was closed locally.
    Closed,
    /// Generic I/O failure.
    Io(String),
    /// A frame could not be encoded or decoded.
    Wire(plexwire::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Channel closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<plexwire::Error> for Error {
    fn from(e: plexwire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One unit received from a channel.
pub enum Packet {
    Message(Message),
    /// A live stream, introduced by `head`.
    Stream { head: Message, stream: ByteStream },
}

impl Packet {
    pub fn id(&self) -> JobId {
        match self {
            Packet::Message(msg) => msg.id(),
            Packet::Stream { head, .. } => head.id(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            Packet::Stream { head, .. } => f.debug_struct("Stream").field("head", head).finish_non_exhaustive(),
        }
    }
}

/// Failure to hand a live stream to the peer.
pub enum SendStreamError {
    /// The channel cannot carry live streams. Both parts are returned untouched.
    NotTransferable { head: Message, stream: ByteStream },
    Transport(Error),
}

impl fmt::Debug for SendStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTransferable { head, .. } => {
                f.debug_struct("NotTransferable").field("head", head).finish_non_exhaustive()
            }
            Self::Transport(e) => f.debug_tuple("Transport").field(e).finish(),
        }
    }
}

impl fmt::Display for SendStreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTransferable { head, .. } => {
                write!(f, "Stream for job {} is not transferable over this channel", head.id())
            }
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SendStreamError {}

impl From<Error> for SendStreamError {
    fn from(e: Error) -> Self {
        Self::Transport(e)
    }
}

/// A duplex, ordered message channel.
///
/// This trait is object-safe (`Arc<dyn Channel>`). `recv` is expected to have a
/// single consumer at a time.
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Sends one message. Resolves once the message is fully handed off.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Hands a live stream to the peer, introduced by `head`.
    ///
    /// The default refuses; only channels sharing memory with their peer override it.
    async fn send_stream(&self, head: Message, stream: ByteStream) -> std::result::Result<(), SendStreamError> {
        Err(SendStreamError::NotTransferable { head, stream })
    }

    /// Receives the next packet. `Ok(None)` means the channel is closed.
    async fn recv(&self) -> Result<Option<Packet>>;

    /// Stops the channel. Pending and future `recv` calls return `Ok(None)`.
    fn close(&self);
}
