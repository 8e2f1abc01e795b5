//! In-process channel for thread-to-thread (task-to-task) rendering.
//!
//! Packets move over tokio mpsc channels, so live streams cross as-is.

use std::sync::Arc;

use plexwire::Message;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::ByteStream;
use crate::transport::Channel;
use crate::transport::Packet;
use crate::transport::SendStreamError;

/// One end of a connected in-process channel pair.
///
/// Closing either end closes both.
pub struct LocalChannel {
    tx: mpsc::UnboundedSender<Packet>,
    rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    closed: Arc<watch::Sender<bool>>,
}

impl LocalChannel {
    /// Creates a pair of channels connected to each other.
    ///
    /// Packets sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let closed = Arc::new(watch::Sender::new(false));

        let a = Self {
            tx: tx_a,
            rx: Mutex::new(rx_b),
            closed: Arc::clone(&closed),
        };

        let b = Self {
            tx: tx_b,
            rx: Mutex::new(rx_a),
            closed,
        };

        (a, b)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn push(&self, packet: Packet) -> transport::Result<()> {
        if self.is_closed() {
            return Err(transport::Error::Closed);
        }
        self.tx
            .send(packet)
            .map_err(|_| transport::Error::ConnectionLost("peer dropped".into()))
    }
}

#[async_trait::async_trait]
impl Channel for LocalChannel {
    async fn send(&self, msg: Message) -> transport::Result<()> {
        self.push(Packet::Message(msg))
    }

    async fn send_stream(&self, head: Message, stream: ByteStream) -> Result<(), SendStreamError> {
        self.push(Packet::Stream { head, stream }).map_err(SendStreamError::from)
    }

    async fn recv(&self) -> transport::Result<Option<Packet>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            packet = rx.recv() => Ok(packet),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}
