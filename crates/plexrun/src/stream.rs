//! Small byte stream utilities shared by the dispatcher, worker and multiplexer.

use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use plexwire::RenderFailure;
use tokio::sync::mpsc;

use crate::transport::ByteStream;

/// Sending half of a stream whose items are pushed from elsewhere.
pub type StreamController = mpsc::UnboundedSender<Result<Bytes, RenderFailure>>;

/// Creates a stream fed by a controller. The stream ends when the controller is dropped.
pub fn controlled() -> (StreamController, ByteStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, unbounded(rx))
}

/// Adapts an unbounded receiver into a stream.
pub fn unbounded<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> stream::BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Adapts a bounded receiver into a stream.
pub fn bounded<T: Send + 'static>(rx: mpsc::Receiver<T>) -> stream::BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// A stream of exactly one chunk.
pub fn once(chunk: Bytes) -> ByteStream {
    stream::once(async move { Ok(chunk) }).boxed()
}

/// A stream over prepared chunks.
pub fn from_chunks<I>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = Bytes>,
    I::IntoIter: Send + 'static,
{
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// Splits one stream into two that each observe every item.
///
/// A background task drives the source. Either copy may be dropped early
/// without stalling the other; the task stops once both are gone.
pub fn tee(mut source: ByteStream) -> (ByteStream, ByteStream) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut left = Some(left_tx);
        let mut right = Some(right_tx);

        while let Some(item) = source.next().await {
            if left.as_ref().is_some_and(|tx| tx.send(item.clone()).is_err()) {
                left = None;
            }
            if right.as_ref().is_some_and(|tx| tx.send(item).is_err()) {
                right = None;
            }
            if left.is_none() && right.is_none() {
                tracing::trace!("tee abandoned by both readers");
                break;
            }
        }
    });

    (unbounded(left_rx), unbounded(right_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tee_delivers_everything_to_both() {
        let source = from_chunks(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        let (left, right) = tee(source);

        let left: Vec<_> = left.map(|r| r.unwrap()).collect().await;
        let right: Vec<_> = right.map(|r| r.unwrap()).collect().await;
        assert_eq!(left, right);
        assert_eq!(left.len(), 2);
    }

    #[tokio::test]
    async fn test_tee_survives_dropped_copy() {
        let source = from_chunks((0..100).map(|i| Bytes::from(i.to_string())));
        let (left, right) = tee(source);
        drop(left);

        let right: Vec<_> = right.collect().await;
        assert_eq!(right.len(), 100);
    }

    #[tokio::test]
    async fn test_controlled_ends_when_controller_dropped() {
        let (ctrl, stream) = controlled();
        ctrl.send(Ok(Bytes::from_static(b"x"))).unwrap();
        ctrl.send(Err(RenderFailure::new("late"))).unwrap();
        drop(ctrl);

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_ref().unwrap_err().message, "late");
    }
}
