//! Integration tests for plexrun: dispatcher and worker end to end.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use plexrun::ByteStream;
use plexrun::Callbacks;
use plexrun::Channel;
use plexrun::Dispatcher;
use plexrun::FramedChannel;
use plexrun::LocalChannel;
use plexrun::MarkupOptions;
use plexrun::Packet;
use plexrun::Prerendered;
use plexrun::RenderError;
use plexrun::RenderJob;
use plexrun::Renderer;
use plexrun::SendStreamError;
use plexrun::Worker;
use plexrun::WorkerConfig;
use plexrun::dispatcher;
use plexrun::stream;
use plexrun::telemetry;
use plexrun::testing::ScriptedRenderer;
use plexrun::transport;
use plexwire::JobId;
use plexwire::Message;
use plexwire::RenderFailure;
use plexwire::RenderOptions;
use plexwire::Value;

const CLIENT_REF: &str = "1:I[\"./Counter.js\",[],\"default\"]\n";
const MAX_FRAME: usize = 1024 * 1024;

fn graph(rows: Vec<String>) -> ByteStream {
    stream::from_chunks(rows.into_iter().map(Bytes::from).collect::<Vec<_>>())
}

async fn collect(stream: ByteStream) -> anyhow::Result<String> {
    let chunks: Vec<Result<Bytes, RenderFailure>> = stream.collect().await;
    let mut out = Vec::new();
    for chunk in chunks {
        out.extend_from_slice(&chunk?);
    }
    Ok(String::from_utf8(out)?)
}

/// Polls `done` until it holds, for at most a second.
async fn eventually(done: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}

/// A dispatcher and a served worker joined by an in-process channel.
fn local_pair(worker: Worker<ScriptedRenderer>) -> Dispatcher {
    let (caller, serving) = LocalChannel::pair();
    tokio::spawn(async move { worker.serve(Arc::new(serving)).await });
    Dispatcher::new(caller)
}

/// A dispatcher and a served worker joined by framed byte pipes.
fn framed_pair(worker: Worker<ScriptedRenderer>) -> Dispatcher {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);

    let serving = FramedChannel::new(right_read, right_write, MAX_FRAME);
    tokio::spawn(async move { worker.serve(Arc::new(serving)).await });
    Dispatcher::new(FramedChannel::new(left_read, left_write, MAX_FRAME))
}

// --- Test 1: Concurrent Jobs Stay Separate (Local) ---

#[tokio::test]
async fn test_concurrent_jobs_over_local_channel() -> anyhow::Result<()> {
    let dispatcher = Arc::new(local_pair(Worker::new(ScriptedRenderer::rows())));

    let mut calls = Vec::new();
    for i in 0..20 {
        let d = Arc::clone(&dispatcher);
        calls.push(tokio::spawn(async move {
            let rows = vec![CLIENT_REF.to_string(), format!("0:\"job-{:03}\"\n", i)];
            let out = d.dispatch(RenderJob::new(graph(rows), RenderOptions::default()), Callbacks::new()).await?;
            collect(out).await.map(|text| (i, text))
        }));
    }

    for call in calls {
        let (i, text) = call.await??;
        let marker = format!("job-{:03}", i);
        assert!(text.starts_with(&format!("<p>{}</p>", marker)), "job {} got {}", i, text);
        assert_eq!(text.matches("job-").count(), 2, "job {} saw foreign output: {}", i, text);
    }
    Ok(())
}

// --- Test 2: Chunked Fallback Over Framed Pipes ---

#[tokio::test]
async fn test_render_over_framed_channel() -> anyhow::Result<()> {
    let dispatcher = framed_pair(Worker::new(ScriptedRenderer::rows()));

    let rows = vec![CLIENT_REF.to_string(), "0:\"hello\"\n".into(), "2:\"world\"\n".into()];
    let out = dispatcher.dispatch(RenderJob::new(graph(rows), RenderOptions::default()), Callbacks::new()).await?;
    let text = collect(out).await?;

    assert!(text.starts_with("<p>hello</p>"));
    assert!(text.contains("<p>world</p>"));
    assert_eq!(text.matches(".push(").count(), 3);
    Ok(())
}

// --- Test 3: Fatal Render Error Rejects The Job ---

#[tokio::test]
async fn test_fatal_error_over_framed_channel() {
    let worker = Worker::new(ScriptedRenderer::rows().failing(RenderFailure::new("broken tree")));
    let dispatcher = framed_pair(worker);

    let result = dispatcher
        .dispatch(RenderJob::new(graph(vec!["0:\"a\"\n".into()]), RenderOptions::default()), Callbacks::new())
        .await;

    match result {
        Err(dispatcher::Error::Render(e)) => assert_eq!(e.message, "broken tree"),
        Err(other) => panic!("Expected render error, got {}", other),
        Ok(_) => panic!("Expected render error, got output"),
    }
}

// --- Test 4: Prerender Reports Postponed State ---

#[tokio::test]
async fn test_prerender_postpones_through_callbacks() -> anyhow::Result<()> {
    let dispatcher = local_pair(Worker::new(ScriptedRenderer::rows()));

    let postponed = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&postponed);
    let callbacks = Callbacks::new().on_postponed(move |state| *slot.lock().unwrap() = Some(state));

    let rows = vec!["0:\"a\"\n".into(), "1:\"SUSPEND\"\n".into(), "2:\"b\"\n".into()];
    let options = RenderOptions { is_prerender: true, ..Default::default() };
    let out = dispatcher.dispatch(RenderJob::new(graph(rows), options), callbacks).await?;
    let text = collect(out).await?;

    assert_eq!(text, "<p>a</p>");

    for _ in 0..100 {
        if dispatcher.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let state = postponed.lock().unwrap().clone();
    assert_eq!(state, Some(Value::from_iter([("row", Value::from(1i64))])));
    Ok(())
}

// --- Test 5: Recoverable Error Arrives With Start ---

#[tokio::test]
async fn test_recoverable_error_reaches_start_callback() -> anyhow::Result<()> {
    let worker = Worker::new(ScriptedRenderer::rows().reporting(RenderFailure::new("soft")))
        .with_config(WorkerConfig::default().with_dev(true));
    let dispatcher = framed_pair(worker);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (on_start, on_error) = (Arc::clone(&seen), Arc::clone(&seen));
    let callbacks = Callbacks::new()
        .on_start(move |e| on_start.lock().unwrap().push(format!("start:{:?}", e.map(|e| e.message))))
        .on_error(move |e| on_error.lock().unwrap().push(format!("error:{}", e.message)));

    let out = dispatcher
        .dispatch(RenderJob::new(graph(vec!["0:\"a\"\n".into()]), RenderOptions::default()), callbacks)
        .await?;
    let text = collect(out).await?;
    assert!(text.starts_with("<p>a</p><script>"));

    for _ in 0..100 {
        if dispatcher.pending_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*seen.lock().unwrap(), vec!["start:Some(\"soft\")".to_string(), "error:soft".to_string()]);
    Ok(())
}

// --- Test 6: Framed Channel Basics ---

#[tokio::test]
async fn test_framed_round_trip_and_stream_fallback() -> anyhow::Result<()> {
    let (left, right) = tokio::io::duplex(1024);
    let (lr, lw) = tokio::io::split(left);
    let (rr, rw) = tokio::io::split(right);
    let a = Arc::new(FramedChannel::new(lr, lw, MAX_FRAME));
    let b = FramedChannel::new(rr, rw, MAX_FRAME);

    // Larger than the pipe buffer, so the write only completes as the reader drains.
    let chunk = Bytes::from(vec![b'x'; 200 * 1024]);
    let sent = Message::Chunk { id: JobId(42), chunk };
    let sender = Arc::clone(&a);
    let expected = sent.clone();
    let writer = tokio::spawn(async move { sender.send(expected).await });

    match b.recv().await? {
        Some(Packet::Message(msg)) => assert_eq!(msg, sent),
        other => panic!("Expected message, got {:?}", other),
    }
    writer.await??;

    let head = Message::Done { id: JobId(1), error: None };
    match a.send_stream(head.clone(), stream::once(Bytes::from_static(b"x"))).await {
        Err(SendStreamError::NotTransferable { head: returned, .. }) => assert_eq!(returned, head),
        Err(other) => panic!("Expected NotTransferable, got {}", other),
        Ok(()) => panic!("Framed channel accepted a live stream"),
    }
    Ok(())
}

#[tokio::test]
async fn test_framed_skips_malformed_frames() -> anyhow::Result<()> {
    let (mut raw, side) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(side);
    let channel = FramedChannel::new(read, write, MAX_FRAME);

    let garbage = b"not json";
    raw.write_all(&(garbage.len() as u32).to_be_bytes()).await?;
    raw.write_all(garbage).await?;
    let valid = Message::Done { id: JobId(5), error: None };
    raw.write_all(&plexwire::encode_frame(&valid)?).await?;

    match channel.recv().await? {
        Some(Packet::Message(msg)) => assert_eq!(msg, valid),
        other => panic!("Expected the valid frame, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_framed_rejects_oversized_header() -> anyhow::Result<()> {
    let (mut raw, side) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(side);
    let channel = FramedChannel::new(read, write, 16);

    raw.write_all(&1000u32.to_be_bytes()).await?;

    let result = channel.recv().await;
    assert!(matches!(
        result,
        Err(transport::Error::Wire(plexwire::Error::FrameTooLarge { len: 1000, max: 16 }))
    ));
    channel.closed().await;
    Ok(())
}

#[tokio::test]
async fn test_framed_peer_eof_and_local_close() -> anyhow::Result<()> {
    let (raw, side) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(side);
    let channel = FramedChannel::new(read, write, MAX_FRAME);

    drop(raw);
    assert!(channel.recv().await?.is_none());
    channel.closed().await;
    assert!(channel.is_closed());

    let (_raw, side) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(side);
    let channel = FramedChannel::new(read, write, MAX_FRAME);

    channel.close();
    assert!(channel.recv().await?.is_none());
    let sent = channel.send(Message::Done { id: JobId(1), error: None }).await;
    assert!(matches!(sent, Err(transport::Error::Closed)));
    Ok(())
}

// --- Test 7: Worker Shuts Down With Its Channel ---

#[tokio::test]
async fn test_worker_serve_returns_when_channel_closes() {
    let (caller, serving) = LocalChannel::pair();
    let worker = Worker::new(ScriptedRenderer::rows());
    let serve = tokio::spawn(async move { worker.serve(Arc::new(serving)).await });

    caller.close();
    tokio::time::timeout(Duration::from_secs(1), serve)
        .await
        .expect("worker kept serving a closed channel")
        .unwrap();
}

// --- Test 8: Telemetry Installs Once ---

#[test]
fn test_telemetry_init_is_single_shot() {
    let _ = telemetry::init("plexrun=debug");
    assert!(telemetry::init("plexrun=debug").is_err());
}

// --- Test 9: Broken Graph Reaches The Caller Over Framed Pipes ---

#[tokio::test]
async fn test_graph_failure_survives_chunked_transfer() -> anyhow::Result<()> {
    let dispatcher = framed_pair(Worker::new(ScriptedRenderer::rows()));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callbacks = Callbacks::new().on_error(move |e| sink.lock().unwrap().push(e.message));

    let tree: ByteStream = futures::stream::iter(vec![
        Ok(Bytes::from_static(b"0:\"a\"\n")),
        Err(RenderFailure::new("graph broke")),
    ])
    .boxed();
    let out = dispatcher.dispatch(RenderJob::new(tree, RenderOptions::default()), callbacks).await?;
    let text = collect(out).await?;
    assert!(text.starts_with("<p>a</p>"));

    assert!(eventually(|| dispatcher.pending_count() == 0).await);
    assert_eq!(*seen.lock().unwrap(), vec!["graph broke".to_string()]);
    Ok(())
}

// --- Test 10: Finished Jobs Do Not Linger ---

#[tokio::test]
async fn test_failed_jobs_are_reaped_on_a_live_channel() -> anyhow::Result<()> {
    let worker = Worker::new(ScriptedRenderer::rows().failing(RenderFailure::new("nope")));
    let dispatcher = local_pair(worker.clone());

    for _ in 0..10 {
        let result = dispatcher
            .dispatch(RenderJob::new(graph(vec!["0:\"a\"\n".into()]), RenderOptions::default()), Callbacks::new())
            .await;
        assert!(matches!(result, Err(dispatcher::Error::Render(_))));
    }

    assert!(eventually(|| worker.active_jobs() == 0).await);
    Ok(())
}

// --- Test 11: Closing The Channel Cancels Jobs In Flight ---

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Produces one chunk of markup and then never finishes.
struct HangingRenderer {
    dropped: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Renderer for HangingRenderer {
    type Tree = ByteStream;

    fn materialize(&self, graph: ByteStream) -> ByteStream {
        graph
    }

    async fn render_markup(&self, tree: ByteStream, _options: MarkupOptions) -> Result<ByteStream, RenderError> {
        let flag = DropFlag(Arc::clone(&self.dropped));
        let markup = futures::stream::once(async { Ok(Bytes::from_static(b"<p>live</p>")) })
            .chain(futures::stream::pending())
            .map(move |item| {
                let _held = (&flag, &tree);
                item
            });
        Ok(markup.boxed())
    }

    async fn prerender_markup(&self, _tree: ByteStream, _options: MarkupOptions) -> Result<Prerendered, RenderError> {
        Err(RenderError::Failed(RenderFailure::new("unsupported")))
    }

    async fn resume_markup(
        &self,
        _tree: ByteStream,
        _postponed: Value,
        _options: MarkupOptions,
    ) -> Result<ByteStream, RenderError> {
        Err(RenderError::Failed(RenderFailure::new("unsupported")))
    }
}

#[tokio::test]
async fn test_close_cancels_running_jobs() -> anyhow::Result<()> {
    let dropped = Arc::new(AtomicBool::new(false));
    let worker = Worker::new(HangingRenderer { dropped: Arc::clone(&dropped) });
    let (caller, serving) = LocalChannel::pair();
    let serving_worker = worker.clone();
    let serve = tokio::spawn(async move { serving_worker.serve(Arc::new(serving)).await });

    // A chunked job whose graph never ends keeps an inbound controller registered.
    let id = JobId(11);
    caller.send(Message::Render { id, options: RenderOptions::default() }).await?;
    caller.send(Message::Chunk { id, chunk: Bytes::from_static(b"0:{}\n") }).await?;

    match caller.recv().await? {
        Some(Packet::Stream { head: Message::Start { id: started, .. }, .. }) => assert_eq!(started, id),
        other => panic!("Expected start with output, got {:?}", other),
    }
    assert_eq!(worker.active_jobs(), 1);
    assert!(!dropped.load(Ordering::SeqCst));

    caller.close();
    tokio::time::timeout(Duration::from_secs(1), serve).await??;

    assert_eq!(worker.active_jobs(), 0);
    assert!(eventually(|| dropped.load(Ordering::SeqCst)).await);
    Ok(())
}

// --- Test 12: Local Close Discards Queued Frames ---

#[tokio::test]
async fn test_framed_local_close_discards_read_frames() -> anyhow::Result<()> {
    let (mut raw, side) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(side);
    let channel = FramedChannel::new(read, write, MAX_FRAME);

    raw.write_all(&plexwire::encode_frame(&Message::Done { id: JobId(3), error: None })?).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.close();
    assert!(channel.recv().await?.is_none());
    Ok(())
}
