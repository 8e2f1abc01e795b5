//! # Render Worker
//!
//! The serving side of a render channel. A worker accepts render jobs, runs a
//! [`Multiplexer`] for each, and streams the merged output back.
//!
//! Per job, replies follow a fixed order: either a single `Error` (nothing
//! could be produced), or `Start`, the output (attached to `Start` when the
//! channel can carry live streams, otherwise as `Chunk`s), an optional
//! `Postponed`, and a terminal `Done`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures::StreamExt;
use plexwire::JobId;
use plexwire::Message;
use plexwire::RenderFailure;
use plexwire::RenderOptions;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::WorkerConfig;
use crate::fragment::TlFragmentParser;
use crate::framed::FramedChannel;
use crate::mux::Multiplexer;
use crate::mux::Outcome;
use crate::renderer::ErrorSink;
use crate::renderer::FragmentParser;
use crate::renderer::ParserFactory;
use crate::renderer::RenderError;
use crate::renderer::Renderer;
use crate::stream;
use crate::stream::StreamController;
use crate::transport;
use crate::transport::ByteStream;
use crate::transport::Channel;
use crate::transport::Packet;
use crate::transport::SendStreamError;

pub struct Worker<R: Renderer> {
    renderer: Arc<R>,
    config: WorkerConfig,
    parsers: ParserFactory,
    active: Arc<AtomicUsize>,
}

impl<R: Renderer> Clone for Worker<R> {
    fn clone(&self) -> Self {
        Self {
            renderer: Arc::clone(&self.renderer),
            config: self.config.clone(),
            parsers: Arc::clone(&self.parsers),
            active: Arc::clone(&self.active),
        }
    }
}

/// Counts a job as active for as long as its task is alive, aborted or not.
struct ActiveJob(Arc<AtomicUsize>);

impl ActiveJob {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The multiplexer task of one job. Dropping it aborts the render.
struct RenderTask(JoinHandle<Result<Outcome, RenderError>>);

impl Drop for RenderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<R: Renderer> Worker<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer: Arc::new(renderer),
            config: WorkerConfig::default(),
            parsers: Arc::new(|| Box::new(TlFragmentParser::new()) as Box<dyn FragmentParser>),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the fragment parser used by remote-mode jobs.
    pub fn with_fragment_parser(mut self, factory: impl Fn() -> Box<dyn FragmentParser> + Send + Sync + 'static) -> Self {
        self.parsers = Arc::new(factory);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Jobs currently running, over every channel this worker (or a clone) serves.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Serves jobs arriving on this process's stdin until it closes.
    pub async fn serve_stdio(&self) {
        let channel = FramedChannel::stdio(self.config.max_frame_len);
        self.serve(Arc::new(channel)).await;
    }

    /// Serves jobs arriving on `channel` until it closes.
    ///
    /// Jobs run concurrently, one task each. When the channel closes, jobs
    /// still running are aborted and joined before this returns, since nobody
    /// can receive their output.
    pub async fn serve(&self, channel: Arc<dyn Channel>) {
        let mut inbound: HashMap<JobId, StreamController> = HashMap::new();
        let mut jobs = JoinSet::new();

        loop {
            let packet = match channel.recv().await {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "channel failed in worker");
                    break;
                }
            };

            while jobs.try_join_next().is_some() {}

            let id = packet.id();
            match packet {
                Packet::Stream { head: Message::Render { options, .. }, stream } => {
                    self.start(&mut jobs, &channel, id, options, stream);
                }
                Packet::Message(Message::Render { options, .. }) => {
                    let (ctrl, tree) = stream::controlled();
                    inbound.insert(id, ctrl);
                    self.start(&mut jobs, &channel, id, options, tree);
                }
                Packet::Message(Message::Chunk { chunk, .. }) => match inbound.get(&id) {
                    Some(ctrl) => {
                        let _ = ctrl.send(Ok(chunk));
                    }
                    None => tracing::warn!(%id, "dropping graph chunk for unknown job"),
                },
                Packet::Message(Message::Done { error, .. }) => match inbound.remove(&id) {
                    Some(ctrl) => {
                        if let Some(error) = error {
                            tracing::debug!(%id, error = %error, "component graph failed at the caller");
                            let _ = ctrl.send(Err(error));
                        }
                    }
                    None => tracing::warn!(%id, "dropping graph end for unknown job"),
                },
                other => {
                    tracing::warn!(%id, packet = ?other, "protocol violation: unexpected packet at worker");
                }
            }
        }

        if !inbound.is_empty() || !jobs.is_empty() {
            tracing::debug!(inbound = inbound.len(), running = jobs.len(), "channel closed, releasing jobs");
        }
        inbound.clear();
        jobs.abort_all();
        while jobs.join_next().await.is_some() {}
    }

    fn start(
        &self,
        jobs: &mut JoinSet<()>,
        channel: &Arc<dyn Channel>,
        id: JobId,
        options: RenderOptions,
        tree: ByteStream,
    ) {
        let worker = self.clone();
        let channel = Arc::clone(channel);
        let active = ActiveJob::enter(&self.active);
        let span = tracing::info_span!("render_job", %id);

        jobs.spawn(
            async move {
                let _active = active;
                worker.run_job(channel, id, options, tree).await;
            }
            .instrument(span),
        );
    }

    async fn run_job(&self, channel: Arc<dyn Channel>, id: JobId, options: RenderOptions, tree: ByteStream) {
        tracing::debug!(remote = options.remote, prerender = options.is_prerender, "job started");

        let errors = ErrorSink::new();
        let (tx, rx) = mpsc::channel::<Bytes>(self.config.output_buffer);
        let mux = Multiplexer::new(Arc::clone(&self.renderer), self.config.clone(), (self.parsers)());
        let mut render = RenderTask(tokio::spawn(mux.run(tree, options, errors.clone(), tx)));

        let mut output = stream::bounded(rx);
        let Some(first) = output.next().await else {
            // The multiplexer finished without writing anything.
            let result = join(&mut render).await;
            if let Err(e) = self.finish(&channel, id, result, &errors, false).await {
                tracing::debug!(error = %e, "could not report job result");
            }
            return;
        };

        let start = Message::Start { id, error: errors.first() };
        let body: ByteStream = stream::once(first).chain(output.map(Ok)).boxed();

        let sent = match channel.send_stream(start, body).await {
            Ok(()) => Ok(()),
            Err(SendStreamError::NotTransferable { head, stream }) => Self::send_chunked(&channel, id, head, stream).await,
            Err(SendStreamError::Transport(e)) => Err(e),
        };
        if let Err(e) = sent {
            tracing::debug!(error = %e, "output undeliverable, abandoning job");
            return;
        }

        let result = join(&mut render).await;
        if let Err(e) = self.finish(&channel, id, result, &errors, true).await {
            tracing::debug!(error = %e, "could not report job result");
        }
    }

    async fn send_chunked(
        channel: &Arc<dyn Channel>,
        id: JobId,
        head: Message,
        mut body: ByteStream,
    ) -> transport::Result<()> {
        channel.send(head).await?;
        while let Some(item) = body.next().await {
            // Output chunks are never errors; the multiplexer reports failures out of band.
            if let Ok(chunk) = item {
                channel.send(Message::Chunk { id, chunk }).await?;
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        channel: &Arc<dyn Channel>,
        id: JobId,
        result: Result<Outcome, RenderError>,
        errors: &ErrorSink,
        started: bool,
    ) -> transport::Result<()> {
        match result {
            Ok(outcome) => {
                if !started {
                    channel.send(Message::Start { id, error: errors.first() }).await?;
                }
                if let Some(state) = outcome.postponed {
                    channel.send(Message::Postponed { id, state }).await?;
                }
                let error = errors.first();
                tracing::debug!(failed = error.is_some(), "job done");
                channel.send(Message::Done { id, error }).await
            }
            Err(RenderError::OutputClosed) => {
                tracing::debug!("output reader went away");
                Ok(())
            }
            Err(e) if !started => {
                tracing::warn!(error = %e, "job failed before producing output");
                channel.send(Message::Error { id, error: e.into() }).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "job failed after output started");
                let error = errors.first().unwrap_or_else(|| RenderFailure::from(e));
                channel.send(Message::Done { id, error: Some(error) }).await
            }
        }
    }
}

async fn join(render: &mut RenderTask) -> Result<Outcome, RenderError> {
    match (&mut render.0).await {
        Ok(result) => result,
        Err(e) => Err(RenderError::Aborted(e.to_string())),
    }
}
