//! # Render Dispatcher
//!
//! The caller side of a render channel. A dispatcher hands render jobs to a
//! worker and resolves each one into the worker's output stream.
//!
//! A background pump task reads every reply from the channel and routes it by
//! job id, so any number of jobs can be in flight over one channel.
//!
//! ## Invariants
//!
//! - **Correlation**: replies are routed by id only. A reply for an unknown id
//!   is logged and dropped; it never reaches another job.
//! - **Single Resolution**: each dispatch resolves or rejects exactly once.
//! - **Closure Rejects Everything**: when the channel closes, every unresolved
//!   job is rejected and every handed-out stream ends with an error.
//! - **No Leaks**: a job's table entries are removed on its terminal reply,
//!   on timeout, or on channel closure.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::StreamExt;
use plexwire::JobId;
use plexwire::Message;
use plexwire::RenderFailure;
use plexwire::RenderOptions;
use plexwire::Value;
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::config::DispatcherConfig;
use crate::framed::FramedChannel;
use crate::stream;
use crate::stream::StreamController;
use crate::transport;
use crate::transport::ByteStream;
use crate::transport::Channel;
use crate::transport::Packet;
use crate::transport::SendStreamError;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    /// The worker could not produce any output for the job.
    Render(RenderFailure),
    Timeout,
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Render(e) => write!(f, "Render failed: {}", e),
            Self::Timeout => write!(f, "Render job timed out"),
            Self::ChannelClosed => write!(f, "Response channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A render request: the component graph to render and how to render it.
pub struct RenderJob {
    pub tree: ByteStream,
    pub options: RenderOptions,
}

impl RenderJob {
    pub fn new(tree: ByteStream, options: RenderOptions) -> Self {
        Self { tree, options }
    }
}

type Hook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Optional observers for a job's lifecycle.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_start: Option<Hook<Option<RenderFailure>>>,
    on_error: Option<Hook<RenderFailure>>,
    on_postponed: Option<Hook<Value>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when output starts, with the first render error seen so far.
    pub fn on_start(mut self, f: impl Fn(Option<RenderFailure>) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Called with the job's render error once it finishes, or with a failure
    /// that arrives after output started.
    pub fn on_error(mut self, f: impl Fn(RenderFailure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called when a prerender suspended, with the state needed to resume it.
    pub fn on_postponed(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_postponed = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_start", &self.on_start.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_postponed", &self.on_postponed.is_some())
            .finish()
    }
}

/// A dispatched job awaiting replies.
struct PendingJob {
    /// Taken on resolution.
    resolve: Option<oneshot::Sender<Result<ByteStream>>>,
    callbacks: Callbacks,
}

type PendingTable = DashMap<JobId, PendingJob>;
type ControllerTable = DashMap<JobId, StreamController>;

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    config: DispatcherConfig,
    pending: Arc<PendingTable>,
    controllers: Arc<ControllerTable>,
    closed: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Creates a dispatcher over `channel` and spawns its pump task.
    pub fn new(channel: impl Channel) -> Self {
        Self::with_config(Arc::new(channel), DispatcherConfig::default())
    }

    pub fn with_config(channel: Arc<dyn Channel>, config: DispatcherConfig) -> Self {
        let pending: Arc<PendingTable> = Arc::new(DashMap::new());
        let controllers: Arc<ControllerTable> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::pump(
            Arc::clone(&channel),
            Arc::clone(&pending),
            Arc::clone(&controllers),
            Arc::clone(&closed),
        ));

        Self { channel, config, pending, controllers, closed }
    }

    /// Starts `command` as a worker process and dispatches to it over its stdio.
    pub fn spawn_process(command: &mut Command, config: DispatcherConfig) -> Result<Self> {
        let channel = FramedChannel::spawn(command, config.max_frame_len)?;
        Ok(Self::with_config(Arc::new(channel), config))
    }

    /// Number of jobs that have not yet received their terminal reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn close(&self) {
        self.channel.close();
    }

    /// Sends a job to the worker and waits for its output to start.
    ///
    /// Resolves with the output stream once the worker reports the first
    /// output. Rejects if the worker fails before producing output, if the
    /// channel closes, or if no reply arrives within the configured timeout.
    pub async fn dispatch(&self, job: RenderJob, callbacks: Callbacks) -> Result<ByteStream> {
        let id = JobId::generate();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingJob { resolve: Some(tx), callbacks });

        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&id);
            return Err(Error::Transport(transport::Error::Closed));
        }

        tracing::debug!(%id, remote = job.options.remote, prerender = job.options.is_prerender, "dispatching render job");

        let head = Message::Render { id, options: job.options };
        match self.channel.send_stream(head, job.tree).await {
            Ok(()) => {}
            Err(SendStreamError::NotTransferable { head, stream }) => {
                if let Err(e) = self.channel.send(head).await {
                    self.pending.remove(&id);
                    return Err(e.into());
                }
                tokio::spawn(Self::send_chunks(Arc::clone(&self.channel), id, stream));
            }
            Err(SendStreamError::Transport(e)) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&id);
                Err(Error::ChannelClosed)
            }
            Err(_) => {
                tracing::warn!(%id, timeout = ?self.config.request_timeout, "render job timed out");
                self.pending.remove(&id);
                self.controllers.remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// Pumps a tree stream to the worker as chunk messages.
    ///
    /// A failing tree ends with `Done` carrying the failure, so the worker sees
    /// the same error a live stream would have delivered.
    async fn send_chunks(channel: Arc<dyn Channel>, id: JobId, mut tree: ByteStream) {
        let mut failure = None;
        while let Some(item) = tree.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    tracing::warn!(%id, error = %e, "component graph failed while sending, truncating");
                    failure = Some(e);
                    break;
                }
            };
            if let Err(e) = channel.send(Message::Chunk { id, chunk }).await {
                tracing::debug!(%id, error = %e, "stopped sending component graph");
                return;
            }
        }
        if let Err(e) = channel.send(Message::Done { id, error: failure }).await {
            tracing::debug!(%id, error = %e, "could not finish component graph");
        }
    }

    async fn pump(
        channel: Arc<dyn Channel>,
        pending: Arc<PendingTable>,
        controllers: Arc<ControllerTable>,
        closed: Arc<AtomicBool>,
    ) {
        let error = loop {
            match channel.recv().await {
                Ok(Some(packet)) => Self::handle_packet(packet, &pending, &controllers),
                Ok(None) => break transport::Error::ConnectionLost("channel closed".into()),
                Err(e) => {
                    tracing::warn!(error = %e, "channel failed in dispatcher pump");
                    break e;
                }
            }
        };

        closed.store(true, Ordering::SeqCst);
        Self::notify_all_pending(&pending, &controllers, error);
    }

    /// Rejects every unresolved job and ends every handed-out stream.
    fn notify_all_pending(pending: &PendingTable, controllers: &ControllerTable, error: transport::Error) {
        let keys: Vec<JobId> = pending.iter().map(|e| *e.key()).collect();
        if !keys.is_empty() {
            tracing::debug!(jobs = keys.len(), error = %error, "rejecting pending render jobs");
        }
        for key in keys {
            if let Some((_, mut job)) = pending.remove(&key) {
                if let Some(tx) = job.resolve.take() {
                    let _ = tx.send(Err(Error::Transport(error.clone())));
                }
            }
        }

        let keys: Vec<JobId> = controllers.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, ctrl)) = controllers.remove(&key) {
                let _ = ctrl.send(Err(RenderFailure::new(error.to_string())));
            }
        }
    }

    /// Resolves `id` with `stream` if it is still unresolved. Returns the job's callbacks.
    fn resolve(pending: &PendingTable, id: JobId, stream: ByteStream) -> Option<Callbacks> {
        let mut job = pending.get_mut(&id)?;
        match job.resolve.take() {
            Some(tx) => {
                let _ = tx.send(Ok(stream));
            }
            None => tracing::warn!(%id, "duplicate start reply"),
        }
        Some(job.callbacks.clone())
    }

    fn callbacks(pending: &PendingTable, id: JobId) -> Option<Callbacks> {
        pending.get(&id).map(|job| job.callbacks.clone())
    }

    fn handle_packet(packet: Packet, pending: &PendingTable, controllers: &ControllerTable) {
        let id = packet.id();
        match packet {
            Packet::Stream { head: Message::Start { error, .. }, stream } => {
                match Self::resolve(pending, id, stream) {
                    Some(callbacks) => Self::started(&callbacks, error),
                    None => tracing::warn!(%id, "dropping output stream for unknown job"),
                }
            }
            Packet::Stream { head, .. } => {
                tracing::warn!(%id, kind = head.kind(), "protocol violation: unexpected stream");
            }
            Packet::Message(Message::Start { error, .. }) => {
                if !pending.contains_key(&id) {
                    tracing::warn!(%id, "dropping start for unknown job");
                    return;
                }
                let (ctrl, stream) = stream::controlled();
                controllers.insert(id, ctrl);
                if let Some(callbacks) = Self::resolve(pending, id, stream) {
                    Self::started(&callbacks, error);
                }
            }
            Packet::Message(Message::Chunk { chunk, .. }) => match controllers.get(&id) {
                Some(ctrl) => {
                    if ctrl.send(Ok(chunk)).is_err() {
                        tracing::trace!(%id, "output reader gone, discarding chunk");
                    }
                }
                None => tracing::warn!(%id, "dropping chunk for unknown job"),
            },
            Packet::Message(Message::Postponed { state, .. }) => match Self::callbacks(pending, id) {
                Some(callbacks) => {
                    if let Some(hook) = &callbacks.on_postponed {
                        hook(state);
                    }
                }
                None => tracing::warn!(%id, "dropping postponed state for unknown job"),
            },
            Packet::Message(Message::Done { error, .. }) => {
                controllers.remove(&id);
                let Some((_, mut job)) = pending.remove(&id) else {
                    tracing::warn!(%id, "dropping done for unknown job");
                    return;
                };
                if let Some(tx) = job.resolve.take() {
                    tracing::warn!(%id, "job finished without starting output");
                    let _ = tx.send(Ok(futures::stream::empty().boxed()));
                }
                tracing::debug!(%id, failed = error.is_some(), "render job done");
                if let (Some(error), Some(hook)) = (error, &job.callbacks.on_error) {
                    hook(error);
                }
            }
            Packet::Message(Message::Error { error, .. }) => {
                let ctrl = controllers.remove(&id);
                let Some((_, mut job)) = pending.remove(&id) else {
                    tracing::warn!(%id, "dropping error for unknown job");
                    return;
                };
                tracing::debug!(%id, error = %error, "render job failed");
                match job.resolve.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(Error::Render(error)));
                    }
                    None => {
                        if let Some((_, ctrl)) = ctrl {
                            let _ = ctrl.send(Err(error.clone()));
                        }
                        if let Some(hook) = &job.callbacks.on_error {
                            hook(error);
                        }
                    }
                }
            }
            Packet::Message(Message::Render { .. }) => {
                tracing::warn!(%id, "protocol violation: dispatcher received a render request");
            }
        }
    }

    fn started(callbacks: &Callbacks, error: Option<RenderFailure>) {
        if let Some(hook) = &callbacks.on_start {
            hook(error);
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // The pump sees the closure and rejects whatever is still pending.
        self.channel.close();
    }
}
