//! # Render Multiplexer
//!
//! Merges two concurrently produced byte streams into one document stream:
//!
//! - the **component graph**, a line-oriented payload describing the rendered
//!   tree, and
//! - the **markup** a [`Renderer`] produces from that same graph.
//!
//! The graph is teed: one copy feeds the renderer, the other is forwarded
//! into the output as inline payload scripts so the client can hydrate without
//! a second request.
//!
//! ## Invariants
//!
//! - **Fair Interleaving**: each turn steps the graph at most once, then the
//!   markup at most once, then yields. Neither stream can starve the other.
//! - **Graph First**: when both streams have data in the same turn, the graph
//!   step runs first, so payload the markup depends on is never behind it.
//! - **No Early Payload**: nothing reaches the output before the first markup
//!   chunk. Payload seen earlier is held until hydration starts.
//! - **Single Hydration**: the hydration unit is injected at most once per job.
//! - **Inert Leftovers**: payload held by a job that never hydrates is emitted
//!   at the end as escaped text inside a `<template>`, never as script.
//! - **Clean Prelude**: a prerender writes the renderer's prelude and nothing
//!   else. Links and payload belong to the resumed render, which sees the
//!   same graph again.

pub mod graph;
pub mod inject;
pub mod remote;
pub mod utf8;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::StreamExt;
use plexwire::RenderFailure;
use plexwire::RenderOptions;
use plexwire::Value;
use tokio::sync::mpsc;

use crate::config::WorkerConfig;
use crate::renderer::ErrorSink;
use crate::renderer::FragmentParser;
use crate::renderer::MarkupOptions;
use crate::renderer::RenderError;
use crate::renderer::Renderer;
use crate::stream;
use crate::transport::ByteStream;

use graph::LineScanner;
use graph::Row;
use inject::Bootstrap;
use inject::HydrationTarget;
use remote::RemoteSerializer;
use utf8::Utf8Carry;

const DOCUMENT_TRAILER: &[u8] = b"</body></html>";

/// What a finished job leaves behind besides its output.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Resume state when a prerender suspended.
    pub postponed: Option<Value>,
}

/// Runs one job: materializes the tree, picks the render mode, and interleaves.
pub struct Multiplexer<R: Renderer> {
    renderer: Arc<R>,
    config: WorkerConfig,
    parser: Box<dyn FragmentParser>,
}

impl<R: Renderer> Multiplexer<R> {
    pub fn new(renderer: Arc<R>, config: WorkerConfig, parser: Box<dyn FragmentParser>) -> Self {
        Self { renderer, config, parser }
    }

    /// Streams the job's output into `out`.
    ///
    /// Returns `Err` only when no output could be produced at all, or when the
    /// reader of `out` went away. Recoverable render errors land in `errors`.
    pub async fn run(
        self,
        tree: ByteStream,
        options: RenderOptions,
        errors: ErrorSink,
        out: mpsc::Sender<Bytes>,
    ) -> Result<Outcome, RenderError> {
        let (graph_copy, forward) = stream::tee(tree);
        let handle = self.renderer.materialize(graph_copy);
        let markup_options = MarkupOptions {
            form_state: options.form_state.clone(),
            errors: errors.clone(),
        };

        let (markup, postponed) = if options.is_prerender {
            let prerendered = self.renderer.prerender_markup(handle, markup_options).await?;
            tracing::debug!(suspended = prerendered.postponed.is_some(), "prerender finished");
            (stream::once(prerendered.prelude), prerendered.postponed)
        } else if let Some(state) = options.postponed_state.clone() {
            let resumed = self.renderer.resume_markup(handle, state, markup_options).await?;
            let markup = match options.prelude.clone() {
                Some(prelude) => stream::once(prelude).chain(resumed).boxed(),
                None => resumed,
            };
            (markup, None)
        } else {
            (self.renderer.render_markup(handle, markup_options).await?, None)
        };

        let mut session = Session::new(&options, &self.config, self.parser, errors, out);
        session.interleave(forward, markup).await?;
        Ok(Outcome { postponed })
    }
}

struct RemoteState {
    parser: Box<dyn FragmentParser>,
    serializer: RemoteSerializer,
    text: Utf8Carry,
}

/// Per-job interleave state.
struct Session<'a> {
    options: &'a RenderOptions,
    config: &'a WorkerConfig,
    errors: ErrorSink,
    out: mpsc::Sender<Bytes>,

    graph_text: Utf8Carry,
    rows: LineScanner,
    bootstrap: Bootstrap,
    stylesheets: Vec<String>,
    linked: HashSet<String>,
    flushed_links: usize,

    root_seen: bool,
    client_reference_seen: bool,
    markup_started: bool,
    hydrated: bool,
    target: HydrationTarget,
    trailer: Option<Bytes>,

    remote: Option<RemoteState>,
}

impl<'a> Session<'a> {
    fn new(
        options: &'a RenderOptions,
        config: &'a WorkerConfig,
        parser: Box<dyn FragmentParser>,
        errors: ErrorSink,
        out: mpsc::Sender<Bytes>,
    ) -> Self {
        let remote = options.remote.then(|| RemoteState {
            parser,
            serializer: RemoteSerializer::new(options.origin.clone()),
            text: Utf8Carry::new(),
        });

        Self {
            options,
            config,
            errors,
            out,
            graph_text: Utf8Carry::new(),
            rows: LineScanner::new(),
            bootstrap: Bootstrap::new(config.payload_global.clone()),
            stylesheets: Vec::new(),
            linked: HashSet::new(),
            flushed_links: 0,
            root_seen: false,
            client_reference_seen: false,
            markup_started: false,
            hydrated: false,
            target: HydrationTarget::Outlet(options.outlet_name.clone().unwrap_or_else(|| "root".into())),
            trailer: None,
            remote,
        }
    }

    async fn interleave(&mut self, mut graph: ByteStream, mut markup: ByteStream) -> Result<(), RenderError> {
        let mut graph_open = true;
        let mut markup_open = true;

        while graph_open || markup_open {
            let mut progressed = false;

            if graph_open {
                if let Some(item) = graph.next().now_or_never() {
                    graph_open = self.on_graph(item).await?;
                    progressed = true;
                }
            }

            if markup_open {
                if let Some(item) = markup.next().now_or_never() {
                    markup_open = self.on_markup(item).await?;
                    progressed = true;
                }
            }

            if !progressed {
                tokio::select! {
                    item = graph.next(), if graph_open => graph_open = self.on_graph(item).await?,
                    item = markup.next(), if markup_open => markup_open = self.on_markup(item).await?,
                    else => break,
                }
            }

            tokio::task::yield_now().await;
        }

        self.finish().await
    }

    // ========================================================================
    //  Graph side
    // ========================================================================

    /// Handles one graph poll result. Returns whether the graph is still open.
    async fn on_graph(&mut self, item: Option<Result<Bytes, RenderFailure>>) -> Result<bool, RenderError> {
        match item {
            Some(Ok(chunk)) => {
                let text = self.graph_text.decode(&chunk);
                self.graph_fragment(text).await?;
                self.at_boundary().await?;
                Ok(true)
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "component graph stream failed");
                self.errors.report(e);
                self.end_graph().await?;
                Ok(false)
            }
            None => {
                self.end_graph().await?;
                Ok(false)
            }
        }
    }

    async fn end_graph(&mut self) -> Result<(), RenderError> {
        let text = self.graph_text.finish();
        self.graph_fragment(text).await?;
        if let Some(row) = self.rows.finish() {
            self.observe(&row);
        }
        self.at_boundary().await
    }

    async fn graph_fragment(&mut self, text: String) -> Result<(), RenderError> {
        if text.is_empty() {
            return Ok(());
        }

        for row in self.rows.push(&text) {
            self.observe(&row);
        }

        if self.remote.is_some() {
            return Ok(());
        }

        if self.hydrated {
            let call = self.bootstrap.push_call(&text);
            self.emit(inject::script(&call)).await
        } else {
            self.bootstrap.hold(&text);
            Ok(())
        }
    }

    fn observe(&mut self, row: &str) {
        match graph::classify(row, &self.config.root_marker) {
            Row::Root if !self.root_seen => {
                tracing::trace!("root row observed");
                self.root_seen = true;
                self.bootstrap.prime();
            }
            Row::ClientReference => self.client_reference_seen = true,
            Row::Stylesheet { href } => {
                if self.linked.insert(href.clone()) {
                    self.stylesheets.push(href);
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    //  Markup side
    // ========================================================================

    /// Handles one markup poll result. Returns whether the markup is still open.
    async fn on_markup(&mut self, item: Option<Result<Bytes, RenderFailure>>) -> Result<bool, RenderError> {
        let chunk = match item {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "markup stream failed");
                self.errors.report(e);
                return Ok(false);
            }
            None => return Ok(false),
        };

        if chunk.is_empty() {
            return Ok(true);
        }

        if let Some(remote) = &mut self.remote {
            let text = remote.text.decode(&chunk);
            remote.parser.write(&text);
            let nodes = remote.parser.fragment();
            if !nodes.is_empty() {
                let rows = remote.serializer.rows(&nodes);
                self.emit(rows).await?;
            }
            return Ok(true);
        }

        if !self.markup_started {
            self.markup_started = true;
            if is_document(&chunk) {
                self.target = HydrationTarget::Document;
            }
        }

        if let Some(trailer) = self.trailer.take() {
            // Markup continued past what looked like the end of the document.
            self.emit(trailer).await?;
        }

        let body = if chunk.ends_with(DOCUMENT_TRAILER) {
            let split = chunk.len() - DOCUMENT_TRAILER.len();
            self.trailer = Some(chunk.slice(split..));
            chunk.slice(..split)
        } else {
            chunk
        };
        if !body.is_empty() {
            self.emit(body).await?;
        }

        self.at_boundary().await?;
        Ok(true)
    }

    // ========================================================================
    //  Injection
    // ========================================================================

    /// Work that may happen between any two steps once markup has started.
    async fn at_boundary(&mut self) -> Result<(), RenderError> {
        if !self.markup_started || self.remote.is_some() || self.options.is_prerender {
            return Ok(());
        }
        self.flush_links().await?;
        self.maybe_hydrate().await
    }

    async fn flush_links(&mut self) -> Result<(), RenderError> {
        if self.flushed_links == self.stylesheets.len() {
            return Ok(());
        }
        let links = inject::stylesheet_links(&self.stylesheets[self.flushed_links..]);
        self.flushed_links = self.stylesheets.len();
        self.emit(links).await
    }

    fn hydration_due(&self) -> bool {
        !self.hydrated
            && self.markup_started
            && !self.options.is_prerender
            && !self.options.remote
            && (self.client_reference_seen || self.config.dev)
    }

    async fn maybe_hydrate(&mut self) -> Result<(), RenderError> {
        if !self.hydration_due() {
            return Ok(());
        }

        let held = self.bootstrap.take_code();
        let unit = inject::hydration_unit(self.options, &self.config.payload_global, &held, &self.target);
        self.hydrated = true;
        tracing::debug!(target_document = self.target == HydrationTarget::Document, "hydration injected");
        self.emit(unit).await
    }

    async fn finish(&mut self) -> Result<(), RenderError> {
        if let Some(mut remote) = self.remote.take() {
            let tail = remote.text.finish();
            remote.parser.write(&tail);
            let nodes = remote.parser.finish();
            let mut rows = remote.serializer.rows(&nodes);
            rows.push_str(&remote.serializer.manifest(&self.stylesheets, &self.remote_scripts()));
            return self.emit(rows).await;
        }

        if self.options.is_prerender {
            return match self.trailer.take() {
                Some(trailer) => self.emit(trailer).await,
                None => Ok(()),
            };
        }

        self.flush_links().await?;
        self.maybe_hydrate().await?;

        if !self.hydrated && !self.bootstrap.is_empty() {
            let raw = self.bootstrap.take_raw();
            tracing::debug!(bytes = raw.len(), "emitting unhydrated payload as inert block");
            self.emit(inject::pending_payload(&raw)).await?;
        }

        if let Some(trailer) = self.trailer.take() {
            self.emit(trailer).await?;
        }
        Ok(())
    }

    /// Bootstrap script nodes for the remote manifest.
    fn remote_scripts(&self) -> Vec<serde_json::Value> {
        if self.options.defer {
            return Vec::new();
        }
        let modules = self
            .options
            .bootstrap_modules
            .iter()
            .map(|src| serde_json::json!(["script", null, { "type": "module", "src": src, "async": true }, [], 2]));
        let scripts = self
            .options
            .bootstrap_scripts
            .iter()
            .map(|src| serde_json::json!(["script", null, { "src": src, "async": true }, [], 2]));
        modules.chain(scripts).collect()
    }

    async fn emit(&self, data: impl Into<Bytes>) -> Result<(), RenderError> {
        self.out.send(data.into()).await.map_err(|_| RenderError::OutputClosed)
    }
}

fn is_document(chunk: &[u8]) -> bool {
    let start = chunk.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(chunk.len());
    let head = &chunk[start..chunk.len().min(start + 9)];
    head.eq_ignore_ascii_case(b"<!doctype") || head.get(..5).is_some_and(|h| h.eq_ignore_ascii_case(b"<html"))
}
