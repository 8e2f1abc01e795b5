//! # Rendering Collaborators
//!
//! The multiplexer does not render anything itself. It drives two external
//! collaborators through the traits in this module:
//!
//! - a [`Renderer`], which turns a component graph stream into markup, and
//! - a [`FragmentParser`], which cuts streamed markup into complete nodes for
//!   remote mode.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;
use plexwire::RenderFailure;
use plexwire::Value;

use crate::fragment::Node;
use crate::transport::ByteStream;

/// Errors raised while producing a job's output.
#[derive(Debug, Clone)]
pub enum RenderError {
    /// The renderer gave up.
    Failed(RenderFailure),
    /// Nobody is reading the output any more.
    OutputClosed,
    /// The job's task died.
    Aborted(String),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "Render failed: {}", e),
            Self::OutputClosed => write!(f, "Output closed"),
            Self::Aborted(msg) => write!(f, "Render aborted: {}", msg),
        }
    }
}

impl std::error::Error for RenderError {}

impl From<RenderFailure> for RenderError {
    fn from(e: RenderFailure) -> Self {
        Self::Failed(e)
    }
}

impl From<RenderError> for RenderFailure {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::Failed(failure) => failure,
            other => RenderFailure::new(other.to_string()),
        }
    }
}

/// Captures the first render error reported for a job. Later reports are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct ErrorSink(Arc<OnceLock<RenderFailure>>);

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error` unless an earlier one was already captured.
    pub fn report(&self, error: RenderFailure) {
        if let Err(error) = self.0.set(error) {
            tracing::debug!(message = %error.message, "dropping subsequent render error");
        }
    }

    pub fn first(&self) -> Option<RenderFailure> {
        self.0.get().cloned()
    }
}

/// Inputs shared by every markup rendering entry point.
#[derive(Debug, Clone)]
pub struct MarkupOptions {
    pub form_state: Value,
    pub errors: ErrorSink,
}

/// Result of a prerender: the static prelude and, if the render suspended,
/// the opaque state needed to resume it.
#[derive(Debug, Clone)]
pub struct Prerendered {
    pub prelude: Bytes,
    pub postponed: Option<Value>,
}

/// Turns a component graph into markup.
///
/// `materialize` must return immediately; the tree handle consumes the graph
/// stream lazily as rendering proceeds. Recoverable render errors go to
/// `MarkupOptions::errors`; returning `Err` means no output can be produced.
#[async_trait::async_trait]
pub trait Renderer: Send + Sync + 'static {
    type Tree: Send + 'static;

    fn materialize(&self, graph: ByteStream) -> Self::Tree;

    async fn render_markup(&self, tree: Self::Tree, options: MarkupOptions) -> Result<ByteStream, RenderError>;

    async fn prerender_markup(&self, tree: Self::Tree, options: MarkupOptions) -> Result<Prerendered, RenderError>;

    async fn resume_markup(
        &self,
        tree: Self::Tree,
        postponed: Value,
        options: MarkupOptions,
    ) -> Result<ByteStream, RenderError>;
}

/// Incremental markup parser used by remote mode.
pub trait FragmentParser: Send + Sync {
    /// Appends decoded markup text.
    fn write(&mut self, html: &str);

    /// Takes the top-level nodes completed since the last call.
    fn fragment(&mut self) -> Vec<Node>;

    /// Takes whatever remains once no more markup will arrive.
    fn finish(&mut self) -> Vec<Node>;
}

/// Produces a fresh parser per job.
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn FragmentParser> + Send + Sync>;
