//! # Plexrun
//!
//! Streaming server-side rendering over a message channel.
//!
//! ## Architecture
//!
//! - [`dispatcher`]: the caller side. Sends render jobs and resolves each into
//!   an output stream, correlating replies by job id.
//! - [`worker`]: the serving side. Runs one [`mux::Multiplexer`] per job and
//!   streams the merged output back.
//! - [`mux`]: interleaves the component graph payload with rendered markup,
//!   injecting the hydration bootstrap, stylesheet links and payload scripts.
//! - [`transport`], [`local`], [`framed`]: the channel seam, an in-process
//!   implementation that passes live streams, and a length-prefixed framing
//!   implementation for byte pipes and worker processes.
//! - [`renderer`], [`fragment`]: the traits for external rendering
//!   collaborators and a default streaming fragment parser.

pub mod config;
pub mod dispatcher;
pub mod fragment;
pub mod framed;
pub mod local;
pub mod mux;
pub mod renderer;
pub mod stream;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod worker;

pub use config::DispatcherConfig;
pub use config::WorkerConfig;
pub use dispatcher::Callbacks;
pub use dispatcher::Dispatcher;
pub use dispatcher::RenderJob;
pub use fragment::Node;
pub use fragment::TlFragmentParser;
pub use framed::FramedChannel;
pub use local::LocalChannel;
pub use mux::Multiplexer;
pub use renderer::ErrorSink;
pub use renderer::FragmentParser;
pub use renderer::MarkupOptions;
pub use renderer::Prerendered;
pub use renderer::RenderError;
pub use renderer::Renderer;
pub use transport::ByteStream;
pub use transport::Channel;
pub use transport::Packet;
pub use transport::SendStreamError;
pub use worker::Worker;
