//! Tunables for dispatchers and workers.

use std::time::Duration;

use plexwire::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a dispatched job may wait for its first reply.
    pub request_timeout: Duration,
    /// Frame limit for channels the dispatcher opens itself.
    pub max_frame_len: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl DispatcherConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Inject the hydration bootstrap even when no client references were seen.
    pub dev: bool,
    /// Output chunks buffered between the multiplexer and the channel.
    pub output_buffer: usize,
    /// Prefix identifying the root row of the component graph.
    pub root_marker: String,
    /// Global array the injected payload scripts push into.
    pub payload_global: String,
    /// Frame limit for `Worker::serve_stdio`.
    pub max_frame_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dev: false,
            output_buffer: 16,
            root_marker: "0:".into(),
            payload_global: "__flight_data".into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl WorkerConfig {
    pub fn with_dev(mut self, dev: bool) -> Self {
        self.dev = dev;
        self
    }

    pub fn with_output_buffer(mut self, chunks: usize) -> Self {
        self.output_buffer = chunks.max(1);
        self
    }

    pub fn with_root_marker(mut self, marker: impl Into<String>) -> Self {
        self.root_marker = marker.into();
        self
    }

    pub fn with_payload_global(mut self, name: impl Into<String>) -> Self {
        self.payload_global = name.into();
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}
