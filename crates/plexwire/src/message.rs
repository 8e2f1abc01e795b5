//! # Message Vocabulary
//!
//! Every message exchanged between a dispatcher and a worker carries the
//! correlation id of the render job it belongs to.
//!
//! ```text
//! caller -> worker:  Render, Chunk*, Done          (tree source, chunked)
//! worker -> caller:  Start, Chunk*, Postponed?, Done | Error
//! ```
//!
//! On the wire each message is a JSON object tagged by `"type"`.

use std::str::FromStr;

use bytes::Bytes;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::value::Value;
use crate::value::tagged_bytes;

/// Opaque correlation id for one render job.
///
/// Ids are random 128-bit values; collisions within a process lifetime are not
/// a practical concern.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobId(pub u128);

impl JobId {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(JobId)
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-job render options. Immutable for the lifetime of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    /// Render once to completion or to the first unresolvable suspension.
    pub is_prerender: bool,
    /// State captured by an earlier prerender; when present the render resumes.
    pub postponed_state: Option<Value>,
    /// Serialize the markup itself into component-graph rows.
    pub remote: bool,
    /// Origin used to rewrite same-origin form actions in remote mode.
    pub origin: Option<String>,
    pub import_map: Option<Value>,
    pub defer: bool,
    /// Element id the hydration entry point attaches to when there is no document wrapper.
    pub outlet_name: Option<String>,
    pub bootstrap_modules: Vec<String>,
    pub bootstrap_scripts: Vec<String>,
    pub form_state: Value,
    /// Previously saved prelude, replayed before resumed markup.
    #[serde(with = "tagged_bytes::option", skip_serializing_if = "Option::is_none")]
    pub prelude: Option<Bytes>,
}

/// A render error as reported across the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl RenderFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), stack: None, digest: None }
    }
}

impl std::fmt::Display for RenderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.digest {
            Some(digest) => write!(f, "{} (digest {})", self.message, digest),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RenderFailure {}

/// A single message on the worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Starts a job. The tree source follows as `Chunk`s and a `Done`.
    Render { id: JobId, options: RenderOptions },
    /// One slice of a byte stream belonging to `id`.
    Chunk {
        id: JobId,
        #[serde(with = "tagged_bytes")]
        chunk: Bytes,
    },
    /// End of a chunked stream. From a worker this is the terminal reply.
    Done {
        id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RenderFailure>,
    },
    /// First output byte produced, optionally with a captured render error.
    Start {
        id: JobId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RenderFailure>,
    },
    /// The render suspended; `state` resumes it later.
    Postponed { id: JobId, state: Value },
    /// Terminal failure.
    Error { id: JobId, error: RenderFailure },
}

impl Message {
    pub fn id(&self) -> JobId {
        match self {
            Message::Render { id, .. }
            | Message::Chunk { id, .. }
            | Message::Done { id, .. }
            | Message::Start { id, .. }
            | Message::Postponed { id, .. }
            | Message::Error { id, .. } => *id,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Render { .. } => "render",
            Message::Chunk { .. } => "chunk",
            Message::Done { .. } => "done",
            Message::Start { .. } => "start",
            Message::Postponed { .. } => "postponed",
            Message::Error { .. } => "error",
        }
    }
}
