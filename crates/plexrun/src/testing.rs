//! A scripted [`Renderer`] for exercising workers without a real UI runtime.
//!
//! In [`Script::Rows`] mode every component graph row whose body is a JSON
//! string becomes one `<p>` of markup, produced as soon as the row arrives.
//! A row with the body `"SUSPEND"` marks a hole: a prerender stops there and
//! postpones, while a normal or resumed render fills it with `<p>resolved</p>`.
//! Other rows (the root, client references, hints) produce no markup.
//!
//! In [`Script::Fixed`] mode the markup is a fixed chunk list and the graph is
//! ignored.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::StreamExt;
use plexwire::RenderFailure;
use plexwire::Value;

use crate::mux::graph::LineScanner;
use crate::mux::inject::escape_text;
use crate::mux::utf8::Utf8Carry;
use crate::renderer::ErrorSink;
use crate::renderer::MarkupOptions;
use crate::renderer::Prerendered;
use crate::renderer::RenderError;
use crate::renderer::Renderer;
use crate::stream;
use crate::transport::ByteStream;

pub const SUSPEND: &str = "SUSPEND";
pub const DOCUMENT_HEAD: &str = "<!DOCTYPE html><html><body>";
pub const DOCUMENT_TAIL: &str = "</body></html>";

#[derive(Debug, Clone)]
pub enum Script {
    Rows,
    Fixed(Vec<Bytes>),
}

#[derive(Debug, Clone)]
pub struct ScriptedRenderer {
    script: Script,
    document: bool,
    fail: Option<RenderFailure>,
    report: Option<RenderFailure>,
}

impl ScriptedRenderer {
    pub fn rows() -> Self {
        Self { script: Script::Rows, document: false, fail: None, report: None }
    }

    pub fn fixed<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            script: Script::Fixed(chunks.into_iter().map(Into::into).collect()),
            document: false,
            fail: None,
            report: None,
        }
    }

    /// Wraps row markup in a full document.
    pub fn with_document(mut self) -> Self {
        self.document = true;
        self
    }

    /// Refuses every render before producing output.
    pub fn failing(mut self, error: RenderFailure) -> Self {
        self.fail = Some(error);
        self
    }

    /// Reports a recoverable error when rendering starts.
    pub fn reporting(mut self, error: RenderFailure) -> Self {
        self.report = Some(error);
        self
    }

    fn begin(&self, errors: &ErrorSink) -> Result<(), RenderError> {
        if let Some(error) = &self.fail {
            return Err(RenderError::Failed(error.clone()));
        }
        if let Some(error) = &self.report {
            errors.report(error.clone());
        }
        Ok(())
    }

    /// Row markup from the `skip`th string row on. A resumed render omits the document head.
    fn markup(&self, graph: ByteStream, skip: usize, resumed: bool) -> ByteStream {
        match &self.script {
            Script::Fixed(chunks) => stream::from_chunks(chunks.clone()),
            Script::Rows => {
                let cursor = RowCursor::new(graph);
                let head = (self.document && !resumed).then(|| Bytes::from_static(DOCUMENT_HEAD.as_bytes()));
                let tail = self.document.then(|| Bytes::from_static(DOCUMENT_TAIL.as_bytes()));

                let body = futures::stream::unfold((cursor, skip), |(mut cursor, skip)| async move {
                    loop {
                        let (index, row) = match cursor.next_row().await? {
                            Ok(next) => next,
                            Err(e) => return Some((Err(e), (cursor, skip))),
                        };
                        if index >= skip {
                            return Some((Ok(Bytes::from(paragraph(&row, true))), (cursor, skip)));
                        }
                    }
                });

                futures::stream::iter(head.map(Ok))
                    .chain(body)
                    .chain(futures::stream::iter(tail.map(Ok)))
                    .boxed()
            }
        }
    }
}

fn paragraph(row: &str, resolve: bool) -> String {
    if row == SUSPEND && resolve {
        "<p>resolved</p>".into()
    } else {
        format!("<p>{}</p>", escape_text(row))
    }
}

/// Reads string rows off a component graph stream as they complete.
struct RowCursor {
    graph: ByteStream,
    text: Utf8Carry,
    lines: LineScanner,
    queue: VecDeque<String>,
    done: bool,
    index: usize,
}

impl RowCursor {
    fn new(graph: ByteStream) -> Self {
        Self {
            graph,
            text: Utf8Carry::new(),
            lines: LineScanner::new(),
            queue: VecDeque::new(),
            done: false,
            index: 0,
        }
    }

    /// Next string row with its position among string rows.
    async fn next_row(&mut self) -> Option<Result<(usize, String), RenderFailure>> {
        loop {
            if let Some(row) = self.queue.pop_front() {
                let index = self.index;
                self.index += 1;
                return Some(Ok((index, row)));
            }
            if self.done {
                return None;
            }

            match self.graph.next().await {
                Some(Ok(chunk)) => {
                    let text = self.text.decode(&chunk);
                    for line in self.lines.push(&text) {
                        self.queue.extend(string_row(&line));
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    let rest = self.text.finish();
                    self.lines.push(&rest);
                    if let Some(line) = self.lines.finish() {
                        self.queue.extend(string_row(&line));
                    }
                }
            }
        }
    }
}

fn string_row(line: &str) -> Option<String> {
    let (_, body) = line.split_once(':')?;
    serde_json::from_str::<String>(body).ok()
}

#[async_trait::async_trait]
impl Renderer for ScriptedRenderer {
    type Tree = ByteStream;

    fn materialize(&self, graph: ByteStream) -> ByteStream {
        graph
    }

    async fn render_markup(&self, tree: ByteStream, options: MarkupOptions) -> Result<ByteStream, RenderError> {
        self.begin(&options.errors)?;
        Ok(self.markup(tree, 0, false))
    }

    async fn prerender_markup(&self, tree: ByteStream, options: MarkupOptions) -> Result<Prerendered, RenderError> {
        self.begin(&options.errors)?;

        let Script::Rows = self.script else {
            let chunks: Vec<Bytes> = self.markup(tree, 0, false).filter_map(|c| async move { c.ok() }).collect().await;
            return Ok(Prerendered { prelude: chunks.concat().into(), postponed: None });
        };

        let mut prelude = String::new();
        if self.document {
            prelude.push_str(DOCUMENT_HEAD);
        }

        let mut cursor = RowCursor::new(tree);
        while let Some(next) = cursor.next_row().await {
            let (index, row) = next?;
            if row == SUSPEND {
                let state = Value::from_iter([("row", Value::from(index as i64))]);
                return Ok(Prerendered { prelude: prelude.into(), postponed: Some(state) });
            }
            prelude.push_str(&paragraph(&row, false));
        }

        if self.document {
            prelude.push_str(DOCUMENT_TAIL);
        }
        Ok(Prerendered { prelude: prelude.into(), postponed: None })
    }

    async fn resume_markup(
        &self,
        tree: ByteStream,
        postponed: Value,
        options: MarkupOptions,
    ) -> Result<ByteStream, RenderError> {
        self.begin(&options.errors)?;

        let skip = match &postponed {
            Value::Object(fields) => match fields.get("row") {
                Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
                _ => 0,
            },
            _ => 0,
        };
        Ok(self.markup(tree, skip, true))
    }
}
