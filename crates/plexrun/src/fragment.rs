//! # Streaming Fragment Parser
//!
//! Cuts an incrementally written markup stream into complete top-level nodes.
//!
//! A light scanner tracks element depth over the buffered text (void elements,
//! self-closing tags, comments, doctypes, quoted attribute values and raw-text
//! elements such as `<script>`). Once a prefix of the buffer closes back to
//! depth zero, that prefix is handed to `tl` and converted into [`Node`]s; the
//! remainder stays buffered for the next write.
//!
//! The scanner keeps its position and depth between writes, so each byte is
//! scanned once even when a single element (a whole `<html>` document) stays
//! open for the entire stream. Only a construct cut off by the end of the
//! buffer (a tag, comment or raw-text element) is rescanned from its start.

use crate::renderer::FragmentParser;

/// A parsed markup node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element {
        tag: String,
        /// Attributes in source order. `None` marks a valueless attribute.
        attrs: Vec<(String, Option<String>)>,
        children: Vec<Node>,
    },
    Text(String),
}

impl Node {
    pub fn element(tag: impl Into<String>) -> Self {
        Node::Element { tag: tag.into(), attrs: Vec::new(), children: Vec::new() }
    }
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

pub fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

pub fn is_raw_text(tag: &str) -> bool {
    RAW_TEXT_ELEMENTS.contains(&tag)
}

/// Default [`FragmentParser`] backed by the `tl` HTML parser.
#[derive(Debug, Default)]
pub struct TlFragmentParser {
    pending: String,
    scanner: Scanner,
}

impl TlFragmentParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of markup still waiting for their enclosing element to close.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Removes the first `end` bytes and parses them one top-level segment at a time.
    fn take_segments(&mut self, bounds: &[usize], end: usize) -> Vec<Node> {
        let rest = self.pending.split_off(end);
        let complete = std::mem::replace(&mut self.pending, rest);
        self.scanner.offset = self.scanner.offset.saturating_sub(end);

        let mut nodes = Vec::new();
        let mut start = 0;
        for &bound in bounds.iter().chain(std::iter::once(&end)) {
            if bound > start {
                nodes.extend(parse_nodes(&complete[start..bound]));
                start = bound;
            }
        }
        nodes
    }
}

impl FragmentParser for TlFragmentParser {
    fn write(&mut self, html: &str) {
        self.pending.push_str(html);
    }

    fn fragment(&mut self) -> Vec<Node> {
        let bounds = self.scanner.advance(&self.pending);
        match bounds.last() {
            Some(&end) => self.take_segments(&bounds, end),
            None => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<Node> {
        let bounds = self.scanner.advance(&self.pending);
        let len = self.pending.len();
        let nodes = self.take_segments(&bounds, len);
        self.scanner = Scanner::default();
        nodes
    }
}

/// Resumable depth scanner over a growing buffer.
#[derive(Debug, Default)]
struct Scanner {
    /// Where the next scan starts. Everything before it has been classified.
    offset: usize,
    /// Element depth at `offset`.
    depth: usize,
}

/// End offsets of each complete top-level node at the start of `html`.
#[cfg(test)]
fn boundaries(html: &str) -> Vec<usize> {
    Scanner::default().advance(html)
}

impl Scanner {
    /// Scans from the saved position and returns the end offsets of top-level
    /// nodes completed since the last call.
    ///
    /// Trailing top-level text only counts once a following `<` proves it ended.
    fn advance(&mut self, html: &str) -> Vec<usize> {
        let bytes = html.as_bytes();
        let len = bytes.len();
        let mut depth = self.depth;
        let mut bounds = Vec::new();
        let mut i = self.offset;

        while i < len {
            if bytes[i] != b'<' {
                let next = find(html, i, "<").unwrap_or(len);
                if depth == 0 && next < len {
                    bounds.push(next);
                }
                i = next;
                continue;
            }

            let rest = &html[i..];
            let end = if rest.starts_with("<!--") {
                find(html, i + 4, "-->").map(|p| p + 3)
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                find(html, i, ">").map(|p| p + 1)
            } else if rest.starts_with("</") {
                let close = find(html, i, ">").map(|p| p + 1);
                if close.is_some() {
                    depth = depth.saturating_sub(1);
                }
                close
            } else if i + 1 == len {
                // Cannot tell a tag from a stray `<` until the next byte arrives.
                None
            } else if bytes[i + 1].is_ascii_alphabetic() {
                let Some((name, tag_end, self_closing)) = scan_open_tag(html, i) else {
                    break;
                };
                if is_void(&name) || self_closing {
                    Some(tag_end)
                } else if is_raw_text(&name) {
                    find_close_tag(html, tag_end, &name)
                } else {
                    depth += 1;
                    i = tag_end;
                    continue;
                }
            } else {
                // A stray `<` is text.
                i += 1;
                continue;
            };

            let Some(end) = end else {
                break;
            };
            i = end;
            if depth == 0 {
                bounds.push(i);
            }
        }

        self.offset = i;
        self.depth = depth;
        bounds
    }
}

fn find(haystack: &str, from: usize, needle: &str) -> Option<usize> {
    haystack.get(from..)?.find(needle).map(|p| p + from)
}

/// Scans an opening tag at `start`, honoring quoted attribute values.
/// Returns the lowercase tag name, the index just past `>`, and whether it self-closed.
fn scan_open_tag(html: &str, start: usize) -> Option<(String, usize, bool)> {
    let bytes = html.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' && bytes[i] != b'/' {
        i += 1;
    }
    let name = html[start + 1..i].to_ascii_lowercase();

    let mut quote = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => {
                let self_closing = i > start + 1 && bytes[i - 1] == b'/';
                return Some((name, i + 1, self_closing));
            }
            None => {}
        }
        i += 1;
    }
    None
}

/// Finds the end of `</name ...>` at or after `from`, case-insensitively.
fn find_close_tag(html: &str, from: usize, name: &str) -> Option<usize> {
    let lower = html.get(from..)?.to_ascii_lowercase();
    let needle = format!("</{}", name);
    let at = lower.find(&needle)? + from;
    find(html, at, ">").map(|p| p + 1)
}

fn parse_nodes(html: &str) -> Vec<Node> {
    let Ok(dom) = tl::parse(html, tl::ParserOptions::default()) else {
        tracing::warn!(len = html.len(), "fragment failed to parse, keeping it as text");
        return vec![Node::Text(html.to_string())];
    };

    let parser = dom.parser();
    dom.children()
        .iter()
        .filter_map(|handle| convert(*handle, parser, false))
        .filter(|node| !matches!(node, Node::Text(text) if text.trim().is_empty()))
        .collect()
}

fn convert(handle: tl::NodeHandle, parser: &tl::Parser, raw_text: bool) -> Option<Node> {
    match handle.get(parser)? {
        tl::Node::Tag(tag) => {
            let name = tag.name().as_utf8_str().to_ascii_lowercase();
            if name.starts_with('!') || name.starts_with('?') {
                return None;
            }

            let attrs = tag
                .attributes()
                .iter()
                .map(|(key, value)| (key.to_string(), value.map(|v| decode_entities(&v))))
                .collect();

            let raw = is_raw_text(&name);
            let children = tag
                .children()
                .top()
                .iter()
                .filter_map(|child| convert(*child, parser, raw))
                .collect();

            Some(Node::Element { tag: name, attrs, children })
        }
        tl::Node::Raw(bytes) => {
            let text = bytes.as_utf8_str();
            if raw_text {
                Some(Node::Text(text.to_string()))
            } else {
                Some(Node::Text(decode_entities(&text)))
            }
        }
        tl::Node::Comment(_) => None,
    }
}

/// Decodes the character references that appear in serialized markup.
/// Unknown references are kept verbatim.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let decoded = rest.find(';').filter(|semi| *semi <= 10).and_then(|semi| {
            let entity = &rest[1..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => {
                    let code = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                        u32::from_str_radix(hex, 16).ok()
                    } else if let Some(dec) = entity.strip_prefix('#') {
                        dec.parse().ok()
                    } else {
                        None
                    };
                    code.and_then(char::from_u32)
                }
            };
            ch.map(|c| (c, semi))
        });

        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
