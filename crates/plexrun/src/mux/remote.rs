//! # Remote Mode Serialization
//!
//! In remote mode the job's output is not markup but payload rows describing
//! the markup, so that another server can embed it in its own component graph.
//!
//! Every completed top-level node becomes one row `<hex id>:<json>\n`, with
//! ids counted from 1. A final manifest row `0:[...]` lists stylesheet links,
//! bootstrap scripts and references (`"$<id>"`) to the rows in order.
//!
//! An element is encoded as `[tag, null, attributes, children, content]`,
//! where `content` is `0` for ordinary elements, `1` for void elements and `2`
//! for raw-text elements. Text nodes are plain JSON strings.

use serde_json::Map;
use serde_json::Value as Json;
use serde_json::json;

use crate::fragment::Node;
use crate::fragment::is_raw_text;
use crate::fragment::is_void;

const CONTENT_NORMAL: u8 = 0;
const CONTENT_VOID: u8 = 1;
const CONTENT_RAW: u8 = 2;

/// Prefix marking a server action field as belonging to the remote origin.
const ACTION_FIELD_PREFIX: &str = "$ACTION_";
const REMOTE_ACTION_PREFIX: &str = "remote:";

/// HTML attribute names that differ from their component property names.
const RENAMED: &[(&str, &str)] = &[
    ("class", "className"),
    ("for", "htmlFor"),
    ("tabindex", "tabIndex"),
    ("readonly", "readOnly"),
    ("maxlength", "maxLength"),
    ("minlength", "minLength"),
    ("colspan", "colSpan"),
    ("rowspan", "rowSpan"),
    ("autocomplete", "autoComplete"),
    ("autofocus", "autoFocus"),
    ("crossorigin", "crossOrigin"),
    ("enctype", "encType"),
    ("formaction", "formAction"),
    ("srcset", "srcSet"),
    ("http-equiv", "httpEquiv"),
    ("accept-charset", "acceptCharset"),
    ("contenteditable", "contentEditable"),
    ("spellcheck", "spellCheck"),
    ("novalidate", "noValidate"),
    ("nomodule", "noModule"),
    ("playsinline", "playsInline"),
    ("referrerpolicy", "referrerPolicy"),
];

#[derive(Debug)]
pub struct RemoteSerializer {
    origin: Option<String>,
    next_id: u64,
    rows: Vec<u64>,
}

impl RemoteSerializer {
    pub fn new(origin: Option<String>) -> Self {
        Self { origin, next_id: 1, rows: Vec::new() }
    }

    /// Encodes completed nodes as rows.
    pub fn rows(&mut self, nodes: &[Node]) -> String {
        let mut out = String::new();
        for node in nodes {
            let id = self.next_id;
            self.next_id += 1;
            self.rows.push(id);
            out.push_str(&format!("{:x}:{}\n", id, self.node(node)));
        }
        out
    }

    /// The closing manifest row.
    pub fn manifest(&self, stylesheets: &[String], scripts: &[Json]) -> String {
        let mut entries: Vec<Json> = stylesheets
            .iter()
            .map(|href| {
                json!(["link", null, { "rel": "stylesheet", "href": href, "precedence": "default" }, [], CONTENT_VOID])
            })
            .collect();
        entries.extend(scripts.iter().cloned());
        entries.extend(self.rows.iter().map(|id| Json::String(format!("${:x}", id))));
        format!("0:{}\n", Json::Array(entries))
    }

    fn node(&self, node: &Node) -> Json {
        match node {
            Node::Text(text) => Json::String(text.clone()),
            Node::Element { tag, attrs, children } => {
                let content = if is_void(tag) {
                    CONTENT_VOID
                } else if is_raw_text(tag) {
                    CONTENT_RAW
                } else {
                    CONTENT_NORMAL
                };
                let children: Vec<Json> = children.iter().map(|child| self.node(child)).collect();
                json!([tag, null, self.attributes(tag, attrs), children, content])
            }
        }
    }

    fn attributes(&self, tag: &str, attrs: &[(String, Option<String>)]) -> Json {
        let hidden_input = tag == "input"
            && attrs
                .iter()
                .any(|(name, value)| name == "type" && value.as_deref().is_some_and(|v| v.eq_ignore_ascii_case("hidden")));

        let mut props = Map::new();
        for (name, value) in attrs {
            let name = name.to_ascii_lowercase();

            if name == "style" {
                match parse_style(value.as_deref().unwrap_or_default()) {
                    Ok(style) => {
                        props.insert("style".into(), style);
                    }
                    Err(e) => tracing::warn!(tag, error = %e, "skipping malformed style attribute"),
                }
                continue;
            }

            if tag == "form" && name == "action" && value.as_deref().is_none_or(str::is_empty) {
                if let Some(origin) = &self.origin {
                    props.insert("action".into(), Json::String(origin.clone()));
                }
                continue;
            }

            let value = match value {
                None => Json::Bool(true),
                Some(v) if hidden_input && name == "name" && v.starts_with(ACTION_FIELD_PREFIX) => {
                    Json::String(format!("{}{}", REMOTE_ACTION_PREFIX, v))
                }
                Some(v) => Json::String(v.clone()),
            };
            props.insert(prop_name(&name), value);
        }
        Json::Object(props)
    }
}

/// Maps an HTML attribute name to its component property name.
pub fn prop_name(attr: &str) -> String {
    if attr.starts_with("data-") || attr.starts_with("aria-") {
        return attr.to_string();
    }
    if let Some((_, prop)) = RENAMED.iter().find(|(html, _)| *html == attr) {
        return prop.to_string();
    }
    attr.to_string()
}

/// Parses an inline style into an object of camelCased properties.
/// Custom properties (`--name`) keep their names.
pub fn parse_style(style: &str) -> Result<Json, String> {
    let mut out = Map::new();
    for decl in split_declarations(style) {
        let decl = decl.trim();
        if decl.is_empty() {
            continue;
        }
        let Some((prop, value)) = decl.split_once(':') else {
            return Err(format!("declaration without value: {:?}", decl));
        };
        let prop = prop.trim();
        if prop.is_empty() {
            return Err(format!("declaration without property: {:?}", decl));
        }
        out.insert(style_key(prop), Json::String(value.trim().to_string()));
    }
    Ok(Json::Object(out))
}

/// Splits on `;` outside of parentheses and quotes, so `url(a;b)` survives.
fn split_declarations(style: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (i, c) in style.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ';') if depth == 0 => {
                parts.push(&style[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&style[start..]);
    parts
}

fn style_key(prop: &str) -> String {
    if prop.starts_with("--") {
        return prop.to_string();
    }

    let lower = prop.to_ascii_lowercase();
    // Vendor prefixes other than -ms- keep a leading capital.
    let (mut key, rest) = match lower.strip_prefix("-ms-") {
        Some(rest) => ("ms".to_string(), rest.to_string()),
        None => match lower.strip_prefix('-') {
            Some(rest) => (String::new(), capitalize(rest)),
            None => (String::new(), lower),
        },
    };

    let mut upper = !key.is_empty();
    for c in rest.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            key.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            key.push(c);
        }
    }
    key
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
