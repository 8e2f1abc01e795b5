//! Classification of component graph payload rows.
//!
//! The payload is a sequence of newline-terminated rows `<hex id>:<body>`.
//! Only three kinds matter to the multiplexer: the root row, client reference
//! rows (`I`), and stylesheet hint rows (`HL` with a `"style"` destination).

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Root,
    ClientReference,
    Stylesheet { href: String },
    Other,
}

pub fn classify(line: &str, root_marker: &str) -> Row {
    if line.starts_with(root_marker) {
        return Row::Root;
    }

    let Some((id, body)) = line.split_once(':') else {
        return Row::Other;
    };
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Row::Other;
    }

    if body.starts_with("I[") || body.starts_with("I{") {
        return Row::ClientReference;
    }

    if let Some(hint) = body.strip_prefix("HL") {
        return stylesheet_hint(hint).map_or(Row::Other, |href| Row::Stylesheet { href });
    }

    Row::Other
}

fn stylesheet_hint(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body.trim_end()).ok()?;
    let args = value.as_array()?;
    let href = args.first()?.as_str()?;
    if args.get(1)?.as_str()? != "style" {
        return None;
    }
    Some(href.to_string())
}

/// Collects complete rows out of arbitrarily split text.
#[derive(Debug, Default)]
pub struct LineScanner {
    partial: String,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text and returns every row it completed, without newlines.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let Some(last) = self.partial.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.partial.split_off(last + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
    }

    /// Returns an unterminated final row, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        (!rest.is_empty()).then_some(rest)
    }
}
